use super::bootstrap::{EyeResources, SessionResources};
use super::runtime::{RawStatus, XrRuntime, describe_failure, op};
use super::{
    BlendMode, DisplayTime, Extent2D, FrameSubmission, FrameTiming, ImageWait, InstanceHandle,
    LocatedView, ProjectionLayer, RuntimeFailure, SessionHandle, SpaceHandle, XrError, XrResult,
};
use crate::config::CompositorConfig;
use crate::math::{Mat4, projection_from_fov, view_from_pose};
use crate::render::{GraphicsBackend, RenderError};

const RENDER_EYE: &str = "render_eye";

/// Where one eye's swapchain image is in its acquire/wait/release cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageCycle {
    #[default]
    Unacquired,
    Acquired(u32),
    Writable(u32),
}

impl ImageCycle {
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Unacquired => None,
            Self::Acquired(index) | Self::Writable(index) => Some(*index),
        }
    }
}

/// What a single pass through the pipeline did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameReport {
    pub display_time: DisplayTime,
    pub should_render: bool,
    pub eyes_rendered: usize,
    pub eyes_skipped: usize,
    pub layers_submitted: usize,
    pub mirrored: Option<Extent2D>,
}

impl FrameReport {
    fn new(timing: &FrameTiming) -> Self {
        Self {
            display_time: timing.predicted_display_time,
            should_render: timing.should_render,
            ..Self::default()
        }
    }
}

fn step_failure<R: XrRuntime>(
    runtime: &R,
    instance: InstanceHandle,
    operation: &'static str,
    status: RawStatus,
) -> XrError {
    XrError::FrameStepFailed(describe_failure(runtime, Some(instance), operation, status))
}

fn render_failure(err: RenderError) -> XrError {
    XrError::FrameStepFailed(RuntimeFailure {
        operation: RENDER_EYE,
        message: err.to_string(),
    })
}

/// Drives wait → begin → locate → per-eye render → end for one frame.
#[derive(Debug, Default)]
pub struct FramePipeline {
    cycles: Vec<ImageCycle>,
    located: Vec<LocatedView>,
    frames_submitted: u64,
}

impl FramePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> &[ImageCycle] {
        &self.cycles
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Runs one frame. Once begin succeeds, end is always issued, with the
    /// projection layer only when every eye was composed and zero layers
    /// otherwise. Every acquired image is released before this returns.
    pub fn render_frame<R, G, F>(
        &mut self,
        runtime: &mut R,
        graphics: &mut G,
        resources: &mut SessionResources,
        config: &CompositorConfig,
        draw: &mut F,
    ) -> XrResult<FrameReport>
    where
        R: XrRuntime,
        G: GraphicsBackend,
        F: FnMut(&Mat4, &Mat4),
    {
        let (Some(instance), Some(session), Some(space), Some(layer)) = (
            resources.instance,
            resources.session,
            resources.space,
            resources.layer.as_mut(),
        ) else {
            return Err(XrError::FrameStepFailed(RuntimeFailure {
                operation: op::WAIT_FRAME,
                message: "session resources are not initialized".to_string(),
            }));
        };
        let eyes = &resources.eyes;
        self.cycles.resize(eyes.len(), ImageCycle::Unacquired);

        let timing = runtime
            .wait_frame(session)
            .map_err(|status| step_failure(runtime, instance, op::WAIT_FRAME, status))?;
        runtime
            .begin_frame(session)
            .map_err(|status| step_failure(runtime, instance, op::BEGIN_FRAME, status))?;

        let mut report = FrameReport::new(&timing);
        let composed = if timing.should_render {
            self.compose(
                runtime, graphics, instance, session, space, eyes, layer, config, &timing,
                &mut report, draw,
            )
        } else {
            Ok(())
        };

        let submit_layer =
            composed.is_ok() && timing.should_render && report.eyes_rendered == eyes.len();
        let layers: &[ProjectionLayer] = if submit_layer {
            std::slice::from_ref(&*layer)
        } else {
            &[]
        };
        let ended = runtime.end_frame(
            session,
            &FrameSubmission {
                display_time: timing.predicted_display_time,
                blend_mode: BlendMode::Opaque,
                layers,
            },
        );
        report.layers_submitted = layers.len();

        composed?;
        ended.map_err(|status| step_failure(runtime, instance, op::END_FRAME, status))?;
        self.frames_submitted += 1;

        log::trace!(
            "[xr-frame] t={} rendered {} skipped {} layers {}",
            report.display_time.0,
            report.eyes_rendered,
            report.eyes_skipped,
            report.layers_submitted
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn compose<R, G, F>(
        &mut self,
        runtime: &mut R,
        graphics: &mut G,
        instance: InstanceHandle,
        session: SessionHandle,
        space: SpaceHandle,
        eyes: &[EyeResources],
        layer: &mut ProjectionLayer,
        config: &CompositorConfig,
        timing: &FrameTiming,
        report: &mut FrameReport,
        draw: &mut F,
    ) -> XrResult<()>
    where
        R: XrRuntime,
        G: GraphicsBackend,
        F: FnMut(&Mat4, &Mat4),
    {
        self.located.clear();
        self.located.resize(eyes.len(), LocatedView::default());
        let located = runtime
            .locate_views(session, timing.predicted_display_time, space, &mut self.located)
            .map_err(|status| step_failure(runtime, instance, op::LOCATE_VIEWS, status))?
            as usize;
        if located != eyes.len() {
            return Err(XrError::ConsistencyViolation {
                expected: eyes.len(),
                actual: located,
            });
        }

        let mut first_eye_written = false;
        for (index, eye) in eyes.iter().enumerate() {
            let view = self.located[index];
            if let Some(projection_view) = layer.views.get_mut(index) {
                projection_view.pose = view.pose;
                projection_view.fov = view.fov;
            }

            match self.render_eye(runtime, graphics, instance, index, eye, &view, config, draw) {
                Ok(true) => {
                    report.eyes_rendered += 1;
                    first_eye_written |= index == 0;
                }
                Ok(false) => report.eyes_skipped += 1,
                Err(err) => {
                    log::warn!("[xr-frame] eye {index} skipped: {err}");
                    report.eyes_skipped += 1;
                }
            }
        }

        // The preview only needs eye 0; a skipped eye 1 withholds the
        // layer but not the mirror.
        if config.mirror_to_surface && first_eye_written {
            report.mirrored = mirror_first_eye(graphics, eyes);
        }
        Ok(())
    }

    /// Returns `Ok(false)` when the image never became writable; the image
    /// is released either way.
    #[allow(clippy::too_many_arguments)]
    fn render_eye<R, G, F>(
        &mut self,
        runtime: &mut R,
        graphics: &mut G,
        instance: InstanceHandle,
        index: usize,
        eye: &EyeResources,
        view: &LocatedView,
        config: &CompositorConfig,
        draw: &mut F,
    ) -> XrResult<bool>
    where
        R: XrRuntime,
        G: GraphicsBackend,
        F: FnMut(&Mat4, &Mat4),
    {
        let image_index = runtime.acquire_swapchain_image(eye.swapchain).map_err(|status| {
            step_failure(runtime, instance, op::ACQUIRE_SWAPCHAIN_IMAGE, status)
        })?;
        self.cycles[index] = ImageCycle::Acquired(image_index);

        let written = self.write_image(
            runtime,
            graphics,
            instance,
            index,
            image_index,
            eye,
            view,
            config,
            draw,
        );

        let released = runtime.release_swapchain_image(eye.swapchain);
        self.cycles[index] = ImageCycle::Unacquired;
        released.map_err(|status| {
            step_failure(runtime, instance, op::RELEASE_SWAPCHAIN_IMAGE, status)
        })?;
        written
    }

    #[allow(clippy::too_many_arguments)]
    fn write_image<R, G, F>(
        &mut self,
        runtime: &mut R,
        graphics: &mut G,
        instance: InstanceHandle,
        index: usize,
        image_index: u32,
        eye: &EyeResources,
        view: &LocatedView,
        config: &CompositorConfig,
        draw: &mut F,
    ) -> XrResult<bool>
    where
        R: XrRuntime,
        G: GraphicsBackend,
        F: FnMut(&Mat4, &Mat4),
    {
        let wait = runtime
            .wait_swapchain_image(eye.swapchain, config.image_wait_timeout())
            .map_err(|status| step_failure(runtime, instance, op::WAIT_SWAPCHAIN_IMAGE, status))?;
        if wait == ImageWait::TimedOut {
            log::warn!(
                "[xr-frame] eye {index}: image {image_index} not writable within {}ms",
                config.image_wait_timeout_ms
            );
            return Ok(false);
        }
        self.cycles[index] = ImageCycle::Writable(image_index);

        let image = eye
            .images
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| {
                XrError::FrameStepFailed(RuntimeFailure {
                    operation: op::ACQUIRE_SWAPCHAIN_IMAGE,
                    message: format!(
                        "image index {image_index} outside swapchain of {}",
                        eye.images.len()
                    ),
                })
            })?;
        let framebuffer = eye.framebuffer.ok_or_else(|| {
            XrError::FrameStepFailed(RuntimeFailure {
                operation: RENDER_EYE,
                message: format!("eye {index} has no framebuffer"),
            })
        })?;

        graphics.set_viewport(eye.extent.width, eye.extent.height);
        graphics.bind_framebuffer(Some(framebuffer)).map_err(render_failure)?;
        let attached = graphics.attach_color_image(framebuffer, image);
        if attached.is_ok() {
            let projection = projection_from_fov(&view.fov, config.near_plane, config.far_plane);
            let view_matrix = view_from_pose(&view.pose);
            draw(&projection, &view_matrix);
        }
        let unbound = graphics.bind_framebuffer(None);
        // Contents must be final before the image goes back to the runtime.
        graphics.finish();

        attached.and(unbound).map_err(render_failure)?;
        Ok(true)
    }
}

fn mirror_first_eye<G: GraphicsBackend>(
    graphics: &mut G,
    eyes: &[EyeResources],
) -> Option<Extent2D> {
    let eye = eyes.first()?;
    let framebuffer = eye.framebuffer?;
    match graphics.blit_to_surface(framebuffer, eye.extent.width, eye.extent.height) {
        Ok(()) => Some(eye.extent),
        Err(err) => {
            log::warn!("[gl] mirror blit failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::NullGraphicsBackend;
    use crate::vr::SessionState;
    use crate::vr::capability::Capabilities;
    use crate::vr::simulated::{RuntimeCall, SimulatedRuntime};

    struct Harness {
        runtime: SimulatedRuntime,
        graphics: NullGraphicsBackend,
        resources: SessionResources,
        config: CompositorConfig,
        pipeline: FramePipeline,
    }

    impl Harness {
        fn new(mut runtime: SimulatedRuntime) -> Self {
            let mut graphics = NullGraphicsBackend::default();
            let config = CompositorConfig::default();
            let capabilities = Capabilities::discover(&mut runtime);
            let mut resources = SessionResources::default();
            resources
                .bootstrap(&mut runtime, &mut graphics, &capabilities, &config, &())
                .expect("bootstrap");
            let session = resources.session.expect("session");
            runtime.push_state_change(SessionState::Ready);
            runtime.begin_session(session).expect("begin session");
            runtime.clear_calls();
            Self {
                runtime,
                graphics,
                resources,
                config,
                pipeline: FramePipeline::new(),
            }
        }

        fn frame(&mut self, draws: &mut usize) -> XrResult<FrameReport> {
            let mut draw = |_: &Mat4, _: &Mat4| *draws += 1;
            self.pipeline.render_frame(
                &mut self.runtime,
                &mut self.graphics,
                &mut self.resources,
                &self.config,
                &mut draw,
            )
        }

        fn end_frames(&self) -> Vec<(usize, Vec<crate::vr::SwapchainHandle>)> {
            self.runtime
                .calls()
                .iter()
                .filter_map(|call| match call {
                    RuntimeCall::EndFrame {
                        layers, sub_images, ..
                    } => Some((*layers, sub_images.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn skipped_frame_still_ends_with_zero_layers() {
        let mut runtime = SimulatedRuntime::new();
        runtime.queue_frames(&[false]);
        let mut harness = Harness::new(runtime);

        let mut draws = 0;
        let report = harness.frame(&mut draws).expect("frame");

        assert!(!report.should_render);
        assert_eq!(report.layers_submitted, 0);
        assert_eq!(draws, 0);
        assert_eq!(harness.end_frames(), vec![(0, Vec::new())]);
        assert_eq!(
            harness
                .runtime
                .count_calls(|call| matches!(call, RuntimeCall::LocateViews { .. })),
            0
        );
    }

    #[test]
    fn rendered_frame_submits_one_view_per_eye() {
        let mut harness = Harness::new(SimulatedRuntime::new());
        let mut draws = 0;
        let report = harness.frame(&mut draws).expect("frame");

        assert_eq!(report.eyes_rendered, 2);
        assert_eq!(report.layers_submitted, 1);
        assert_eq!(draws, 2);
        let swapchains: Vec<_> = harness.resources.eyes.iter().map(|eye| eye.swapchain).collect();
        assert_eq!(harness.end_frames(), vec![(1, swapchains)]);
        assert_eq!(harness.graphics.finish_count(), 2);
        assert_eq!(harness.graphics.bound_framebuffer(), None);
        assert!(harness
            .pipeline
            .cycles()
            .iter()
            .all(|cycle| *cycle == ImageCycle::Unacquired));
    }

    #[test]
    fn layer_carries_located_poses() {
        let mut harness = Harness::new(SimulatedRuntime::new());
        harness.frame(&mut 0).expect("frame");

        let layer = harness.resources.layer.as_ref().expect("layer");
        assert!(layer.views[0].pose.position.x < 0.0);
        assert!(layer.views[1].pose.position.x > 0.0);
        assert!(layer.views.iter().all(|view| view.fov.angle_right > 0.0));
    }

    #[test]
    fn timed_out_eye_is_released_and_layer_withheld() {
        let mut harness = Harness::new(SimulatedRuntime::new().timing_out_image_waits(1));
        let mut draws = 0;
        let report = harness.frame(&mut draws).expect("frame");

        assert_eq!(report.eyes_rendered, 1);
        assert_eq!(report.eyes_skipped, 1);
        assert_eq!(report.layers_submitted, 0);
        assert_eq!(draws, 1);

        let acquires = harness
            .runtime
            .count_calls(|call| matches!(call, RuntimeCall::AcquireImage { .. }));
        let releases = harness
            .runtime
            .count_calls(|call| matches!(call, RuntimeCall::ReleaseImage { .. }));
        assert_eq!(acquires, 2);
        assert_eq!(releases, 2);
    }

    #[test]
    fn mirror_survives_second_eye_timeout() {
        let mut harness = Harness::new(
            SimulatedRuntime::new()
                .with_eye_resolution(800, 600)
                .timing_out_image_waits(1),
        );
        let report = harness.frame(&mut 0).expect("frame");

        assert_eq!(report.eyes_rendered, 1);
        assert_eq!(report.layers_submitted, 0);
        assert_eq!(
            report.mirrored,
            Some(Extent2D {
                width: 800,
                height: 600
            })
        );
        assert_eq!(harness.graphics.blits().len(), 1);
    }

    #[test]
    fn mirror_is_skipped_when_first_eye_times_out() {
        let mut harness = Harness::new(SimulatedRuntime::new().timing_out_image_waits(0));
        let report = harness.frame(&mut 0).expect("frame");

        assert_eq!(report.eyes_rendered, 1);
        assert_eq!(report.mirrored, None);
        assert!(harness.graphics.blits().is_empty());
    }

    #[test]
    fn view_count_mismatch_is_fatal_but_frame_is_ended() {
        let mut harness = Harness::new(SimulatedRuntime::new().with_located_view_count(1));
        let err = harness.frame(&mut 0).unwrap_err();

        assert_eq!(
            err,
            XrError::ConsistencyViolation {
                expected: 2,
                actual: 1
            }
        );
        assert!(err.is_fatal());
        assert_eq!(harness.end_frames(), vec![(0, Vec::new())]);
    }

    #[test]
    fn locate_failure_ends_frame_and_reports_step() {
        let mut harness = Harness::new(SimulatedRuntime::new());
        harness
            .runtime
            .fail_call(op::LOCATE_VIEWS, RawStatus::SESSION_LOST);
        let err = harness.frame(&mut 0).unwrap_err();

        assert_eq!(
            err.to_string(),
            "frame step failed: locate_views: XR_ERROR_SESSION_LOST"
        );
        assert!(!err.is_fatal());
        assert_eq!(harness.end_frames().len(), 1);
    }

    #[test]
    fn begin_failure_does_not_end() {
        let mut harness = Harness::new(SimulatedRuntime::new());
        harness
            .runtime
            .fail_call(op::BEGIN_FRAME, RawStatus::RUNTIME_FAILURE);
        assert!(harness.frame(&mut 0).is_err());
        assert!(harness.end_frames().is_empty());

        harness.runtime.clear_failure(op::BEGIN_FRAME);
        harness.frame(&mut 0).expect("recovered frame");
        assert_eq!(harness.end_frames().len(), 1);
    }

    #[test]
    fn acquire_failure_skips_only_that_eye() {
        let mut harness = Harness::new(SimulatedRuntime::new());
        let first = harness.resources.eyes[0].swapchain;
        harness
            .runtime
            .acquire_swapchain_image(first)
            .expect("hold image");

        let report = harness.frame(&mut 0).expect("frame");
        assert_eq!(report.eyes_rendered, 1);
        assert_eq!(report.eyes_skipped, 1);
        assert_eq!(report.layers_submitted, 0);
    }

    #[test]
    fn mirror_copies_first_eye_extent() {
        let mut harness = Harness::new(SimulatedRuntime::new().with_eye_resolution(640, 480));
        let report = harness.frame(&mut 0).expect("frame");

        assert_eq!(
            report.mirrored,
            Some(Extent2D {
                width: 640,
                height: 480
            })
        );
        let blit = harness.graphics.blits()[0];
        assert_eq!(Some(blit.source), harness.resources.eyes[0].framebuffer);
        assert_eq!((blit.width, blit.height), (640, 480));
    }

    #[test]
    fn mirror_can_be_disabled() {
        let mut harness = Harness::new(SimulatedRuntime::new());
        harness.config.mirror_to_surface = false;
        let report = harness.frame(&mut 0).expect("frame");
        assert_eq!(report.mirrored, None);
        assert!(harness.graphics.blits().is_empty());
    }

    #[test]
    fn waits_and_ends_pair_over_many_frames() {
        let mut runtime = SimulatedRuntime::new().timing_out_image_waits(0);
        runtime.queue_frames(&[true, false, true, false, false, true]);
        let mut harness = Harness::new(runtime);
        for _ in 0..8 {
            harness.frame(&mut 0).expect("frame");
        }

        let mut open = false;
        for call in harness.runtime.calls() {
            match call {
                RuntimeCall::WaitFrame { .. } => {
                    assert!(!open, "wait issued before previous end");
                    open = true;
                }
                RuntimeCall::EndFrame { .. } => {
                    assert!(open, "end without wait");
                    open = false;
                }
                _ => {}
            }
        }
        assert!(!open);
        assert_eq!(harness.pipeline.frames_submitted(), 8);
    }
}
