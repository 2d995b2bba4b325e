use super::bootstrap::SessionResources;
use super::capability::Capabilities;
use super::frame::{FramePipeline, FrameReport};
use super::runtime::XrRuntime;
use super::session::SessionStateMachine;
use super::{BootstrapError, BootstrapStage, SessionState, XrError, XrResult};
use crate::config::CompositorConfig;
use crate::math::Mat4;
use crate::render::GraphicsBackend;

/// Stereo compositor client: owns the runtime adapter, borrows the host's
/// graphics context through `G`, and carries the session from discovery
/// to teardown.
///
/// A host loop calls [`StereoCompositor::process_events`] and then
/// [`StereoCompositor::draw`] once per iteration until
/// [`StereoCompositor::should_exit`] reports true.
pub struct StereoCompositor<R: XrRuntime, G: GraphicsBackend> {
    runtime: R,
    graphics: G,
    config: CompositorConfig,
    capabilities: Capabilities,
    resources: SessionResources,
    session: SessionStateMachine,
    pipeline: FramePipeline,
}

impl<R: XrRuntime, G: GraphicsBackend> StereoCompositor<R, G> {
    /// Discovers runtime capabilities; no instance is created yet.
    pub fn new(mut runtime: R, graphics: G, config: CompositorConfig) -> Self {
        let capabilities = Capabilities::discover(&mut runtime);
        Self {
            runtime,
            graphics,
            config,
            capabilities,
            resources: SessionResources::default(),
            session: SessionStateMachine::new(),
            pipeline: FramePipeline::new(),
        }
    }

    /// Bootstraps the session against the caller's current graphics
    /// context. On failure everything created so far is released before
    /// the error is returned.
    pub fn init(&mut self, binding: &R::Binding) -> XrResult<()> {
        if !self.resources.is_empty() {
            return Err(XrError::bootstrap(
                BootstrapStage::CreateInstance,
                BootstrapError::AlreadyInitialized,
            ));
        }

        let result = self.resources.bootstrap(
            &mut self.runtime,
            &mut self.graphics,
            &self.capabilities,
            &self.config,
            binding,
        );
        if let Err(err) = &result {
            log::error!("[xr] {err}");
            self.resources.release(&mut self.runtime, &mut self.graphics);
        }
        result
    }

    pub fn is_initialized(&self) -> bool {
        self.resources.is_ready()
    }

    /// Drains the runtime's event queue. Must run every loop iteration.
    pub fn process_events(&mut self) -> XrResult<usize> {
        let (Some(instance), Some(session)) = (self.resources.instance, self.resources.session)
        else {
            return Ok(0);
        };
        self.session.drain_events(&mut self.runtime, instance, session)
    }

    /// Renders one frame when the session is in a render-eligible state.
    /// Returns `Ok(None)` for iterations that skip rendering entirely.
    pub fn draw<F>(&mut self, mut draw: F) -> XrResult<Option<FrameReport>>
    where
        F: FnMut(&Mat4, &Mat4),
    {
        if !self.resources.is_ready() || !self.session.should_render() {
            return Ok(None);
        }

        match self.pipeline.render_frame(
            &mut self.runtime,
            &mut self.graphics,
            &mut self.resources,
            &self.config,
            &mut draw,
        ) {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                if err.is_fatal() {
                    log::error!("[xr-frame] {err}");
                } else {
                    log::warn!("[xr-frame] {err}");
                }
                Err(err)
            }
        }
    }

    /// Polls events and, if eligible, renders a frame.
    pub fn frame<F>(&mut self, draw: F) -> XrResult<Option<FrameReport>>
    where
        F: FnMut(&Mat4, &Mat4),
    {
        self.process_events()?;
        self.draw(draw)
    }

    /// True once the runtime reported loss or exit.
    pub fn should_exit(&self) -> bool {
        self.session.is_halted()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn resources(&self) -> &SessionResources {
        &self.resources
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn graphics(&self) -> &G {
        &self.graphics
    }

    pub fn frames_submitted(&self) -> u64 {
        self.pipeline.frames_submitted()
    }

    /// Tears down everything bootstrap created. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.resources.release(&mut self.runtime, &mut self.graphics);
        self.session = SessionStateMachine::new();
    }
}

impl<R: XrRuntime, G: GraphicsBackend> Drop for StereoCompositor<R, G> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::NullGraphicsBackend;
    use crate::vr::simulated::{RuntimeCall, SimulatedRuntime};

    fn compositor(
        runtime: SimulatedRuntime,
    ) -> StereoCompositor<SimulatedRuntime, NullGraphicsBackend> {
        StereoCompositor::new(
            runtime,
            NullGraphicsBackend::default(),
            CompositorConfig::default(),
        )
    }

    #[test]
    fn draw_is_skipped_until_session_is_ready() {
        let mut compositor = compositor(SimulatedRuntime::new());
        assert_eq!(compositor.draw(|_, _| {}), Ok(None));

        compositor.init(&()).expect("init");
        compositor.process_events().expect("events");
        assert_eq!(compositor.state(), SessionState::Idle);
        assert_eq!(compositor.draw(|_, _| {}), Ok(None));

        compositor
            .runtime_mut()
            .push_state_change(SessionState::Ready);
        let report = compositor.frame(|_, _| {}).expect("frame").expect("rendered");
        assert_eq!(report.eyes_rendered, 2);
    }

    #[test]
    fn init_twice_is_rejected() {
        let mut compositor = compositor(SimulatedRuntime::new());
        compositor.init(&()).expect("init");
        let err = compositor.init(&()).unwrap_err();
        assert!(matches!(
            err,
            XrError::BootstrapFailed {
                source: BootstrapError::AlreadyInitialized,
                ..
            }
        ));
        assert!(compositor.is_initialized());
    }

    #[test]
    fn failed_init_releases_partial_resources() {
        let mut compositor = compositor(SimulatedRuntime::new().without_device());
        assert!(compositor.init(&()).is_err());
        assert!(compositor.resources().is_empty());
        assert!(!compositor.runtime().instance_alive());

        // A clean slate allows another attempt.
        assert!(matches!(
            compositor.init(&()),
            Err(XrError::BootstrapFailed {
                source: BootstrapError::NoDeviceFound,
                ..
            })
        ));
    }

    #[test]
    fn exiting_stops_rendering() {
        let mut compositor = compositor(SimulatedRuntime::new());
        compositor.init(&()).expect("init");
        compositor
            .runtime_mut()
            .push_state_changes(&[SessionState::Ready, SessionState::Focused]);
        assert!(compositor.frame(|_, _| {}).expect("frame").is_some());

        compositor
            .runtime_mut()
            .push_state_changes(&[SessionState::Stopping, SessionState::Exiting]);
        assert_eq!(compositor.frame(|_, _| {}), Ok(None));
        assert!(compositor.should_exit());
        assert!(!compositor.runtime().is_session_running());
    }

    #[test]
    fn release_is_idempotent() {
        let mut compositor = compositor(SimulatedRuntime::new());
        compositor.init(&()).expect("init");
        compositor.release();
        compositor.release();

        assert_eq!(
            compositor
                .runtime()
                .count_calls(|call| matches!(call, RuntimeCall::DestroyInstance)),
            1
        );
        assert_eq!(compositor.graphics().deleted_framebuffers().len(), 2);
        assert!(!compositor.is_initialized());
    }
}
