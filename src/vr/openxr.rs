//! OpenXR runtime adapter with the OpenGL graphics binding.
//!
//! Handles are opaque counters mapped onto the `openxr` crate's owned
//! objects. The count-then-fill calls the crate already collapses into
//! `Vec`s are re-expanded here; extension enumeration, result decoding and
//! the bounded image wait go through the raw function table because the
//! safe wrappers drop the information the pipeline needs (extension
//! versions, runtime messages, `XR_TIMEOUT_EXPIRED`).

use super::runtime::{CallResult, GraphicsRequirements, RawStatus, XrRuntime};
use super::{
    ApplicationIdentity, BlendMode, DeviceHandle, DisplayTime, ExtensionInfo, FormFactor, FrameSubmission,
    FrameTiming, ImageWait, InstanceHandle, LayerInfo, LocatedView, ReferenceSpaceKind,
    RuntimeEvent, RuntimeFailure, SessionHandle, SessionState, SpaceHandle, SwapchainDesc,
    SwapchainHandle, ViewDescriptor, XrError, XrResult,
};
use crate::config::OPENGL_ENABLE_EXTENSION;
use crate::math::{Fov, Pose, Quat, Vec3};
use crate::render::{ApiVersion, ImageHandle};
use openxr as xr;
use openxr::sys;
use std::collections::HashMap;
use std::ffi::c_char;
use std::ptr;
use std::time::Duration;

const VIEW_CONFIGURATION: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;

struct ActiveSession {
    handle: SessionHandle,
    session: xr::Session<xr::OpenGL>,
    waiter: xr::FrameWaiter,
    stream: xr::FrameStream<xr::OpenGL>,
}

pub struct OpenXrRuntime {
    entry: xr::Entry,
    instance: Option<(InstanceHandle, xr::Instance)>,
    system: Option<(DeviceHandle, xr::SystemId)>,
    session: Option<ActiveSession>,
    spaces: HashMap<SpaceHandle, xr::Space>,
    swapchains: HashMap<SwapchainHandle, xr::Swapchain<xr::OpenGL>>,
    event_buffer: xr::EventDataBuffer,
    next_handle: u64,
}

fn status(err: sys::Result) -> RawStatus {
    RawStatus(err.into_raw())
}

fn check(result: sys::Result) -> CallResult<sys::Result> {
    if result.into_raw() < 0 {
        Err(status(result))
    } else {
        Ok(result)
    }
}

fn c_chars_to_string(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn api_version(version: xr::Version) -> ApiVersion {
    ApiVersion::new(version.major(), version.minor(), version.patch())
}

fn to_xr_pose(pose: &Pose) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
            w: pose.orientation.w,
        },
        position: xr::Vector3f {
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
        },
    }
}

fn from_xr_pose(pose: &xr::Posef) -> Pose {
    Pose::new(
        Quat::new(
            pose.orientation.x,
            pose.orientation.y,
            pose.orientation.z,
            pose.orientation.w,
        ),
        Vec3::new(pose.position.x, pose.position.y, pose.position.z),
    )
}

fn to_xr_fov(fov: &Fov) -> xr::Fovf {
    xr::Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

fn session_state(state: xr::SessionState) -> SessionState {
    match state {
        xr::SessionState::IDLE => SessionState::Idle,
        xr::SessionState::READY => SessionState::Ready,
        xr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        xr::SessionState::VISIBLE => SessionState::Visible,
        xr::SessionState::FOCUSED => SessionState::Focused,
        xr::SessionState::STOPPING => SessionState::Stopping,
        xr::SessionState::LOSS_PENDING => SessionState::LossPending,
        xr::SessionState::EXITING => SessionState::Exiting,
        _ => SessionState::Unknown,
    }
}

impl OpenXrRuntime {
    /// Loads the system OpenXR loader.
    pub fn load() -> XrResult<Self> {
        // SAFETY: the loader library stays loaded for the lifetime of the
        // returned `Entry`, which every instance created here borrows from.
        let entry = unsafe { xr::Entry::load() }.map_err(|err| {
            XrError::QueryFailed(RuntimeFailure {
                operation: "load_loader",
                message: err.to_string(),
            })
        })?;
        log::info!("[xr] OpenXR loader ready");
        Ok(Self {
            entry,
            instance: None,
            system: None,
            session: None,
            spaces: HashMap::new(),
            swapchains: HashMap::new(),
            event_buffer: xr::EventDataBuffer::new(),
            next_handle: 1,
        })
    }

    fn allocate_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn instance(&self, handle: InstanceHandle) -> CallResult<&xr::Instance> {
        match &self.instance {
            Some((live, instance)) if *live == handle => Ok(instance),
            _ => Err(RawStatus::HANDLE_INVALID),
        }
    }

    fn system_id(&self, handle: DeviceHandle) -> CallResult<xr::SystemId> {
        match self.system {
            Some((live, system)) if live == handle => Ok(system),
            _ => Err(RawStatus::HANDLE_INVALID),
        }
    }

    fn session(&mut self, handle: SessionHandle) -> CallResult<&mut ActiveSession> {
        match &mut self.session {
            Some(active) if active.handle == handle => Ok(active),
            _ => Err(RawStatus::HANDLE_INVALID),
        }
    }

    fn swapchain(&mut self, handle: SwapchainHandle) -> CallResult<&mut xr::Swapchain<xr::OpenGL>> {
        self.swapchains
            .get_mut(&handle)
            .ok_or(RawStatus::HANDLE_INVALID)
    }
}

impl XrRuntime for OpenXrRuntime {
    type Binding = xr::opengl::SessionCreateInfo;

    fn label(&self) -> &'static str {
        "OpenXR"
    }

    fn graphics_extension(&self) -> &'static str {
        OPENGL_ENABLE_EXTENSION
    }

    fn enumerate_api_layers(&mut self, out: &mut [LayerInfo]) -> CallResult<u32> {
        let layers = self.entry.enumerate_layers().map_err(status)?;
        for (slot, layer) in out.iter_mut().zip(&layers) {
            *slot = LayerInfo {
                name: layer.layer_name.clone(),
                description: layer.description.clone(),
                spec_version: api_version(layer.spec_version),
                layer_version: layer.layer_version,
            };
        }
        Ok(if out.is_empty() {
            layers.len() as u32
        } else {
            out.len().min(layers.len()) as u32
        })
    }

    fn enumerate_extensions(&mut self, out: &mut [ExtensionInfo]) -> CallResult<u32> {
        let enumerate = self.entry.fp().enumerate_instance_extension_properties;
        let mut count = 0u32;
        if out.is_empty() {
            // SAFETY: a zero capacity with a null buffer only writes the count.
            check(unsafe { enumerate(ptr::null(), 0, &mut count, ptr::null_mut()) })?;
            return Ok(count);
        }

        let mut properties: Vec<sys::ExtensionProperties> = (0..out.len())
            .map(|_| sys::ExtensionProperties {
                ty: sys::ExtensionProperties::TYPE,
                next: ptr::null_mut(),
                extension_name: [0; sys::MAX_EXTENSION_NAME_SIZE],
                extension_version: 0,
            })
            .collect();
        // SAFETY: `properties` holds `out.len()` initialized, typed entries.
        check(unsafe {
            enumerate(
                ptr::null(),
                properties.len() as u32,
                &mut count,
                properties.as_mut_ptr(),
            )
        })?;

        let written = (count as usize).min(out.len());
        for (slot, raw) in out.iter_mut().zip(&properties[..written]) {
            *slot = ExtensionInfo {
                name: c_chars_to_string(&raw.extension_name),
                version: raw.extension_version,
            };
        }
        Ok(written as u32)
    }

    fn create_instance(
        &mut self,
        identity: &ApplicationIdentity,
        extensions: &[String],
    ) -> CallResult<InstanceHandle> {
        if self.instance.is_some() {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }

        let mut enabled = xr::ExtensionSet::default();
        for name in extensions {
            match name.as_str() {
                OPENGL_ENABLE_EXTENSION => enabled.khr_opengl_enable = true,
                other => enabled.other.push(other.to_string()),
            }
        }
        let app_info = xr::ApplicationInfo {
            application_name: &identity.application_name,
            application_version: identity.application_version,
            engine_name: &identity.engine_name,
            engine_version: identity.engine_version,
        };
        let instance = self
            .entry
            .create_instance(&app_info, &enabled, &[])
            .map_err(status)?;

        if let Ok(properties) = instance.properties() {
            log::info!(
                "[xr] runtime {} {}",
                properties.runtime_name,
                properties.runtime_version
            );
        }
        let handle = InstanceHandle(self.allocate_handle());
        self.instance = Some((handle, instance));
        Ok(handle)
    }

    fn result_to_string(
        &self,
        _instance: Option<InstanceHandle>,
        status: RawStatus,
    ) -> Option<String> {
        let (_, instance) = self.instance.as_ref()?;
        let mut buffer: [c_char; sys::MAX_RESULT_STRING_SIZE] = [0; sys::MAX_RESULT_STRING_SIZE];
        // SAFETY: the buffer is the size the call contract requires.
        let result = unsafe {
            (instance.fp().result_to_string)(
                instance.as_raw(),
                sys::Result::from_raw(status.0),
                buffer.as_mut_ptr(),
            )
        };
        if result.into_raw() < 0 {
            return None;
        }
        Some(c_chars_to_string(&buffer))
    }

    fn system(
        &mut self,
        instance: InstanceHandle,
        _form_factor: FormFactor,
    ) -> CallResult<Option<DeviceHandle>> {
        let system = match self
            .instance(instance)?
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
        {
            Ok(system) => system,
            Err(sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE) => return Ok(None),
            Err(err) => return Err(status(err)),
        };
        let handle = DeviceHandle(self.allocate_handle());
        self.system = Some((handle, system));
        Ok(Some(handle))
    }

    fn graphics_requirements(
        &mut self,
        instance: InstanceHandle,
        device: DeviceHandle,
    ) -> CallResult<GraphicsRequirements> {
        let system = self.system_id(device)?;
        let requirements = self
            .instance(instance)?
            .graphics_requirements::<xr::OpenGL>(system)
            .map_err(status)?;
        Ok(GraphicsRequirements {
            min_api_version: api_version(requirements.min_api_version_supported),
            max_api_version: api_version(requirements.max_api_version_supported),
        })
    }

    fn create_session(
        &mut self,
        instance: InstanceHandle,
        device: DeviceHandle,
        binding: &Self::Binding,
    ) -> CallResult<SessionHandle> {
        if self.session.is_some() {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        let system = self.system_id(device)?;
        // SAFETY: the binding names the caller's current GL context, which
        // outlives the session (teardown destroys the instance first).
        let (session, waiter, stream) = unsafe {
            self.instance(instance)?
                .create_session::<xr::OpenGL>(system, binding)
                .map_err(status)?
        };
        let handle = SessionHandle(self.allocate_handle());
        self.session = Some(ActiveSession {
            handle,
            session,
            waiter,
            stream,
        });
        Ok(handle)
    }

    fn create_reference_space(
        &mut self,
        session: SessionHandle,
        kind: ReferenceSpaceKind,
        pose: Pose,
    ) -> CallResult<SpaceHandle> {
        let space_type = match kind {
            ReferenceSpaceKind::Local => xr::ReferenceSpaceType::LOCAL,
        };
        let space = self
            .session(session)?
            .session
            .create_reference_space(space_type, to_xr_pose(&pose))
            .map_err(status)?;
        let handle = SpaceHandle(self.allocate_handle());
        self.spaces.insert(handle, space);
        Ok(handle)
    }

    fn enumerate_view_descriptors(
        &mut self,
        instance: InstanceHandle,
        device: DeviceHandle,
        out: &mut [ViewDescriptor],
    ) -> CallResult<u32> {
        let system = self.system_id(device)?;
        let views = self
            .instance(instance)?
            .enumerate_view_configuration_views(system, VIEW_CONFIGURATION)
            .map_err(status)?;
        if out.is_empty() {
            return Ok(views.len() as u32);
        }
        for (slot, view) in out.iter_mut().zip(&views) {
            *slot = ViewDescriptor {
                recommended_width: view.recommended_image_rect_width,
                recommended_height: view.recommended_image_rect_height,
                max_width: view.max_image_rect_width,
                max_height: view.max_image_rect_height,
                recommended_sample_count: view.recommended_swapchain_sample_count,
                max_sample_count: view.max_swapchain_sample_count,
            };
        }
        Ok(out.len().min(views.len()) as u32)
    }

    fn create_swapchain(
        &mut self,
        session: SessionHandle,
        desc: &SwapchainDesc,
    ) -> CallResult<SwapchainHandle> {
        let swapchain = self
            .session(session)?
            .session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT
                    | xr::SwapchainUsageFlags::SAMPLED,
                format: desc.format,
                sample_count: desc.sample_count,
                width: desc.width,
                height: desc.height,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
            })
            .map_err(status)?;
        let handle = SwapchainHandle(self.allocate_handle());
        self.swapchains.insert(handle, swapchain);
        Ok(handle)
    }

    fn enumerate_swapchain_images(
        &mut self,
        swapchain: SwapchainHandle,
        out: &mut [ImageHandle],
    ) -> CallResult<u32> {
        let images = self.swapchain(swapchain)?.enumerate_images().map_err(status)?;
        if out.is_empty() {
            return Ok(images.len() as u32);
        }
        for (slot, texture) in out.iter_mut().zip(&images) {
            *slot = ImageHandle(u64::from(*texture));
        }
        Ok(out.len().min(images.len()) as u32)
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) -> CallResult<()> {
        self.swapchains
            .remove(&swapchain)
            .map(drop)
            .ok_or(RawStatus::HANDLE_INVALID)
    }

    fn poll_event(&mut self, instance: InstanceHandle) -> CallResult<Option<RuntimeEvent>> {
        let live = match &self.instance {
            Some((live, instance_ref)) if *live == instance => instance_ref,
            _ => return Err(RawStatus::HANDLE_INVALID),
        };
        let event = live.poll_event(&mut self.event_buffer).map_err(status)?;
        Ok(event.map(|event| match event {
            xr::Event::SessionStateChanged(changed) => RuntimeEvent::SessionStateChanged {
                state: session_state(changed.state()),
                time: DisplayTime(changed.time().as_nanos()),
            },
            xr::Event::EventsLost(_) => RuntimeEvent::Ignored("events_lost"),
            xr::Event::InstanceLossPending(_) => RuntimeEvent::Ignored("instance_loss_pending"),
            xr::Event::ReferenceSpaceChangePending(_) => {
                RuntimeEvent::Ignored("reference_space_change_pending")
            }
            xr::Event::InteractionProfileChanged(_) => {
                RuntimeEvent::Ignored("interaction_profile_changed")
            }
            _ => RuntimeEvent::Ignored("other"),
        }))
    }

    fn begin_session(&mut self, session: SessionHandle) -> CallResult<()> {
        self.session(session)?
            .session
            .begin(VIEW_CONFIGURATION)
            .map(drop)
            .map_err(status)
    }

    fn end_session(&mut self, session: SessionHandle) -> CallResult<()> {
        self.session(session)?
            .session
            .end()
            .map(drop)
            .map_err(status)
    }

    fn wait_frame(&mut self, session: SessionHandle) -> CallResult<FrameTiming> {
        let state = self.session(session)?.waiter.wait().map_err(status)?;
        Ok(FrameTiming {
            predicted_display_time: DisplayTime(state.predicted_display_time.as_nanos()),
            predicted_display_period_ns: state.predicted_display_period.as_nanos(),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self, session: SessionHandle) -> CallResult<()> {
        self.session(session)?
            .stream
            .begin()
            .map(drop)
            .map_err(status)
    }

    fn locate_views(
        &mut self,
        session: SessionHandle,
        display_time: DisplayTime,
        space: SpaceHandle,
        out: &mut [LocatedView],
    ) -> CallResult<u32> {
        let active = match &self.session {
            Some(active) if active.handle == session => active,
            _ => return Err(RawStatus::HANDLE_INVALID),
        };
        let space = self.spaces.get(&space).ok_or(RawStatus::HANDLE_INVALID)?;
        let (_, views) = active
            .session
            .locate_views(
                VIEW_CONFIGURATION,
                xr::Time::from_nanos(display_time.0),
                space,
            )
            .map_err(status)?;
        for (slot, view) in out.iter_mut().zip(&views) {
            *slot = LocatedView {
                pose: from_xr_pose(&view.pose),
                fov: Fov {
                    angle_left: view.fov.angle_left,
                    angle_right: view.fov.angle_right,
                    angle_up: view.fov.angle_up,
                    angle_down: view.fov.angle_down,
                },
            };
        }
        Ok(views.len() as u32)
    }

    fn acquire_swapchain_image(&mut self, swapchain: SwapchainHandle) -> CallResult<u32> {
        self.swapchain(swapchain)?.acquire_image().map_err(status)
    }

    fn wait_swapchain_image(
        &mut self,
        swapchain: SwapchainHandle,
        timeout: Duration,
    ) -> CallResult<ImageWait> {
        let (_, instance) = self.instance.as_ref().ok_or(RawStatus::HANDLE_INVALID)?;
        let swapchain = self
            .swapchains
            .get(&swapchain)
            .ok_or(RawStatus::HANDLE_INVALID)?;
        let info = sys::SwapchainImageWaitInfo {
            ty: sys::SwapchainImageWaitInfo::TYPE,
            next: ptr::null(),
            timeout: xr::Duration::from_nanos(
                i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX),
            ),
        };
        // SAFETY: the swapchain handle is live and `info` is fully initialized.
        let result = unsafe { (instance.fp().wait_swapchain_image)(swapchain.as_raw(), &info) };
        if result == sys::Result::TIMEOUT_EXPIRED {
            return Ok(ImageWait::TimedOut);
        }
        check(result)?;
        Ok(ImageWait::Ready)
    }

    fn release_swapchain_image(&mut self, swapchain: SwapchainHandle) -> CallResult<()> {
        self.swapchain(swapchain)?.release_image().map_err(status)
    }

    fn end_frame(
        &mut self,
        session: SessionHandle,
        submission: &FrameSubmission<'_>,
    ) -> CallResult<()> {
        let active = match &mut self.session {
            Some(active) if active.handle == session => active,
            _ => return Err(RawStatus::HANDLE_INVALID),
        };
        let display_time = xr::Time::from_nanos(submission.display_time.0);
        let blend_mode = match submission.blend_mode {
            BlendMode::Opaque => xr::EnvironmentBlendMode::OPAQUE,
        };

        let mut view_sets = Vec::with_capacity(submission.layers.len());
        for layer in submission.layers {
            let mut views = Vec::with_capacity(layer.views.len());
            for view in &layer.views {
                let swapchain = self
                    .swapchains
                    .get(&view.sub_image.swapchain)
                    .ok_or(RawStatus::HANDLE_INVALID)?;
                let rect = view.sub_image.rect;
                views.push(
                    xr::CompositionLayerProjectionView::new()
                        .pose(to_xr_pose(&view.pose))
                        .fov(to_xr_fov(&view.fov))
                        .sub_image(
                            xr::SwapchainSubImage::new()
                                .swapchain(swapchain)
                                .image_array_index(view.sub_image.image_array_index)
                                .image_rect(xr::Rect2Di {
                                    offset: xr::Offset2Di {
                                        x: rect.x,
                                        y: rect.y,
                                    },
                                    extent: xr::Extent2Di {
                                        width: rect.extent.width as i32,
                                        height: rect.extent.height as i32,
                                    },
                                }),
                        ),
                );
            }
            let space = self
                .spaces
                .get(&layer.space)
                .ok_or(RawStatus::HANDLE_INVALID)?;
            view_sets.push((space, views));
        }

        let projections: Vec<xr::CompositionLayerProjection<'_, xr::OpenGL>> = view_sets
            .iter()
            .map(|(space, views)| {
                xr::CompositionLayerProjection::new()
                    .space(space)
                    .views(views)
            })
            .collect();
        let layers: Vec<&xr::CompositionLayerBase<'_, xr::OpenGL>> =
            projections.iter().map(|layer| &**layer).collect();

        active
            .stream
            .end(display_time, blend_mode, &layers)
            .map_err(status)
    }

    fn destroy_instance(&mut self, instance: InstanceHandle) -> CallResult<()> {
        self.instance(instance)?;
        self.swapchains.clear();
        self.spaces.clear();
        self.session = None;
        self.system = None;
        self.instance = None;
        log::info!("[xr] OpenXR instance destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_lifecycle_state_maps_across() {
        let pairs = [
            (xr::SessionState::IDLE, SessionState::Idle),
            (xr::SessionState::READY, SessionState::Ready),
            (xr::SessionState::SYNCHRONIZED, SessionState::Synchronized),
            (xr::SessionState::VISIBLE, SessionState::Visible),
            (xr::SessionState::FOCUSED, SessionState::Focused),
            (xr::SessionState::STOPPING, SessionState::Stopping),
            (xr::SessionState::LOSS_PENDING, SessionState::LossPending),
            (xr::SessionState::EXITING, SessionState::Exiting),
            (xr::SessionState::UNKNOWN, SessionState::Unknown),
        ];
        for (raw, expected) in pairs {
            assert_eq!(session_state(raw), expected);
        }
    }

    #[test]
    fn pose_survives_conversion() {
        let pose = Pose::new(Quat::new(0.0, 0.7071, 0.0, 0.7071), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(from_xr_pose(&to_xr_pose(&pose)), pose);
    }

    #[test]
    fn fov_keeps_each_half_angle() {
        let fov = Fov {
            angle_left: -0.8,
            angle_right: 0.7,
            angle_up: 0.9,
            angle_down: -0.6,
        };
        let converted = to_xr_fov(&fov);
        assert_eq!(
            (
                converted.angle_left,
                converted.angle_right,
                converted.angle_up,
                converted.angle_down
            ),
            (-0.8, 0.7, 0.9, -0.6)
        );
    }

    #[test]
    fn runtime_strings_stop_at_nul() {
        let mut raw = [0 as c_char; 32];
        for (slot, byte) in raw.iter_mut().zip(b"XR_KHR_opengl_enable") {
            *slot = *byte as c_char;
        }
        assert_eq!(c_chars_to_string(&raw), OPENGL_ENABLE_EXTENSION);
    }
}
