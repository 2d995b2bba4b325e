//! Deterministic in-process runtime.
//!
//! Behaves like a well-formed compositor runtime with a stereo headset
//! attached, enforces the call-order rules a real runtime enforces, and
//! records every call so hosts and tests can inspect what the pipeline
//! did. Failures are injected per operation name (see [`op`]).

use super::runtime::{CallResult, GraphicsRequirements, RawStatus, XrRuntime, op};
use super::{
    ApplicationIdentity, DeviceHandle, DisplayTime, ExtensionInfo, FormFactor, FrameSubmission,
    FrameTiming, ImageWait, InstanceHandle, LayerInfo, LocatedView, ReferenceSpaceKind,
    RuntimeEvent, SessionHandle, SessionState, SpaceHandle, SwapchainDesc, SwapchainHandle,
    ViewDescriptor, STEREO_VIEW_COUNT,
};
use crate::config::OPENGL_ENABLE_EXTENSION;
use crate::math::{Fov, Pose, Quat, Vec3};
use crate::render::{ApiVersion, ImageHandle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

const DEFAULT_FRAME_PERIOD_NS: i64 = 11_111_111;
const DEFAULT_IMAGES_PER_SWAPCHAIN: u32 = 3;
const INTERPUPILLARY_HALF_DISTANCE: f32 = 0.032;

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    CreateInstance { extensions: Vec<String> },
    GetSystem,
    GraphicsRequirements,
    CreateSession,
    CreateReferenceSpace { pose: Pose },
    CreateSwapchain { swapchain: SwapchainHandle, desc: SwapchainDesc },
    DestroySwapchain(SwapchainHandle),
    BeginSession,
    EndSession,
    WaitFrame { should_render: bool },
    BeginFrame,
    LocateViews { display_time: DisplayTime },
    AcquireImage { swapchain: SwapchainHandle, index: u32 },
    WaitImage { swapchain: SwapchainHandle, outcome: ImageWait },
    ReleaseImage { swapchain: SwapchainHandle, index: u32 },
    EndFrame {
        display_time: DisplayTime,
        layers: usize,
        sub_images: Vec<SwapchainHandle>,
    },
    DestroyInstance,
}

#[derive(Debug)]
struct SimSwapchain {
    handle: SwapchainHandle,
    ordinal: usize,
    images: Vec<ImageHandle>,
    next_index: u32,
    acquired: Option<u32>,
}

pub struct SimulatedRuntime {
    api_layers: Vec<LayerInfo>,
    extensions: Vec<ExtensionInfo>,
    enumeration_failure: Option<RawStatus>,
    device_available: bool,
    requirements: GraphicsRequirements,
    views: Vec<ViewDescriptor>,
    located_view_count: Option<usize>,
    images_per_swapchain: u32,
    failing_swapchain_ordinal: Option<usize>,
    timing_out_ordinals: HashSet<usize>,
    failures: HashMap<&'static str, RawStatus>,
    events: VecDeque<RuntimeEvent>,
    frame_plan: VecDeque<bool>,
    display_time: i64,
    instance: Option<InstanceHandle>,
    session: Option<SessionHandle>,
    session_running: bool,
    frame_waited: bool,
    frame_begun: bool,
    swapchains: Vec<SimSwapchain>,
    swapchains_created: usize,
    next_handle: u64,
    next_image: u64,
    calls: Vec<RuntimeCall>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self {
            api_layers: Vec::new(),
            extensions: vec![ExtensionInfo {
                name: OPENGL_ENABLE_EXTENSION.to_string(),
                version: 10,
            }],
            enumeration_failure: None,
            device_available: true,
            requirements: GraphicsRequirements {
                min_api_version: ApiVersion::new(4, 0, 0),
                max_api_version: ApiVersion::new(4, 6, 0),
            },
            views: vec![ViewDescriptor::recommended(1440, 1600); STEREO_VIEW_COUNT],
            located_view_count: None,
            images_per_swapchain: DEFAULT_IMAGES_PER_SWAPCHAIN,
            failing_swapchain_ordinal: None,
            timing_out_ordinals: HashSet::new(),
            failures: HashMap::new(),
            events: VecDeque::new(),
            frame_plan: VecDeque::new(),
            display_time: 0,
            instance: None,
            session: None,
            session_running: false,
            frame_waited: false,
            frame_begun: false,
            swapchains: Vec::new(),
            swapchains_created: 0,
            next_handle: 1,
            next_image: 1,
            calls: Vec::new(),
        }
    }

    pub fn with_extensions(mut self, names: &[String]) -> Self {
        self.extensions = names
            .iter()
            .map(|name| ExtensionInfo {
                name: name.clone(),
                version: 1,
            })
            .collect();
        self
    }

    pub fn with_api_layer_count(mut self, count: usize) -> Self {
        self.api_layers = (0..count)
            .map(|index| LayerInfo {
                name: format!("XR_APILAYER_sim_{index}"),
                description: "simulated layer".to_string(),
                spec_version: ApiVersion::new(1, 0, 0),
                layer_version: 1,
            })
            .collect();
        self
    }

    pub fn failing_enumeration(mut self, status: RawStatus) -> Self {
        self.enumeration_failure = Some(status);
        self
    }

    pub fn without_device(mut self) -> Self {
        self.device_available = false;
        self
    }

    pub fn with_graphics_requirements(mut self, min: ApiVersion, max: ApiVersion) -> Self {
        self.requirements = GraphicsRequirements {
            min_api_version: min,
            max_api_version: max,
        };
        self
    }

    pub fn with_views(mut self, views: Vec<ViewDescriptor>) -> Self {
        self.views = views;
        self
    }

    pub fn with_eye_resolution(self, width: u32, height: u32) -> Self {
        self.with_views(vec![ViewDescriptor::recommended(width, height); STEREO_VIEW_COUNT])
    }

    /// Makes `locate_views` report `count` views regardless of the view
    /// configuration.
    pub fn with_located_view_count(mut self, count: usize) -> Self {
        self.located_view_count = Some(count);
        self
    }

    pub fn with_images_per_swapchain(mut self, count: u32) -> Self {
        self.images_per_swapchain = count;
        self
    }

    /// Fails the `ordinal`-th swapchain creation (0-based).
    pub fn failing_swapchain_creation_at(mut self, ordinal: usize) -> Self {
        self.failing_swapchain_ordinal = Some(ordinal);
        self
    }

    /// Image waits on the `ordinal`-th swapchain always time out.
    pub fn timing_out_image_waits(mut self, ordinal: usize) -> Self {
        self.timing_out_ordinals.insert(ordinal);
        self
    }

    pub fn fail_call(&mut self, operation: &'static str, status: RawStatus) {
        self.failures.insert(operation, status);
    }

    pub fn clear_failure(&mut self, operation: &'static str) {
        self.failures.remove(operation);
    }

    pub fn push_event(&mut self, event: RuntimeEvent) {
        self.events.push_back(event);
    }

    pub fn push_state_change(&mut self, state: SessionState) {
        let time = DisplayTime(self.display_time);
        self.events
            .push_back(RuntimeEvent::SessionStateChanged { state, time });
    }

    pub fn push_state_changes(&mut self, states: &[SessionState]) {
        for state in states {
            self.push_state_change(*state);
        }
    }

    /// Queues `should_render` flags for upcoming frames; frames past the
    /// plan render.
    pub fn queue_frames(&mut self, should_render: &[bool]) {
        self.frame_plan.extend(should_render.iter().copied());
    }

    pub fn calls(&self) -> &[RuntimeCall] {
        &self.calls
    }

    pub fn count_calls(&self, predicate: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn is_session_running(&self) -> bool {
        self.session_running
    }

    pub fn instance_alive(&self) -> bool {
        self.instance.is_some()
    }

    pub fn live_swapchains(&self) -> Vec<SwapchainHandle> {
        self.swapchains.iter().map(|swapchain| swapchain.handle).collect()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    fn check(&self, operation: &'static str) -> CallResult<()> {
        match self.failures.get(operation) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }

    fn allocate_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn require_instance(&self, instance: InstanceHandle) -> CallResult<()> {
        if self.instance == Some(instance) {
            Ok(())
        } else {
            Err(RawStatus::HANDLE_INVALID)
        }
    }

    fn require_session(&self, session: SessionHandle) -> CallResult<()> {
        if self.session == Some(session) {
            Ok(())
        } else {
            Err(RawStatus::HANDLE_INVALID)
        }
    }

    fn swapchain_mut(&mut self, handle: SwapchainHandle) -> CallResult<&mut SimSwapchain> {
        self.swapchains
            .iter_mut()
            .find(|swapchain| swapchain.handle == handle)
            .ok_or(RawStatus::HANDLE_INVALID)
    }

    fn eye_view(eye: usize) -> LocatedView {
        let offset = if eye == 0 {
            -INTERPUPILLARY_HALF_DISTANCE
        } else {
            INTERPUPILLARY_HALF_DISTANCE
        };
        LocatedView {
            pose: Pose::new(Quat::IDENTITY, Vec3::new(offset, 1.6, 0.0)),
            fov: Fov::symmetric(0.785, 0.785),
        }
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn fill<T: Clone>(source: &[T], out: &mut [T]) -> u32 {
    if out.is_empty() {
        return source.len() as u32;
    }
    let written = source.len().min(out.len());
    out[..written].clone_from_slice(&source[..written]);
    written as u32
}

impl XrRuntime for SimulatedRuntime {
    type Binding = ();

    fn label(&self) -> &'static str {
        "Simulated Runtime"
    }

    fn graphics_extension(&self) -> &'static str {
        OPENGL_ENABLE_EXTENSION
    }

    fn enumerate_api_layers(&mut self, out: &mut [LayerInfo]) -> CallResult<u32> {
        if let Some(status) = self.enumeration_failure {
            return Err(status);
        }
        Ok(fill(&self.api_layers, out))
    }

    fn enumerate_extensions(&mut self, out: &mut [ExtensionInfo]) -> CallResult<u32> {
        if let Some(status) = self.enumeration_failure {
            return Err(status);
        }
        Ok(fill(&self.extensions, out))
    }

    fn create_instance(
        &mut self,
        _identity: &ApplicationIdentity,
        extensions: &[String],
    ) -> CallResult<InstanceHandle> {
        self.check(op::CREATE_INSTANCE)?;
        if self.instance.is_some() {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        if extensions
            .iter()
            .any(|name| !self.extensions.iter().any(|ext| &ext.name == name))
        {
            return Err(RawStatus::EXTENSION_NOT_PRESENT);
        }
        self.calls.push(RuntimeCall::CreateInstance {
            extensions: extensions.to_vec(),
        });
        let handle = InstanceHandle(self.allocate_handle());
        self.instance = Some(handle);
        Ok(handle)
    }

    fn result_to_string(
        &self,
        _instance: Option<InstanceHandle>,
        status: RawStatus,
    ) -> Option<String> {
        let name = match status {
            RawStatus::VALIDATION_FAILURE => "XR_ERROR_VALIDATION_FAILURE",
            RawStatus::RUNTIME_FAILURE => "XR_ERROR_RUNTIME_FAILURE",
            RawStatus::EXTENSION_NOT_PRESENT => "XR_ERROR_EXTENSION_NOT_PRESENT",
            RawStatus::HANDLE_INVALID => "XR_ERROR_HANDLE_INVALID",
            RawStatus::SESSION_RUNNING => "XR_ERROR_SESSION_RUNNING",
            RawStatus::SESSION_NOT_RUNNING => "XR_ERROR_SESSION_NOT_RUNNING",
            RawStatus::SESSION_LOST => "XR_ERROR_SESSION_LOST",
            RawStatus::FORM_FACTOR_UNAVAILABLE => "XR_ERROR_FORM_FACTOR_UNAVAILABLE",
            RawStatus::CALL_ORDER_INVALID => "XR_ERROR_CALL_ORDER_INVALID",
            _ => return None,
        };
        Some(name.to_string())
    }

    fn system(
        &mut self,
        instance: InstanceHandle,
        _form_factor: FormFactor,
    ) -> CallResult<Option<DeviceHandle>> {
        self.check(op::GET_SYSTEM)?;
        self.require_instance(instance)?;
        self.calls.push(RuntimeCall::GetSystem);
        if !self.device_available {
            return Ok(None);
        }
        Ok(Some(DeviceHandle(self.allocate_handle())))
    }

    fn graphics_requirements(
        &mut self,
        instance: InstanceHandle,
        _device: DeviceHandle,
    ) -> CallResult<GraphicsRequirements> {
        self.check(op::GRAPHICS_REQUIREMENTS)?;
        self.require_instance(instance)?;
        self.calls.push(RuntimeCall::GraphicsRequirements);
        Ok(self.requirements)
    }

    fn create_session(
        &mut self,
        instance: InstanceHandle,
        _device: DeviceHandle,
        _binding: &(),
    ) -> CallResult<SessionHandle> {
        self.check(op::CREATE_SESSION)?;
        self.require_instance(instance)?;
        if self.session.is_some() {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        self.calls.push(RuntimeCall::CreateSession);
        let handle = SessionHandle(self.allocate_handle());
        self.session = Some(handle);
        self.push_state_change(SessionState::Idle);
        Ok(handle)
    }

    fn create_reference_space(
        &mut self,
        session: SessionHandle,
        _kind: ReferenceSpaceKind,
        pose: Pose,
    ) -> CallResult<SpaceHandle> {
        self.check(op::CREATE_REFERENCE_SPACE)?;
        self.require_session(session)?;
        self.calls.push(RuntimeCall::CreateReferenceSpace { pose });
        Ok(SpaceHandle(self.allocate_handle()))
    }

    fn enumerate_view_descriptors(
        &mut self,
        instance: InstanceHandle,
        _device: DeviceHandle,
        out: &mut [ViewDescriptor],
    ) -> CallResult<u32> {
        self.check(op::ENUMERATE_VIEW_DESCRIPTORS)?;
        self.require_instance(instance)?;
        Ok(fill(&self.views, out))
    }

    fn create_swapchain(
        &mut self,
        session: SessionHandle,
        desc: &SwapchainDesc,
    ) -> CallResult<SwapchainHandle> {
        self.check(op::CREATE_SWAPCHAIN)?;
        self.require_session(session)?;
        let ordinal = self.swapchains_created;
        if self.failing_swapchain_ordinal == Some(ordinal) {
            return Err(RawStatus::RUNTIME_FAILURE);
        }
        self.swapchains_created += 1;

        let handle = SwapchainHandle(self.allocate_handle());
        let images = (0..self.images_per_swapchain)
            .map(|_| {
                let image = ImageHandle(self.next_image);
                self.next_image += 1;
                image
            })
            .collect();
        self.swapchains.push(SimSwapchain {
            handle,
            ordinal,
            images,
            next_index: 0,
            acquired: None,
        });
        self.calls.push(RuntimeCall::CreateSwapchain {
            swapchain: handle,
            desc: *desc,
        });
        Ok(handle)
    }

    fn enumerate_swapchain_images(
        &mut self,
        swapchain: SwapchainHandle,
        out: &mut [ImageHandle],
    ) -> CallResult<u32> {
        self.check(op::ENUMERATE_SWAPCHAIN_IMAGES)?;
        let swapchain = self.swapchain_mut(swapchain)?;
        Ok(fill(&swapchain.images, out))
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) -> CallResult<()> {
        let before = self.swapchains.len();
        self.swapchains.retain(|live| live.handle != swapchain);
        if self.swapchains.len() == before {
            return Err(RawStatus::HANDLE_INVALID);
        }
        self.calls.push(RuntimeCall::DestroySwapchain(swapchain));
        Ok(())
    }

    fn poll_event(&mut self, instance: InstanceHandle) -> CallResult<Option<RuntimeEvent>> {
        self.check(op::POLL_EVENT)?;
        self.require_instance(instance)?;
        Ok(self.events.pop_front())
    }

    fn begin_session(&mut self, session: SessionHandle) -> CallResult<()> {
        self.check(op::BEGIN_SESSION)?;
        self.require_session(session)?;
        if self.session_running {
            return Err(RawStatus::SESSION_RUNNING);
        }
        self.calls.push(RuntimeCall::BeginSession);
        self.session_running = true;
        Ok(())
    }

    fn end_session(&mut self, session: SessionHandle) -> CallResult<()> {
        self.check(op::END_SESSION)?;
        self.require_session(session)?;
        if !self.session_running {
            return Err(RawStatus::SESSION_NOT_RUNNING);
        }
        self.calls.push(RuntimeCall::EndSession);
        self.session_running = false;
        Ok(())
    }

    fn wait_frame(&mut self, session: SessionHandle) -> CallResult<FrameTiming> {
        self.check(op::WAIT_FRAME)?;
        self.require_session(session)?;
        if !self.session_running {
            return Err(RawStatus::SESSION_NOT_RUNNING);
        }
        if self.frame_begun {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        let should_render = self.frame_plan.pop_front().unwrap_or(true);
        self.display_time += DEFAULT_FRAME_PERIOD_NS;
        self.frame_waited = true;
        self.calls.push(RuntimeCall::WaitFrame { should_render });
        Ok(FrameTiming {
            predicted_display_time: DisplayTime(self.display_time),
            predicted_display_period_ns: DEFAULT_FRAME_PERIOD_NS,
            should_render,
        })
    }

    fn begin_frame(&mut self, session: SessionHandle) -> CallResult<()> {
        self.check(op::BEGIN_FRAME)?;
        self.require_session(session)?;
        if !self.frame_waited || self.frame_begun {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        self.frame_waited = false;
        self.frame_begun = true;
        self.calls.push(RuntimeCall::BeginFrame);
        Ok(())
    }

    fn locate_views(
        &mut self,
        session: SessionHandle,
        display_time: DisplayTime,
        _space: SpaceHandle,
        out: &mut [LocatedView],
    ) -> CallResult<u32> {
        self.check(op::LOCATE_VIEWS)?;
        self.require_session(session)?;
        self.calls.push(RuntimeCall::LocateViews { display_time });
        let count = self.located_view_count.unwrap_or(self.views.len());
        let views: Vec<LocatedView> = (0..count).map(Self::eye_view).collect();
        fill(&views, out);
        Ok(count as u32)
    }

    fn acquire_swapchain_image(&mut self, swapchain: SwapchainHandle) -> CallResult<u32> {
        self.check(op::ACQUIRE_SWAPCHAIN_IMAGE)?;
        let handle = swapchain;
        let swapchain = self.swapchain_mut(handle)?;
        if swapchain.acquired.is_some() {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        let index = swapchain.next_index;
        swapchain.next_index = (index + 1) % swapchain.images.len().max(1) as u32;
        swapchain.acquired = Some(index);
        self.calls.push(RuntimeCall::AcquireImage {
            swapchain: handle,
            index,
        });
        Ok(index)
    }

    fn wait_swapchain_image(
        &mut self,
        swapchain: SwapchainHandle,
        _timeout: Duration,
    ) -> CallResult<ImageWait> {
        self.check(op::WAIT_SWAPCHAIN_IMAGE)?;
        let handle = swapchain;
        let swapchain = self
            .swapchains
            .iter()
            .find(|swapchain| swapchain.handle == handle)
            .ok_or(RawStatus::HANDLE_INVALID)?;
        if swapchain.acquired.is_none() {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        let outcome = if self.timing_out_ordinals.contains(&swapchain.ordinal) {
            ImageWait::TimedOut
        } else {
            ImageWait::Ready
        };
        self.calls.push(RuntimeCall::WaitImage {
            swapchain: handle,
            outcome,
        });
        Ok(outcome)
    }

    fn release_swapchain_image(&mut self, swapchain: SwapchainHandle) -> CallResult<()> {
        self.check(op::RELEASE_SWAPCHAIN_IMAGE)?;
        let handle = swapchain;
        let swapchain = self.swapchain_mut(handle)?;
        let Some(index) = swapchain.acquired.take() else {
            return Err(RawStatus::CALL_ORDER_INVALID);
        };
        self.calls.push(RuntimeCall::ReleaseImage {
            swapchain: handle,
            index,
        });
        Ok(())
    }

    fn end_frame(
        &mut self,
        session: SessionHandle,
        submission: &FrameSubmission<'_>,
    ) -> CallResult<()> {
        self.require_session(session)?;
        if !self.frame_begun {
            return Err(RawStatus::CALL_ORDER_INVALID);
        }
        // The frame is closed even when the submission is rejected.
        self.frame_begun = false;
        self.check(op::END_FRAME)?;

        let sub_images = submission
            .layers
            .iter()
            .flat_map(|layer| layer.views.iter().map(|view| view.sub_image.swapchain))
            .collect();
        self.calls.push(RuntimeCall::EndFrame {
            display_time: submission.display_time,
            layers: submission.layers.len(),
            sub_images,
        });
        Ok(())
    }

    fn destroy_instance(&mut self, instance: InstanceHandle) -> CallResult<()> {
        self.require_instance(instance)?;
        self.calls.push(RuntimeCall::DestroyInstance);
        self.swapchains.clear();
        self.session = None;
        self.session_running = false;
        self.frame_waited = false;
        self.frame_begun = false;
        self.instance = None;
        Ok(())
    }
}
