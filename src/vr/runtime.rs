use super::{
    ApplicationIdentity, DeviceHandle, DisplayTime, ExtensionInfo, FormFactor, FrameSubmission,
    FrameTiming, ImageWait, InstanceHandle, LayerInfo, LocatedView, ReferenceSpaceKind,
    RuntimeEvent, RuntimeFailure, SessionHandle, SpaceHandle, SwapchainDesc, SwapchainHandle,
    ViewDescriptor,
};
use crate::math::Pose;
use crate::render::{ApiVersion, ImageHandle};
use std::time::Duration;

/// Raw non-success status code returned by a runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawStatus(pub i32);

impl RawStatus {
    pub const VALIDATION_FAILURE: Self = Self(-1);
    pub const RUNTIME_FAILURE: Self = Self(-2);
    pub const HANDLE_INVALID: Self = Self(-12);
    pub const SESSION_RUNNING: Self = Self(-14);
    pub const SESSION_NOT_RUNNING: Self = Self(-16);
    pub const SESSION_LOST: Self = Self(-17);
    pub const FORM_FACTOR_UNAVAILABLE: Self = Self(-35);
    pub const CALL_ORDER_INVALID: Self = Self(-37);
    pub const EXTENSION_NOT_PRESENT: Self = Self(-9);
}

pub type CallResult<T> = Result<T, RawStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsRequirements {
    pub min_api_version: ApiVersion,
    pub max_api_version: ApiVersion,
}

impl GraphicsRequirements {
    pub fn accepts(&self, version: ApiVersion) -> bool {
        version >= self.min_api_version && version <= self.max_api_version
    }
}

/// The compositor runtime as the stereo pipeline consumes it.
///
/// Enumeration calls follow the count-then-fill convention: an empty
/// `out` slice asks only for the element count, a non-empty slice is
/// filled up to its length and the number written is returned.
///
/// `Binding` is the caller's graphics context description used to create
/// the session; the runtime borrows it for that call only.
pub trait XrRuntime {
    type Binding;

    fn label(&self) -> &'static str;

    /// Extension the fixed graphics binding depends on.
    fn graphics_extension(&self) -> &'static str;

    fn enumerate_api_layers(&mut self, out: &mut [LayerInfo]) -> CallResult<u32>;
    fn enumerate_extensions(&mut self, out: &mut [ExtensionInfo]) -> CallResult<u32>;

    fn create_instance(
        &mut self,
        identity: &ApplicationIdentity,
        extensions: &[String],
    ) -> CallResult<InstanceHandle>;

    /// Runtime-provided description of `status`, when it has one.
    fn result_to_string(&self, instance: Option<InstanceHandle>, status: RawStatus)
    -> Option<String>;

    /// `Ok(None)` when the runtime has no device of this form factor.
    fn system(
        &mut self,
        instance: InstanceHandle,
        form_factor: FormFactor,
    ) -> CallResult<Option<DeviceHandle>>;

    fn graphics_requirements(
        &mut self,
        instance: InstanceHandle,
        device: DeviceHandle,
    ) -> CallResult<GraphicsRequirements>;

    fn create_session(
        &mut self,
        instance: InstanceHandle,
        device: DeviceHandle,
        binding: &Self::Binding,
    ) -> CallResult<SessionHandle>;

    fn create_reference_space(
        &mut self,
        session: SessionHandle,
        kind: ReferenceSpaceKind,
        pose: Pose,
    ) -> CallResult<SpaceHandle>;

    /// Per-eye limits of the stereo view configuration.
    fn enumerate_view_descriptors(
        &mut self,
        instance: InstanceHandle,
        device: DeviceHandle,
        out: &mut [ViewDescriptor],
    ) -> CallResult<u32>;

    fn create_swapchain(
        &mut self,
        session: SessionHandle,
        desc: &SwapchainDesc,
    ) -> CallResult<SwapchainHandle>;

    fn enumerate_swapchain_images(
        &mut self,
        swapchain: SwapchainHandle,
        out: &mut [ImageHandle],
    ) -> CallResult<u32>;

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) -> CallResult<()>;

    /// Non-blocking; `Ok(None)` once the queue is drained.
    fn poll_event(&mut self, instance: InstanceHandle) -> CallResult<Option<RuntimeEvent>>;

    fn begin_session(&mut self, session: SessionHandle) -> CallResult<()>;
    fn end_session(&mut self, session: SessionHandle) -> CallResult<()>;

    /// Blocks until the compositor is ready for the next frame.
    fn wait_frame(&mut self, session: SessionHandle) -> CallResult<FrameTiming>;
    fn begin_frame(&mut self, session: SessionHandle) -> CallResult<()>;

    /// Fills `out` with one located view per eye and returns how many
    /// views the runtime located, which may differ from `out.len()`.
    fn locate_views(
        &mut self,
        session: SessionHandle,
        display_time: DisplayTime,
        space: SpaceHandle,
        out: &mut [LocatedView],
    ) -> CallResult<u32>;

    fn acquire_swapchain_image(&mut self, swapchain: SwapchainHandle) -> CallResult<u32>;
    fn wait_swapchain_image(
        &mut self,
        swapchain: SwapchainHandle,
        timeout: Duration,
    ) -> CallResult<ImageWait>;
    fn release_swapchain_image(&mut self, swapchain: SwapchainHandle) -> CallResult<()>;

    fn end_frame(
        &mut self,
        session: SessionHandle,
        submission: &FrameSubmission<'_>,
    ) -> CallResult<()>;

    /// Destroys the instance and, with it, every session, space and
    /// swapchain it owns.
    fn destroy_instance(&mut self, instance: InstanceHandle) -> CallResult<()>;
}

/// Wraps a failed call into a [`RuntimeFailure`], decoding the status
/// through the runtime or falling back to the raw code.
pub fn describe_failure<R: XrRuntime + ?Sized>(
    runtime: &R,
    instance: Option<InstanceHandle>,
    operation: &'static str,
    status: RawStatus,
) -> RuntimeFailure {
    let message = runtime
        .result_to_string(instance, status)
        .unwrap_or_else(|| status.0.to_string());
    RuntimeFailure { operation, message }
}

/// Operation names used in diagnostics and failure reports.
pub mod op {
    pub const ENUMERATE_API_LAYERS: &str = "enumerate_api_layers";
    pub const ENUMERATE_EXTENSIONS: &str = "enumerate_extensions";
    pub const CREATE_INSTANCE: &str = "create_instance";
    pub const GET_SYSTEM: &str = "get_system";
    pub const GRAPHICS_REQUIREMENTS: &str = "graphics_requirements";
    pub const CREATE_SESSION: &str = "create_session";
    pub const CREATE_REFERENCE_SPACE: &str = "create_reference_space";
    pub const ENUMERATE_VIEW_DESCRIPTORS: &str = "enumerate_view_descriptors";
    pub const CREATE_SWAPCHAIN: &str = "create_swapchain";
    pub const ENUMERATE_SWAPCHAIN_IMAGES: &str = "enumerate_swapchain_images";
    pub const DESTROY_SWAPCHAIN: &str = "destroy_swapchain";
    pub const POLL_EVENT: &str = "poll_event";
    pub const BEGIN_SESSION: &str = "begin_session";
    pub const END_SESSION: &str = "end_session";
    pub const WAIT_FRAME: &str = "wait_frame";
    pub const BEGIN_FRAME: &str = "begin_frame";
    pub const LOCATE_VIEWS: &str = "locate_views";
    pub const ACQUIRE_SWAPCHAIN_IMAGE: &str = "acquire_swapchain_image";
    pub const WAIT_SWAPCHAIN_IMAGE: &str = "wait_swapchain_image";
    pub const RELEASE_SWAPCHAIN_IMAGE: &str = "release_swapchain_image";
    pub const END_FRAME: &str = "end_frame";
    pub const DESTROY_INSTANCE: &str = "destroy_instance";
}
