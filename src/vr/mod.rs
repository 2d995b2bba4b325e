pub mod bootstrap;
pub mod capability;
pub mod compositor;
pub mod frame;
#[cfg(feature = "vr-openxr")]
pub mod openxr;
pub mod runtime;
pub mod session;
pub mod simulated;

use crate::math::{Fov, Pose};
use crate::render::RenderError;
use std::fmt;
use thiserror::Error;

pub use compositor::StereoCompositor;
pub use runtime::{RawStatus, XrRuntime};

/// Stereo view configuration: one view per eye.
pub const STEREO_VIEW_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationIdentity {
    pub application_name: String,
    pub application_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormFactor {
    HeadMountedDisplay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSpaceKind {
    /// Seated frame anchored at the position of the head when the space
    /// was created.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
}

/// Recommended and maximum render-target limits for one eye.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewDescriptor {
    pub recommended_width: u32,
    pub recommended_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub recommended_sample_count: u32,
    pub max_sample_count: u32,
}

impl ViewDescriptor {
    pub fn recommended(width: u32, height: u32) -> Self {
        Self {
            recommended_width: width,
            recommended_height: height,
            max_width: width,
            max_height: height,
            recommended_sample_count: 1,
            max_sample_count: 1,
        }
    }

    pub fn extent(&self) -> Extent2D {
        Extent2D {
            width: self.recommended_width,
            height: self.recommended_height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub format: u32,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
}

/// Predicted display time in nanoseconds on the runtime's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DisplayTime(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTiming {
    pub predicted_display_time: DisplayTime,
    pub predicted_display_period_ns: i64,
    pub should_render: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocatedView {
    pub pose: Pose,
    pub fov: Fov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageWait {
    Ready,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubImage {
    pub swapchain: SwapchainHandle,
    pub rect: Rect2D,
    pub image_array_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionView {
    pub pose: Pose,
    pub fov: Fov,
    pub sub_image: SubImage,
}

/// Stereo projection layer. Built once at bootstrap; pose and fov are
/// rewritten in place every rendered frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionLayer {
    pub space: SpaceHandle,
    pub views: Vec<ProjectionView>,
}

/// Borrowed for the duration of a single end-frame call.
#[derive(Debug, Clone, Copy)]
pub struct FrameSubmission<'a> {
    pub display_time: DisplayTime,
    pub blend_mode: BlendMode,
    pub layers: &'a [ProjectionLayer],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Unknown,
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Synchronized => "synchronized",
            Self::Visible => "visible",
            Self::Focused => "focused",
            Self::Stopping => "stopping",
            Self::LossPending => "loss-pending",
            Self::Exiting => "exiting",
        }
    }

    pub fn is_render_eligible(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Synchronized | Self::Visible | Self::Focused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LossPending | Self::Exiting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event records drained from the runtime's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    SessionStateChanged {
        state: SessionState,
        time: DisplayTime,
    },
    /// Any other event kind, named for diagnostics only.
    Ignored(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayerInfo {
    pub name: String,
    pub description: String,
    pub spec_version: crate::render::ApiVersion,
    pub layer_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtensionInfo {
    pub name: String,
    pub version: u32,
}

/// A failed runtime call: the operation plus the runtime's description of
/// the status, or its raw code when the runtime cannot describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    pub operation: &'static str,
    pub message: String,
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    CreateInstance,
    SelectDevice,
    CreateSession,
    CreateReferenceSpace,
    QueryViews,
    CreateSwapchains,
    AllocateFramebuffers,
}

impl BootstrapStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInstance => "create-instance",
            Self::SelectDevice => "select-device",
            Self::CreateSession => "create-session",
            Self::CreateReferenceSpace => "create-reference-space",
            Self::QueryViews => "query-views",
            Self::CreateSwapchains => "create-swapchains",
            Self::AllocateFramebuffers => "allocate-framebuffers",
        }
    }
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("runtime reported no head-mounted device")]
    NoDeviceFound,
    #[error("stereo view configuration reported no views")]
    NoViewsReported,
    #[error("stereo view configuration reported {actual} views, expected {expected}")]
    ViewCountMismatch { expected: usize, actual: usize },
    #[error("extension {0} is not supported by the runtime")]
    UnsupportedExtension(String),
    #[error("graphics api {actual} outside runtime range {min}..={max}")]
    GraphicsVersionUnsupported {
        actual: crate::render::ApiVersion,
        min: crate::render::ApiVersion,
        max: crate::render::ApiVersion,
    },
    #[error("swapchain for eye {eye} has no images")]
    EmptySwapchain { eye: usize },
    #[error("framebuffer for eye {eye}: {reason}")]
    Framebuffer { eye: usize, reason: RenderError },
    #[error("session already initialized")]
    AlreadyInitialized,
    #[error("{0}")]
    Runtime(RuntimeFailure),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum XrError {
    #[error("query failed: {0}")]
    QueryFailed(RuntimeFailure),
    #[error("bootstrap failed at {stage}: {source}")]
    BootstrapFailed {
        stage: BootstrapStage,
        source: BootstrapError,
    },
    #[error("frame step failed: {0}")]
    FrameStepFailed(RuntimeFailure),
    #[error("runtime located {actual} views but bootstrap configured {expected}")]
    ConsistencyViolation { expected: usize, actual: usize },
}

impl XrError {
    pub fn bootstrap(stage: BootstrapStage, source: BootstrapError) -> Self {
        Self::BootstrapFailed { stage, source }
    }

    /// Fatal errors end the render loop; the rest only cost a frame or an eye.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BootstrapFailed { .. } | Self::ConsistencyViolation { .. }
        )
    }
}

pub type XrResult<T> = Result<T, XrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_eligible_states() {
        let eligible = [
            SessionState::Ready,
            SessionState::Synchronized,
            SessionState::Visible,
            SessionState::Focused,
        ];
        for state in eligible {
            assert!(state.is_render_eligible(), "{state}");
        }
        for state in [
            SessionState::Unknown,
            SessionState::Idle,
            SessionState::Stopping,
            SessionState::LossPending,
            SessionState::Exiting,
        ] {
            assert!(!state.is_render_eligible(), "{state}");
        }
    }

    #[test]
    fn error_messages_name_the_operation() {
        let err = XrError::FrameStepFailed(RuntimeFailure {
            operation: "wait_frame",
            message: "XR_ERROR_SESSION_LOST".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "frame step failed: wait_frame: XR_ERROR_SESSION_LOST"
        );
        assert!(!err.is_fatal());

        let err = XrError::bootstrap(BootstrapStage::SelectDevice, BootstrapError::NoDeviceFound);
        assert_eq!(
            err.to_string(),
            "bootstrap failed at select-device: runtime reported no head-mounted device"
        );
        assert!(err.is_fatal());
    }
}
