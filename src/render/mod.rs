#[cfg(feature = "render-gl")]
pub mod gl;

use std::cmp::Ordering;
use std::fmt;

/// Handle to a runtime-owned swapchain image as the graphics API sees it
/// (a GL texture name for the OpenGL binding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u32,
}

impl ApiVersion {
    pub const fn new(major: u16, minor: u16, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl PartialOrd for ApiVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ApiVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    FramebufferCreation(String),
    InvalidImage(ImageHandle),
    UnknownFramebuffer(FramebufferId),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::FramebufferCreation(reason) => {
                write!(f, "failed to create framebuffer: {reason}")
            }
            RenderError::InvalidImage(image) => {
                write!(f, "swapchain image {} is not a valid texture", image.0)
            }
            RenderError::UnknownFramebuffer(id) => write!(f, "unknown framebuffer {}", id.0),
        }
    }
}

impl std::error::Error for RenderError {}

pub type RenderResult<T> = Result<T, RenderError>;

/// The caller's already-current graphics context. Implementations borrow
/// the device; they never create or destroy it, and they never present.
pub trait GraphicsBackend {
    fn label(&self) -> &'static str;
    fn api_version(&self) -> ApiVersion;
    fn create_framebuffer(&mut self) -> RenderResult<FramebufferId>;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);
    /// `None` binds the default (window) framebuffer.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> RenderResult<()>;
    fn attach_color_image(
        &mut self,
        framebuffer: FramebufferId,
        image: ImageHandle,
    ) -> RenderResult<()>;
    fn set_viewport(&mut self, width: u32, height: u32);
    /// Blocks until every submitted command has completed.
    fn finish(&mut self);
    /// Copies `width` x `height` pixels from `source` into the presentation surface.
    fn blit_to_surface(
        &mut self,
        source: FramebufferId,
        width: u32,
        height: u32,
    ) -> RenderResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRecord {
    pub source: FramebufferId,
    pub width: u32,
    pub height: u32,
}

/// Headless backend that tracks framebuffer bookkeeping without touching
/// a GPU.
pub struct NullGraphicsBackend {
    version: ApiVersion,
    next_framebuffer: u32,
    live: Vec<FramebufferId>,
    deleted: Vec<FramebufferId>,
    bound: Option<FramebufferId>,
    attachments: Vec<(FramebufferId, ImageHandle)>,
    viewport: (u32, u32),
    finishes: usize,
    blits: Vec<BlitRecord>,
    fail_framebuffer_creation: bool,
}

impl NullGraphicsBackend {
    pub fn new(version: ApiVersion) -> Self {
        Self {
            version,
            next_framebuffer: 1,
            live: Vec::new(),
            deleted: Vec::new(),
            bound: None,
            attachments: Vec::new(),
            viewport: (0, 0),
            finishes: 0,
            blits: Vec::new(),
            fail_framebuffer_creation: false,
        }
    }

    pub fn failing_framebuffers(mut self) -> Self {
        self.fail_framebuffer_creation = true;
        self
    }

    pub fn live_framebuffers(&self) -> &[FramebufferId] {
        &self.live
    }

    pub fn deleted_framebuffers(&self) -> &[FramebufferId] {
        &self.deleted
    }

    pub fn bound_framebuffer(&self) -> Option<FramebufferId> {
        self.bound
    }

    pub fn attachments(&self) -> &[(FramebufferId, ImageHandle)] {
        &self.attachments
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn finish_count(&self) -> usize {
        self.finishes
    }

    pub fn blits(&self) -> &[BlitRecord] {
        &self.blits
    }

    fn check_live(&self, framebuffer: FramebufferId) -> RenderResult<()> {
        if self.live.contains(&framebuffer) {
            Ok(())
        } else {
            Err(RenderError::UnknownFramebuffer(framebuffer))
        }
    }
}

impl Default for NullGraphicsBackend {
    fn default() -> Self {
        Self::new(ApiVersion::new(4, 5, 0))
    }
}

impl GraphicsBackend for NullGraphicsBackend {
    fn label(&self) -> &'static str {
        "Null Graphics Backend"
    }

    fn api_version(&self) -> ApiVersion {
        self.version
    }

    fn create_framebuffer(&mut self) -> RenderResult<FramebufferId> {
        if self.fail_framebuffer_creation {
            return Err(RenderError::FramebufferCreation(
                "framebuffer creation disabled".to_string(),
            ));
        }
        let id = FramebufferId(self.next_framebuffer);
        self.next_framebuffer += 1;
        self.live.push(id);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.live.retain(|live| *live != framebuffer);
        self.deleted.push(framebuffer);
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> RenderResult<()> {
        if let Some(id) = framebuffer {
            self.check_live(id)?;
        }
        self.bound = framebuffer;
        Ok(())
    }

    fn attach_color_image(
        &mut self,
        framebuffer: FramebufferId,
        image: ImageHandle,
    ) -> RenderResult<()> {
        self.check_live(framebuffer)?;
        self.attachments.push((framebuffer, image));
        Ok(())
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
    }

    fn finish(&mut self) {
        self.finishes += 1;
    }

    fn blit_to_surface(
        &mut self,
        source: FramebufferId,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        self.check_live(source)?;
        self.blits.push(BlitRecord {
            source,
            width,
            height,
        });
        Ok(())
    }
}
