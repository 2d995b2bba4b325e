//! OpenGL backend over a caller-owned `glow` context.

use super::{ApiVersion, FramebufferId, GraphicsBackend, ImageHandle, RenderError, RenderResult};
use glow::HasContext;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

pub struct GlBackend {
    gl: Arc<glow::Context>,
    framebuffers: HashMap<FramebufferId, glow::Framebuffer>,
    next_id: u32,
}

impl GlBackend {
    /// The context must be current on the calling thread for as long as
    /// the backend is used.
    pub fn new(gl: Arc<glow::Context>) -> Self {
        Self {
            gl,
            framebuffers: HashMap::new(),
            next_id: 1,
        }
    }

    fn framebuffer(&self, id: FramebufferId) -> RenderResult<glow::Framebuffer> {
        self.framebuffers
            .get(&id)
            .copied()
            .ok_or(RenderError::UnknownFramebuffer(id))
    }
}

impl GraphicsBackend for GlBackend {
    fn label(&self) -> &'static str {
        "OpenGL Backend"
    }

    fn api_version(&self) -> ApiVersion {
        let version = self.gl.version();
        ApiVersion::new(version.major as u16, version.minor as u16, 0)
    }

    fn create_framebuffer(&mut self) -> RenderResult<FramebufferId> {
        let framebuffer =
            unsafe { self.gl.create_framebuffer() }.map_err(RenderError::FramebufferCreation)?;
        let id = FramebufferId(self.next_id);
        self.next_id += 1;
        self.framebuffers.insert(id, framebuffer);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        if let Some(native) = self.framebuffers.remove(&framebuffer) {
            unsafe { self.gl.delete_framebuffer(native) };
        } else {
            log::warn!("[gl] delete of unknown framebuffer {}", framebuffer.0);
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> RenderResult<()> {
        let native = framebuffer.map(|id| self.framebuffer(id)).transpose()?;
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, native) };
        Ok(())
    }

    fn attach_color_image(
        &mut self,
        framebuffer: FramebufferId,
        image: ImageHandle,
    ) -> RenderResult<()> {
        let native = self.framebuffer(framebuffer)?;
        let texture = u32::try_from(image.0)
            .ok()
            .and_then(NonZeroU32::new)
            .map(glow::NativeTexture)
            .ok_or(RenderError::InvalidImage(image))?;
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(native));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
        }
        Ok(())
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        unsafe {
            self.gl.viewport(0, 0, width as i32, height as i32);
            self.gl.scissor(0, 0, width as i32, height as i32);
        }
    }

    fn finish(&mut self) {
        unsafe { self.gl.finish() };
    }

    fn blit_to_surface(
        &mut self,
        source: FramebufferId,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let native = self.framebuffer(source)?;
        let (w, h) = (width as i32, height as i32);
        unsafe {
            self.gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(native));
            self.gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, None);
            self.gl.blit_framebuffer(
                0,
                0,
                w,
                h,
                0,
                0,
                w,
                h,
                glow::COLOR_BUFFER_BIT,
                glow::LINEAR,
            );
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        Ok(())
    }
}

impl Drop for GlBackend {
    fn drop(&mut self) {
        for (_, native) in self.framebuffers.drain() {
            unsafe { self.gl.delete_framebuffer(native) };
        }
    }
}
