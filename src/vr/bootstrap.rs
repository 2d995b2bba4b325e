use super::capability::{Capabilities, enumerate_two_call};
use super::runtime::{RawStatus, XrRuntime, describe_failure, op};
use super::{
    ApplicationIdentity, BootstrapError, BootstrapStage, DeviceHandle, Extent2D, FormFactor,
    InstanceHandle, ProjectionLayer, ProjectionView, Rect2D, ReferenceSpaceKind, SessionHandle,
    STEREO_VIEW_COUNT, SpaceHandle, SubImage, SwapchainDesc, SwapchainHandle, ViewDescriptor,
    XrError, XrResult,
};
use crate::config::CompositorConfig;
use crate::math::{Fov, Pose};
use crate::render::{FramebufferId, GraphicsBackend, ImageHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EyeResources {
    pub swapchain: SwapchainHandle,
    pub images: Vec<ImageHandle>,
    pub framebuffer: Option<FramebufferId>,
    pub extent: Extent2D,
}

/// Everything bootstrap created, recorded as it is created so a partial
/// bootstrap can be torn down precisely.
#[derive(Debug, Default)]
pub struct SessionResources {
    pub instance: Option<InstanceHandle>,
    pub device: Option<DeviceHandle>,
    pub session: Option<SessionHandle>,
    pub space: Option<SpaceHandle>,
    pub views: Vec<ViewDescriptor>,
    pub eyes: Vec<EyeResources>,
    pub layer: Option<ProjectionLayer>,
}

fn runtime_error<R: XrRuntime>(
    runtime: &R,
    instance: Option<InstanceHandle>,
    stage: BootstrapStage,
    operation: &'static str,
    status: RawStatus,
) -> XrError {
    XrError::bootstrap(
        stage,
        BootstrapError::Runtime(describe_failure(runtime, instance, operation, status)),
    )
}

impl SessionResources {
    /// True once every stage completed.
    pub fn is_ready(&self) -> bool {
        self.layer.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.instance.is_none() && self.eyes.is_empty()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Runs the bootstrap stages in order, stopping at the first failure.
    /// Whatever was created before the failure stays recorded here for
    /// [`SessionResources::release`].
    pub fn bootstrap<R, G>(
        &mut self,
        runtime: &mut R,
        graphics: &mut G,
        capabilities: &Capabilities,
        config: &CompositorConfig,
        binding: &R::Binding,
    ) -> XrResult<()>
    where
        R: XrRuntime,
        G: GraphicsBackend,
    {
        if !self.is_empty() {
            return Err(XrError::bootstrap(
                BootstrapStage::CreateInstance,
                BootstrapError::AlreadyInitialized,
            ));
        }

        let instance = self.create_instance(runtime, capabilities, config)?;
        let device = self.select_device(runtime, instance)?;
        let session = self.create_session(runtime, graphics, instance, device, binding)?;
        let space = self.create_reference_space(runtime, instance, session, config)?;
        self.query_views(runtime, instance, device)?;
        self.create_swapchains(runtime, instance, session, config)?;
        self.allocate_framebuffers(graphics)?;
        self.prepare_layer(space);

        log::info!(
            "[xr] bootstrap complete on {}: {} eyes",
            runtime.label(),
            self.eyes.len()
        );
        Ok(())
    }

    fn create_instance<R: XrRuntime>(
        &mut self,
        runtime: &mut R,
        capabilities: &Capabilities,
        config: &CompositorConfig,
    ) -> XrResult<InstanceHandle> {
        let stage = BootstrapStage::CreateInstance;
        let required = runtime.graphics_extension();

        let mut desired = config.desired_extensions.clone();
        if !desired.iter().any(|name| name == required) {
            desired.push(required.to_string());
        }
        let extensions = capabilities.filter_extensions(&desired);
        if !extensions.iter().any(|name| name == required) {
            return Err(XrError::bootstrap(
                stage,
                BootstrapError::UnsupportedExtension(required.to_string()),
            ));
        }

        let identity = ApplicationIdentity {
            application_name: config.application_name.clone(),
            application_version: config.application_version,
            engine_name: config.engine_name.clone(),
            engine_version: config.engine_version,
        };
        let instance = runtime
            .create_instance(&identity, &extensions)
            .map_err(|status| runtime_error(runtime, None, stage, op::CREATE_INSTANCE, status))?;
        self.instance = Some(instance);

        log::info!(
            "[xr] instance created for {} with extensions [{}]",
            identity.application_name,
            extensions.join(", ")
        );
        Ok(instance)
    }

    fn select_device<R: XrRuntime>(
        &mut self,
        runtime: &mut R,
        instance: InstanceHandle,
    ) -> XrResult<DeviceHandle> {
        let stage = BootstrapStage::SelectDevice;
        let device = runtime
            .system(instance, FormFactor::HeadMountedDisplay)
            .map_err(|status| {
                runtime_error(runtime, Some(instance), stage, op::GET_SYSTEM, status)
            })?
            .ok_or_else(|| XrError::bootstrap(stage, BootstrapError::NoDeviceFound))?;
        self.device = Some(device);
        Ok(device)
    }

    fn create_session<R, G>(
        &mut self,
        runtime: &mut R,
        graphics: &mut G,
        instance: InstanceHandle,
        device: DeviceHandle,
        binding: &R::Binding,
    ) -> XrResult<SessionHandle>
    where
        R: XrRuntime,
        G: GraphicsBackend,
    {
        let stage = BootstrapStage::CreateSession;
        let requirements = runtime
            .graphics_requirements(instance, device)
            .map_err(|status| {
                runtime_error(runtime, Some(instance), stage, op::GRAPHICS_REQUIREMENTS, status)
            })?;

        let actual = graphics.api_version();
        if !requirements.accepts(actual) {
            return Err(XrError::bootstrap(
                stage,
                BootstrapError::GraphicsVersionUnsupported {
                    actual,
                    min: requirements.min_api_version,
                    max: requirements.max_api_version,
                },
            ));
        }
        log::info!(
            "[gl] {} {} within runtime range {}..={}",
            graphics.label(),
            actual,
            requirements.min_api_version,
            requirements.max_api_version
        );

        let session = runtime
            .create_session(instance, device, binding)
            .map_err(|status| {
                runtime_error(runtime, Some(instance), stage, op::CREATE_SESSION, status)
            })?;
        self.session = Some(session);
        Ok(session)
    }

    fn create_reference_space<R: XrRuntime>(
        &mut self,
        runtime: &mut R,
        instance: InstanceHandle,
        session: SessionHandle,
        config: &CompositorConfig,
    ) -> XrResult<SpaceHandle> {
        let stage = BootstrapStage::CreateReferenceSpace;
        let space = runtime
            .create_reference_space(
                session,
                ReferenceSpaceKind::Local,
                config.reference_space_pose,
            )
            .map_err(|status| {
                runtime_error(runtime, Some(instance), stage, op::CREATE_REFERENCE_SPACE, status)
            })?;
        self.space = Some(space);
        Ok(space)
    }

    fn query_views<R: XrRuntime>(
        &mut self,
        runtime: &mut R,
        instance: InstanceHandle,
        device: DeviceHandle,
    ) -> XrResult<()> {
        let stage = BootstrapStage::QueryViews;
        let views = enumerate_two_call(|out| {
            runtime.enumerate_view_descriptors(instance, device, out)
        })
        .map_err(|status| {
            runtime_error(runtime, Some(instance), stage, op::ENUMERATE_VIEW_DESCRIPTORS, status)
        })?;
        if views.is_empty() {
            return Err(XrError::bootstrap(stage, BootstrapError::NoViewsReported));
        }
        if views.len() != STEREO_VIEW_COUNT {
            return Err(XrError::bootstrap(
                stage,
                BootstrapError::ViewCountMismatch {
                    expected: STEREO_VIEW_COUNT,
                    actual: views.len(),
                },
            ));
        }

        for (eye, view) in views.iter().enumerate() {
            log::info!(
                "[xr] eye {eye}: recommended {}x{} (max {}x{}), samples {}",
                view.recommended_width,
                view.recommended_height,
                view.max_width,
                view.max_height,
                view.recommended_sample_count
            );
        }
        self.views = views;
        Ok(())
    }

    fn create_swapchains<R: XrRuntime>(
        &mut self,
        runtime: &mut R,
        instance: InstanceHandle,
        session: SessionHandle,
        config: &CompositorConfig,
    ) -> XrResult<()> {
        let stage = BootstrapStage::CreateSwapchains;
        for eye in 0..self.views.len() {
            let extent = self.views[eye].extent();
            let desc = SwapchainDesc {
                format: config.swapchain_format,
                sample_count: config.swapchain_sample_count,
                width: extent.width,
                height: extent.height,
            };
            let swapchain = runtime.create_swapchain(session, &desc).map_err(|status| {
                runtime_error(runtime, Some(instance), stage, op::CREATE_SWAPCHAIN, status)
            })?;
            // Recorded before image enumeration so teardown still sees it.
            self.eyes.push(EyeResources {
                swapchain,
                images: Vec::new(),
                framebuffer: None,
                extent,
            });

            let images = enumerate_two_call(|out| runtime.enumerate_swapchain_images(swapchain, out))
                .map_err(|status| {
                    runtime_error(
                        runtime,
                        Some(instance),
                        stage,
                        op::ENUMERATE_SWAPCHAIN_IMAGES,
                        status,
                    )
                })?;
            if images.is_empty() {
                return Err(XrError::bootstrap(stage, BootstrapError::EmptySwapchain { eye }));
            }

            log::info!(
                "[xr] eye {eye}: swapchain {}x{} with {} images",
                extent.width,
                extent.height,
                images.len()
            );
            if let Some(resources) = self.eyes.last_mut() {
                resources.images = images;
            }
        }
        Ok(())
    }

    fn allocate_framebuffers<G: GraphicsBackend>(&mut self, graphics: &mut G) -> XrResult<()> {
        for (eye, resources) in self.eyes.iter_mut().enumerate() {
            let framebuffer = graphics.create_framebuffer().map_err(|reason| {
                XrError::bootstrap(
                    BootstrapStage::AllocateFramebuffers,
                    BootstrapError::Framebuffer { eye, reason },
                )
            })?;
            resources.framebuffer = Some(framebuffer);
        }
        Ok(())
    }

    fn prepare_layer(&mut self, space: SpaceHandle) {
        let views = self
            .eyes
            .iter()
            .map(|eye| ProjectionView {
                pose: Pose::IDENTITY,
                fov: Fov::default(),
                sub_image: SubImage {
                    swapchain: eye.swapchain,
                    rect: Rect2D {
                        x: 0,
                        y: 0,
                        extent: eye.extent,
                    },
                    image_array_index: 0,
                },
            })
            .collect();
        self.layer = Some(ProjectionLayer { space, views });
    }

    /// Releases framebuffers, then swapchains, then the instance (which
    /// takes the session and space with it). Only what was created is
    /// released and every handle is cleared, so calling this again does
    /// nothing.
    pub fn release<R, G>(&mut self, runtime: &mut R, graphics: &mut G)
    where
        R: XrRuntime,
        G: GraphicsBackend,
    {
        if self.is_empty() {
            return;
        }

        self.layer = None;
        for eye in &mut self.eyes {
            if let Some(framebuffer) = eye.framebuffer.take() {
                graphics.delete_framebuffer(framebuffer);
            }
        }
        for eye in self.eyes.drain(..) {
            if let Err(status) = runtime.destroy_swapchain(eye.swapchain) {
                let failure = describe_failure(runtime, self.instance, op::DESTROY_SWAPCHAIN, status);
                log::warn!("[xr] {failure}");
            }
        }

        self.views.clear();
        self.space = None;
        self.session = None;
        self.device = None;
        if let Some(instance) = self.instance.take() {
            if let Err(status) = runtime.destroy_instance(instance) {
                let failure = describe_failure(runtime, Some(instance), op::DESTROY_INSTANCE, status);
                log::warn!("[xr] {failure}");
            }
        }
        log::info!("[xr] session resources released");
    }
}
