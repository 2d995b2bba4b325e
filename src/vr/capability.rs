use super::runtime::{CallResult, XrRuntime, describe_failure, op};
use super::{ExtensionInfo, LayerInfo, XrError, XrResult};

/// Count-then-fill enumeration: the first call with an empty buffer
/// yields the element count, the second fills a buffer of that size.
pub fn enumerate_two_call<T, F>(mut call: F) -> CallResult<Vec<T>>
where
    T: Default + Clone,
    F: FnMut(&mut [T]) -> CallResult<u32>,
{
    let count = call(&mut [])? as usize;
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut items = vec![T::default(); count];
    let written = call(&mut items)? as usize;
    items.truncate(written);
    Ok(items)
}

pub fn list_api_layers<R: XrRuntime>(runtime: &mut R) -> XrResult<Vec<LayerInfo>> {
    enumerate_two_call(|out| runtime.enumerate_api_layers(out)).map_err(|status| {
        XrError::QueryFailed(describe_failure(
            runtime,
            None,
            op::ENUMERATE_API_LAYERS,
            status,
        ))
    })
}

pub fn list_extensions<R: XrRuntime>(runtime: &mut R) -> XrResult<Vec<ExtensionInfo>> {
    enumerate_two_call(|out| runtime.enumerate_extensions(out)).map_err(|status| {
        XrError::QueryFailed(describe_failure(
            runtime,
            None,
            op::ENUMERATE_EXTENSIONS,
            status,
        ))
    })
}

/// What the runtime reported before any instance existed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub api_layers: Vec<LayerInfo>,
    pub extensions: Vec<ExtensionInfo>,
}

impl Capabilities {
    /// Queries layers and extensions. A failed query is logged and leaves
    /// that list empty.
    pub fn discover<R: XrRuntime>(runtime: &mut R) -> Self {
        let api_layers = list_api_layers(runtime).unwrap_or_else(|err| {
            log::warn!("[xr] {err}");
            Vec::new()
        });
        let extensions = list_extensions(runtime).unwrap_or_else(|err| {
            log::warn!("[xr] {err}");
            Vec::new()
        });

        log::info!(
            "[xr] {} reports {} api layers, {} extensions",
            runtime.label(),
            api_layers.len(),
            extensions.len()
        );
        for layer in &api_layers {
            log::debug!(
                "[xr]   layer {} (spec {}, v{}): {}",
                layer.name,
                layer.spec_version,
                layer.layer_version,
                layer.description
            );
        }
        for extension in &extensions {
            log::debug!("[xr]   extension {} v{}", extension.name, extension.version);
        }

        Self {
            api_layers,
            extensions,
        }
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|extension| extension.name == name)
    }

    /// Keeps the desired extensions the runtime supports, in request order.
    pub fn filter_extensions(&self, desired: &[String]) -> Vec<String> {
        let mut enabled: Vec<String> = Vec::with_capacity(desired.len());
        for name in desired {
            if enabled.contains(name) {
                continue;
            }
            if self.supports_extension(name) {
                enabled.push(name.clone());
            } else {
                log::warn!("[xr] extension {name} not supported by runtime; skipping");
            }
        }
        enabled
    }
}
