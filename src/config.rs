use crate::math::{Pose, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// `GL_SRGB8_ALPHA8`.
pub const DEFAULT_SWAPCHAIN_FORMAT: u32 = 0x8C43;
pub const OPENGL_ENABLE_EXTENSION: &str = "XR_KHR_opengl_enable";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub application_name: String,
    pub application_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
    /// Extensions requested when supported; unsupported names are dropped
    /// before instance creation.
    pub desired_extensions: Vec<String>,
    pub near_plane: f32,
    pub far_plane: f32,
    pub swapchain_format: u32,
    pub swapchain_sample_count: u32,
    pub image_wait_timeout_ms: u64,
    pub reference_space_pose: Pose,
    pub mirror_to_surface: bool,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            application_name: "Theta XR".to_string(),
            application_version: 1,
            engine_name: "Theta Engine".to_string(),
            engine_version: 1,
            desired_extensions: vec![OPENGL_ENABLE_EXTENSION.to_string()],
            near_plane: 0.01,
            far_plane: 1000.0,
            swapchain_format: DEFAULT_SWAPCHAIN_FORMAT,
            swapchain_sample_count: 1,
            image_wait_timeout_ms: 100,
            // q and -q encode the same rotation.
            reference_space_pose: Pose::new(Quat::new(0.0, 0.0, 0.0, -1.0), Vec3::ZERO),
            mirror_to_surface: true,
        }
    }
}

impl CompositorConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.near_plane > 0.0) {
            return Err(ConfigError::Invalid {
                field: "near_plane",
                reason: "must be positive",
            });
        }
        if !(self.far_plane > self.near_plane) {
            return Err(ConfigError::Invalid {
                field: "far_plane",
                reason: "must be greater than near_plane",
            });
        }
        if self.swapchain_sample_count == 0 {
            return Err(ConfigError::Invalid {
                field: "swapchain_sample_count",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    pub fn image_wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.image_wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CompositorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.near_plane, 0.01);
        assert_eq!(config.far_plane, 1000.0);
        assert_eq!(config.swapchain_sample_count, 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            CompositorConfig::from_json_str(r#"{ "application_name": "Cube", "near_plane": 0.05 }"#)
                .expect("config should parse");
        assert_eq!(config.application_name, "Cube");
        assert_eq!(config.near_plane, 0.05);
        assert_eq!(config.engine_name, "Theta Engine");
        assert_eq!(config.desired_extensions, vec![OPENGL_ENABLE_EXTENSION]);
    }

    #[test]
    fn rejects_inverted_planes() {
        let err = CompositorConfig::from_json_str(r#"{ "near_plane": 10.0, "far_plane": 1.0 }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "far_plane", .. }));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = CompositorConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "image_wait_timeout_ms": 5, "mirror_to_surface": false }}"#)
            .expect("write config");
        let config = CompositorConfig::load(file.path()).expect("config should load");
        assert_eq!(config.image_wait_timeout(), std::time::Duration::from_millis(5));
        assert!(!config.mirror_to_surface);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = CompositorConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
