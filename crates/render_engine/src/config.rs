//! Graphics runtime configuration
//!
//! The recognized option surface, parsed from TOML. Every field has a
//! conservative default so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::{GfxResult, GraphicsError};

/// Default staging buffer capacity for the async copy queue (4 MiB)
pub const DEFAULT_STAGING_BYTES: u64 = 4 * 1024 * 1024;

/// Upper bindless descriptor counts; actual counts also clamp to device limits
pub const MAX_BINDLESS_SAMPLERS: u32 = 512;
/// Maximum number of sampled-image descriptors in the bindless set
pub const MAX_BINDLESS_SRVS: u32 = 64 * 1024;
/// Maximum number of storage-image descriptors in the bindless set
pub const MAX_BINDLESS_UAVS: u32 = 64 * 1024;

/// Async copy queue options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AsyncCopyConfig {
    /// Size of the staging ring buffer in bytes
    pub staging_bytes: u64,
}

impl Default for AsyncCopyConfig {
    fn default() -> Self {
        Self {
            staging_bytes: DEFAULT_STAGING_BYTES,
        }
    }
}

/// Bindless descriptor table sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BindlessConfig {
    /// Number of sampler descriptors
    pub samplers: u32,
    /// Number of sampled-image descriptors
    pub srvs: u32,
    /// Number of storage-image descriptors
    pub uavs: u32,
}

impl Default for BindlessConfig {
    fn default() -> Self {
        Self {
            samplers: MAX_BINDLESS_SAMPLERS,
            srvs: MAX_BINDLESS_SRVS,
            uavs: MAX_BINDLESS_UAVS,
        }
    }
}

/// Viewport and present loop options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ViewportConfig {
    /// Number of frames the CPU may run ahead of the GPU (2 or 3)
    pub frames_in_flight: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
        }
    }
}

/// Top-level graphics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GraphicsConfig {
    /// Back-end API name; `"Vulkan"` is the only accepted value
    pub api: String,
    /// Enable the validation layer and debug-utils messenger
    pub enable_validation: bool,
    /// Async copy queue options
    pub async_copy: AsyncCopyConfig,
    /// Bindless descriptor table sizing
    pub bindless: BindlessConfig,
    /// Viewport options
    pub viewport: ViewportConfig,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            api: "Vulkan".to_string(),
            enable_validation: false,
            async_copy: AsyncCopyConfig::default(),
            bindless: BindlessConfig::default(),
            viewport: ViewportConfig::default(),
        }
    }
}

impl GraphicsConfig {
    /// Parse a configuration from a TOML document and validate it
    pub fn from_toml_str(contents: &str) -> GfxResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| GraphicsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option values that have a restricted domain
    pub fn validate(&self) -> GfxResult<()> {
        if self.api != "Vulkan" {
            return Err(GraphicsError::Config(format!(
                "unsupported graphics API {:?}, only \"Vulkan\" is available",
                self.api
            )));
        }
        if !(2..=3).contains(&self.viewport.frames_in_flight) {
            return Err(GraphicsError::Config(format!(
                "viewport.frames_in_flight must be 2 or 3, got {}",
                self.viewport.frames_in_flight
            )));
        }
        if self.async_copy.staging_bytes == 0 {
            return Err(GraphicsError::Config(
                "async_copy.staging_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp the bindless table sizes to hard caps and device limits.
    ///
    /// `max_samplers` / `max_sampled` / `max_storage` come from
    /// `VkPhysicalDeviceLimits` of the selected adapter.
    pub fn clamped_bindless(&self, max_samplers: u32, max_sampled: u32, max_storage: u32) -> BindlessConfig {
        BindlessConfig {
            samplers: self.bindless.samplers.min(MAX_BINDLESS_SAMPLERS).min(max_samplers),
            srvs: self.bindless.srvs.min(MAX_BINDLESS_SRVS).min(max_sampled),
            uavs: self.bindless.uavs.min(MAX_BINDLESS_UAVS).min(max_storage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GraphicsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.async_copy.staging_bytes, DEFAULT_STAGING_BYTES);
        assert_eq!(config.viewport.frames_in_flight, 2);
    }

    #[test]
    fn test_empty_document_parses_to_defaults() {
        let config = GraphicsConfig::from_toml_str("").unwrap();
        assert_eq!(config.api, "Vulkan");
        assert_eq!(config.bindless.srvs, MAX_BINDLESS_SRVS);
    }

    #[test]
    fn test_parse_overrides() {
        let doc = r#"
            enable_validation = true

            [async_copy]
            staging_bytes = 8388608

            [viewport]
            frames_in_flight = 3
        "#;
        let config = GraphicsConfig::from_toml_str(doc).unwrap();
        assert!(config.enable_validation);
        assert_eq!(config.async_copy.staging_bytes, 8 * 1024 * 1024);
        assert_eq!(config.viewport.frames_in_flight, 3);
    }

    #[test]
    fn test_rejects_unknown_api() {
        let doc = "api = \"D3D12\"";
        assert!(GraphicsConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_rejects_bad_frame_count() {
        let doc = "[viewport]\nframes_in_flight = 5";
        assert!(GraphicsConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_bindless_clamping() {
        let mut config = GraphicsConfig::default();
        config.bindless.srvs = 1 << 20;
        let clamped = config.clamped_bindless(4000, 500_000, 100);
        assert_eq!(clamped.srvs, MAX_BINDLESS_SRVS);
        assert_eq!(clamped.samplers, MAX_BINDLESS_SAMPLERS);
        assert_eq!(clamped.uavs, 100);
    }
}
