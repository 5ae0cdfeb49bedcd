//! Device and allocator configuration.
//!
//! Both structs carry sensible defaults. `DeviceConfig::from_env` layers
//! environment overrides on top of the defaults:
//!
//! - `USMFLOW_VALIDATION`: `1`/`true`/`on` enables the Khronos validation layer
//! - `USMFLOW_DEVICE`: `discrete`, `integrated` or `any`
//! - `USMFLOW_BUFFER_DEVICE_ADDRESS`: request device-address-capable buffers

use ash::vk;
use gpu_allocator::MemoryLocation;

/// Environment variable toggling the validation layer.
pub const ENV_VALIDATION: &str = "USMFLOW_VALIDATION";
/// Environment variable selecting the preferred physical device kind.
pub const ENV_DEVICE: &str = "USMFLOW_DEVICE";
/// Environment variable toggling buffer device address.
pub const ENV_BUFFER_DEVICE_ADDRESS: &str = "USMFLOW_BUFFER_DEVICE_ADDRESS";

/// Which kind of physical device to favour when several are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Discrete,
    Integrated,
    Any,
}

impl DevicePreference {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "discrete" | "dgpu" => Self::Discrete,
            "integrated" | "igpu" => Self::Integrated,
            _ => Self::Any,
        }
    }

    /// Whether a device of `ty` is the preferred kind.
    pub fn matches(self, ty: vk::PhysicalDeviceType) -> bool {
        match self {
            Self::Discrete => ty == vk::PhysicalDeviceType::DISCRETE_GPU,
            Self::Integrated => ty == vk::PhysicalDeviceType::INTEGRATED_GPU,
            Self::Any => true,
        }
    }
}

/// Settings consumed by [`DeviceContext::new`](crate::DeviceContext::new).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub application_name: String,
    pub enable_validation: bool,
    pub preference: DevicePreference,
    /// Enable `bufferDeviceAddress` when the device supports it.
    pub buffer_device_address: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            application_name: "usmflow".to_string(),
            enable_validation: cfg!(debug_assertions),
            preference: DevicePreference::Discrete,
            buffer_device_address: true,
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by `USMFLOW_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup(ENV_VALIDATION) {
            self.enable_validation = parse_flag(&v);
        }
        if let Some(v) = lookup(ENV_DEVICE) {
            self.preference = DevicePreference::from_str_or_default(&v);
        }
        if let Some(v) = lookup(ENV_BUFFER_DEVICE_ADDRESS) {
            self.buffer_device_address = parse_flag(&v);
        }
        self
    }
}

fn parse_flag(s: &str) -> bool {
    matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Settings for [`UsmAllocator`](crate::UsmAllocator).
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub buffer_usage: vk::BufferUsageFlags,
    /// Must be a host-visible location: every allocation is mapped.
    pub location: MemoryLocation,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            buffer_usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            // host-cached, suited to random host reads of kernel output
            location: MemoryLocation::GpuToCpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_device_preference_parse() {
        assert_eq!(DevicePreference::from_str_or_default("discrete"), DevicePreference::Discrete);
        assert_eq!(DevicePreference::from_str_or_default(" IGPU "), DevicePreference::Integrated);
        assert_eq!(DevicePreference::from_str_or_default("whatever"), DevicePreference::Any);
    }

    #[test]
    fn test_preference_matches() {
        assert!(DevicePreference::Any.matches(vk::PhysicalDeviceType::CPU));
        assert!(DevicePreference::Discrete.matches(vk::PhysicalDeviceType::DISCRETE_GPU));
        assert!(!DevicePreference::Integrated.matches(vk::PhysicalDeviceType::DISCRETE_GPU));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_VALIDATION, "on"),
            (ENV_DEVICE, "integrated"),
            (ENV_BUFFER_DEVICE_ADDRESS, "0"),
        ]
        .into_iter()
        .collect();

        let config = DeviceConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert!(config.enable_validation);
        assert_eq!(config.preference, DevicePreference::Integrated);
        assert!(!config.buffer_device_address);
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let config = DeviceConfig::default().with_overrides(|_| None);
        assert_eq!(config.application_name, "usmflow");
        assert_eq!(config.preference, DevicePreference::Discrete);
        assert!(config.buffer_device_address);
    }

    #[test]
    fn test_allocator_defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.buffer_usage, vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(config.location, MemoryLocation::GpuToCpu);
    }
}
