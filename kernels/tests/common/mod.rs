use std::sync::Arc;

use usmflow_vulkan::{AllocatorConfig, DeviceConfig, DeviceContext, DevicePreference, Engine};

/// Engine on any available GPU; `None` skips the test on GPU-less machines.
///
/// Validation is requested so API misuse surfaces in the test log; without
/// the layer installed the device comes up without it.
pub fn engine() -> Option<Engine> {
    let config = DeviceConfig {
        enable_validation: true,
        preference: DevicePreference::Any,
        ..DeviceConfig::default()
    };
    let device = match DeviceContext::new(&config) {
        Ok(device) => Arc::new(device),
        Err(e) => {
            eprintln!("skipping: {e}");
            return None;
        }
    };
    Some(Engine::with_device(device, AllocatorConfig::default()).unwrap())
}
