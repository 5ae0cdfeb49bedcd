//! Vulkan loader, instance, physical device selection and logical device setup.
//!
//! [`DeviceContext`] is everything the core consumes from the driver: a device
//! handle, one compute queue and its family index. Bootstrap negotiates the
//! features the allocator and kernels depend on (8/16-bit storage access,
//! buffer device address) and enables whichever the GPU supports.

use std::ffi::{CStr, CString};

use ash::vk;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::error::{Error, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Failures while bringing up the device context.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The Vulkan loader library could not be opened.
    #[error("failed to load the Vulkan library: {0}")]
    Loader(String),
    /// No physical device was enumerated.
    #[error("No Vulkan-capable GPU found")]
    NoGpu,
    /// The chosen GPU exposes no queue family with compute support.
    #[error("No compute queue family found")]
    NoComputeQueue,
    /// Application name contains an interior NUL.
    #[error("invalid application name: {0}")]
    InvalidName(String),
    /// Driver call failure during bring-up.
    #[error("{context}: {result}{}", hint(.result))]
    Vk {
        context: &'static str,
        result: vk::Result,
    },
}

fn hint(result: &vk::Result) -> &'static str {
    match *result {
        vk::Result::ERROR_DEVICE_LOST => " (GPU device lost, restart may be required)",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => " (GPU out of memory)",
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => " (host out of memory)",
        _ => "",
    }
}

fn vk_err(context: &'static str) -> impl FnOnce(vk::Result) -> DeviceError {
    move |result| DeviceError::Vk { context, result }
}

/// Optional device features that were actually enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub storage_buffer_8bit: bool,
    pub uniform_and_storage_buffer_8bit: bool,
    pub shader_int8: bool,
    pub storage_buffer_16bit: bool,
    pub buffer_device_address: bool,
}

/// Compute-relevant device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeLimits {
    pub max_workgroup_size: [u32; 3],
    pub max_workgroup_invocations: u32,
    pub max_workgroup_count: [u32; 3],
    pub max_push_constants_size: u32,
    pub max_storage_buffer_range: u32,
}

impl ComputeLimits {
    /// Whether a workgroup of `size` fits on the device.
    pub fn fits_workgroup(&self, size: [u32; 3]) -> bool {
        let per_axis = size
            .iter()
            .zip(self.max_workgroup_size.iter())
            .all(|(s, m)| s <= m);
        let invocations = size.iter().map(|&s| u64::from(s)).product::<u64>();
        per_axis && invocations <= u64::from(self.max_workgroup_invocations)
    }
}

/// Owns the Vulkan instance, logical device and compute queue.
pub struct DeviceContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    compute_queue: vk::Queue,
    queue_family_index: u32,
    device_name: String,
    features: DeviceFeatures,
    limits: ComputeLimits,
    /// Serializes `vkQueueSubmit` on the shared compute queue.
    queue_lock: Mutex<()>,
}

impl DeviceContext {
    /// Load Vulkan, create an instance, pick a GPU, create the device.
    pub fn new(config: &DeviceConfig) -> std::result::Result<Self, DeviceError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| DeviceError::Loader(e.to_string()))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| DeviceError::InvalidName(config.application_name.clone()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"usmflow")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let layers = if config.enable_validation {
            validation_layers(&entry)
        } else {
            Vec::new()
        };
        let layer_ptrs: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(vk_err("vkCreateInstance"))?;

        match unsafe { Self::create_device(entry.clone(), instance.clone(), config) } {
            Ok(ctx) => Ok(ctx),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn create_device(
        entry: ash::Entry,
        instance: ash::Instance,
        config: &DeviceConfig,
    ) -> std::result::Result<Self, DeviceError> {
        let physical_devices = instance
            .enumerate_physical_devices()
            .map_err(vk_err("vkEnumeratePhysicalDevices"))?;

        if physical_devices.is_empty() {
            return Err(DeviceError::NoGpu);
        }

        // (device, compute family) for every GPU that can run compute at all
        let candidates: Vec<(vk::PhysicalDevice, u32)> = physical_devices
            .iter()
            .filter_map(|&pd| compute_family(&instance, pd).map(|family| (pd, family)))
            .collect();
        let &(physical_device, queue_family_index) = candidates
            .iter()
            .find(|(pd, _)| {
                let props = instance.get_physical_device_properties(*pd);
                config.preference.matches(props.device_type)
            })
            .or_else(|| candidates.first())
            .ok_or(DeviceError::NoComputeQueue)?;

        let properties = instance.get_physical_device_properties(physical_device);
        let device_name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!(
            "Using GPU: {} ({:?}, queue family {})",
            device_name,
            properties.device_type,
            queue_family_index
        );

        // Query what the GPU supports before asking for it.
        let mut supported11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut supported12 = vk::PhysicalDeviceVulkan12Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut supported11)
                .push_next(&mut supported12);
            instance.get_physical_device_features2(physical_device, &mut features2);
        }

        let features = DeviceFeatures {
            storage_buffer_8bit: supported12.storage_buffer8_bit_access == vk::TRUE,
            uniform_and_storage_buffer_8bit: supported12.uniform_and_storage_buffer8_bit_access
                == vk::TRUE,
            shader_int8: supported12.shader_int8 == vk::TRUE,
            storage_buffer_16bit: supported11.storage_buffer16_bit_access == vk::TRUE,
            buffer_device_address: config.buffer_device_address
                && supported12.buffer_device_address == vk::TRUE,
        };
        tracing::debug!("Enabling device features: {:?}", features);

        let mut enable11 = vk::PhysicalDeviceVulkan11Features::default()
            .storage_buffer16_bit_access(features.storage_buffer_16bit);
        let mut enable12 = vk::PhysicalDeviceVulkan12Features::default()
            .storage_buffer8_bit_access(features.storage_buffer_8bit)
            .uniform_and_storage_buffer8_bit_access(features.uniform_and_storage_buffer_8bit)
            .shader_int8(features.shader_int8)
            .buffer_device_address(features.buffer_device_address);

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities)];
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .push_next(&mut enable11)
            .push_next(&mut enable12);

        let device = instance
            .create_device(physical_device, &device_info, None)
            .map_err(vk_err("vkCreateDevice"))?;
        let compute_queue = device.get_device_queue(queue_family_index, 0);

        let l = properties.limits;
        let limits = ComputeLimits {
            max_workgroup_size: l.max_compute_work_group_size,
            max_workgroup_invocations: l.max_compute_work_group_invocations,
            max_workgroup_count: l.max_compute_work_group_count,
            max_push_constants_size: l.max_push_constants_size,
            max_storage_buffer_range: l.max_storage_buffer_range,
        };

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            compute_queue,
            queue_family_index,
            device_name,
            features,
            limits,
            queue_lock: Mutex::new(()),
        })
    }

    /// Logical device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// GPU chosen at bootstrap.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Raw compute queue. Submit through [`submit`](Self::submit) to keep
    /// queue access serialized.
    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Optional features that were supported and enabled.
    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    /// Limits used to validate pipeline configurations.
    pub fn limits(&self) -> ComputeLimits {
        self.limits
    }

    /// Thread-safe queue submission. Holds the queue lock during `vkQueueSubmit`.
    pub fn submit(&self, submits: &[vk::SubmitInfo<'_>], fence: vk::Fence) -> Result<()> {
        let _lock = self.queue_lock.lock();
        unsafe { self.device.queue_submit(self.compute_queue, submits, fence) }
            .map_err(Error::vk("vkQueueSubmit"))
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_name", &self.device_name)
            .field("queue_family_index", &self.queue_family_index)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        tracing::debug!("Destroying device context for {}", self.device_name);
        let idle = unsafe { self.device.device_wait_idle() };
        idle_before_teardown(idle);
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Teardown goes ahead regardless; a failed idle wait is logged and reported.
fn idle_before_teardown(result: std::result::Result<(), vk::Result>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("vkDeviceWaitIdle failed during drop: {}{}", e, hint(&e));
            false
        }
    }
}

/// First queue family with compute support.
fn compute_family(instance: &ash::Instance, pd: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
}

fn validation_layers(entry: &ash::Entry) -> Vec<&'static CStr> {
    let available = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let found = available
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
    if found {
        vec![VALIDATION_LAYER]
    } else {
        tracing::warn!("Validation layer requested but not available, continuing without it");
        Vec::new()
    }
}
