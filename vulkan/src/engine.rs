//! One device, one allocator, and factories for everything that runs on them.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use crate::buffer::UsmBuffer;
use crate::config::{AllocatorConfig, DeviceConfig};
use crate::device::DeviceContext;
use crate::error::Result;
use crate::memory::{UsmAllocator, UsmPtr};
use crate::pipeline::Pipeline;
use crate::sequence::Sequence;
use crate::shader::ShaderRegistry;

/// Entry point for host programs.
///
/// ```ignore
/// let engine = Engine::new(&DeviceConfig::from_env())?;
/// let a = engine.buffer_from_slice(&[1.0f32; 1024])?;
/// let mut pipeline = engine.make_pipeline(&registry, "vector_add")?;
/// let mut seq = engine.make_sequence()?;
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    allocator: Arc<UsmAllocator>,
    device: Arc<DeviceContext>,
}

impl Engine {
    /// Bring up a device from `config` with a default allocator.
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        let device = Arc::new(DeviceContext::new(config)?);
        Self::with_device(device, AllocatorConfig::default())
    }

    /// Attach to an existing device context.
    pub fn with_device(device: Arc<DeviceContext>, config: AllocatorConfig) -> Result<Self> {
        let allocator = Arc::new(UsmAllocator::with_config(device.clone(), config)?);
        Ok(Self { allocator, device })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn allocator(&self) -> &Arc<UsmAllocator> {
        &self.allocator
    }

    /// Unbuilt pipeline for kernel `name` from `registry`.
    pub fn make_pipeline<R: ShaderRegistry + ?Sized>(
        &self,
        registry: &R,
        name: &str,
    ) -> Result<Pipeline> {
        Pipeline::new(self.device.clone(), registry, name)
    }

    /// Fresh, idle sequence on the compute queue.
    pub fn make_sequence(&self) -> Result<Sequence> {
        Sequence::new(self.device.clone())
    }

    /// Zeroed buffer of `len` elements.
    pub fn buffer<T: Pod>(&self, len: usize) -> Result<UsmBuffer<T>> {
        UsmBuffer::new(self.allocator.clone(), len)
    }

    pub fn buffer_from_slice<T: Pod>(&self, data: &[T]) -> Result<UsmBuffer<T>> {
        UsmBuffer::from_slice(self.allocator.clone(), data)
    }

    pub fn buffer_filled<T: Pod>(&self, len: usize, value: T) -> Result<UsmBuffer<T>> {
        UsmBuffer::filled(self.allocator.clone(), len, value)
    }

    /// `vk::Buffer` behind a raw unified pointer.
    pub fn get_buffer(&self, ptr: UsmPtr) -> Result<vk::Buffer> {
        self.allocator.get_buffer_from_pointer(ptr)
    }

    /// Whole-buffer binding for `buffer`.
    pub fn buffer_info<T: Pod>(&self, buffer: &UsmBuffer<T>) -> Result<vk::DescriptorBufferInfo> {
        self.allocator.buffer_info(buffer.ptr(), buffer.byte_size())
    }
}
