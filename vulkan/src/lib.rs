//! usmflow Vulkan compute runtime.
//!
//! Host pointers that double as GPU buffers ([`UsmAllocator`], [`UsmBuffer`]),
//! a fluent compute [`Pipeline`] builder over named SPIR-V kernels, and a
//! reusable command [`Sequence`] that records, submits and fences batches of
//! dispatches on a single compute queue. [`Engine`] ties them to one
//! [`DeviceContext`].

pub mod buffer;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod sequence;
pub mod shader;

pub use buffer::UsmBuffer;
pub use config::{AllocatorConfig, DeviceConfig, DevicePreference};
pub use device::{ComputeLimits, DeviceContext, DeviceError, DeviceFeatures};
pub use engine::Engine;
pub use error::{ConfigError, Error, Result};
pub use memory::{AllocationTable, MemoryResource, UsmAllocator, UsmPtr};
pub use pipeline::{div_ceil, Pipeline, PipelineConfig, PushConstantBuffer, MAX_PUSH_CONSTANT_SIZE};
pub use sequence::{Sequence, SequenceOp, SequenceState};
pub use shader::{ShaderRegistry, StaticRegistry};

pub use ash::vk;
