//! Compute pipeline builder.
//!
//! A [`Pipeline`] starts from a named kernel in a [`ShaderRegistry`] and is
//! configured fluently:
//!
//! ```ignore
//! let mut pipeline = Pipeline::new(device, &registry, "vector_add")?;
//! pipeline
//!     .work_group_size(256, 1, 1)?
//!     .num_buffers(3)?
//!     .push_constant::<u32>()?
//!     .build()?;
//! pipeline.update_descriptor_set(0, &[a.binding()?, b.binding()?, c.binding()?])?;
//! pipeline.update_push_constant_value(&n)?;
//! ```
//!
//! Structure (workgroup size, binding count, set count, push-constant size)
//! is frozen by `build()`. Afterwards only the buffer bindings of each
//! descriptor set and the push-constant payload change.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use crate::device::{ComputeLimits, DeviceContext};
use crate::error::{ConfigError, Error, Result};
use crate::shader::ShaderRegistry;

/// Largest push-constant block a pipeline accepts, in bytes.
pub const MAX_PUSH_CONSTANT_SIZE: usize = 128;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// `ceil(a / b)`, e.g. the number of workgroups covering `a` items.
pub const fn div_ceil(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

/// Validate a SPIR-V blob and copy it into words.
pub fn spirv_words(name: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    let unknown = |reason| Error::UnknownShader {
        name: name.to_string(),
        reason,
    };
    if bytes.is_empty() {
        return Err(unknown("SPIR-V binary is empty"));
    }
    if bytes.len() % 4 != 0 {
        return Err(unknown("SPIR-V binary length is not a multiple of 4"));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(unknown("missing SPIR-V magic number"));
    }
    Ok(words)
}

/// Fixed-capacity push-constant payload.
#[derive(Clone, PartialEq, Eq)]
pub struct PushConstantBuffer {
    data: [u8; MAX_PUSH_CONSTANT_SIZE],
    len: usize,
}

impl PushConstantBuffer {
    pub fn with_size(len: usize) -> std::result::Result<Self, ConfigError> {
        if len > MAX_PUSH_CONSTANT_SIZE {
            return Err(ConfigError::PushConstantTooLarge {
                requested: len,
                max: MAX_PUSH_CONSTANT_SIZE,
            });
        }
        Ok(Self {
            data: [0; MAX_PUSH_CONSTANT_SIZE],
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Replace the payload. The size must equal the configured size.
    pub fn update(&mut self, bytes: &[u8]) -> Result<()> {
        if self.len == 0 {
            return Err(ConfigError::PushConstantsDisabled.into());
        }
        if bytes.len() != self.len {
            return Err(Error::BindingMismatch {
                what: "push constant bytes",
                expected: self.len,
                actual: bytes.len(),
            });
        }
        self.data[..self.len].copy_from_slice(bytes);
        Ok(())
    }
}

impl Default for PushConstantBuffer {
    fn default() -> Self {
        Self {
            data: [0; MAX_PUSH_CONSTANT_SIZE],
            len: 0,
        }
    }
}

impl std::fmt::Debug for PushConstantBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PushConstantBuffer")
            .field(&self.as_bytes())
            .finish()
    }
}

/// Structural pipeline parameters, frozen by `build()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub num_buffers: Option<u32>,
    pub num_sets: u32,
    pub workgroup_size: [u32; 3],
    pub push_constant_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_buffers: None,
            num_sets: 1,
            workgroup_size: [0; 3],
            push_constant_size: 0,
        }
    }
}

impl PipelineConfig {
    /// Check everything `build()` needs. Returns the binding count.
    pub fn validate(&self, limits: &ComputeLimits) -> std::result::Result<u32, ConfigError> {
        let num_buffers = match self.num_buffers {
            None => return Err(ConfigError::MissingBufferCount),
            Some(0) => return Err(ConfigError::ZeroBufferCount),
            Some(n) => n,
        };
        if self.num_sets == 0 {
            return Err(ConfigError::ZeroSetCount);
        }
        if self.workgroup_size.contains(&0) {
            return Err(ConfigError::WorkgroupUnset(self.workgroup_size));
        }
        if !limits.fits_workgroup(self.workgroup_size) {
            return Err(ConfigError::WorkgroupTooLarge {
                size: self.workgroup_size,
                max: limits.max_workgroup_size,
                max_invocations: limits.max_workgroup_invocations,
            });
        }
        let max_push = MAX_PUSH_CONSTANT_SIZE.min(limits.max_push_constants_size as usize);
        if self.push_constant_size > max_push {
            return Err(ConfigError::PushConstantTooLarge {
                requested: self.push_constant_size,
                max: max_push,
            });
        }
        Ok(num_buffers)
    }

    /// Workgroup counts covering `problem` items per axis.
    pub fn grid_for(&self, problem: [u32; 3]) -> [u32; 3] {
        let wg = self.workgroup_size;
        [
            div_ceil(problem[0], wg[0].max(1)),
            div_ceil(problem[1], wg[1].max(1)),
            div_ceil(problem[2], wg[2].max(1)),
        ]
    }
}

/// Storage-buffer descriptors a pool needs for `buffers` bindings in each of
/// `sets` sets. Both counts and their product must fit the driver's `u32`.
fn descriptor_count(buffers: usize, sets: usize) -> std::result::Result<u32, ConfigError> {
    buffers
        .checked_mul(sets)
        .and_then(|total| u32::try_from(total).ok())
        .filter(|_| u32::try_from(buffers).is_ok() && u32::try_from(sets).is_ok())
        .ok_or(ConfigError::TooManyDescriptors { buffers, sets })
}

/// A compute kernel plus its descriptor and push-constant configuration.
pub struct Pipeline {
    name: String,
    spirv: Vec<u32>,
    config: PipelineConfig,
    push_constants: PushConstantBuffer,

    shader_module: vk::ShaderModule,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    device: Arc<DeviceContext>,
}

impl Pipeline {
    /// Look `name` up in `registry` and create its shader module.
    pub fn new<R: ShaderRegistry + ?Sized>(
        device: Arc<DeviceContext>,
        registry: &R,
        name: &str,
    ) -> Result<Self> {
        let bytes = registry.lookup(name).ok_or_else(|| Error::UnknownShader {
            name: name.to_string(),
            reason: "not found in registry",
        })?;
        let spirv = spirv_words(name, bytes)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&spirv);
        let shader_module = unsafe { device.device().create_shader_module(&create_info, None) }
            .map_err(Error::vk("vkCreateShaderModule"))?;
        tracing::debug!("Pipeline `{}`: shader module with {} words", name, spirv.len());

        Ok(Self {
            name: name.to_string(),
            spirv,
            config: PipelineConfig::default(),
            push_constants: PushConstantBuffer::default(),
            shader_module,
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            device,
        })
    }

    /// Registry name the kernel was created from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SPIR-V words handed to the driver.
    pub fn spirv(&self) -> &[u32] {
        &self.spirv
    }

    /// Current structural configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Whether `build()` has succeeded.
    pub fn is_built(&self) -> bool {
        self.pipeline != vk::Pipeline::null()
    }

    /// Whether a non-empty push-constant block is configured.
    pub fn has_push_constants(&self) -> bool {
        !self.push_constants.is_empty()
    }

    /// Configured number of descriptor sets.
    pub fn set_count(&self) -> usize {
        self.config.num_sets as usize
    }

    /// Workgroup counts covering `problem` with the configured workgroup size.
    pub fn grid_for(&self, problem: [u32; 3]) -> [u32; 3] {
        self.config.grid_for(problem)
    }

    /// Local workgroup size, fed to the shader as specialization constants.
    pub fn work_group_size(&mut self, x: u32, y: u32, z: u32) -> Result<&mut Self> {
        self.ensure_unbuilt()?;
        self.config.workgroup_size = [x, y, z];
        Ok(self)
    }

    /// Set the storage-buffer count per set and create the set layout and pool.
    ///
    /// On failure the previous layout, pool and buffer count are kept.
    pub fn num_buffers(&mut self, n: usize) -> Result<&mut Self> {
        self.ensure_unbuilt()?;
        if n == 0 {
            return Err(ConfigError::ZeroBufferCount.into());
        }
        let descriptors = descriptor_count(n, self.config.num_sets as usize)?;
        let n = n as u32;

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..n)
            .map(|i| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let device = self.device.device();
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(Error::vk("vkCreateDescriptorSetLayout"))?;
        let pool = match self.create_descriptor_pool(descriptors, self.config.num_sets) {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(e);
            }
        };

        self.destroy_layout_and_pool();
        self.descriptor_set_layout = layout;
        self.descriptor_pool = pool;
        self.config.num_buffers = Some(n);
        Ok(self)
    }

    /// Number of descriptor sets (default 1). Recreates the pool if one exists.
    ///
    /// On failure the previous pool and set count are kept.
    pub fn num_sets(&mut self, count: usize) -> Result<&mut Self> {
        self.ensure_unbuilt()?;
        if count == 0 {
            return Err(ConfigError::ZeroSetCount.into());
        }
        let buffers = self.config.num_buffers.unwrap_or(0) as usize;
        let descriptors = descriptor_count(buffers, count)?;
        let count = count as u32;
        if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
            let pool = self.create_descriptor_pool(descriptors, count)?;
            unsafe { self.device.device().destroy_descriptor_pool(self.descriptor_pool, None) };
            self.descriptor_pool = pool;
        }
        self.config.num_sets = count;
        Ok(self)
    }

    /// Size of the push-constant block in bytes; 0 disables push constants.
    pub fn push_constant_size(&mut self, bytes: usize) -> Result<&mut Self> {
        self.ensure_unbuilt()?;
        self.push_constants = PushConstantBuffer::with_size(bytes)?;
        self.config.push_constant_size = bytes;
        Ok(self)
    }

    /// Size the push-constant block for one `T`.
    pub fn push_constant<T: Pod>(&mut self) -> Result<&mut Self> {
        self.push_constant_size(std::mem::size_of::<T>())
    }

    /// Allocate descriptor sets and create the pipeline layout and pipeline.
    pub fn build(&mut self) -> Result<&mut Self> {
        self.ensure_unbuilt()?;
        self.config.validate(&self.device.limits())?;
        if self.descriptor_set_layout == vk::DescriptorSetLayout::null()
            || self.descriptor_pool == vk::DescriptorPool::null()
        {
            return Err(ConfigError::MissingBufferCount.into());
        }

        let device = self.device.device();
        let layouts = vec![self.descriptor_set_layout; self.config.num_sets as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let descriptor_sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(Error::vk("vkAllocateDescriptorSets"))?;

        let set_layouts = [self.descriptor_set_layout];
        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(self.push_constants.len() as u32)];
        let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if self.has_push_constants() {
            layout_info = layout_info.push_constant_ranges(&push_ranges);
        }
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(result) => {
                self.reset_descriptor_pool();
                return Err(Error::Vulkan {
                    context: "vkCreatePipelineLayout",
                    result,
                });
            }
        };

        // Specialization constants 0, 1, 2 carry the workgroup size.
        let map_entries: Vec<vk::SpecializationMapEntry> = (0..3u32)
            .map(|i| vk::SpecializationMapEntry {
                constant_id: i,
                offset: i * 4,
                size: 4,
            })
            .collect();
        let spec_data = bytemuck::bytes_of(&self.config.workgroup_size);
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(spec_data);
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.shader_module)
            .name(c"main")
            .specialization_info(&specialization);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout);

        let pipeline = match unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, result)) => {
                unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
                self.reset_descriptor_pool();
                return Err(Error::Vulkan {
                    context: "vkCreateComputePipelines",
                    result,
                });
            }
        };

        self.descriptor_sets = descriptor_sets;
        self.pipeline_layout = pipeline_layout;
        self.pipeline = pipeline;
        tracing::debug!(
            "Pipeline `{}` built: workgroup {:?}, {} buffers x {} sets, {} push constant bytes",
            self.name,
            self.config.workgroup_size,
            self.config.num_buffers.unwrap_or(0),
            self.config.num_sets,
            self.push_constants.len()
        );
        Ok(self)
    }

    /// Rewrite every binding of descriptor set `set`.
    pub fn update_descriptor_set(
        &mut self,
        set: usize,
        bindings: &[vk::DescriptorBufferInfo],
    ) -> Result<()> {
        let descriptor_set = self.descriptor_set(set)?;
        let expected = self.config.num_buffers.unwrap_or(0) as usize;
        if bindings.len() != expected {
            return Err(Error::BindingMismatch {
                what: "buffer bindings",
                expected,
                actual: bindings.len(),
            });
        }

        let writes: Vec<vk::WriteDescriptorSet> = bindings
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(i as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { self.device.device().update_descriptor_sets(&writes, &[]) };
        tracing::trace!("Pipeline `{}`: updated set {}", self.name, set);
        Ok(())
    }

    /// Replace the push-constant payload. `bytes` must match the configured size.
    pub fn update_push_constant(&mut self, bytes: &[u8]) -> Result<()> {
        self.push_constants.update(bytes)
    }

    pub fn update_push_constant_value<T: Pod>(&mut self, value: &T) -> Result<()> {
        self.push_constants.update(bytemuck::bytes_of(value))
    }

    /// Payload pushed by the next `record_bind_push`.
    pub fn push_constant_bytes(&self) -> &[u8] {
        self.push_constants.as_bytes()
    }

    /// Bind the pipeline and descriptor set `set` on `cmd`.
    pub fn record_bind_core(&self, cmd: vk::CommandBuffer, set: usize) -> Result<()> {
        let descriptor_set = self.descriptor_set(set)?;
        let device = self.device.device();
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[descriptor_set],
                &[],
            );
        }
        Ok(())
    }

    /// Push the current payload on `cmd`.
    pub fn record_bind_push(&self, cmd: vk::CommandBuffer) -> Result<()> {
        if !self.has_push_constants() {
            return Err(ConfigError::PushConstantsDisabled.into());
        }
        self.ensure_built()?;
        unsafe {
            self.device.device().cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                self.push_constants.as_bytes(),
            );
        }
        Ok(())
    }

    /// Dispatch `grid` workgroups.
    pub fn record_dispatch(&self, cmd: vk::CommandBuffer, grid: [u32; 3]) -> Result<()> {
        self.ensure_built()?;
        unsafe { self.device.device().cmd_dispatch(cmd, grid[0], grid[1], grid[2]) };
        Ok(())
    }

    fn descriptor_set(&self, set: usize) -> Result<vk::DescriptorSet> {
        self.ensure_built()?;
        self.descriptor_sets.get(set).copied().ok_or(Error::Index {
            index: set,
            len: self.descriptor_sets.len(),
        })
    }

    fn ensure_built(&self) -> Result<()> {
        if self.is_built() {
            Ok(())
        } else {
            Err(ConfigError::NotBuilt.into())
        }
    }

    fn ensure_unbuilt(&self) -> Result<()> {
        if self.is_built() {
            Err(ConfigError::AlreadyBuilt.into())
        } else {
            Ok(())
        }
    }

    fn create_descriptor_pool(&self, descriptors: u32, num_sets: u32) -> Result<vk::DescriptorPool> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: descriptors,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(num_sets)
            .pool_sizes(&pool_sizes);
        unsafe { self.device.device().create_descriptor_pool(&pool_info, None) }
            .map_err(Error::vk("vkCreateDescriptorPool"))
    }

    fn reset_descriptor_pool(&self) {
        let result = unsafe {
            self.device
                .device()
                .reset_descriptor_pool(self.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
        };
        if let Err(e) = result {
            tracing::error!("vkResetDescriptorPool failed: {}", e);
        }
    }

    fn destroy_layout_and_pool(&mut self) {
        let device = self.device.device();
        unsafe {
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
                self.descriptor_pool = vk::DescriptorPool::null();
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
                self.descriptor_set_layout = vk::DescriptorSetLayout::null();
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("built", &self.is_built())
            .finish_non_exhaustive()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            let device = self.device.device();
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            device.destroy_shader_module(self.shader_module, None);
        }
        // Descriptor sets are freed with their pool.
        self.destroy_layout_and_pool();
        tracing::debug!("Pipeline `{}` destroyed", self.name);
    }
}
