//! Command buffer, submission and fence lifecycle.
//!
//! A [`Sequence`] owns one primary command buffer and one fence on the
//! compute queue. It is reusable: record, launch, sync, record again.
//! Pipelines are not tied to a sequence; any number of them may be recorded
//! into one batch. Dispatches within a batch are only ordered across the
//! barriers the caller inserts.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

/// Where a sequence is in its record/submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    Recording,
    Executable,
    Submitted,
}

/// Operation that moves a sequence between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOp {
    Begin,
    /// Any command recorded into an open batch: dispatch or barrier.
    Record,
    End,
    Launch,
    Sync,
}

impl SequenceOp {
    /// Name of the public method performing this operation.
    pub fn name(self) -> &'static str {
        match self {
            SequenceOp::Begin => "cmd_begin",
            SequenceOp::Record => "record",
            SequenceOp::End => "cmd_end",
            SequenceOp::Launch => "launch_kernel_async",
            SequenceOp::Sync => "sync",
        }
    }
}

impl std::fmt::Display for SequenceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl SequenceState {
    /// State after `op`, or `InvalidState` if `op` is not allowed now.
    ///
    /// Recording may restart from `Executable`: the command buffer is reset
    /// on begin, dropping the unsubmitted batch.
    pub fn transition(self, op: SequenceOp) -> Result<SequenceState> {
        use SequenceState::*;
        let next = match (self, op) {
            (Idle | Executable, SequenceOp::Begin) => Recording,
            (Recording, SequenceOp::Record) => Recording,
            (Recording, SequenceOp::End) => Executable,
            (Executable, SequenceOp::Launch) => Submitted,
            (Submitted, SequenceOp::Sync) => Idle,
            (state, op) => return Err(Error::InvalidState { op, state }),
        };
        Ok(next)
    }
}

/// Reusable command buffer + fence on the device's compute queue.
pub struct Sequence {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    state: SequenceState,
    device: Arc<DeviceContext>,
}

impl Sequence {
    pub fn new(device: Arc<DeviceContext>) -> Result<Self> {
        let d = device.device();
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_family_index());
        let command_pool = unsafe { d.create_command_pool(&pool_info, None) }
            .map_err(Error::vk("vkCreateCommandPool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { d.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(result) => {
                unsafe { d.destroy_command_pool(command_pool, None) };
                return Err(Error::Vulkan {
                    context: "vkAllocateCommandBuffers",
                    result,
                });
            }
        };

        let fence = match unsafe { d.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(result) => {
                unsafe { d.destroy_command_pool(command_pool, None) };
                return Err(Error::Vulkan {
                    context: "vkCreateFence",
                    result,
                });
            }
        };

        tracing::debug!("Sequence created on queue family {}", device.queue_family_index());
        Ok(Self {
            command_pool,
            command_buffer,
            fence,
            state: SequenceState::Idle,
            device,
        })
    }

    /// Raw command buffer, for recording commands this crate does not wrap.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Begin a one-time-submit recording.
    pub fn cmd_begin(&mut self) -> Result<()> {
        tracing::trace!("Sequence::cmd_begin()");
        let next = self.state.transition(SequenceOp::Begin)?;
        let d = self.device.device();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            d.reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(Error::vk("vkResetCommandBuffer"))?;
            d.begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(Error::vk("vkBeginCommandBuffer"))?;
        }
        self.state = next;
        Ok(())
    }

    pub fn cmd_end(&mut self) -> Result<()> {
        tracing::trace!("Sequence::cmd_end()");
        let next = self.state.transition(SequenceOp::End)?;
        unsafe { self.device.device().end_command_buffer(self.command_buffer) }
            .map_err(Error::vk("vkEndCommandBuffer"))?;
        self.state = next;
        Ok(())
    }

    /// Run `f` between `cmd_begin` and `cmd_end`. The recording is closed
    /// even when `f` fails; `f`'s error wins.
    pub fn record<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.cmd_begin()?;
        let recorded = f(self);
        let ended = self.cmd_end();
        recorded.and(ended)
    }

    /// Compute → compute hazard barrier: shader writes before shader reads.
    pub fn insert_compute_memory_barrier(&mut self) -> Result<()> {
        tracing::trace!("Sequence::insert_compute_memory_barrier()");
        self.barrier(
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        )
    }

    /// Compute → host barrier: makes shader writes visible to host reads
    /// after `sync()`.
    pub fn insert_host_read_barrier(&mut self) -> Result<()> {
        tracing::trace!("Sequence::insert_host_read_barrier()");
        self.barrier(vk::PipelineStageFlags::HOST, vk::AccessFlags::HOST_READ)
    }

    fn barrier(&mut self, dst_stage: vk::PipelineStageFlags, dst_access: vk::AccessFlags) -> Result<()> {
        self.state.transition(SequenceOp::Record)?;
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(dst_access);
        unsafe {
            self.device.device().cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }

    /// Begin, bind `set`, push constants if configured, dispatch `grid`, end.
    /// The batch closes with a host-read barrier so the output is readable
    /// once `sync()` returns.
    pub fn record_commands(&mut self, pipeline: &Pipeline, set: usize, grid: [u32; 3]) -> Result<()> {
        tracing::trace!(
            "Sequence::record_commands(`{}`, set {}, grid {:?})",
            pipeline.name(),
            set,
            grid
        );
        self.record(|seq| {
            seq.record_dispatch(pipeline, set, grid)?;
            seq.insert_host_read_barrier()
        })
    }

    /// Bind, push and dispatch `pipeline` into the open recording.
    pub fn record_dispatch(&mut self, pipeline: &Pipeline, set: usize, grid: [u32; 3]) -> Result<()> {
        self.state.transition(SequenceOp::Record)?;
        let cmd = self.command_buffer;
        pipeline.record_bind_core(cmd, set)?;
        if pipeline.has_push_constants() {
            pipeline.record_bind_push(cmd)?;
        }
        pipeline.record_dispatch(cmd, grid)
    }

    /// Submit the recorded batch. Returns without waiting.
    pub fn launch_kernel_async(&mut self) -> Result<()> {
        tracing::trace!("Sequence::launch_kernel_async()");
        let next = self.state.transition(SequenceOp::Launch)?;
        let command_buffers = [self.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        self.device.submit(&[submit], self.fence)?;
        self.state = next;
        Ok(())
    }

    /// Block until the submitted batch completes, then reset the fence.
    pub fn sync(&mut self) -> Result<()> {
        tracing::trace!("Sequence::sync()");
        let next = self.state.transition(SequenceOp::Sync)?;
        let d = self.device.device();
        unsafe {
            d.wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(|result| Error::Sync { op: "wait", result })?;
            d.reset_fences(&[self.fence])
                .map_err(|result| Error::Sync { op: "reset", result })?;
        }
        self.state = next;
        Ok(())
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        let d = self.device.device();
        if self.state == SequenceState::Submitted {
            tracing::debug!("Sequence dropped while submitted, waiting for completion");
            if let Err(e) = unsafe { d.wait_for_fences(&[self.fence], true, u64::MAX) } {
                tracing::error!("vkWaitForFences failed during drop: {}", e);
            }
        }
        unsafe {
            d.destroy_fence(self.fence, None);
            d.destroy_command_pool(self.command_pool, None);
        }
        tracing::debug!("Sequence destroyed");
    }
}
