//! Error taxonomy shared by the allocator, pipeline builder and command sequence.

use ash::vk;
use thiserror::Error;

use crate::device::DeviceError;
use crate::sequence::{SequenceOp, SequenceState};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Builder misuse: a missing prerequisite step, a zero-valued parameter, or a
/// structural change after `build()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `build()` was called before `num_buffers`.
    #[error("buffer count must be configured before build()")]
    MissingBufferCount,
    /// `num_buffers(0)`.
    #[error("buffer count must be non-zero")]
    ZeroBufferCount,
    /// Buffers times sets does not fit a descriptor pool.
    #[error("{buffers} buffers x {sets} sets exceeds the descriptor pool size limit")]
    TooManyDescriptors { buffers: usize, sets: usize },
    /// `num_sets(0)`.
    #[error("descriptor set count must be non-zero")]
    ZeroSetCount,
    /// A workgroup dimension is zero, including the unconfigured default.
    #[error("workgroup size {0:?} has a zero dimension")]
    WorkgroupUnset([u32; 3]),
    /// A dimension or the invocation product exceeds the device limits.
    #[error("workgroup size {size:?} exceeds device limits (max {max:?}, max invocations {max_invocations})")]
    WorkgroupTooLarge {
        size: [u32; 3],
        max: [u32; 3],
        max_invocations: u32,
    },
    /// Requested push-constant block is larger than the portable maximum.
    #[error("push constant size {requested} exceeds the {max}-byte maximum")]
    PushConstantTooLarge { requested: usize, max: usize },
    /// Push-constant update or bind on a pipeline configured without them.
    #[error("push constants were not configured for this pipeline")]
    PushConstantsDisabled,
    /// Structural setter or second `build()` after the pipeline was built.
    #[error("pipeline is already built")]
    AlreadyBuilt,
    /// Descriptor update or command recording before `build()`.
    #[error("pipeline is not built yet")]
    NotBuilt,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Kernel name absent from the registry, or its binary is unusable.
    #[error("unknown shader `{name}`: {reason}")]
    UnknownShader { name: String, reason: &'static str },

    /// Device buffer or memory creation failed.
    #[error("device allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: u64, reason: String },

    /// Lookup or deallocation of a pointer the allocator does not track.
    #[error("pointer {0:#x} is not tracked by the allocator")]
    UnknownPointer(usize),

    /// Descriptor or push-constant payload does not match the configuration.
    #[error("expected {expected} {what}, got {actual}")]
    BindingMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Descriptor set index past the configured set count.
    #[error("descriptor set index {index} out of range ({len} sets)")]
    Index { index: usize, len: usize },

    /// Fence wait or reset failure. Not recoverable.
    #[error("fence {op} failed: {result}")]
    Sync { op: &'static str, result: vk::Result },

    /// Sequence operation attempted from a state that does not allow it.
    #[error("cannot {op} while the sequence is {state:?}")]
    InvalidState { op: SequenceOp, state: SequenceState },

    /// Any other failed driver call, tagged with the entry point.
    #[error("{context}: {result}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl Error {
    /// Adapter for `map_err` on raw `ash` calls.
    pub(crate) fn vk(context: &'static str) -> impl FnOnce(vk::Result) -> Error {
        move |result| Error::Vulkan { context, result }
    }
}
