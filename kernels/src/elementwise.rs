//! Elementwise `f32` compute kernels.
//!
//! Every kernel has the same shape: one invocation per element, inputs at
//! bindings `0..inputs`, output at binding `inputs`, and a push-constant
//! block `{ n: u32 }` bounding the index. The workgroup size comes from
//! specialization constants 0, 1 and 2.

use crate::spirv::{
    builtin, decoration, op, storage, string, Id, Module, Section, ADDRESSING_LOGICAL,
    CAPABILITY_SHADER, EXECUTION_MODEL_GLCOMPUTE, EXECUTION_MODE_LOCAL_SIZE,
    MEMORY_MODEL_GLSL450,
};

/// What a kernel computes per element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Elementwise {
    /// `out[i] = a[i] + b[i]`
    Add,
    /// `out[i] = a[i] - b[i]`
    Sub,
    /// `out[i] = a[i] * b[i]`
    Mul,
    /// `out[i] = x[i] * factor`
    Scale(f32),
}

impl Elementwise {
    /// Number of input buffers. The kernel binds `inputs() + 1` buffers.
    pub fn inputs(self) -> u32 {
        match self {
            Self::Add | Self::Sub | Self::Mul => 2,
            Self::Scale(_) => 1,
        }
    }

    pub fn num_buffers(self) -> usize {
        self.inputs() as usize + 1
    }

    fn opcode(self) -> u16 {
        match self {
            Self::Add => op::FADD,
            Self::Sub => op::FSUB,
            Self::Mul | Self::Scale(_) => op::FMUL,
        }
    }

    /// Assemble the kernel as SPIR-V words.
    pub fn spirv(self) -> Vec<u32> {
        let mut m = Module::new();

        m.op(Section::Capability, op::CAPABILITY, &[CAPABILITY_SHADER]);
        m.op(
            Section::MemoryModel,
            op::MEMORY_MODEL,
            &[ADDRESSING_LOGICAL, MEMORY_MODEL_GLSL450],
        );

        // types
        let void = m.global(op::TYPE_VOID, &[]);
        let fn_void = m.global(op::TYPE_FUNCTION, &[void]);
        let bool_ty = m.global(op::TYPE_BOOL, &[]);
        let uint = m.global(op::TYPE_INT, &[32, 0]);
        let float = m.global(op::TYPE_FLOAT, &[32]);
        let uvec3 = m.global(op::TYPE_VECTOR, &[uint, 3]);

        let float_array = m.global(op::TYPE_RUNTIME_ARRAY, &[float]);
        m.decorate(float_array, decoration::ARRAY_STRIDE, &[4]);
        let ssbo = m.global(op::TYPE_STRUCT, &[float_array]);
        m.decorate(ssbo, decoration::BLOCK, &[]);
        m.member_decorate(ssbo, 0, decoration::OFFSET, &[0]);

        let push_block = m.global(op::TYPE_STRUCT, &[uint]);
        m.decorate(push_block, decoration::BLOCK, &[]);
        m.member_decorate(push_block, 0, decoration::OFFSET, &[0]);

        let ptr_ssbo = m.global(op::TYPE_POINTER, &[storage::STORAGE_BUFFER, ssbo]);
        let ptr_float = m.global(op::TYPE_POINTER, &[storage::STORAGE_BUFFER, float]);
        let ptr_push = m.global(op::TYPE_POINTER, &[storage::PUSH_CONSTANT, push_block]);
        let ptr_push_uint = m.global(op::TYPE_POINTER, &[storage::PUSH_CONSTANT, uint]);
        let ptr_in_uvec3 = m.global(op::TYPE_POINTER, &[storage::INPUT, uvec3]);
        let ptr_in_uint = m.global(op::TYPE_POINTER, &[storage::INPUT, uint]);

        // constants
        let zero = m.typed(Section::Global, op::CONSTANT, uint, &[0]);
        let factor = match self {
            Self::Scale(f) => Some(m.typed(Section::Global, op::CONSTANT, float, &[f.to_bits()])),
            _ => None,
        };
        let local: Vec<Id> = (0..3u32)
            .map(|spec_id| {
                let id = m.typed(Section::Global, op::SPEC_CONSTANT, uint, &[1]);
                m.decorate(id, decoration::SPEC_ID, &[spec_id]);
                id
            })
            .collect();
        let workgroup_size = m.typed(Section::Global, op::SPEC_CONSTANT_COMPOSITE, uvec3, &local);
        m.decorate(workgroup_size, decoration::BUILT_IN, &[builtin::WORKGROUP_SIZE]);

        // interface variables
        let global_id = m.typed(Section::Global, op::VARIABLE, ptr_in_uvec3, &[storage::INPUT]);
        m.decorate(global_id, decoration::BUILT_IN, &[builtin::GLOBAL_INVOCATION_ID]);
        let buffers: Vec<Id> = (0..self.num_buffers() as u32)
            .map(|binding| {
                let var = m.typed(Section::Global, op::VARIABLE, ptr_ssbo, &[storage::STORAGE_BUFFER]);
                m.decorate(var, decoration::DESCRIPTOR_SET, &[0]);
                m.decorate(var, decoration::BINDING, &[binding]);
                var
            })
            .collect();
        let push = m.typed(Section::Global, op::VARIABLE, ptr_push, &[storage::PUSH_CONSTANT]);

        // entry point
        let main = m.id();
        let mut entry = vec![EXECUTION_MODEL_GLCOMPUTE, main];
        entry.extend(string("main"));
        entry.push(global_id);
        m.op(Section::EntryPoint, op::ENTRY_POINT, &entry);
        m.op(
            Section::ExecutionMode,
            op::EXECUTION_MODE,
            &[main, EXECUTION_MODE_LOCAL_SIZE, 1, 1, 1],
        );

        // void main() { uint i = gl_GlobalInvocationID.x; if (i < n) { ... } }
        m.op(Section::Function, op::FUNCTION, &[void, main, 0, fn_void]);
        let entry_label = m.id();
        let body_label = m.id();
        let merge_label = m.id();
        m.label(entry_label);

        let gid_x_ptr = m.typed(Section::Function, op::ACCESS_CHAIN, ptr_in_uint, &[global_id, zero]);
        let i = m.typed(Section::Function, op::LOAD, uint, &[gid_x_ptr]);
        let n_ptr = m.typed(Section::Function, op::ACCESS_CHAIN, ptr_push_uint, &[push, zero]);
        let n = m.typed(Section::Function, op::LOAD, uint, &[n_ptr]);
        let in_bounds = m.typed(Section::Function, op::ULESS_THAN, bool_ty, &[i, n]);
        m.op(Section::Function, op::SELECTION_MERGE, &[merge_label, 0]);
        m.op(
            Section::Function,
            op::BRANCH_CONDITIONAL,
            &[in_bounds, body_label, merge_label],
        );

        m.label(body_label);
        let (inputs, output) = buffers.split_at(self.inputs() as usize);
        let values: Vec<Id> = inputs
            .iter()
            .map(|&buffer| {
                let ptr = m.typed(Section::Function, op::ACCESS_CHAIN, ptr_float, &[buffer, zero, i]);
                m.typed(Section::Function, op::LOAD, float, &[ptr])
            })
            .collect();
        let rhs = factor.unwrap_or_else(|| values[values.len() - 1]);
        let result = m.typed(Section::Function, self.opcode(), float, &[values[0], rhs]);
        let out_ptr = m.typed(Section::Function, op::ACCESS_CHAIN, ptr_float, &[output[0], zero, i]);
        m.op(Section::Function, op::STORE, &[out_ptr, result]);
        m.op(Section::Function, op::BRANCH, &[merge_label]);

        m.label(merge_label);
        m.op(Section::Function, op::RETURN, &[]);
        m.op(Section::Function, op::FUNCTION_END, &[]);

        m.finish()
    }
}
