//! Minimal SPIR-V 1.3 module writer.
//!
//! Instructions are appended to the logical-layout section they belong to
//! and concatenated by [`Module::finish`], so callers can declare things in
//! whatever order is convenient.

/// SPIR-V result id.
pub type Id = u32;

pub const MAGIC: u32 = 0x0723_0203;
pub const VERSION_1_3: u32 = 0x0001_0300;

/// Opcodes used by the built-in kernels.
pub mod op {
    pub const CAPABILITY: u16 = 17;
    pub const MEMORY_MODEL: u16 = 14;
    pub const ENTRY_POINT: u16 = 15;
    pub const EXECUTION_MODE: u16 = 16;
    pub const DECORATE: u16 = 71;
    pub const MEMBER_DECORATE: u16 = 72;
    pub const TYPE_VOID: u16 = 19;
    pub const TYPE_BOOL: u16 = 20;
    pub const TYPE_INT: u16 = 21;
    pub const TYPE_FLOAT: u16 = 22;
    pub const TYPE_VECTOR: u16 = 23;
    pub const TYPE_RUNTIME_ARRAY: u16 = 29;
    pub const TYPE_STRUCT: u16 = 30;
    pub const TYPE_POINTER: u16 = 32;
    pub const TYPE_FUNCTION: u16 = 33;
    pub const CONSTANT: u16 = 43;
    pub const SPEC_CONSTANT: u16 = 50;
    pub const SPEC_CONSTANT_COMPOSITE: u16 = 51;
    pub const FUNCTION: u16 = 54;
    pub const FUNCTION_END: u16 = 56;
    pub const VARIABLE: u16 = 59;
    pub const LOAD: u16 = 61;
    pub const STORE: u16 = 62;
    pub const ACCESS_CHAIN: u16 = 65;
    pub const FADD: u16 = 129;
    pub const FSUB: u16 = 131;
    pub const FMUL: u16 = 133;
    pub const ULESS_THAN: u16 = 176;
    pub const SELECTION_MERGE: u16 = 247;
    pub const LABEL: u16 = 248;
    pub const BRANCH: u16 = 249;
    pub const BRANCH_CONDITIONAL: u16 = 250;
    pub const RETURN: u16 = 253;
}

pub mod decoration {
    pub const SPEC_ID: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const ARRAY_STRIDE: u32 = 6;
    pub const BUILT_IN: u32 = 11;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const OFFSET: u32 = 35;
}

pub mod builtin {
    pub const WORKGROUP_SIZE: u32 = 25;
    pub const GLOBAL_INVOCATION_ID: u32 = 28;
}

pub mod storage {
    pub const INPUT: u32 = 1;
    pub const PUSH_CONSTANT: u32 = 9;
    pub const STORAGE_BUFFER: u32 = 12;
}

pub const CAPABILITY_SHADER: u32 = 1;
pub const ADDRESSING_LOGICAL: u32 = 0;
pub const MEMORY_MODEL_GLSL450: u32 = 1;
pub const EXECUTION_MODEL_GLCOMPUTE: u32 = 5;
pub const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;

/// Logical layout sections, in module order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Capability,
    MemoryModel,
    EntryPoint,
    ExecutionMode,
    Annotation,
    Global,
    Function,
}

const SECTIONS: usize = 7;

#[derive(Debug)]
pub struct Module {
    sections: [Vec<u32>; SECTIONS],
    next_id: Id,
}

impl Module {
    pub fn new() -> Self {
        Self {
            sections: Default::default(),
            next_id: 1,
        }
    }

    /// Fresh result id.
    pub fn id(&mut self) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn op(&mut self, section: Section, opcode: u16, operands: &[u32]) {
        let words = &mut self.sections[section as usize];
        words.push(((operands.len() as u32 + 1) << 16) | u32::from(opcode));
        words.extend_from_slice(operands);
    }

    /// Emit an instruction whose first operand after the type is a new id.
    pub fn typed(&mut self, section: Section, opcode: u16, ty: Id, operands: &[u32]) -> Id {
        let id = self.id();
        let mut all = Vec::with_capacity(operands.len() + 2);
        all.push(ty);
        all.push(id);
        all.extend_from_slice(operands);
        self.op(section, opcode, &all);
        id
    }

    /// Emit a type or other result-only declaration into the global section.
    pub fn global(&mut self, opcode: u16, operands: &[u32]) -> Id {
        let id = self.id();
        let mut all = Vec::with_capacity(operands.len() + 1);
        all.push(id);
        all.extend_from_slice(operands);
        self.op(Section::Global, opcode, &all);
        id
    }

    pub fn decorate(&mut self, target: Id, decoration: u32, literals: &[u32]) {
        let mut all = vec![target, decoration];
        all.extend_from_slice(literals);
        self.op(Section::Annotation, op::DECORATE, &all);
    }

    pub fn member_decorate(&mut self, ty: Id, member: u32, decoration: u32, literals: &[u32]) {
        let mut all = vec![ty, member, decoration];
        all.extend_from_slice(literals);
        self.op(Section::Annotation, op::MEMBER_DECORATE, &all);
    }

    pub fn label(&mut self, id: Id) {
        self.op(Section::Function, op::LABEL, &[id]);
    }

    /// Header plus all sections. The id bound is one past the last id handed out.
    pub fn finish(self) -> Vec<u32> {
        let body: usize = self.sections.iter().map(Vec::len).sum();
        let mut words = Vec::with_capacity(5 + body);
        words.extend_from_slice(&[MAGIC, VERSION_1_3, 0, self.next_id, 0]);
        for section in &self.sections {
            words.extend_from_slice(section);
        }
        words
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

/// Nul-terminated, zero-padded literal string operand.
pub fn string(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u16,
    pub operands: &'a [u32],
}

/// Walk the instruction stream after the header. Stops at the first
/// malformed word count.
pub fn instructions(words: &[u32]) -> impl Iterator<Item = Instruction<'_>> {
    let mut rest = words.get(5..).unwrap_or(&[]);
    std::iter::from_fn(move || {
        let first = *rest.first()?;
        let count = (first >> 16) as usize;
        if count == 0 || count > rest.len() {
            return None;
        }
        let inst = Instruction {
            opcode: (first & 0xffff) as u16,
            operands: &rest[1..count],
        };
        rest = &rest[count..];
        Some(inst)
    })
}
