//! Built-in compute kernels for usmflow.
//!
//! Kernels are assembled as SPIR-V at registry construction, so the crate
//! needs no offline shader toolchain. All of them take a `u32` push constant
//! `n` and touch elements `0..n` only.
//!
//! | name          | bindings                 |
//! |---------------|--------------------------|
//! | `vector_add`  | `a`, `b` → `out`         |
//! | `vector_sub`  | `a`, `b` → `out`         |
//! | `vector_mul`  | `a`, `b` → `out`         |
//! | `double`      | `x` → `out` (`x * 2`)    |

pub mod elementwise;
pub mod spirv;

pub use elementwise::Elementwise;

use usmflow_vulkan::StaticRegistry;

pub const VECTOR_ADD: &str = "vector_add";
pub const VECTOR_SUB: &str = "vector_sub";
pub const VECTOR_MUL: &str = "vector_mul";
pub const DOUBLE: &str = "double";

/// Every built-in kernel with its name.
pub const KERNELS: &[(&str, Elementwise)] = &[
    (VECTOR_ADD, Elementwise::Add),
    (VECTOR_SUB, Elementwise::Sub),
    (VECTOR_MUL, Elementwise::Mul),
    (DOUBLE, Elementwise::Scale(2.0)),
];

/// Registry holding all built-in kernels.
pub fn builtin_registry() -> StaticRegistry {
    let mut registry = StaticRegistry::new();
    for &(name, kind) in KERNELS {
        registry.insert_words(name, &kind.spirv());
    }
    tracing::debug!("Registered {} built-in kernels", registry.len());
    registry
}
