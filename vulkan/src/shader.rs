//! Named compute kernels as SPIR-V blobs.

use std::collections::HashMap;

/// Name → compiled SPIR-V lookup consumed by [`Pipeline::new`](crate::Pipeline::new).
///
/// Blobs are raw little-endian SPIR-V bytes. The pipeline validates the
/// length and copies the words, so the registry may hand out borrowed data.
pub trait ShaderRegistry {
    fn lookup(&self, name: &str) -> Option<&[u8]>;
}

/// Map-backed registry.
#[derive(Debug, Default, Clone)]
pub struct StaticRegistry {
    shaders: HashMap<String, Vec<u8>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, spirv: Vec<u8>) -> &mut Self {
        self.shaders.insert(name.into(), spirv);
        self
    }

    /// Register a kernel given as SPIR-V words.
    pub fn insert_words(&mut self, name: impl Into<String>, words: &[u32]) -> &mut Self {
        let bytes = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.insert(name, bytes)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shaders.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }
}

impl ShaderRegistry for StaticRegistry {
    fn lookup(&self, name: &str) -> Option<&[u8]> {
        self.shaders.get(name).map(Vec::as_slice)
    }
}

impl<R: ShaderRegistry + ?Sized> ShaderRegistry for &R {
    fn lookup(&self, name: &str) -> Option<&[u8]> {
        (**self).lookup(name)
    }
}
