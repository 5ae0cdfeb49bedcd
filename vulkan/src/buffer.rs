//! Fixed-length typed vector living in unified memory.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::memory::{UsmAllocator, UsmPtr};

/// Host-visible, GPU-bindable array of `T`.
///
/// The element storage is the mapped memory of a device buffer, so the same
/// bytes a kernel reads through [`binding`](Self::binding) are visible here
/// through `Deref`. Reads of kernel output are only coherent after the
/// sequence that wrote them has synced behind a host-read barrier.
///
/// Dropping a buffer deallocates it immediately. Dropping one that a
/// submitted, not yet synced sequence still uses is undefined behavior on
/// the device: call [`Sequence::sync`](crate::Sequence::sync) first.
pub struct UsmBuffer<T: Pod> {
    allocator: Arc<UsmAllocator>,
    ptr: UsmPtr,
    len: usize,
    bytes: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> UsmBuffer<T> {
    /// Zero-initialised buffer of `len` elements.
    pub fn new(allocator: Arc<UsmAllocator>, len: usize) -> Result<Self> {
        let bytes = Self::byte_len(len).ok_or(Error::Allocation {
            bytes: u64::MAX,
            reason: format!("size overflow: {} x {} bytes", len, size_of::<T>()),
        })?;
        let ptr = allocator.allocate(bytes, align_of::<T>())?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        tracing::trace!("UsmBuffer::new({} x {} bytes)", len, size_of::<T>());
        Ok(Self {
            allocator,
            ptr,
            len,
            bytes,
            _marker: PhantomData,
        })
    }

    /// Buffer holding a copy of `data`.
    pub fn from_slice(allocator: Arc<UsmAllocator>, data: &[T]) -> Result<Self> {
        let mut buffer = Self::new(allocator, data.len())?;
        buffer.copy_from_slice(data);
        Ok(buffer)
    }

    pub fn filled(allocator: Arc<UsmAllocator>, len: usize, value: T) -> Result<Self> {
        let mut buffer = Self::new(allocator, len)?;
        buffer.fill(value);
        Ok(buffer)
    }

    /// Unified pointer key of the backing allocation.
    pub fn ptr(&self) -> UsmPtr {
        self.ptr
    }

    /// Size of the backing allocation in bytes.
    pub fn byte_size(&self) -> u64 {
        self.bytes as u64
    }

    /// Descriptor binding covering the whole buffer.
    pub fn binding(&self) -> Result<vk::DescriptorBufferInfo> {
        self.allocator.buffer_info(self.ptr, self.byte_size())
    }

    /// Allocator that owns the backing memory.
    pub fn allocator(&self) -> &Arc<UsmAllocator> {
        &self.allocator
    }

    // Zero-length buffers still get one element of storage: the allocator
    // rejects empty allocations.
    fn byte_len(len: usize) -> Option<usize> {
        len.max(1).checked_mul(size_of::<T>().max(1))
    }
}

impl<T: Pod> Deref for UsmBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const T, self.len) }
    }
}

impl<T: Pod> DerefMut for UsmBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut T, self.len) }
    }
}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for UsmBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsmBuffer")
            .field("ptr", &format_args!("{:#x}", self.ptr.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl<T: Pod> Drop for UsmBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.deallocate(self.ptr, self.bytes, align_of::<T>()) {
            tracing::error!("UsmBuffer drop failed: {}", e);
        }
    }
}
