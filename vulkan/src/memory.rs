//! Unified host/GPU memory: host pointers as keys for device buffers.
//!
//! Every allocation is a dedicated `VkBuffer` bound to host-visible, mapped
//! memory from `gpu-allocator`. The mapped address is handed back as a
//! [`UsmPtr`] and recorded in an [`AllocationTable`], so downstream code can
//! go from an ordinary host pointer to the buffer that backs it.
//!
//! The table is the only shared mutable state in the crate. Lookup, insert
//! and erase serialize on its lock; device calls happen outside of it.

use std::any::Any;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;

use crate::config::AllocatorConfig;
use crate::device::DeviceContext;
use crate::error::{Error, Result};

/// Opaque key for a live allocation: the mapped host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsmPtr(usize);

impl UsmPtr {
    pub(crate) fn from_raw(ptr: NonNull<u8>) -> Self {
        Self(ptr.as_ptr() as usize)
    }

    /// Mapped host address of the allocation.
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn addr(self) -> usize {
        self.0
    }
}

/// Pointer → record map guarded by a single lock.
///
/// At most one record exists per pointer. Looking up or removing a pointer
/// that has no record fails with [`Error::UnknownPointer`] and leaves the
/// table untouched.
pub struct AllocationTable<R> {
    records: Mutex<HashMap<UsmPtr, R>>,
}

impl<R> AllocationTable<R> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a record. A pointer that is already live is rejected and the
    /// record is handed back.
    pub fn insert(&self, ptr: UsmPtr, record: R) -> std::result::Result<(), R> {
        let mut records = self.records.lock();
        if records.contains_key(&ptr) {
            return Err(record);
        }
        records.insert(ptr, record);
        Ok(())
    }

    pub fn remove(&self, ptr: UsmPtr) -> Result<R> {
        self.records
            .lock()
            .remove(&ptr)
            .ok_or(Error::UnknownPointer(ptr.addr()))
    }

    /// Run `f` on the record for `ptr` while holding the lock.
    pub fn with<T>(&self, ptr: UsmPtr, f: impl FnOnce(&R) -> T) -> Result<T> {
        self.records
            .lock()
            .get(&ptr)
            .map(f)
            .ok_or(Error::UnknownPointer(ptr.addr()))
    }

    pub fn contains(&self, ptr: UsmPtr) -> bool {
        self.records.lock().contains_key(&ptr)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every record, e.g. to reclaim leaks on shutdown.
    pub fn drain(&self) -> Vec<(UsmPtr, R)> {
        self.records.lock().drain().collect()
    }
}

impl<R> Default for AllocationTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Polymorphic memory resource, in the spirit of an allocator handed to
/// containers. Two resources are equal when they are the same concrete kind.
pub trait MemoryResource: Send + Sync {
    fn allocate(&self, bytes: usize, alignment: usize) -> Result<UsmPtr>;

    /// Release an allocation obtained from [`allocate`](Self::allocate).
    /// Memory still referenced by a submitted, unsynced batch must not be
    /// released.
    fn deallocate(&self, ptr: UsmPtr, bytes: usize, alignment: usize) -> Result<()>;

    fn is_equal(&self, other: &dyn MemoryResource) -> bool;

    fn as_any(&self) -> &dyn Any;
}

// Alignment 0 means "no constraint"; anything else must be a power of two.
fn checked_alignment(bytes: u64, alignment: usize) -> Result<u64> {
    match alignment {
        0 => Ok(1),
        a if a.is_power_of_two() => Ok(a as u64),
        a => Err(Error::Allocation {
            bytes,
            reason: format!("alignment {a} is not a power of two"),
        }),
    }
}

/// Buffer, device memory and size behind one host pointer.
struct AllocationRecord {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

/// Device-buffer allocator whose allocations are addressed by host pointers.
pub struct UsmAllocator {
    table: AllocationTable<AllocationRecord>,
    allocator: Mutex<Option<Allocator>>,
    config: AllocatorConfig,
    buffer_usage: vk::BufferUsageFlags,
    // Declared last: the device must outlive the allocator and every buffer.
    device: Arc<DeviceContext>,
}

impl UsmAllocator {
    pub fn new(device: Arc<DeviceContext>) -> Result<Self> {
        Self::with_config(device, AllocatorConfig::default())
    }

    pub fn with_config(device: Arc<DeviceContext>, config: AllocatorConfig) -> Result<Self> {
        let buffer_device_address = device.features().buffer_device_address;
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().clone(),
            device: device.device().clone(),
            physical_device: device.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| Error::Allocation {
            bytes: 0,
            reason: format!("allocator creation failed: {e}"),
        })?;

        let mut buffer_usage = config.buffer_usage;
        if buffer_device_address {
            buffer_usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        tracing::debug!(
            "UsmAllocator created with usage = {:?}, location = {:?}, device address = {}",
            buffer_usage,
            config.location,
            buffer_device_address
        );

        Ok(Self {
            table: AllocationTable::new(),
            allocator: Mutex::new(Some(allocator)),
            config,
            buffer_usage,
            device,
        })
    }

    /// Device every allocation lives on.
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Usage and memory location applied to every allocation.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Create a mapped device buffer of `bytes` and register its host pointer.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> Result<UsmPtr> {
        tracing::trace!("UsmAllocator::allocate({}, {})", bytes, alignment);
        let size = bytes as u64;
        if bytes == 0 {
            return Err(Error::Allocation {
                bytes: 0,
                reason: "zero-sized allocation".to_string(),
            });
        }
        let alignment = checked_alignment(size, alignment)?;

        let device = self.device.device();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(self.buffer_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }.map_err(|e| {
            Error::Allocation {
                bytes: size,
                reason: format!("vkCreateBuffer: {e}"),
            }
        })?;

        let mut requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(alignment);

        let allocated = self.with_allocator(|allocator| {
            allocator.allocate(&AllocationCreateDesc {
                name: "usm buffer",
                requirements,
                location: self.config.location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(reason) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(Error::Allocation { bytes: size, reason });
            }
        };

        let bound = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) };
        let mapped = allocation.mapped_ptr().map(|p| p.cast::<u8>());
        let ptr = match (bound, mapped) {
            (Ok(()), Some(ptr)) => UsmPtr::from_raw(ptr),
            (bound, _) => {
                let reason = match bound {
                    Err(e) => format!("vkBindBufferMemory: {e}"),
                    Ok(()) => format!("memory at {:?} is not host-visible", self.config.location),
                };
                self.release(buffer, allocation);
                return Err(Error::Allocation { bytes: size, reason });
            }
        };

        let record = AllocationRecord {
            buffer,
            allocation,
            size,
        };
        if let Err(record) = self.table.insert(ptr, record) {
            self.release(record.buffer, record.allocation);
            return Err(Error::Allocation {
                bytes: size,
                reason: format!("pointer {:#x} is already registered", ptr.addr()),
            });
        }

        Ok(ptr)
    }

    /// Unregister `ptr` and destroy its buffer and memory.
    ///
    /// The buffer is destroyed right away. The caller must make sure no
    /// submitted sequence still references it: freeing memory that an
    /// in-flight batch reads or writes is undefined behavior on the device.
    /// Sync the sequence first.
    pub fn deallocate(&self, ptr: UsmPtr, bytes: usize, alignment: usize) -> Result<()> {
        tracing::trace!(
            "UsmAllocator::deallocate({:#x}, {}, {})",
            ptr.addr(),
            bytes,
            alignment
        );
        let record = self.table.remove(ptr).map_err(|e| {
            tracing::error!("Attempted to deallocate unknown pointer {:#x}", ptr.addr());
            e
        })?;
        self.release(record.buffer, record.allocation);
        Ok(())
    }

    /// Device buffer backing `ptr`, or `UnknownPointer`.
    pub fn get_buffer_from_pointer(&self, ptr: UsmPtr) -> Result<vk::Buffer> {
        self.table.with(ptr, |record| record.buffer)
    }

    /// Binding descriptor for `range` bytes at the start of the allocation.
    pub fn buffer_info(&self, ptr: UsmPtr, range: u64) -> Result<vk::DescriptorBufferInfo> {
        let buffer = self.get_buffer_from_pointer(ptr)?;
        tracing::trace!(
            "buffer_info: ptr = {:#x}, buffer = {:?}, range = {}",
            ptr.addr(),
            buffer,
            range
        );
        Ok(vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        })
    }

    /// Size in bytes of the buffer behind `ptr`.
    pub fn allocation_size(&self, ptr: UsmPtr) -> Result<u64> {
        self.table.with(ptr, |record| record.size)
    }

    /// Number of allocations not yet deallocated.
    pub fn live_allocations(&self) -> usize {
        self.table.len()
    }

    /// Total bytes of all live allocations.
    pub fn allocated_bytes(&self) -> u64 {
        self.table
            .records
            .lock()
            .values()
            .map(|record| record.size)
            .sum()
    }

    fn with_allocator<T>(
        &self,
        f: impl FnOnce(&mut Allocator) -> gpu_allocator::Result<T>,
    ) -> std::result::Result<T, String> {
        let mut guard = self.allocator.lock();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| "allocator already shut down".to_string())?;
        f(allocator).map_err(|e| e.to_string())
    }

    fn release(&self, buffer: vk::Buffer, allocation: Allocation) {
        unsafe { self.device.device().destroy_buffer(buffer, None) };
        if let Err(e) = self.with_allocator(|allocator| allocator.free(allocation)) {
            tracing::error!("Failed to free device memory: {}", e);
        }
    }
}

impl MemoryResource for UsmAllocator {
    fn allocate(&self, bytes: usize, alignment: usize) -> Result<UsmPtr> {
        UsmAllocator::allocate(self, bytes, alignment)
    }

    fn deallocate(&self, ptr: UsmPtr, bytes: usize, alignment: usize) -> Result<()> {
        UsmAllocator::deallocate(self, ptr, bytes, alignment)
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        other.as_any().is::<UsmAllocator>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl PartialEq for UsmAllocator {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl std::fmt::Debug for UsmAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsmAllocator")
            .field("live_allocations", &self.live_allocations())
            .field("buffer_usage", &self.buffer_usage)
            .finish_non_exhaustive()
    }
}

impl Drop for UsmAllocator {
    fn drop(&mut self) {
        let leaked = self.table.drain();
        if !leaked.is_empty() {
            tracing::warn!("UsmAllocator dropped with {} live allocations", leaked.len());
        }
        for (_, record) in leaked {
            self.release(record.buffer, record.allocation);
        }
        // gpu-allocator must go before the device does.
        self.allocator.lock().take();
        tracing::debug!("UsmAllocator destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::gpu;
    use std::collections::HashSet;

    fn fake_ptr(addr: usize) -> UsmPtr {
        UsmPtr(addr)
    }

    #[test]
    fn test_table_insert_lookup_remove() {
        let table = AllocationTable::new();
        table.insert(fake_ptr(0x1000), 64u64).unwrap();
        assert_eq!(table.with(fake_ptr(0x1000), |size| *size).unwrap(), 64);
        assert_eq!(table.remove(fake_ptr(0x1000)).unwrap(), 64);
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_rejects_duplicate_pointer() {
        let table = AllocationTable::new();
        table.insert(fake_ptr(0x2000), 1u32).unwrap();
        assert_eq!(table.insert(fake_ptr(0x2000), 2u32), Err(2));
        assert_eq!(table.with(fake_ptr(0x2000), |v| *v).unwrap(), 1);
    }

    #[test]
    fn test_table_double_remove_is_unknown_pointer() {
        let table = AllocationTable::new();
        table.insert(fake_ptr(0x3000), ()).unwrap();
        table.insert(fake_ptr(0x4000), ()).unwrap();

        assert!(table.remove(fake_ptr(0x3000)).is_ok());
        for _ in 0..3 {
            assert!(matches!(
                table.remove(fake_ptr(0x3000)),
                Err(Error::UnknownPointer(0x3000))
            ));
            assert_eq!(table.len(), 1);
            assert!(table.contains(fake_ptr(0x4000)));
        }
    }

    #[test]
    fn test_table_unknown_lookup() {
        let table: AllocationTable<()> = AllocationTable::new();
        assert!(matches!(
            table.with(fake_ptr(0xdead), |_| ()),
            Err(Error::UnknownPointer(0xdead))
        ));
    }

    #[test]
    fn test_table_concurrent_unique_pointers() {
        // Real heap addresses stand in for mapped pointers.
        let table = AllocationTable::new();
        std::thread::scope(|s| {
            for t in 0..8usize {
                let table = &table;
                s.spawn(move || {
                    let mut live: Vec<(UsmPtr, Box<u64>)> = Vec::new();
                    for i in 0..200usize {
                        let boxed = Box::new((t * 1000 + i) as u64);
                        let ptr = UsmPtr::from_raw(NonNull::from(boxed.as_ref()).cast());
                        table.insert(ptr, *boxed).unwrap();
                        live.push((ptr, boxed));
                        if i % 3 == 0 {
                            let (ptr, boxed) = live.remove(0);
                            assert_eq!(table.remove(ptr).unwrap(), *boxed);
                        }
                        for (ptr, boxed) in &live {
                            assert_eq!(table.with(*ptr, |v| *v).unwrap(), **boxed);
                        }
                    }
                    for (ptr, _) in live {
                        table.remove(ptr).unwrap();
                    }
                });
            }
        });
        assert!(table.is_empty());
    }

    #[test]
    fn test_alignment_must_be_power_of_two() {
        assert_eq!(checked_alignment(64, 0).unwrap(), 1);
        assert_eq!(checked_alignment(64, 1).unwrap(), 1);
        assert_eq!(checked_alignment(64, 256).unwrap(), 256);
        for bad in [3, 12, 100, usize::MAX] {
            match checked_alignment(64, bad) {
                Err(Error::Allocation { bytes: 64, reason }) => {
                    assert!(reason.contains("power of two"), "{reason}")
                }
                other => panic!("alignment {bad} accepted: {other:?}"),
            }
        }
    }

    #[test]
    fn test_usm_rejects_bad_alignment() {
        let Some(device) = gpu() else { return };
        let mr = UsmAllocator::new(device).unwrap();
        assert!(matches!(mr.allocate(128, 12), Err(Error::Allocation { .. })));
        assert_eq!(mr.live_allocations(), 0);
        let ptr = mr.allocate(128, 0).unwrap();
        mr.deallocate(ptr, 128, 0).unwrap();
    }

    struct OtherResource;

    impl MemoryResource for OtherResource {
        fn allocate(&self, bytes: usize, _alignment: usize) -> Result<UsmPtr> {
            Err(Error::Allocation {
                bytes: bytes as u64,
                reason: "unsupported".to_string(),
            })
        }

        fn deallocate(&self, ptr: UsmPtr, _bytes: usize, _alignment: usize) -> Result<()> {
            Err(Error::UnknownPointer(ptr.addr()))
        }

        fn is_equal(&self, other: &dyn MemoryResource) -> bool {
            other.as_any().is::<OtherResource>()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_usm_allocate_and_lookup() {
        let Some(device) = gpu() else { return };
        let mr = UsmAllocator::new(device).unwrap();

        let ptr = mr.allocate(1024, 16).unwrap();
        assert_eq!(ptr.addr() % 16, 0);
        assert_ne!(mr.get_buffer_from_pointer(ptr).unwrap(), vk::Buffer::null());
        assert_eq!(mr.allocation_size(ptr).unwrap(), 1024);
        assert_eq!(mr.live_allocations(), 1);

        // mapped memory is writable from the host
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 1024) };
        assert_eq!(unsafe { *ptr.as_ptr().add(1023) }, 0xAB);

        let info = mr.buffer_info(ptr, 512).unwrap();
        assert_eq!(info.offset, 0);
        assert_eq!(info.range, 512);

        mr.deallocate(ptr, 1024, 16).unwrap();
        assert_eq!(mr.live_allocations(), 0);
    }

    #[test]
    fn test_usm_double_free() {
        let Some(device) = gpu() else { return };
        let mr = UsmAllocator::new(device).unwrap();
        let keep = mr.allocate(256, 4).unwrap();
        let ptr = mr.allocate(256, 4).unwrap();

        mr.deallocate(ptr, 256, 4).unwrap();
        assert!(matches!(mr.deallocate(ptr, 256, 4), Err(Error::UnknownPointer(_))));
        assert!(matches!(mr.get_buffer_from_pointer(ptr), Err(Error::UnknownPointer(_))));
        assert_eq!(mr.live_allocations(), 1);
        assert!(mr.get_buffer_from_pointer(keep).is_ok());
    }

    #[test]
    fn test_usm_zero_sized_allocation() {
        let Some(device) = gpu() else { return };
        let mr = UsmAllocator::new(device).unwrap();
        assert!(matches!(mr.allocate(0, 4), Err(Error::Allocation { .. })));
        assert_eq!(mr.live_allocations(), 0);
    }

    #[test]
    fn test_usm_concurrent_allocations() {
        let Some(device) = gpu() else { return };
        let mr = UsmAllocator::new(device).unwrap();

        let all: Vec<UsmPtr> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let mr = &mr;
                    s.spawn(move || {
                        let mut mine = Vec::new();
                        for i in 0..16 {
                            let ptr = mr.allocate(64 * (i + 1), 4).unwrap();
                            mine.push(ptr);
                            if i % 2 == 1 {
                                let gone = mine.remove(0);
                                mr.deallocate(gone, 0, 4).unwrap();
                            }
                        }
                        for ptr in &mine {
                            assert!(mr.get_buffer_from_pointer(*ptr).is_ok());
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<UsmPtr> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert_eq!(mr.live_allocations(), all.len());
        for ptr in all {
            mr.deallocate(ptr, 0, 4).unwrap();
        }
    }

    #[test]
    fn test_usm_is_equal_by_kind() {
        let Some(device) = gpu() else { return };
        let a = UsmAllocator::new(device.clone()).unwrap();
        let b = UsmAllocator::new(device).unwrap();
        assert!(a.is_equal(&b));
        assert!(a == b);
        assert!(!a.is_equal(&OtherResource));
        assert!(!OtherResource.is_equal(&a));
    }
}
