//! Block-based device memory sub-allocator.
//!
//! Real `vkAllocateMemory` calls are expensive and capped by
//! `maxMemoryAllocationCount`, so resources never allocate directly. Instead
//! the pool carves sub-ranges out of large [`Block`]s, bump-style, and keys
//! the block lists by ([`Arena`], physical memory type). Freed bytes are only
//! counted; a block is returned to the driver once every byte it ever issued
//! has been freed. There is no defragmentation and no retry policy.
//!
//! Host-visible blocks are mapped once at creation and stay mapped; an
//! [`Allocation`] carved from such a block carries a pointer into that
//! mapping, since a `VkDeviceMemory` cannot be mapped twice.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use ash::vk;

use crate::{
    device::{Device, HasDevice},
    error::{Error, Result},
    utils::align_up,
};

/// Default block size for sub-allocated requests.
pub const DEFAULT_BLOCK_SIZE: vk::DeviceSize = 16 * 1024 * 1024;
/// Block size hint for small resources with widely shared usage patterns.
pub const COMMON_BLOCK_SIZE: vk::DeviceSize = 64 * 1024 * 1024;

/// A logical lifetime grouping for allocations. Arenas are append-only ids;
/// callers may define their own beyond the predefined ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Arena(pub u32);

impl Arena {
    /// Scene-lifetime resources: geometry, acceleration structures.
    pub const PERSISTENT: Arena = Arena(0);
    /// Per-frame display resources, typically swap-ring buffered.
    pub const DISPLAY: Arena = Arena(1);
    /// Transient build/staging storage with high churn.
    pub const SCRATCH: Arena = Arena(2);
}

/// One real device allocation, subdivided with a bump cursor.
struct Block {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    /// Bump offset; bytes below the cursor have been issued.
    cursor: vk::DeviceSize,
    /// Bytes issued and since returned. Never exceeds `cursor`.
    freed: vk::DeviceSize,
    /// Persistent mapping base, null for non-host-visible memory.
    mapped: *mut u8,
}

unsafe impl Send for Block {}

impl Block {
    fn new(memory: vk::DeviceMemory, size: vk::DeviceSize, mapped: *mut u8) -> Self {
        Self {
            memory,
            size,
            cursor: 0,
            freed: 0,
            mapped,
        }
    }

    fn remaining(&self) -> vk::DeviceSize {
        self.size - self.cursor
    }
}

/// Result of placing a request into a bucket.
struct Placement {
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    ptr: *mut u8,
}

enum FreeOutcome {
    /// Block still holds live sub-allocations.
    Retained,
    /// Every issued byte has been returned; the block was unlinked and its
    /// memory must be given back to the driver.
    Destroyed(Block),
    /// No block in this bucket owns the handle.
    UnknownBlock,
}

/// The block list for one (arena, memory type) pair, kept sorted by
/// ascending remaining capacity so a forward scan finds the fitting block
/// with the least room to spare.
#[derive(Default)]
struct Bucket {
    blocks: Vec<Block>,
}

impl Bucket {
    /// Best-fit placement. Returns `None` when no block can hold the request,
    /// in which case the caller creates a new block.
    fn place(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<Placement> {
        let idx = self.blocks.iter().position(|block| {
            align_up(block.cursor, alignment)
                .checked_add(size)
                .is_some_and(|end| end <= block.size)
        })?;
        let block = &mut self.blocks[idx];
        let offset = align_up(block.cursor, alignment);
        block.cursor = offset + size;
        let placement = Placement {
            memory: block.memory,
            offset,
            ptr: if block.mapped.is_null() {
                std::ptr::null_mut()
            } else {
                unsafe { block.mapped.add(offset as usize) }
            },
        };
        // Only this block's remaining capacity shrank, so one swap pass
        // toward the front restores the order.
        let mut i = idx;
        while i > 0 && self.blocks[i].remaining() < self.blocks[i - 1].remaining() {
            self.blocks.swap(i, i - 1);
            i -= 1;
        }
        Some(placement)
    }

    /// Links a freshly created block and issues its first sub-range at
    /// offset 0.
    fn insert(&mut self, mut block: Block, first_size: vk::DeviceSize) -> Placement {
        block.cursor = first_size;
        let placement = Placement {
            memory: block.memory,
            offset: 0,
            ptr: block.mapped,
        };
        let remaining = block.remaining();
        let at = self
            .blocks
            .iter()
            .position(|b| b.remaining() >= remaining)
            .unwrap_or(self.blocks.len());
        self.blocks.insert(at, block);
        placement
    }

    fn free(&mut self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> FreeOutcome {
        let Some(idx) = self.blocks.iter().position(|b| b.memory == memory) else {
            return FreeOutcome::UnknownBlock;
        };
        let block = &mut self.blocks[idx];
        block.freed += size;
        debug_assert!(block.freed <= block.cursor);
        if block.freed == block.size || block.freed == block.cursor {
            FreeOutcome::Destroyed(self.blocks.remove(idx))
        } else {
            FreeOutcome::Retained
        }
    }
}

/// A sub-range of a block, owned by exactly one resource.
///
/// Freed explicitly through [`MemoryPool::free`], which clears the handle;
/// a second free on the cleared handle is a no-op.
#[derive(Debug)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub arena: Arena,
    pub memory_type_index: u32,
    /// Pointer to this range inside the block's persistent mapping, null for
    /// non-host-visible memory.
    pub ptr: *mut u8,
}

unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    pub fn is_freed(&self) -> bool {
        self.memory == vk::DeviceMemory::null()
    }
}

/// Parameters for one pool allocation.
#[derive(Clone, Debug)]
pub struct AllocRequest {
    pub arena: Arena,
    pub size: vk::DeviceSize,
    /// Memory type bitmask from `VkMemoryRequirements`.
    pub type_filter: u32,
    /// Sub-allocation alignment. Zero requests a dedicated block, used for
    /// large or irregular resources that must sit at offset 0.
    pub alignment: vk::DeviceSize,
    pub required_props: vk::MemoryPropertyFlags,
    pub alloc_flags: vk::MemoryAllocateFlags,
    pub block_size_hint: Option<vk::DeviceSize>,
    /// Passed through to `VK_EXT_memory_priority` when available.
    pub priority: f32,
}

impl Default for AllocRequest {
    fn default() -> Self {
        Self {
            arena: Arena::PERSISTENT,
            size: 0,
            type_filter: !0,
            alignment: 1,
            required_props: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            alloc_flags: vk::MemoryAllocateFlags::empty(),
            block_size_hint: None,
            priority: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TypeStats {
    pub blocks: u32,
    /// Bytes reserved from the driver.
    pub reserved: vk::DeviceSize,
    /// Bytes currently issued to live allocations.
    pub used: vk::DeviceSize,
}

/// Snapshot of pool traffic, readable by the frame loop for diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct AllocationStats {
    /// Lifetime count of real device allocations.
    pub device_allocations: u64,
    /// Lifetime count of real device frees.
    pub device_frees: u64,
    pub types: [TypeStats; vk::MAX_MEMORY_TYPES],
}

impl Default for AllocationStats {
    fn default() -> Self {
        Self {
            device_allocations: 0,
            device_frees: 0,
            types: [TypeStats::default(); vk::MAX_MEMORY_TYPES],
        }
    }
}

/// Resolves the lowest memory type index satisfying both the resource's type
/// filter and the requested property flags.
fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_filter & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(required)
    })
}

struct PoolInner {
    buckets: BTreeMap<(Arena, u32), Bucket>,
    stats: AllocationStats,
}

struct PoolShared {
    device: Device,
    inner: Mutex<PoolInner>,
}

/// Shared handle to the sub-allocator for one device.
///
/// Cloning is cheap; resource handles keep a clone so their `Drop` can
/// release into [`MemoryPool::free`]. The block lists sit behind a mutex for
/// that reason, but the intended discipline remains one resource-management
/// call chain per device.
#[derive(Clone)]
pub struct MemoryPool(Arc<PoolShared>);

impl HasDevice for MemoryPool {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl MemoryPool {
    pub fn new(device: Device) -> Self {
        Self(Arc::new(PoolShared {
            device,
            inner: Mutex::new(PoolInner {
                buckets: BTreeMap::new(),
                stats: AllocationStats::default(),
            }),
        }))
    }

    pub fn stats(&self) -> AllocationStats {
        self.0.inner.lock().unwrap().stats
    }

    /// Sub-allocates, creating a new block only when no existing block in the
    /// (arena, type) bucket can hold the request.
    pub fn alloc(&self, req: &AllocRequest) -> Result<Allocation> {
        let device = &self.0.device;
        let type_index = find_memory_type(
            device.memory_properties(),
            req.type_filter,
            req.required_props,
        )
        .ok_or(Error::MemoryTypeUnavailable {
            type_filter: req.type_filter,
            required_props: req.required_props,
        })?;
        let host_visible = device
            .memory_type_properties(type_index)
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        let mut inner = self.0.inner.lock().unwrap();
        let bucket = inner.buckets.entry((req.arena, type_index)).or_default();

        let placement = if req.alignment == 0 {
            // Dedicated block, fully consumed by this one allocation.
            let block = self.allocate_block(req, type_index, req.size, host_visible)?;
            let reserved = block.size;
            let placement = bucket.insert(block, req.size);
            inner.stats.device_allocations += 1;
            let ts = &mut inner.stats.types[type_index as usize];
            ts.blocks += 1;
            ts.reserved += reserved;
            placement
        } else if let Some(placement) = bucket.place(req.size, req.alignment) {
            placement
        } else {
            let block_size = req
                .block_size_hint
                .unwrap_or(DEFAULT_BLOCK_SIZE)
                .max(req.size);
            let block = self.allocate_block(req, type_index, block_size, host_visible)?;
            let reserved = block.size;
            let placement = inner
                .buckets
                .get_mut(&(req.arena, type_index))
                .unwrap()
                .insert(block, req.size);
            inner.stats.device_allocations += 1;
            let ts = &mut inner.stats.types[type_index as usize];
            ts.blocks += 1;
            ts.reserved += reserved;
            placement
        };
        inner.stats.types[type_index as usize].used += req.size;

        Ok(Allocation {
            memory: placement.memory,
            offset: placement.offset,
            size: req.size,
            arena: req.arena,
            memory_type_index: type_index,
            ptr: placement.ptr,
        })
    }

    /// Returns a sub-range. Idempotent: a cleared allocation is ignored, and
    /// the handle is cleared on the way out so the owning resource's `Drop`
    /// cannot double-free.
    pub fn free(&self, allocation: &mut Allocation) {
        if allocation.is_freed() {
            return;
        }
        let mut inner = self.0.inner.lock().unwrap();
        let outcome = match inner
            .buckets
            .get_mut(&(allocation.arena, allocation.memory_type_index))
        {
            Some(bucket) => bucket.free(allocation.memory, allocation.size),
            None => FreeOutcome::UnknownBlock,
        };
        match outcome {
            FreeOutcome::Retained => {
                inner.stats.types[allocation.memory_type_index as usize].used -= allocation.size;
            }
            FreeOutcome::Destroyed(block) => {
                let ts = &mut inner.stats.types[allocation.memory_type_index as usize];
                ts.used -= allocation.size;
                ts.blocks -= 1;
                ts.reserved -= block.size;
                inner.stats.device_frees += 1;
                drop(inner);
                self.destroy_block(block);
            }
            FreeOutcome::UnknownBlock => {
                // Reachable only through a bookkeeping bug. Called from Drop
                // impls, so log instead of panicking.
                tracing::error!(
                    memory = ?allocation.memory,
                    arena = allocation.arena.0,
                    "free of allocation with no owning block"
                );
            }
        }
        allocation.memory = vk::DeviceMemory::null();
        allocation.ptr = std::ptr::null_mut();
    }

    fn allocate_block(
        &self,
        req: &AllocRequest,
        type_index: u32,
        size: vk::DeviceSize,
        host_visible: bool,
    ) -> Result<Block> {
        let device = &self.0.device;
        // Keeping host-visible blocks atom-sized keeps every whole-range
        // flush inside the allocation.
        let size = if host_visible {
            align_up(size, device.limits().non_coherent_atom_size)
        } else {
            size
        };
        let mut flags_info = vk::MemoryAllocateFlagsInfo::default().flags(req.alloc_flags);
        let mut priority_info =
            vk::MemoryPriorityAllocateInfoEXT::default().priority(req.priority);
        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        if !req.alloc_flags.is_empty() {
            info = info.push_next(&mut flags_info);
        }
        if device.has_extension(ash::ext::memory_priority::NAME) {
            info = info.push_next(&mut priority_info);
        }
        let memory = unsafe { device.allocate_memory(&info, None)? };
        let mapped = if host_visible {
            match unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            } {
                Ok(ptr) => ptr as *mut u8,
                Err(err) => {
                    unsafe { device.free_memory(memory, None) };
                    return Err(err.into());
                }
            }
        } else {
            std::ptr::null_mut()
        };
        tracing::info!(
            size,
            type_index,
            arena = req.arena.0,
            "allocated device memory block"
        );
        Ok(Block::new(memory, size, mapped))
    }

    fn destroy_block(&self, block: Block) {
        let device = &self.0.device;
        unsafe {
            if !block.mapped.is_null() {
                device.unmap_memory(block.memory);
            }
            device.free_memory(block.memory, None);
        }
        tracing::info!(size = block.size, "released device memory block");
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for ((arena, type_index), bucket) in std::mem::take(&mut inner.buckets) {
            for block in bucket.blocks {
                if block.freed != block.cursor {
                    tracing::warn!(
                        arena = arena.0,
                        type_index,
                        outstanding = block.cursor - block.freed,
                        "destroying memory pool with live sub-allocations"
                    );
                }
                unsafe {
                    if !block.mapped.is_null() {
                        self.device.unmap_memory(block.memory);
                    }
                    self.device.free_memory(block.memory, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn test_block(raw: u64, size: vk::DeviceSize) -> Block {
        Block::new(vk::DeviceMemory::from_raw(raw), size, std::ptr::null_mut())
    }

    #[test]
    fn three_uniform_allocations_share_one_block() {
        let mut bucket = Bucket::default();
        assert!(bucket.place(256, 256).is_none());

        bucket.insert(test_block(1, DEFAULT_BLOCK_SIZE), 256);
        let b = bucket.place(256, 256).unwrap();
        let c = bucket.place(256, 256).unwrap();

        assert_eq!(bucket.blocks.len(), 1);
        assert_eq!(b.offset, 256);
        assert_eq!(c.offset, 512);
        assert_eq!(bucket.blocks[0].cursor, 768);
    }

    #[test]
    fn alignment_padding_advances_cursor() {
        let mut bucket = Bucket::default();
        bucket.insert(test_block(1, 4096), 100);
        let next = bucket.place(100, 256).unwrap();
        assert_eq!(next.offset, 256);
        assert_eq!(bucket.blocks[0].cursor, 356);
    }

    #[test]
    fn best_fit_prefers_fullest_block() {
        let mut bucket = Bucket::default();
        let mut tight = test_block(1, 1024);
        tight.cursor = 924; // 100 remaining
        let mut roomy = test_block(2, 4096);
        roomy.cursor = 96; // 4000 remaining
        bucket.blocks.push(tight);
        bucket.blocks.push(roomy);

        let p = bucket.place(50, 1).unwrap();
        assert_eq!(p.memory, vk::DeviceMemory::from_raw(1));
        assert_eq!(p.offset, 924);
    }

    #[test]
    fn list_stays_sorted_by_remaining_capacity() {
        let mut bucket = Bucket::default();
        bucket.insert(test_block(1, 1024), 512);
        bucket.insert(test_block(2, 4096), 512);
        bucket.insert(test_block(3, 2048), 512);

        // Consumes most of block 2, which must then migrate to the front.
        let p = bucket.place(3500, 1).unwrap();
        assert_eq!(p.memory, vk::DeviceMemory::from_raw(2));
        for pair in bucket.blocks.windows(2) {
            assert!(pair[0].remaining() <= pair[1].remaining());
        }
        assert_eq!(bucket.blocks[0].memory, vk::DeviceMemory::from_raw(2));
    }

    #[test]
    fn block_destroyed_when_freed_equals_cursor() {
        let mut bucket = Bucket::default();
        bucket.insert(test_block(1, 1024), 256);
        bucket.place(256, 1).unwrap();

        let mem = vk::DeviceMemory::from_raw(1);
        assert!(matches!(bucket.free(mem, 256), FreeOutcome::Retained));
        assert!(bucket.blocks[0].freed <= bucket.blocks[0].cursor);
        assert!(matches!(bucket.free(mem, 256), FreeOutcome::Destroyed(_)));
        assert!(bucket.blocks.is_empty());
    }

    #[test]
    fn block_destroyed_when_freed_equals_size() {
        let mut bucket = Bucket::default();
        bucket.insert(test_block(1, 1024), 1024);
        let mem = vk::DeviceMemory::from_raw(1);
        assert!(matches!(bucket.free(mem, 1024), FreeOutcome::Destroyed(_)));
    }

    #[test]
    fn unknown_handle_reported_not_destroyed() {
        let mut bucket = Bucket::default();
        bucket.insert(test_block(1, 1024), 256);
        assert!(matches!(
            bucket.free(vk::DeviceMemory::from_raw(99), 256),
            FreeOutcome::UnknownBlock
        ));
        assert_eq!(bucket.blocks.len(), 1);
    }

    #[test]
    fn memory_type_selection_honors_filter_and_props() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(
            find_memory_type(&props, !0, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        // Filter excludes type 1, so the combined type wins.
        assert_eq!(
            find_memory_type(&props, 0b101, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(2)
        );
        assert_eq!(
            find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
