//! Buffer factory over the memory pool.
//!
//! [`Buffer`] is a shared handle; the underlying `vk::Buffer` and its pool
//! allocation are released exactly once when the last clone drops. Creation
//! runs the full pipeline from padded sizing through memory binding, with a
//! scope-exit guard destroying the partially built object on any failure
//! path.
//!
//! Buffers created with `swap_count > 1` back several logical ring copies
//! with one allocation; the frame loop advances the active copy with
//! [`Buffer::cycle_swap`] and addresses it through [`Buffer::swap_offset`].

use std::{
    fmt::Debug,
    ops::RangeBounds,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use ash::vk;

use crate::{
    device::{Device, DeviceLimits, HasDevice},
    error::Result,
    pool::{AllocRequest, Allocation, Arena, MemoryPool, COMMON_BLOCK_SIZE},
    utils::{align_down, align_up, AsVkHandle},
};

/// Buffers at or below this size with plain usage share the large common
/// blocks instead of the default-sized ones.
const SMALL_RESOURCE_LIMIT: vk::DeviceSize = 4 * 1024 * 1024;

/// Usage bits eligible for common-block sharing. Anything outside this list,
/// notably acceleration-structure storage, build inputs, and device-address
/// scratch, gets its own placement. Keep the regression test below in sync
/// when extending it.
const COMMON_USAGES: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDIRECT_BUFFER.as_raw(),
);

fn is_common_usage(usage: vk::BufferUsageFlags) -> bool {
    !usage.is_empty() && COMMON_USAGES.contains(usage)
}

fn accel_related(usage: vk::BufferUsageFlags) -> bool {
    usage.intersects(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
    ) || usage.contains(
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
    )
}

/// Pool-alloc alignment for a buffer: the driver's requirement, raised to
/// the scratch floor for acceleration-structure-related usages and to the
/// non-coherent atom for host-visible requests. Flush and invalidate ranges
/// are atom-aligned in absolute offsets, so two host-visible sub-allocations
/// must never share an atom.
fn alloc_alignment(
    required: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
    limits: &DeviceLimits,
) -> vk::DeviceSize {
    let mut alignment = required;
    if accel_related(usage) {
        alignment = alignment.max(limits.min_accel_scratch_offset_alignment as vk::DeviceSize);
    }
    if host_visible {
        alignment = alignment.max(limits.non_coherent_atom_size);
    }
    alignment
}

/// Exact-shape match for the reuse fast path. The label is not part of the
/// shape.
fn reuse_compatible(
    desc: &BufferDesc,
    size: vk::DeviceSize,
    swap_count: u32,
    usage: vk::BufferUsageFlags,
    requested_props: vk::MemoryPropertyFlags,
) -> bool {
    desc.size == size
        && desc.swap_count == swap_count
        && desc.usage == usage
        && desc.memory_props == requested_props
}

/// Per-copy stride after host-visibility and swap-ring padding.
fn padded_stride(
    size: vk::DeviceSize,
    swap_count: u32,
    host_visible: bool,
    limits: &DeviceLimits,
) -> vk::DeviceSize {
    let mut stride = size;
    if host_visible {
        stride = align_up(stride, limits.non_coherent_atom_size);
    }
    if swap_count > 1 {
        stride = align_up(stride, limits.ring_stride_alignment());
    }
    stride
}

/// Common interface for buffer-backed data: a raw handle plus the range it
/// occupies and its shader-visible address.
pub trait BufferLike: AsVkHandle<Handle = vk::Buffer> + Send + Sync + 'static {
    /// Offset of the data within the underlying `vk::Buffer`. 0 for
    /// standalone buffers.
    fn offset(&self) -> vk::DeviceSize {
        0
    }

    /// Returns the size of the buffer in bytes.
    fn size(&self) -> vk::DeviceSize;

    /// Returns the buffer device address for use in shaders.
    ///
    /// Returns 0 if the buffer was not created with `SHADER_DEVICE_ADDRESS`
    /// usage.
    fn device_address(&self) -> vk::DeviceAddress;
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    /// Logical size of one copy, before padding.
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Required memory property flags, resolved against the device's memory
    /// types at creation.
    pub memory_props: vk::MemoryPropertyFlags,
    /// Number of ring copies backed by this one allocation. 1 for plain
    /// buffers.
    pub swap_count: u32,
    pub arena: Arena,
    pub label: Option<&'static str>,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            memory_props: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            swap_count: 1,
            arena: Arena::PERSISTENT,
            label: None,
        }
    }
}

/// Destroys the `vk::Buffer` unless released, covering every failure exit
/// between object creation and memory binding.
struct PartialBuffer<'a> {
    device: &'a Device,
    handle: vk::Buffer,
}

impl PartialBuffer<'_> {
    fn release(self) -> vk::Buffer {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }
}

impl Drop for PartialBuffer<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.handle, None);
        }
    }
}

struct BufferInner {
    pool: MemoryPool,
    handle: vk::Buffer,
    allocation: Allocation,
    /// Logical per-copy size, as requested.
    size: vk::DeviceSize,
    /// Padded per-copy stride; `swap_offset = index * stride`.
    stride: vk::DeviceSize,
    swap_count: u32,
    swap_index: AtomicU32,
    usage: vk::BufferUsageFlags,
    /// Property flags the caller asked for, kept for exact reuse matching.
    requested_props: vk::MemoryPropertyFlags,
    /// Property flags of the memory type actually chosen.
    memory_props: vk::MemoryPropertyFlags,
    device_address: vk::DeviceAddress,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        unsafe {
            self.pool.device().destroy_buffer(self.handle, None);
        }
        self.pool.free(&mut self.allocation);
    }
}

/// A buffer bound to a pool allocation, shared by reference counting.
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.0.handle)
            .field("size", &self.0.size)
            .field("swap_count", &self.0.swap_count)
            .finish_non_exhaustive()
    }
}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        self.0.pool.device()
    }
}

impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> vk::Buffer {
        self.0.handle
    }
}

impl BufferLike for Buffer {
    fn size(&self) -> vk::DeviceSize {
        self.0.size
    }
    fn device_address(&self) -> vk::DeviceAddress {
        self.0.device_address
    }
}

impl Buffer {
    /// Creates a buffer, or returns `reuse` unchanged when its shape matches
    /// the request exactly. The reuse path performs zero pool traffic.
    pub fn new(pool: &MemoryPool, desc: &BufferDesc, reuse: Option<&Buffer>) -> Result<Buffer> {
        if let Some(prior) = reuse {
            if reuse_compatible(
                desc,
                prior.0.size,
                prior.0.swap_count,
                prior.0.usage,
                prior.0.requested_props,
            ) {
                return Ok(prior.clone());
            }
        }

        let device = pool.device();
        let host_visible = desc
            .memory_props
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let stride = padded_stride(desc.size, desc.swap_count, host_visible, device.limits());
        let full_size = stride * desc.swap_count.max(1) as vk::DeviceSize;

        let handle = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo {
                    size: full_size,
                    usage: desc.usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                None,
            )?
        };
        let partial = PartialBuffer { device, handle };

        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let alignment =
            alloc_alignment(requirements.alignment, desc.usage, host_visible, device.limits());
        let common = desc.arena != Arena::SCRATCH
            && full_size <= SMALL_RESOURCE_LIMIT
            && is_common_usage(desc.usage);
        let alloc_flags = if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            vk::MemoryAllocateFlags::DEVICE_ADDRESS
        } else {
            vk::MemoryAllocateFlags::empty()
        };

        let mut allocation = pool.alloc(&AllocRequest {
            arena: desc.arena,
            size: requirements.size.max(full_size),
            type_filter: requirements.memory_type_bits,
            alignment,
            required_props: desc.memory_props,
            alloc_flags,
            block_size_hint: common.then_some(COMMON_BLOCK_SIZE),
            ..Default::default()
        })?;

        if let Err(err) =
            unsafe { device.bind_buffer_memory(handle, allocation.memory, allocation.offset) }
        {
            pool.free(&mut allocation);
            return Err(err.into());
        }

        let device_address = if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            unsafe {
                device.get_buffer_device_address(&vk::BufferDeviceAddressInfo {
                    buffer: handle,
                    ..Default::default()
                })
            }
        } else {
            0
        };
        let memory_props = device.memory_type_properties(allocation.memory_type_index);

        if let Some(label) = desc.label {
            tracing::debug!(label, size = full_size, "created buffer");
        }
        let handle = partial.release();
        Ok(Buffer(Arc::new(BufferInner {
            pool: pool.clone(),
            handle,
            allocation,
            size: desc.size,
            stride,
            swap_count: desc.swap_count.max(1),
            swap_index: AtomicU32::new(0),
            usage: desc.usage,
            requested_props: desc.memory_props,
            memory_props,
            device_address,
        })))
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.0.usage
    }

    /// Total backing size including all ring copies and their padding.
    pub fn full_size(&self) -> vk::DeviceSize {
        self.0.stride * self.0.swap_count as vk::DeviceSize
    }

    /// Byte offset of the active ring copy within the buffer.
    pub fn swap_offset(&self) -> vk::DeviceSize {
        self.0.swap_index.load(Ordering::Relaxed) as vk::DeviceSize * self.0.stride
    }

    /// Device address of the active ring copy.
    pub fn swap_device_address(&self) -> vk::DeviceAddress {
        if self.0.device_address == 0 {
            0
        } else {
            self.0.device_address + self.swap_offset()
        }
    }

    /// Advances the ring to the next copy, modulo `active_count`.
    ///
    /// `active_count` may be smaller than the provisioned swap count but
    /// never larger. Callers advance before writing the next frame's copy.
    pub fn cycle_swap(&self, active_count: u32) {
        assert!(
            active_count >= 1 && active_count <= self.0.swap_count,
            "active count {} outside provisioned swap count {}",
            active_count,
            self.0.swap_count
        );
        let _ = self
            .0
            .swap_index
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| {
                Some((i + 1) % active_count)
            });
    }

    fn host_ptr(&self) -> *mut u8 {
        assert!(
            self.0
                .memory_props
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            "buffer is not host-visible"
        );
        debug_assert!(!self.0.allocation.ptr.is_null());
        self.0.allocation.ptr
    }

    /// Pointer to the start of the buffer contents. The mapping is
    /// persistent; this only asserts host visibility.
    pub fn map(&self) -> *mut u8 {
        self.host_ptr()
    }

    /// Counterpart of [`Buffer::map`]. On non-coherent memory this flushes
    /// the whole range so prior host writes become device-visible.
    pub fn unmap(&self) -> Result<()> {
        self.flush(..)
    }

    /// Read-only view of the full buffer contents. Logs a warning when
    /// reading memory that isn't `HOST_CACHED`, as this may be slow.
    pub fn as_slice(&self) -> &[u8] {
        if !self
            .0
            .memory_props
            .contains(vk::MemoryPropertyFlags::HOST_CACHED)
        {
            tracing::warn!("Trying to read from buffer that isn't HOST_CACHED");
        }
        unsafe { std::slice::from_raw_parts(self.host_ptr(), self.full_size() as usize) }
    }

    /// Mutable view of the full buffer contents. Panics when other clones of
    /// this handle exist.
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        assert_eq!(Arc::strong_count(&self.0), 1, "buffer is shared");
        unsafe { std::slice::from_raw_parts_mut(self.host_ptr(), self.full_size() as usize) }
    }

    /// Makes host writes in `range` (relative to the buffer start) visible
    /// to the device. No-op on `HOST_COHERENT` memory.
    pub fn flush(&self, range: impl RangeBounds<vk::DeviceSize>) -> Result<()> {
        if let Some(mapped) = self.mapped_range(range) {
            unsafe {
                self.device().flush_mapped_memory_ranges(&[mapped])?;
            }
        }
        Ok(())
    }

    /// Makes device writes in `range` visible to the host. No-op on
    /// `HOST_COHERENT` memory.
    pub fn invalidate(&self, range: impl RangeBounds<vk::DeviceSize>) -> Result<()> {
        if let Some(mapped) = self.mapped_range(range) {
            unsafe {
                self.device().invalidate_mapped_memory_ranges(&[mapped])?;
            }
        }
        Ok(())
    }

    fn mapped_range(
        &self,
        range: impl RangeBounds<vk::DeviceSize>,
    ) -> Option<vk::MappedMemoryRange<'static>> {
        if self
            .0
            .memory_props
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return None;
        }
        let full = self.full_size();
        let start = match range.start_bound() {
            std::ops::Bound::Included(start) => *start,
            std::ops::Bound::Excluded(start) => start + 1,
            std::ops::Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            std::ops::Bound::Included(end) => end + 1,
            std::ops::Bound::Excluded(end) => *end,
            std::ops::Bound::Unbounded => full,
        };
        assert!(start <= end && end <= full);
        // Atom alignment may widen the range past the sub-allocation.
        // Host-visible placements are atom-aligned and host-visible blocks
        // atom-sized, so the widened range stays inside the memory object and
        // off neighboring sub-allocations.
        let atom = self.device().limits().non_coherent_atom_size;
        let abs_start = align_down(self.0.allocation.offset + start, atom);
        let abs_end = align_up(self.0.allocation.offset + end, atom);
        Some(
            vk::MappedMemoryRange::default()
                .memory(self.0.allocation.memory)
                .offset(abs_start)
                .size(abs_end - abs_start),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            non_coherent_atom_size: 64,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 32,
            min_accel_scratch_offset_alignment: 128,
        }
    }

    #[test]
    fn stride_pads_to_atom_then_ring_alignment() {
        let l = limits();
        assert_eq!(padded_stride(100, 1, false, &l), 100);
        assert_eq!(padded_stride(100, 1, true, &l), 128);
        assert_eq!(padded_stride(100, 3, false, &l), 256);
        assert_eq!(padded_stride(300, 3, true, &l), 512);
    }

    #[test]
    fn ring_copies_never_overlap() {
        let l = limits();
        let logical = 300;
        let stride = padded_stride(logical, 3, true, &l);
        let offsets: Vec<_> = (0..3u64).map(|i| i * stride).collect();
        for (i, &a) in offsets.iter().enumerate() {
            for &b in &offsets[i + 1..] {
                assert!(a + logical <= b, "copy at {a} overlaps copy at {b}");
            }
        }
    }

    #[test]
    fn scratch_class_is_never_common() {
        // Scratch and build-input buffers carry device addresses and their
        // own alignment class; pooling them into shared common blocks would
        // silently violate the scratch offset alignment.
        assert!(!is_common_usage(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        ));
        assert!(!is_common_usage(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
        ));
        assert!(!is_common_usage(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::VERTEX_BUFFER
        ));
        assert!(!is_common_usage(vk::BufferUsageFlags::empty()));
    }

    #[test]
    fn plain_transfer_and_uniform_usage_is_common() {
        assert!(is_common_usage(
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::UNIFORM_BUFFER
        ));
        assert!(is_common_usage(
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER
        ));
    }

    #[test]
    fn reuse_requires_exact_shape_match() {
        let desc = BufferDesc {
            size: 1024,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            swap_count: 3,
            ..Default::default()
        };
        let props = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert!(reuse_compatible(
            &desc,
            1024,
            3,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            props
        ));
        // Any shape-field mismatch falls through to a fresh creation.
        assert!(!reuse_compatible(
            &desc,
            2048,
            3,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            props
        ));
        assert!(!reuse_compatible(
            &desc,
            1024,
            2,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            props
        ));
        assert!(!reuse_compatible(
            &desc,
            1024,
            3,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            props
        ));
        assert!(!reuse_compatible(
            &desc,
            1024,
            3,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE
        ));
    }

    #[test]
    fn host_visible_placements_never_share_an_atom() {
        // An atom-sized alignment floor keeps a whole-range flush or
        // invalidate of one sub-allocation from touching bytes issued to a
        // neighbor in the same block.
        let l = limits();
        let plain = vk::BufferUsageFlags::UNIFORM_BUFFER;
        assert_eq!(alloc_alignment(16, plain, true, &l), 64);
        assert_eq!(alloc_alignment(16, plain, false, &l), 16);
        // An already stricter driver requirement wins.
        assert_eq!(alloc_alignment(256, plain, true, &l), 256);
        // The scratch floor composes with the atom floor.
        let scratch =
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        assert_eq!(alloc_alignment(16, scratch, true, &l), 128);
    }

    #[test]
    fn accel_usages_raise_alignment_floor() {
        assert!(accel_related(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        ));
        assert!(accel_related(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
        ));
        assert!(!accel_related(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(!accel_related(vk::BufferUsageFlags::STORAGE_BUFFER));
    }
}
