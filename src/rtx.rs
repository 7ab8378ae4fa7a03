//! Acceleration structure lifecycle management.
//!
//! Structures move through `Empty -> Staged -> Finalized`. A build stages the
//! structure into an exactly-sized backing buffer plus a scratch buffer; for
//! compaction-eligible structures a compacted-size query followed by a
//! compacting copy produces a second, smaller object, and `finalize` keeps
//! only that one. Refit-capable structures keep their backing and scratch
//! buffers and update in place from the `Finalized` state.
//!
//! The caller sequences GPU phases through a [`CommandStream`]: the
//! compacted-size query result is only available after the submission holding
//! [`AccelerationStructure::enqueue_post_build_async`] completes, so batched
//! callers `wait_complete` between the build batch and the compaction batch.
//! Likewise `finalize` must run only after the compacting copy's submission
//! is confirmed complete.
//!
//! Bottom-level structures capture their build-range info from geometry
//! counts at construction, so later release of the input buffers cannot
//! corrupt a rebuild.

use std::ops::{Deref, DerefMut};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    buffer::{Buffer, BufferDesc, BufferLike},
    command::CommandStream,
    device::{Device, HasDevice},
    error::{Error, Result},
    pool::{Arena, MemoryPool},
    utils::AsVkHandle,
};

/// One triangle geometry feeding a bottom-level build. Buffer handles are
/// shared, so the views stay valid for as long as the structure keeps them.
#[derive(Clone)]
pub struct TriangleGeometryDesc {
    pub vertex_buffer: Buffer,
    pub vertex_offset: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub vertex_stride: vk::DeviceSize,
    pub max_vertex: u32,
    pub index_buffer: Buffer,
    pub index_offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
    pub primitive_count: u32,
    pub flags: vk::GeometryFlagsKHR,
}

/// What a structure is built from: triangle geometries for bottom-level,
/// one flat instance array for top-level. Assembly of the Vulkan geometry
/// descriptions dispatches on this tag.
pub enum AccelPayload {
    Mesh {
        geometries: SmallVec<[TriangleGeometryDesc; 1]>,
        /// Captured from geometry counts at construction; survives
        /// `geometries` being dropped for static meshes.
        build_ranges: SmallVec<[vk::AccelerationStructureBuildRangeInfoKHR; 1]>,
    },
    Instances {
        /// Tightly packed `vk::AccelerationStructureInstanceKHR` array.
        instance_buffer: Buffer,
        instance_offset: vk::DeviceSize,
        count: u32,
    },
}

fn payload_ty(payload: &AccelPayload) -> vk::AccelerationStructureTypeKHR {
    match payload {
        AccelPayload::Mesh { .. } => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelPayload::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn mesh_build_ranges(
    primitive_counts: &[u32],
) -> SmallVec<[vk::AccelerationStructureBuildRangeInfoKHR; 1]> {
    primitive_counts
        .iter()
        .map(|&primitive_count| vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count,
            ..Default::default()
        })
        .collect()
}

fn payload_build_ranges(
    payload: &AccelPayload,
) -> SmallVec<[vk::AccelerationStructureBuildRangeInfoKHR; 1]> {
    match payload {
        AccelPayload::Mesh { build_ranges, .. } => build_ranges.clone(),
        AccelPayload::Instances { count, .. } => {
            smallvec::smallvec![vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: *count,
                ..Default::default()
            }]
        }
    }
}

fn payload_primitive_counts(payload: &AccelPayload) -> SmallVec<[u32; 1]> {
    payload_build_ranges(payload)
        .iter()
        .map(|range| range.primitive_count)
        .collect()
}

fn payload_geometries(
    payload: &AccelPayload,
) -> SmallVec<[vk::AccelerationStructureGeometryKHR<'static>; 1]> {
    match payload {
        AccelPayload::Mesh { geometries, .. } => geometries
            .iter()
            .map(|desc| vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                        vertex_format: desc.vertex_format,
                        vertex_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: desc.vertex_buffer.device_address()
                                + desc.vertex_offset,
                        },
                        vertex_stride: desc.vertex_stride,
                        max_vertex: desc.max_vertex,
                        index_type: desc.index_type,
                        index_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: desc.index_buffer.device_address() + desc.index_offset,
                        },
                        ..Default::default()
                    },
                },
                flags: desc.flags,
                ..Default::default()
            })
            .collect(),
        AccelPayload::Instances {
            instance_buffer,
            instance_offset,
            ..
        } => {
            smallvec::smallvec![vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::INSTANCES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR {
                        array_of_pointers: vk::FALSE,
                        data: vk::DeviceOrHostAddressConstKHR {
                            device_address: instance_buffer.device_address() + instance_offset,
                        },
                        ..Default::default()
                    },
                },
                ..Default::default()
            }]
        }
    }
}

fn is_dynamic_flags(flags: vk::BuildAccelerationStructureFlagsKHR) -> bool {
    flags.intersects(
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
    )
}

fn is_rebuilt_regularly_flags(flags: vk::BuildAccelerationStructureFlagsKHR) -> bool {
    is_dynamic_flags(flags)
        && !flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
}

/// Compaction double-buffers the structure, which costs more than it saves
/// for structures rebuilt every few frames.
fn wants_compaction_flags(flags: vk::BuildAccelerationStructureFlagsKHR) -> bool {
    flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
        && !is_rebuilt_regularly_flags(flags)
}

/// Whether finalize has work to do in `state`. `Ok(false)` is the idempotent
/// re-entry on an already finalized structure.
fn finalize_plan(state: LifecycleState) -> Result<bool> {
    match state {
        LifecycleState::Finalized => Ok(false),
        LifecycleState::Staged => Ok(true),
        LifecycleState::Empty => Err(Error::InvalidState("finalize requires a staged build")),
    }
}

/// A topology change between builds requires a new structure, not a rebuild.
fn validate_cached_size(cached: vk::DeviceSize, queried: vk::DeviceSize) -> Result<()> {
    if cached != 0 && cached != queried {
        return Err(Error::SizeChanged { cached, queried });
    }
    Ok(())
}

/// A query pool reading back compacted acceleration structure sizes.
pub struct QueryPool {
    device: Device,
    handle: vk::QueryPool,
    count: u32,
}

impl QueryPool {
    pub fn new(device: Device, query_type: vk::QueryType, count: u32) -> Result<Self> {
        let handle = unsafe {
            device.create_query_pool(
                &vk::QueryPoolCreateInfo {
                    query_type,
                    query_count: count,
                    ..Default::default()
                },
                None,
            )?
        };
        Ok(Self {
            device,
            handle,
            count,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Blocks until the queried values are available, then reads them out.
    pub fn get_results_u64(&self, first: u32, results: &mut [u64]) -> Result<()> {
        assert!(first + results.len() as u32 <= self.count);
        unsafe {
            self.device.get_query_pool_results(
                self.handle,
                first,
                results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }
        Ok(())
    }
}

impl AsVkHandle for QueryPool {
    type Handle = vk::QueryPool;
    fn vk_handle(&self) -> vk::QueryPool {
        self.handle
    }
}

impl HasDevice for QueryPool {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_query_pool(self.handle, None);
        }
    }
}

/// One raw acceleration structure object created on an exactly-sized backing
/// buffer.
struct AccelObject {
    device: Device,
    buffer: Buffer,
    raw: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
}

impl Drop for AccelObject {
    fn drop(&mut self) {
        unsafe {
            self.device.accel().destroy_acceleration_structure(self.raw, None);
        }
    }
}

impl AccelObject {
    fn new(
        pool: &MemoryPool,
        size: vk::DeviceSize,
        ty: vk::AccelerationStructureTypeKHR,
        label: &'static str,
    ) -> Result<Self> {
        let buffer = Buffer::new(
            pool,
            &BufferDesc {
                size,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                memory_props: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                arena: Arena::PERSISTENT,
                label: Some(label),
                ..Default::default()
            },
            None,
        )?;
        let device = pool.device().clone();
        let raw = unsafe {
            device.accel().create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR {
                    ty,
                    size: buffer.size(),
                    offset: 0,
                    buffer: buffer.vk_handle(),
                    ..Default::default()
                },
                None,
            )?
        };
        let device_address = unsafe {
            device.accel().get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR {
                    acceleration_structure: raw,
                    ..Default::default()
                },
            )
        };
        Ok(Self {
            device,
            buffer,
            raw,
            device_address,
        })
    }

    fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LifecycleState {
    Empty,
    Staged,
    Finalized,
}

/// A bottom- or top-level spatial index with its staged-build bookkeeping.
///
/// Use through the [`TriangleMesh`] and [`TopLevelBvh`] wrappers.
pub struct AccelerationStructure {
    pool: MemoryPool,
    payload: AccelPayload,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// An external rasterization consumer still reads the vertex/index
    /// buffers, so `finalize` must not drop them.
    retain_inputs: bool,
    state: LifecycleState,
    staging: Option<AccelObject>,
    compacted: Option<AccelObject>,
    scratch: Option<Buffer>,
    query_pool: Option<QueryPool>,
    /// `acceleration_structure_size` cached at the first build.
    cached_size: vk::DeviceSize,
    /// Compacted size cached when the compacted object is first allocated.
    cached_compacted_size: vk::DeviceSize,
    /// Resolved at finalize; 0 before then.
    device_address: vk::DeviceAddress,
}

impl HasDevice for AccelerationStructure {
    fn device(&self) -> &Device {
        self.pool.device()
    }
}

impl AccelerationStructure {
    fn new(
        pool: MemoryPool,
        payload: AccelPayload,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        retain_inputs: bool,
    ) -> Self {
        Self {
            pool,
            payload,
            build_flags,
            retain_inputs,
            state: LifecycleState::Empty,
            staging: None,
            compacted: None,
            scratch: None,
            query_pool: None,
            cached_size: 0,
            cached_compacted_size: 0,
            device_address: 0,
        }
    }

    pub fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.build_flags
    }

    /// Fast-build-preferred or update-supported structures.
    pub fn is_dynamic(&self) -> bool {
        is_dynamic_flags(self.build_flags)
    }

    /// Dynamic structures not tuned for trace speed; these skip compaction.
    pub fn is_rebuilt_regularly(&self) -> bool {
        is_rebuilt_regularly_flags(self.build_flags)
    }

    pub fn supports_refit(&self) -> bool {
        self.build_flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }

    fn wants_compaction(&self) -> bool {
        wants_compaction_flags(self.build_flags)
    }

    /// Device address of the finalized structure, for TLAS instances and
    /// shader tables. Zero before [`AccelerationStructure::finalize`].
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Backing size of the object rays will traverse: the compacted object
    /// once one exists, the staging object otherwise.
    pub fn backing_size(&self) -> vk::DeviceSize {
        self.final_object().map(AccelObject::size).unwrap_or(0)
    }

    pub fn compacted_size(&self) -> Option<vk::DeviceSize> {
        self.compacted.as_ref().map(AccelObject::size)
    }

    fn final_object(&self) -> Option<&AccelObject> {
        self.compacted.as_ref().or(self.staging.as_ref())
    }

    fn query_build_sizes(&self) -> Result<vk::AccelerationStructureBuildSizesInfoKHR<'static>> {
        let geometries = payload_geometries(&self.payload);
        let counts = payload_primitive_counts(&self.payload);
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(payload_ty(&self.payload))
            .flags(self.build_flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.device().accel().get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &counts,
                &mut size_info,
            );
        }
        Ok(size_info)
    }

    /// Queries build sizes, allocates staging backing and scratch on first
    /// use, and records the build into the stream's current recording.
    ///
    /// Re-invocation revalidates the freshly queried size against the cached
    /// one; a mismatch means the topology changed and fails with
    /// [`Error::SizeChanged`]. With `enqueue_barriers` the build is fenced
    /// against prior uploads before and made visible after; callers batching
    /// several builds pass `false` and own the barrier placement.
    pub fn enqueue_build(
        &mut self,
        stream: &mut impl CommandStream,
        enqueue_barriers: bool,
    ) -> Result<()> {
        if matches!(self.payload, AccelPayload::Mesh { ref geometries, .. } if geometries.is_empty())
        {
            return Err(Error::InvalidState(
                "geometry descriptors were released; rebuilds require retained inputs",
            ));
        }
        let sizes = self.query_build_sizes()?;
        validate_cached_size(self.cached_size, sizes.acceleration_structure_size)?;

        let ty = payload_ty(&self.payload);
        if self.staging.is_none() {
            self.staging = Some(AccelObject::new(
                &self.pool,
                sizes.acceleration_structure_size,
                ty,
                "acceleration structure staging",
            )?);
            self.cached_size = sizes.acceleration_structure_size;
        }
        if self.scratch.is_none() {
            let scratch_size = sizes.build_scratch_size.max(sizes.update_scratch_size);
            self.scratch = Some(Buffer::new(
                &self.pool,
                &BufferDesc {
                    size: scratch_size,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    memory_props: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    arena: Arena::SCRATCH,
                    label: Some("acceleration structure scratch"),
                    ..Default::default()
                },
                None,
            )?);
        }

        self.record_build(stream, vk::BuildAccelerationStructureModeKHR::BUILD, enqueue_barriers);
        self.state = LifecycleState::Staged;
        Ok(())
    }

    fn record_build(
        &self,
        stream: &mut impl CommandStream,
        mode: vk::BuildAccelerationStructureModeKHR,
        enqueue_barriers: bool,
    ) {
        let cmd = stream.command_buffer();
        let device = self.device().clone();
        // Fresh builds always target the staging object; an update targets
        // whichever object rays traverse, the compacted one when it exists.
        let target = if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            self.final_object().unwrap()
        } else {
            self.staging.as_ref().unwrap()
        };
        let scratch = self.scratch.as_ref().unwrap();

        if enqueue_barriers {
            // Vertex/index/instance uploads must land before the build reads
            // them.
            memory_barrier2(
                &device,
                cmd,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags2::SHADER_READ,
            );
        }

        let geometries = payload_geometries(&self.payload);
        let ranges = payload_build_ranges(&self.payload);
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(payload_ty(&self.payload))
            .flags(self.build_flags)
            .mode(mode)
            .dst_acceleration_structure(target.raw)
            .geometries(&geometries);
        if mode == vk::BuildAccelerationStructureModeKHR::UPDATE {
            info = info.src_acceleration_structure(target.raw);
        }
        info.scratch_data.device_address = scratch.device_address();
        unsafe {
            device
                .accel()
                .cmd_build_acceleration_structures(cmd, &[info], &[ranges.as_slice()]);
        }

        if enqueue_barriers {
            memory_barrier2(
                &device,
                cmd,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::MEMORY_READ,
            );
        }
    }

    /// Records the compacted-size query. No-op for structures that never
    /// compact. Must precede [`AccelerationStructure::enqueue_compaction`],
    /// with a completed submission in between.
    pub fn enqueue_post_build_async(&mut self, stream: &mut impl CommandStream) -> Result<()> {
        if !self.wants_compaction() || self.compacted.is_some() {
            return Ok(());
        }
        if self.state != LifecycleState::Staged {
            return Err(Error::InvalidState(
                "compacted-size query requires a staged build",
            ));
        }
        if self.query_pool.is_none() {
            self.query_pool = Some(QueryPool::new(
                self.device().clone(),
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                1,
            )?);
        }
        let query_pool = self.query_pool.as_ref().unwrap();
        let cmd = stream.command_buffer();
        let device = self.device();
        unsafe {
            device.cmd_reset_query_pool(cmd, query_pool.vk_handle(), 0, 1);
        }
        memory_barrier2(
            device,
            cmd,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        );
        unsafe {
            device.accel().cmd_write_acceleration_structures_properties(
                cmd,
                &[self.staging.as_ref().unwrap().raw],
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                query_pool.vk_handle(),
                0,
            );
        }
        Ok(())
    }

    /// Reads the compacted size back, allocates (or revalidates) the
    /// compacted object, and records the compacting copy. The read blocks
    /// until the query result is available, so batched callers must have
    /// waited for the query submission first.
    ///
    /// Non-refit structures hand their scratch buffer to the stream's
    /// current slot here; the pool gets it back once that slot's submission
    /// completes, never while a build may still be in flight.
    pub fn enqueue_compaction(&mut self, stream: &mut impl CommandStream) -> Result<()> {
        if !self.wants_compaction() || self.compacted.is_some() {
            return Ok(());
        }
        if self.state != LifecycleState::Staged {
            return Err(Error::InvalidState("compaction requires a staged build"));
        }
        let query_pool = self
            .query_pool
            .as_ref()
            .ok_or(Error::InvalidState("compaction before compacted-size query"))?;
        let mut compacted_size = [0u64; 1];
        query_pool.get_results_u64(0, &mut compacted_size)?;
        let compacted_size = compacted_size[0];
        validate_cached_size(self.cached_compacted_size, compacted_size)?;

        if !self.supports_refit() {
            if let Some(scratch) = self.scratch.take() {
                stream.hold_buffer(scratch);
            }
        }

        let staging = self.staging.as_ref().unwrap();
        let compacted = AccelObject::new(
            &self.pool,
            compacted_size,
            payload_ty(&self.payload),
            "acceleration structure compacted",
        )?;
        tracing::info!(
            staged = staging.size(),
            compacted = compacted_size,
            "compacting acceleration structure"
        );

        let cmd = stream.command_buffer();
        let device = self.device().clone();
        unsafe {
            device
                .accel()
                .cmd_copy_acceleration_structure(cmd, &vk::CopyAccelerationStructureInfoKHR {
                    src: staging.raw,
                    dst: compacted.raw,
                    mode: vk::CopyAccelerationStructureModeKHR::COMPACT,
                    ..Default::default()
                });
        }
        memory_barrier2(
            &device,
            cmd,
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        );
        // Staging remains the src of the in-flight copy; keep its backing
        // memory out of the pool until the slot confirms completion.
        stream.hold_buffer(staging.buffer.clone());

        self.cached_compacted_size = compacted_size;
        self.compacted = Some(compacted);
        Ok(())
    }

    /// Settles the structure: releases scratch for non-refit structures,
    /// drops the staging object and query pool when a compacted object took
    /// over, resolves the device address, and for static meshes without an
    /// external consumer drops the geometry descriptors. Idempotent.
    ///
    /// Call only after the structure's last recorded GPU work (build or
    /// compacting copy) is confirmed complete.
    pub fn finalize(&mut self) -> Result<()> {
        if !finalize_plan(self.state)? {
            return Ok(());
        }
        if !self.supports_refit() {
            self.scratch = None;
        }
        if self.compacted.is_some() {
            // Updates target the compacted object from here on, so the
            // staging object is dead weight even for refit-capable
            // structures.
            self.staging = None;
            self.query_pool = None;
        }
        // Non-compacting structures keep staging as the final object.
        self.device_address = self
            .final_object()
            .expect("staged structure always has an object")
            .device_address;
        if !self.is_dynamic() && !self.retain_inputs {
            if let AccelPayload::Mesh { geometries, .. } = &mut self.payload {
                geometries.clear();
            }
        }
        self.state = LifecycleState::Finalized;
        Ok(())
    }

    /// Records an in-place update of a finalized, refit-capable structure,
    /// reusing the existing backing and scratch buffers.
    pub fn enqueue_refit(
        &mut self,
        stream: &mut impl CommandStream,
        enqueue_barriers: bool,
    ) -> Result<()> {
        if self.state != LifecycleState::Finalized {
            return Err(Error::InvalidState("refit requires a finalized structure"));
        }
        if !self.supports_refit() {
            return Err(Error::InvalidState(
                "structure was not built with update support",
            ));
        }
        self.record_build(
            stream,
            vk::BuildAccelerationStructureModeKHR::UPDATE,
            enqueue_barriers,
        );
        Ok(())
    }
}

/// Records one global memory barrier.
fn memory_barrier2(
    device: &Device,
    cmd: vk::CommandBuffer,
    src_stage_mask: vk::PipelineStageFlags2,
    src_access_mask: vk::AccessFlags2,
    dst_stage_mask: vk::PipelineStageFlags2,
    dst_access_mask: vk::AccessFlags2,
) {
    let barrier = vk::MemoryBarrier2 {
        src_stage_mask,
        src_access_mask,
        dst_stage_mask,
        dst_access_mask,
        ..Default::default()
    };
    unsafe {
        device.cmd_pipeline_barrier2(
            cmd,
            &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier)),
        );
    }
}

/// A bottom-level structure over triangle geometries.
pub struct TriangleMesh(AccelerationStructure);

impl TriangleMesh {
    /// `retain_inputs` keeps the vertex/index buffers alive past finalize
    /// for an external rasterization consumer.
    pub fn new(
        pool: MemoryPool,
        geometries: impl IntoIterator<Item = TriangleGeometryDesc>,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
        retain_inputs: bool,
    ) -> Self {
        let geometries: SmallVec<[TriangleGeometryDesc; 1]> = geometries.into_iter().collect();
        let counts: SmallVec<[u32; 1]> = geometries.iter().map(|g| g.primitive_count).collect();
        let build_ranges = mesh_build_ranges(&counts);
        Self(AccelerationStructure::new(
            pool,
            AccelPayload::Mesh {
                geometries,
                build_ranges,
            },
            build_flags,
            retain_inputs,
        ))
    }

    pub fn num_geometries(&self) -> usize {
        match &self.0.payload {
            AccelPayload::Mesh { build_ranges, .. } => build_ranges.len(),
            AccelPayload::Instances { .. } => unreachable!(),
        }
    }
}

impl Deref for TriangleMesh {
    type Target = AccelerationStructure;
    fn deref(&self) -> &AccelerationStructure {
        &self.0
    }
}
impl DerefMut for TriangleMesh {
    fn deref_mut(&mut self) -> &mut AccelerationStructure {
        &mut self.0
    }
}

/// A top-level structure over one flat instance array.
pub struct TopLevelBvh(AccelerationStructure);

impl TopLevelBvh {
    pub fn new(
        pool: MemoryPool,
        instance_buffer: Buffer,
        instance_count: u32,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Self {
        Self(AccelerationStructure::new(
            pool,
            AccelPayload::Instances {
                instance_buffer,
                instance_offset: 0,
                count: instance_count,
            },
            build_flags,
            true,
        ))
    }

    pub fn num_instances(&self) -> u32 {
        match &self.0.payload {
            AccelPayload::Instances { count, .. } => *count,
            AccelPayload::Mesh { .. } => unreachable!(),
        }
    }
}

impl Deref for TopLevelBvh {
    type Target = AccelerationStructure;
    fn deref(&self) -> &AccelerationStructure {
        &self.0
    }
}
impl DerefMut for TopLevelBvh {
    fn deref_mut(&mut self) -> &mut AccelerationStructure {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::BuildAccelerationStructureFlagsKHR as F;

    #[test]
    fn classification_matrix() {
        assert!(is_dynamic_flags(F::PREFER_FAST_BUILD));
        assert!(is_dynamic_flags(F::ALLOW_UPDATE | F::PREFER_FAST_TRACE));
        assert!(!is_dynamic_flags(F::PREFER_FAST_TRACE | F::ALLOW_COMPACTION));

        assert!(is_rebuilt_regularly_flags(F::PREFER_FAST_BUILD));
        // Update-capable but trace-optimized structures refit instead of
        // rebuilding, so they are not "rebuilt regularly".
        assert!(!is_rebuilt_regularly_flags(
            F::ALLOW_UPDATE | F::PREFER_FAST_TRACE
        ));
        assert!(!is_rebuilt_regularly_flags(F::PREFER_FAST_TRACE));
    }

    #[test]
    fn regularly_rebuilt_structures_skip_compaction() {
        assert!(wants_compaction_flags(
            F::ALLOW_COMPACTION | F::PREFER_FAST_TRACE
        ));
        assert!(!wants_compaction_flags(
            F::ALLOW_COMPACTION | F::PREFER_FAST_BUILD
        ));
        assert!(!wants_compaction_flags(F::PREFER_FAST_TRACE));
        assert!(wants_compaction_flags(
            F::ALLOW_COMPACTION | F::ALLOW_UPDATE | F::PREFER_FAST_TRACE
        ));
    }

    #[test]
    fn size_revalidation_rejects_topology_changes() {
        assert!(validate_cached_size(0, 4096).is_ok());
        assert!(validate_cached_size(4096, 4096).is_ok());
        let err = validate_cached_size(4096, 8192).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeChanged {
                cached: 4096,
                queried: 8192
            }
        ));
    }

    #[test]
    fn finalize_settles_once_then_noops() {
        let mut state = LifecycleState::Empty;
        assert!(matches!(
            finalize_plan(state),
            Err(Error::InvalidState(_))
        ));

        state = LifecycleState::Staged;
        assert!(finalize_plan(state).unwrap());
        state = LifecycleState::Finalized;
        // Every further call performs no work and reports success.
        assert!(!finalize_plan(state).unwrap());
        assert!(!finalize_plan(state).unwrap());
    }

    #[test]
    fn build_ranges_capture_primitive_counts() {
        let ranges = mesh_build_ranges(&[10, 20]);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].primitive_count, 10);
        assert_eq!(ranges[1].primitive_count, 20);
        assert_eq!(ranges[0].primitive_offset, 0);
    }
}
