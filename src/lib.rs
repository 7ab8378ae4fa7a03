//! # Scoria
//!
//! GPU memory sub-allocation and acceleration structure lifecycle management
//! for Vulkan ray tracing, built on [ash](https://docs.rs/ash).
//!
//! Scoria owns the memory under a real-time ray tracer: a batching
//! sub-allocator that packs buffers and images into a small number of device
//! memory blocks, resource factories on top of it, command submission
//! disciplines with deferred resource release, and a staged build pipeline
//! for bottom- and top-level acceleration structures.
//!
//! ## Quick Start
//!
//! ```no_run
//! # fn scene_geometry() -> Vec<scoria::rtx::TriangleGeometryDesc> { unimplemented!() }
//! # fn demo(device: scoria::Device) -> Result<(), scoria::Error> {
//! use scoria::prelude::*;
//!
//! let pool = MemoryPool::new(device.clone());
//! let mut stream = SyncCommandStream::new(device)?;
//!
//! // Stage a bottom-level structure: build, query compacted size, compact.
//! let mut mesh = TriangleMesh::new(
//!     pool.clone(),
//!     scene_geometry(),
//!     vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
//!         | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
//!     false,
//! );
//! stream.begin_record()?;
//! mesh.enqueue_build(&mut stream, true)?;
//! mesh.enqueue_post_build_async(&mut stream)?;
//! stream.end_submit()?;
//! stream.wait_complete(Cursor::Latest)?;
//!
//! stream.begin_record()?;
//! mesh.enqueue_compaction(&mut stream)?;
//! stream.end_submit()?;
//! stream.wait_complete(Cursor::Latest)?;
//! mesh.finalize()?;
//! # Ok(()) }
//! ```
//!
//! ## Overview
//!
//! ### Memory Pool
//!
//! [`MemoryPool`] sub-allocates from large `vk::DeviceMemory` blocks, keyed
//! by [`Arena`](pool::Arena) and memory type. Blocks never shrink in place;
//! a block is returned to the driver once everything in it is freed.
//!
//! ### Resource Factories
//!
//! [`Buffer`](buffer::Buffer) and [`Image`](image::Image) bind their Vulkan
//! objects to pool allocations and release them on last drop. Both support
//! exact-match reuse and ring-style swap copies
//! ([`Buffer::cycle_swap`](buffer::Buffer::cycle_swap),
//! [`Image::cycle_swap`](image::Image::cycle_swap)); images additionally
//! support memory aliasing on another image's storage
//! ([`Image::new_aliased`](image::Image::new_aliased)).
//!
//! ### Command Streams
//!
//! [`SyncCommandStream`](command::SyncCommandStream),
//! [`AsyncRingCommandStream`](command::AsyncRingCommandStream), and
//! [`ParallelCommandStream`](command::ParallelCommandStream) share the
//! [`CommandStream`](command::CommandStream) contract: record, submit
//! signaling a timeline semaphore, wait by [`Cursor`](command::Cursor).
//! Resources pinned with `hold_buffer`/`hold_texture` are released only
//! after their slot's submission is confirmed complete.
//!
//! ### Acceleration Structures
//!
//! [`TriangleMesh`](rtx::TriangleMesh) and [`TopLevelBvh`](rtx::TopLevelBvh)
//! move through `Empty -> Staged -> Finalized`, with optional compaction
//! into an exactly-sized backing buffer and in-place refit for
//! update-capable structures.
//!
//! ## Requirements
//!
//! Vulkan 1.3 with the `VK_KHR_acceleration_structure` device extension.

pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
pub mod image;
pub mod pool;
pub mod rtx;
pub mod utils;

pub use device::{Device, HasDevice};
pub use error::{Error, Result};
pub use pool::MemoryPool;

pub use ash;

pub mod prelude {
    pub use crate::{
        ash,
        ash::vk,
        buffer::{Buffer, BufferDesc, BufferLike},
        command::{
            AsyncRingCommandStream, CommandStream, Cursor, ParallelCommandStream,
            SyncCommandStream,
        },
        image::{Image, ImageDesc, ImageExt, ImageLike},
        pool::{AllocRequest, Arena, MemoryPool},
        rtx::{TopLevelBvh, TriangleGeometryDesc, TriangleMesh},
        utils::AsVkHandle,
        Device, HasDevice,
    };
}
