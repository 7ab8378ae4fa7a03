//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result`]. The taxonomy is
//! deliberately small: configuration errors ([`Error::MemoryTypeUnavailable`],
//! [`Error::InvalidAlias`], [`Error::SizeChanged`], [`Error::InvalidState`])
//! signal caller misuse and are never retried; everything coming back from the
//! driver surfaces as [`Error::Vulkan`]. None of these are designed to be
//! caught and resumed mid-frame; they terminate the current scene-load or
//! render operation.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No physical memory type satisfies both the resource's type filter and
    /// the requested property flags.
    #[error(
        "no memory type in filter {type_filter:#034b} provides properties {required_props:?}"
    )]
    MemoryTypeUnavailable {
        type_filter: u32,
        required_props: vk::MemoryPropertyFlags,
    },

    /// A freshly queried acceleration structure size no longer matches the
    /// size cached at the previous build. The topology changed; the caller
    /// must create a new structure instead of rebuilding this one.
    #[error("acceleration structure size changed between builds: cached {cached}, queried {queried}")]
    SizeChanged {
        cached: vk::DeviceSize,
        queried: vk::DeviceSize,
    },

    /// An aliasing image was requested on storage that cannot hold it.
    #[error(
        "alias target unsuitable: offset {target_offset} size {target_size} cannot satisfy \
         requirement of size {required_size} aligned to {required_alignment}"
    )]
    InvalidAlias {
        target_offset: vk::DeviceSize,
        target_size: vk::DeviceSize,
        required_size: vk::DeviceSize,
        required_alignment: vk::DeviceSize,
    },

    /// An operation was invoked in a lifecycle state that does not permit it.
    #[error("operation invalid in current state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Vulkan(#[from] vk::Result),
}
