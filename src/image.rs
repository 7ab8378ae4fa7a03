//! Image factory over the memory pool, including memory aliasing.
//!
//! Images either own a pool allocation or alias another image's already
//! bound memory. An aliasing image holds a handle to its target so the
//! shared allocation outlives both, and it never frees that allocation
//! itself; the release happens exactly once when the owning image's last
//! handle drops.
//!
//! An image created with `swap_count > 1` backs several ring copies with one
//! allocation, one `vk::Image` per copy bound at a stride; the frame loop
//! advances the active copy with [`Image::cycle_swap`] and [`AsVkHandle`]
//! resolves to it.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use ash::vk;
use glam::UVec3;
use smallvec::SmallVec;

use crate::{
    device::{Device, HasDevice},
    error::{Error, Result},
    pool::{AllocRequest, Allocation, Arena, MemoryPool},
    utils::{align_up, AsVkHandle},
};

/// Image aspect flags implied by a format.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// The queryable surface shared by image wrappers: shape, format, and the
/// aspects a view of it should cover.
pub trait ImageLike: AsVkHandle<Handle = vk::Image> + Send + Sync + 'static {
    /// Aspect flags deduced from the format.
    fn aspects(&self) -> vk::ImageAspectFlags {
        format_aspects(self.format())
    }

    fn array_layer_count(&self) -> u32;

    fn mip_level_count(&self) -> u32;

    /// Width, height, depth.
    fn extent(&self) -> UVec3;

    fn format(&self) -> vk::Format;

    fn ty(&self) -> vk::ImageType;
}

/// Rejects an alias whose target range cannot hold the new image.
fn validate_alias(
    target_offset: vk::DeviceSize,
    target_size: vk::DeviceSize,
    requirements: &vk::MemoryRequirements,
) -> Result<()> {
    if target_offset % requirements.alignment != 0 || requirements.size > target_size {
        return Err(Error::InvalidAlias {
            target_offset,
            target_size,
            required_size: requirements.size,
            required_alignment: requirements.alignment,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub ty: vk::ImageType,
    pub format: vk::Format,
    pub extent: UVec3,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub memory_props: vk::MemoryPropertyFlags,
    /// Number of ring copies, each its own `vk::Image` bound at a stride
    /// within one shared allocation. 1 for plain images.
    pub swap_count: u32,
    pub arena: Arena,
    pub label: Option<&'static str>,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            ty: vk::ImageType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            extent: UVec3::ONE,
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::empty(),
            memory_props: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            swap_count: 1,
            arena: Arena::PERSISTENT,
            label: None,
        }
    }
}

/// Exact-shape match for the reuse fast path. The label is not part of the
/// shape.
fn reuse_compatible(prior: &ImageDesc, desc: &ImageDesc) -> bool {
    prior.ty == desc.ty
        && prior.format == desc.format
        && prior.extent == desc.extent
        && prior.mip_levels == desc.mip_levels
        && prior.array_layers == desc.array_layers
        && prior.usage == desc.usage
        && prior.memory_props == desc.memory_props
        && prior.swap_count.max(1) == desc.swap_count.max(1)
}

enum Storage {
    Owned(Allocation),
    /// Keeps the target image (and through it the shared allocation) alive.
    /// The pool is never called from this variant.
    Aliased { target: Image },
}

struct ImageInner {
    pool: MemoryPool,
    /// One `vk::Image` per ring copy.
    handles: SmallVec<[vk::Image; 1]>,
    swap_index: AtomicU32,
    storage: Storage,
    desc: ImageDesc,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        unsafe {
            for &handle in &self.handles {
                self.pool.device().destroy_image(handle, None);
            }
        }
        if let Storage::Owned(allocation) = &mut self.storage {
            self.pool.free(allocation);
        }
    }
}

/// An image fully backed by memory, shared by reference counting.
#[derive(Clone)]
pub struct Image(Arc<ImageInner>);

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handles", &self.0.handles)
            .field("format", &self.0.desc.format)
            .field("extent", &self.0.desc.extent)
            .finish_non_exhaustive()
    }
}

impl HasDevice for Image {
    fn device(&self) -> &Device {
        self.0.pool.device()
    }
}

impl AsVkHandle for Image {
    type Handle = vk::Image;
    fn vk_handle(&self) -> vk::Image {
        self.0.handles[self.0.swap_index.load(Ordering::Relaxed) as usize]
    }
}

impl ImageLike for Image {
    fn array_layer_count(&self) -> u32 {
        self.0.desc.array_layers
    }
    fn mip_level_count(&self) -> u32 {
        self.0.desc.mip_levels
    }
    fn extent(&self) -> UVec3 {
        self.0.desc.extent
    }
    fn format(&self) -> vk::Format {
        self.0.desc.format
    }
    fn ty(&self) -> vk::ImageType {
        self.0.desc.ty
    }
}

fn destroy_all(device: &Device, handles: &[vk::Image]) {
    for &handle in handles {
        unsafe {
            device.destroy_image(handle, None);
        }
    }
}

impl Image {
    /// Creates an image backed by its own pool allocation, or returns `reuse`
    /// unchanged when its shape matches the request exactly. The reuse path
    /// performs zero pool traffic.
    pub fn new(pool: &MemoryPool, desc: &ImageDesc, reuse: Option<&Image>) -> Result<Image> {
        if let Some(prior) = reuse {
            if reuse_compatible(&prior.0.desc, desc) {
                return Ok(prior.clone());
            }
        }
        let device = pool.device();
        let mut desc = *desc;
        desc.swap_count = desc.swap_count.max(1);

        let mut handles: SmallVec<[vk::Image; 1]> = SmallVec::new();
        for _ in 0..desc.swap_count {
            match unsafe { device.create_image(&image_create_info(&desc), None) } {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    destroy_all(device, &handles);
                    return Err(err.into());
                }
            }
        }
        match Self::bind_new(pool, &desc, &handles) {
            Ok(storage) => Ok(Image(Arc::new(ImageInner {
                pool: pool.clone(),
                handles,
                swap_index: AtomicU32::new(0),
                storage,
                desc,
            }))),
            Err(err) => {
                destroy_all(device, &handles);
                Err(err)
            }
        }
    }

    fn bind_new(pool: &MemoryPool, desc: &ImageDesc, handles: &[vk::Image]) -> Result<Storage> {
        let device = pool.device();
        // Copies share one create info, so one requirements query covers all.
        let requirements = unsafe { device.get_image_memory_requirements(handles[0]) };
        let stride = align_up(requirements.size, requirements.alignment);
        let full_size = stride * handles.len() as vk::DeviceSize;
        let mut allocation = pool.alloc(&AllocRequest {
            arena: desc.arena,
            size: full_size,
            type_filter: requirements.memory_type_bits,
            alignment: requirements.alignment,
            required_props: desc.memory_props,
            ..Default::default()
        })?;
        for (i, &handle) in handles.iter().enumerate() {
            if let Err(err) = unsafe {
                device.bind_image_memory(
                    handle,
                    allocation.memory,
                    allocation.offset + i as vk::DeviceSize * stride,
                )
            } {
                pool.free(&mut allocation);
                return Err(err.into());
            }
        }
        if let Some(label) = desc.label {
            tracing::debug!(label, size = full_size, copies = desc.swap_count, "created image");
        }
        Ok(Storage::Owned(allocation))
    }

    /// Creates an image bound onto `target`'s memory instead of a new
    /// allocation.
    ///
    /// Fails with [`Error::InvalidAlias`] when the target's offset does not
    /// satisfy the new image's alignment or its size cannot cover the new
    /// image's requirement. The aliasing image keeps `target` alive and never
    /// frees the shared allocation. Aliases are single-copy; carrying a swap
    /// ring on someone else's storage is rejected.
    pub fn new_aliased(target: &Image, desc: &ImageDesc) -> Result<Image> {
        if desc.swap_count > 1 {
            return Err(Error::InvalidState(
                "aliased images do not carry a swap ring",
            ));
        }
        let pool = &target.0.pool;
        let device = pool.device();
        let backing = target.backing_allocation();
        let handle = unsafe { device.create_image(&image_create_info(desc), None)? };
        let bind = (|| {
            let requirements = unsafe { device.get_image_memory_requirements(handle) };
            validate_alias(backing.offset, backing.size, &requirements)?;
            if requirements.memory_type_bits & (1 << backing.memory_type_index) == 0 {
                return Err(Error::InvalidState(
                    "alias target lives in a memory type the new image cannot use",
                ));
            }
            unsafe {
                device.bind_image_memory(handle, backing.memory, backing.offset)?;
            }
            Ok(())
        })();
        if let Err(err) = bind {
            unsafe {
                device.destroy_image(handle, None);
            }
            return Err(err);
        }
        let mut desc = *desc;
        desc.swap_count = 1;
        Ok(Image(Arc::new(ImageInner {
            pool: pool.clone(),
            handles: smallvec::smallvec![handle],
            swap_index: AtomicU32::new(0),
            storage: Storage::Aliased {
                target: target.clone(),
            },
            desc,
        })))
    }

    pub fn swap_count(&self) -> u32 {
        self.0.desc.swap_count
    }

    /// Advances the ring to the next copy, modulo `active_count`.
    ///
    /// `active_count` may be smaller than the provisioned swap count but
    /// never larger. Callers advance before rendering into the next frame's
    /// copy.
    pub fn cycle_swap(&self, active_count: u32) {
        assert!(
            active_count >= 1 && active_count <= self.0.desc.swap_count,
            "active count {} outside provisioned swap count {}",
            active_count,
            self.0.desc.swap_count
        );
        let _ = self
            .0
            .swap_index
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| {
                Some((i + 1) % active_count)
            });
    }

    fn backing_allocation(&self) -> &Allocation {
        match &self.0.storage {
            Storage::Owned(allocation) => allocation,
            Storage::Aliased { target } => target.backing_allocation(),
        }
    }

    pub fn is_aliased(&self) -> bool {
        matches!(self.0.storage, Storage::Aliased { .. })
    }
}

fn image_create_info(desc: &ImageDesc) -> vk::ImageCreateInfo<'static> {
    vk::ImageCreateInfo {
        image_type: desc.ty,
        format: desc.format,
        extent: vk::Extent3D {
            width: desc.extent.x,
            height: desc.extent.y,
            depth: desc.extent.z,
        },
        mip_levels: desc.mip_levels,
        array_layers: desc.array_layers,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage: desc.usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    }
}

/// An owned view spanning every mip level and array layer of its image.
///
/// Dropping it destroys only the view; the wrapped image handle keeps the
/// underlying storage alive.
pub struct FullImageView<T: ImageLike + HasDevice> {
    image: T,
    view: vk::ImageView,
    ty: vk::ImageViewType,
}

impl<T: ImageLike + HasDevice> HasDevice for FullImageView<T> {
    fn device(&self) -> &Device {
        self.image.device()
    }
}

impl<T: ImageLike + HasDevice> Drop for FullImageView<T> {
    fn drop(&mut self) {
        unsafe {
            self.image.device().destroy_image_view(self.view, None);
        }
    }
}

impl<T: ImageLike + HasDevice> FullImageView<T> {
    pub fn image(&self) -> &T {
        &self.image
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        self.ty
    }
}

impl<T: ImageLike + HasDevice> AsVkHandle for FullImageView<T> {
    type Handle = vk::ImageView;
    fn vk_handle(&self) -> vk::ImageView {
        self.view
    }
}

/// View-construction conveniences layered on [`ImageLike`].
pub trait ImageExt: ImageLike {
    /// Consumes the image and pairs it with a view over its whole
    /// subresource range, with the view type matching the image type.
    fn create_full_view(self) -> Result<FullImageView<Self>>
    where
        Self: HasDevice + Sized,
    {
        let view_type = match self.ty() {
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            vk::ImageType::TYPE_2D => vk::ImageViewType::TYPE_2D,
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => unreachable!(),
        };
        unsafe {
            let view = self.device().create_image_view(
                &vk::ImageViewCreateInfo {
                    image: self.vk_handle(),
                    view_type,
                    format: self.format(),
                    components: vk::ComponentMapping::default(),
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: self.aspects(),
                        base_mip_level: 0,
                        base_array_layer: 0,
                        level_count: self.mip_level_count(),
                        layer_count: self.array_layer_count(),
                    },
                    ..Default::default()
                },
                None,
            )?;
            Ok(FullImageView {
                image: self,
                view,
                ty: view_type,
            })
        }
    }
}

impl<T> ImageExt for T where T: ImageLike {}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: !0,
        }
    }

    #[test]
    fn alias_rejected_when_target_too_small() {
        let err = validate_alias(0, 1024, &requirements(2048, 256)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidAlias {
                required_size: 2048,
                target_size: 1024,
                ..
            }
        ));
    }

    #[test]
    fn alias_rejected_when_target_misaligned() {
        assert!(validate_alias(100, 4096, &requirements(1024, 256)).is_err());
    }

    #[test]
    fn alias_accepted_when_range_covers_requirement() {
        assert!(validate_alias(512, 4096, &requirements(4096, 256)).is_ok());
        assert!(validate_alias(0, 1024, &requirements(1024, 1)).is_ok());
    }

    #[test]
    fn reuse_requires_exact_shape_match() {
        let desc = ImageDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: UVec3::new(256, 256, 1),
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            swap_count: 2,
            ..Default::default()
        };
        assert!(reuse_compatible(&desc, &desc));
        // A different label is still the same shape.
        assert!(reuse_compatible(
            &desc,
            &ImageDesc {
                label: Some("albedo"),
                ..desc
            }
        ));

        assert!(!reuse_compatible(
            &desc,
            &ImageDesc {
                format: vk::Format::R16G16B16A16_SFLOAT,
                ..desc
            }
        ));
        assert!(!reuse_compatible(
            &desc,
            &ImageDesc {
                extent: UVec3::new(512, 512, 1),
                ..desc
            }
        ));
        assert!(!reuse_compatible(
            &desc,
            &ImageDesc {
                usage: vk::ImageUsageFlags::SAMPLED,
                ..desc
            }
        ));
        assert!(!reuse_compatible(
            &desc,
            &ImageDesc {
                swap_count: 3,
                ..desc
            }
        ));
        assert!(!reuse_compatible(
            &desc,
            &ImageDesc {
                memory_props: vk::MemoryPropertyFlags::HOST_VISIBLE,
                ..desc
            }
        ));
    }

    #[test]
    fn ring_copies_bind_at_disjoint_strides() {
        // Stride rounds each copy's requirement to its alignment, so per-copy
        // bind offsets never overlap.
        let req = requirements(1000, 256);
        let stride = align_up(req.size, req.alignment);
        assert_eq!(stride, 1024);
        let offsets: Vec<_> = (0..3u64).map(|i| i * stride).collect();
        for (i, &a) in offsets.iter().enumerate() {
            for &b in &offsets[i + 1..] {
                assert!(a + req.size <= b);
            }
        }
    }

    #[test]
    fn aspect_deduction_from_format() {
        assert_eq!(
            format_aspects(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspects(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_aspects(vk::Format::S8_UINT),
            vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_aspects(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }
}
