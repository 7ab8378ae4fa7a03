//! Logical device wrapper.
//!
//! [`Device`] is a reference-counted handle around an already-created ash
//! logical device. It caches everything the allocator and the acceleration
//! structure manager need to avoid per-call driver queries: physical-device
//! memory properties, the handful of alignment limits we care about, and the
//! `VK_KHR_acceleration_structure` function table. The function table is a
//! field on the device rather than a process global, so multiple devices
//! coexist cleanly.
//!
//! Instance creation, physical device selection and queue configuration live
//! in the surrounding renderer; this crate only consumes the result.

use std::{
    collections::BTreeSet,
    ffi::{CStr, CString},
    fmt::Debug,
    ops::Deref,
    sync::Arc,
};

use ash::vk;

use crate::error::Result;

/// A trait for types created from a Vulkan device.
pub trait HasDevice {
    /// Returns a reference to the owning [`Device`].
    fn device(&self) -> &Device;
}

/// Alignment and granularity limits consumed by the allocator and the
/// resource factories, captured once at device wrap time.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    pub non_coherent_atom_size: vk::DeviceSize,
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub min_storage_buffer_offset_alignment: vk::DeviceSize,
    /// `minAccelerationStructureScratchOffsetAlignment` from
    /// `VK_KHR_acceleration_structure`. Zero when the extension is absent.
    pub min_accel_scratch_offset_alignment: u32,
}

impl DeviceLimits {
    /// The larger of the uniform and storage offset alignments, used as the
    /// per-copy stride alignment for swap-ring buffers.
    pub fn ring_stride_alignment(&self) -> vk::DeviceSize {
        self.min_uniform_buffer_offset_alignment
            .max(self.min_storage_buffer_offset_alignment)
    }
}

/// A Vulkan logical device wrapper, reference-counted for cheap sharing.
///
/// Dropping the last clone destroys the logical device. The instance handle
/// is borrowed (cloned fn table), and its teardown remains the renderer's
/// responsibility.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device").field(&self.0.device.handle()).finish()
    }
}

struct DeviceInner {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    accel: ash::khr::acceleration_structure::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    extensions: BTreeSet<CString>,
    queue: vk::Queue,
    queue_family_index: u32,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

impl Device {
    /// Wraps an existing logical device.
    ///
    /// `enabled_extensions` is the extension list the device was created
    /// with; it gates optional behavior such as memory-priority pass-through.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        enabled_extensions: &[&CStr],
    ) -> Result<Self> {
        let accel = ash::khr::acceleration_structure::Device::new(instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut accel_props);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }
        let limits = DeviceLimits {
            non_coherent_atom_size: props2.properties.limits.non_coherent_atom_size,
            min_uniform_buffer_offset_alignment: props2
                .properties
                .limits
                .min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: props2
                .properties
                .limits
                .min_storage_buffer_offset_alignment,
            min_accel_scratch_offset_alignment: accel_props
                .min_acceleration_structure_scratch_offset_alignment,
        };

        Ok(Self(Arc::new(DeviceInner {
            device,
            physical_device,
            accel,
            memory_properties,
            limits,
            extensions: enabled_extensions.iter().map(|s| CString::from(*s)).collect(),
            queue,
            queue_family_index,
        })))
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.0.physical_device
    }

    /// The `VK_KHR_acceleration_structure` entry points.
    pub fn accel(&self) -> &ash::khr::acceleration_structure::Device {
        &self.0.accel
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.0.memory_properties
    }

    /// Property flags of one physical memory type.
    pub fn memory_type_properties(&self, type_index: u32) -> vk::MemoryPropertyFlags {
        self.0.memory_properties.memory_types[type_index as usize].property_flags
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.0.limits
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        self.0.extensions.contains(name)
    }

    /// The queue all command streams submit to.
    pub fn queue(&self) -> vk::Queue {
        self.0.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.0.queue_family_index
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}

impl HasDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}
