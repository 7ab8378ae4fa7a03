//! Small helpers shared across the crate.

use ash::vk;

/// Trait for types wrapping a raw Vulkan handle.
pub trait AsVkHandle {
    type Handle: vk::Handle + Copy;
    fn vk_handle(&self) -> Self::Handle;
}
impl<T> AsVkHandle for &'_ T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be nonzero. Works for non-power-of-two alignments, which
/// Vulkan permits for a few limits (e.g. `nonCoherentAtomSize` is only
/// guaranteed to be a power of two on conforming drivers, but we don't rely
/// on that here).
pub const fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    value.next_multiple_of(alignment)
}

/// Rounds `value` down to the previous multiple of `alignment`.
pub const fn align_down(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    value - value % alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounding() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_down(257, 256), 256);
        assert_eq!(align_down(255, 256), 0);
    }
}
