/// Maximum number of sub-contexts (e.g. MIG partitions) a single device can expose.
pub const MAX_SUB_CONTEXTS: u8 = 8;

/// Stable small-integer identity of a physical device.
///
/// All sub-contexts of a device share the device's DMA address space, so this is the key used by
/// DMA mapping tables and reverse mapping indices.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, new)]
pub struct DeviceId {
    /// The index of the device.
    pub index: u32,
}

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("Device({})", self.index))
    }
}

/// An independently schedulable partition of a [device](DeviceId).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct DeviceContext {
    /// The device owning the sub-context.
    pub device: DeviceId,
    /// The sub-context index, always lower than [MAX_SUB_CONTEXTS].
    pub sub_context: u8,
}

impl DeviceContext {
    /// Create a new device context.
    ///
    /// # Panics
    ///
    /// If `sub_context` isn't lower than [MAX_SUB_CONTEXTS].
    pub fn new(device: DeviceId, sub_context: u8) -> Self {
        assert!(
            sub_context < MAX_SUB_CONTEXTS,
            "Sub-context {sub_context} out of range, maximum is {MAX_SUB_CONTEXTS}"
        );
        Self {
            device,
            sub_context,
        }
    }

    /// The context of a device that isn't partitioned.
    pub fn whole(device: DeviceId) -> Self {
        Self::new(device, 0)
    }
}

impl core::fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!(
            "Device({}:{})",
            self.device.index, self.sub_context
        ))
    }
}

/// Bit mask of [sub-contexts](DeviceContext) of a single device.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct SubContextMask {
    bits: u8,
}

impl SubContextMask {
    /// An empty mask.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Whether no sub-context is set.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Whether the given sub-context is set.
    pub fn contains(&self, sub_context: u8) -> bool {
        self.bits & Self::bit(sub_context) != 0
    }

    /// Set the sub-context, returning whether it was previously set.
    pub fn test_and_set(&mut self, sub_context: u8) -> bool {
        let was_set = self.contains(sub_context);
        self.bits |= Self::bit(sub_context);
        was_set
    }

    /// Clear the sub-context, returning whether it was previously set.
    pub fn test_and_clear(&mut self, sub_context: u8) -> bool {
        let was_set = self.contains(sub_context);
        self.bits &= !Self::bit(sub_context);
        was_set
    }

    /// The number of sub-contexts set.
    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Iterate over the set sub-contexts in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MAX_SUB_CONTEXTS).filter(|sub| self.contains(*sub))
    }

    fn bit(sub_context: u8) -> u8 {
        assert!(sub_context < MAX_SUB_CONTEXTS);
        1 << sub_context
    }
}

/// A processor that can own the pages of a virtual memory region.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum Processor {
    /// The host CPU.
    Cpu,
    /// A device.
    Device(DeviceId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_context_mask_tracks_bits() {
        let mut mask = SubContextMask::empty();

        assert!(!mask.test_and_set(3));
        assert!(mask.test_and_set(3));
        assert!(!mask.test_and_set(0));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.iter().collect::<alloc::vec::Vec<_>>(), [0, 3]);

        assert!(mask.test_and_clear(3));
        assert!(!mask.test_and_clear(3));
        assert_eq!(mask.count(), 1);
    }

    #[test]
    #[should_panic]
    fn device_context_rejects_out_of_range_sub_context() {
        DeviceContext::new(DeviceId::new(0), MAX_SUB_CONTEXTS);
    }
}
