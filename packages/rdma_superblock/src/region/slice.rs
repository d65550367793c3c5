/// A byte range inside one slot of a registered superblock, resolved to everything a work
/// request needs to reference it.
///
/// Obtained from [`Superblock::region_slice()`][crate::Superblock::region_slice].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionSlice {
    pub(crate) address: usize,
    pub(crate) len: usize,
    pub(crate) slot_address: usize,
    pub(crate) offset_in_slot: usize,
    pub(crate) offset_in_region: usize,
    pub(crate) local_key: u32,
    pub(crate) remote_key: u32,
}

impl RegionSlice {
    /// Start address of the range.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// Length of the range in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start address of the slot containing the range.
    #[must_use]
    pub const fn slot_address(&self) -> usize {
        self.slot_address
    }

    /// Distance from the start of the slot to the start of the range.
    #[must_use]
    pub const fn offset_in_slot(&self) -> usize {
        self.offset_in_slot
    }

    /// Distance from the start of the registered region (the arena) to the start of the range.
    #[must_use]
    pub const fn offset_in_region(&self) -> usize {
        self.offset_in_region
    }

    /// Local key of the region containing the range.
    #[must_use]
    pub const fn local_key(&self) -> u32 {
        self.local_key
    }

    /// Remote key of the region containing the range.
    #[must_use]
    pub const fn remote_key(&self) -> u32 {
        self.remote_key
    }
}
