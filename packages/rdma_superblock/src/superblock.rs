use std::alloc::{Layout, dealloc};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::{
    DropPolicy, Error, Geometry, HEADER_SIZE, MemoryRegion, RegionBinding, RegionProvider,
    RegionSlice, Result, SuperblockBuilder, SuperblockGuard, SuperblockHeader,
};

/// A fixed-size memory arena divided into equal-size object slots.
///
/// The superblock header is stored in the same memory block as the arena, immediately before
/// it, and the arena is optionally registered as an RDMA memory region for the whole lifetime of
/// the superblock.
///
/// Allocation bookkeeping is accessed through the guard returned by [`lock()`][Self::lock]. The
/// geometry of the superblock never changes after it has been built and can be queried directly.
///
/// # Dropping
///
/// Dropping the superblock deregisters its memory region and releases its memory (unless the
/// memory was supplied by the caller via [`SuperblockBuilder::build_in()`]). Dropping a
/// superblock that still has pinned slots panics, because in-flight transfers may still
/// reference the memory. Whether dropping with allocated slots is acceptable is governed by the
/// [`DropPolicy`].
///
/// If the header fails validation at drop time, nothing is released. The memory and the region
/// registration are leaked and an error is logged.
///
/// # Examples
///
/// ```
/// use rdma_superblock::Superblock;
///
/// let superblock = Superblock::builder(64).arena_size(64 * 6400).build().unwrap();
///
/// assert_eq!(superblock.total_slots(), 6400);
/// assert!(superblock.memory_region().is_none());
///
/// let mut guard = superblock.lock();
/// let slot = guard.malloc().unwrap().unwrap();
///
/// assert_eq!(guard.objects_free(), 6399);
/// assert_eq!(superblock.get_size(slot).unwrap(), 64);
/// ```
pub struct Superblock {
    header: NonNull<SuperblockHeader>,

    /// Bytes of the arena, including any tail too small to hold a slot.
    arena_len: usize,

    backing: Backing,

    drop_policy: DropPolicy,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Backing {
    /// The superblock allocated the memory block itself, with this layout.
    Owned(Layout),

    /// The memory block was supplied by the caller, who remains responsible for it.
    Borrowed,
}

impl Superblock {
    /// Starts building a superblock whose slots are `object_size` bytes each.
    ///
    /// See [`SuperblockBuilder`] for the available options.
    pub fn builder(object_size: usize) -> SuperblockBuilder {
        SuperblockBuilder::new(object_size)
    }

    /// Writes the header into `block` and registers the arena that follows it.
    ///
    /// On failure, nothing has been written and the caller still owns `block`.
    ///
    /// # Safety
    ///
    /// `block` must be aligned to [`ALIGNMENT`][crate::ALIGNMENT], valid for reads and writes of
    /// `HEADER_SIZE + arena_len` bytes and used by nothing else until the superblock is dropped.
    /// If `backing` is [`Backing::Owned`], `block` must have been allocated with that layout.
    /// `geometry` must fit into `arena_len` bytes.
    pub(crate) unsafe fn initialize(
        block: NonNull<u8>,
        arena_len: usize,
        geometry: Geometry,
        region_provider: Option<Arc<dyn RegionProvider>>,
        backing: Backing,
        drop_policy: DropPolicy,
    ) -> Result<Self> {
        debug_assert!(geometry.slots_len() <= arena_len);

        // SAFETY: The block is large enough to hold the header followed by the arena.
        let arena_start = unsafe { block.add(HEADER_SIZE) };

        let region = region_provider
            .map(|provider| RegionBinding::register(provider, arena_start, arena_len))
            .transpose()?;

        let header = block.cast::<SuperblockHeader>();

        // SAFETY: The block is aligned to ALIGNMENT, which satisfies the header alignment, and
        // is exclusively ours. The arena starts HEADER_SIZE bytes in, which keeps it aligned.
        unsafe {
            SuperblockHeader::write(header, geometry, arena_start, region);
        }

        debug!(
            header_address = header.addr().get(),
            object_size = geometry.object_size,
            total_slots = geometry.total_slots,
            arena_len,
            ?backing,
            ?drop_policy,
            "superblock built"
        );

        Ok(Self {
            header,
            arena_len,
            backing,
            drop_policy,
        })
    }

    fn header(&self) -> &SuperblockHeader {
        // SAFETY: The header was written when the superblock was built and lives until the
        // superblock is dropped. Only shared references to it are ever created while the
        // superblock is alive (all mutation happens behind its lock).
        unsafe { self.header.as_ref() }
    }

    /// Locks the allocation bookkeeping of the superblock.
    ///
    /// The lock is released when the returned guard is dropped. Locking a superblock that is
    /// already locked by the current thread deadlocks.
    pub fn lock(&self) -> SuperblockGuard<'_> {
        SuperblockGuard::new(self.header())
    }

    /// Size of each slot in bytes.
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.header().object_size()
    }

    /// Number of slots in the arena.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.header().total_slots()
    }

    /// Start of the arena, which is also the start of the first slot.
    #[must_use]
    pub fn arena_start(&self) -> NonNull<u8> {
        self.header().arena_start()
    }

    /// Length of the arena in bytes. This is also the length of the registered memory region.
    ///
    /// May exceed `object_size() * total_slots()` if the arena size is not a multiple of the
    /// object size. The tail belongs to no slot.
    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.arena_len
    }

    /// Whether `ptr` points into one of the slots of this superblock.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.header().arena_offset(ptr).is_ok()
    }

    /// Returns the start of the slot containing `ptr`.
    ///
    /// Any address inside a slot maps to the start of that slot, so normalizing an already
    /// normalized pointer returns it unchanged.
    ///
    /// # Errors
    ///
    /// * [`Error::CorruptedSuperblock`] if the header failed validation.
    /// * [`Error::ForeignPointer`] if `ptr` is not inside a slot.
    pub fn normalize(&self, ptr: NonNull<u8>) -> Result<NonNull<u8>> {
        self.header().normalize(ptr)
    }

    /// Returns the number of bytes from `ptr` to the end of its slot.
    ///
    /// For the start of a slot, this is the object size.
    ///
    /// # Errors
    ///
    /// * [`Error::CorruptedSuperblock`] if the header failed validation.
    /// * [`Error::ForeignPointer`] if `ptr` is not inside a slot.
    pub fn get_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        self.header().get_size(ptr)
    }

    /// The memory region the arena is registered as, if the superblock was built with a
    /// region provider.
    #[must_use]
    pub fn memory_region(&self) -> Option<&MemoryRegion> {
        self.header().region().map(RegionBinding::region)
    }

    /// Resolves `len` bytes starting at `ptr` to the slot, offsets and keys that a work request
    /// referencing them needs.
    ///
    /// The range must lie within a single slot. Bookkeeping is not consulted, so the slot does
    /// not need to be allocated.
    ///
    /// # Errors
    ///
    /// * [`Error::CorruptedSuperblock`] if the header failed validation.
    /// * [`Error::ForeignPointer`] if `ptr` is not inside a slot.
    /// * [`Error::NoMemoryRegion`] if the superblock was built without a region provider.
    /// * [`Error::SliceOutOfSlot`] if the range extends past the end of the slot.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use rdma_superblock::{SoftwareRegionProvider, Superblock};
    ///
    /// let superblock = Superblock::builder(256)
    ///     .arena_size(4096)
    ///     .region_provider(Arc::new(SoftwareRegionProvider::new()))
    ///     .build()
    ///     .unwrap();
    ///
    /// let slot = superblock.lock().malloc().unwrap().unwrap();
    ///
    /// // Receive into the second half of the slot.
    /// // SAFETY: The slot is 256 bytes long.
    /// let target = unsafe { slot.add(128) };
    /// let slice = superblock.region_slice(target, 128).unwrap();
    ///
    /// assert_eq!(slice.slot_address(), slot.addr().get());
    /// assert_eq!(slice.offset_in_slot(), 128);
    /// assert_eq!(slice.offset_in_region(), 128);
    /// assert_eq!(
    ///     slice.remote_key(),
    ///     superblock.memory_region().unwrap().remote_key()
    /// );
    /// ```
    pub fn region_slice(&self, ptr: NonNull<u8>, len: usize) -> Result<RegionSlice> {
        let header = self.header();

        let slot = header.normalize(ptr)?;
        let region = header.region().ok_or(Error::NoMemoryRegion)?.region();

        let address = ptr.addr().get();

        if len > header.get_size(ptr)? {
            return Err(Error::SliceOutOfSlot { address, len });
        }

        Ok(RegionSlice {
            address,
            len,
            slot_address: slot.addr().get(),
            offset_in_slot: address
                .checked_sub(slot.addr().get())
                .expect("a pointer is never before the start of its own slot"),
            offset_in_region: address
                .checked_sub(region.address())
                .expect("the region covers the whole arena"),
            local_key: region.local_key(),
            remote_key: region.remote_key(),
        })
    }

    /// Whether the header passes validation.
    ///
    /// Every operation validates the header on its own, so there is no need to call this before
    /// using the superblock.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.header().is_valid()
    }

    /// Overwrites the validity tag, returning the previous one, to simulate memory corruption.
    #[cfg(test)]
    pub(crate) fn replace_validity_tag(&mut self, tag: usize) -> usize {
        // SAFETY: We hold an exclusive reference to the superblock, so nobody holds a reference
        // to the header.
        unsafe { SuperblockHeader::replace_validity_tag(self.header, tag) }
    }
}

impl fmt::Debug for Superblock {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Superblock")
            .field("header", self.header())
            .field("arena_len", &self.arena_len)
            .field("backing", &self.backing)
            .field("drop_policy", &self.drop_policy)
            .finish()
    }
}

impl Drop for Superblock {
    fn drop(&mut self) {
        let header = self.header();

        if !header.is_valid() {
            error!(
                header_address = self.header.addr().get(),
                "superblock header failed validation on drop, leaking its memory and memory region"
            );
            return;
        }

        let (pinned, allocated) = {
            let mut state = header.lock();
            let pinned = state.pinned_slots();
            let allocated = header
                .total_slots()
                .checked_sub(state.free_slots())
                .expect("free slots never exceed the total");

            if pinned == 0 {
                header.reset(&mut state);
            }

            (pinned, allocated)
        };

        // SAFETY: We hold an exclusive reference to the superblock and the header reference
        // above is no longer used. Clearing the tag makes any stale pointer to this header
        // fail validation.
        unsafe {
            SuperblockHeader::replace_validity_tag(self.header, 0);
        }

        // SAFETY: The header was written when the superblock was built and is dropped only here.
        // This deregisters the memory region, after the bookkeeping has been cleared above.
        unsafe {
            self.header.drop_in_place();
        }

        if let Backing::Owned(layout) = self.backing {
            // SAFETY: The layout must match between alloc and dealloc. It does.
            unsafe {
                dealloc(self.header.as_ptr().cast(), layout);
            }
        }

        debug!(
            header_address = self.header.addr().get(),
            pinned, allocated, "superblock dropped"
        );

        // We do this check at the end so we clean up the memory first. If we are already
        // panicking, we do not want to panic again and obscure the original panic.
        if thread::panicking() {
            return;
        }

        assert!(
            pinned == 0,
            "dropped a superblock with {pinned} pinned slots that may still be referenced by in-flight transfers"
        );

        if self.drop_policy == DropPolicy::MustNotDropAllocated {
            assert!(
                allocated == 0,
                "dropped a superblock with {allocated} allocated slots with a policy that says it must be empty when dropped"
            );
        }
    }
}

// SAFETY: The raw pointers refer to memory exclusively owned by the superblock and all shared
// mutable state is behind the header lock, so the superblock may move between and be shared by
// threads.
unsafe impl Send for Superblock {}
// SAFETY: See above.
unsafe impl Sync for Superblock {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::io;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{
        ALIGNMENT, AccessFlags, HeapId, MockRegionProvider, PIN_TABLE_CAPACITY, SlotState,
        SoftwareRegionProvider, SuperblockId,
    };

    assert_impl_all!(Superblock: Send, Sync, fmt::Debug);

    fn superblock(object_size: usize, total_slots: usize) -> Superblock {
        Superblock::builder(object_size)
            .arena_size(object_size * total_slots)
            .build()
            .unwrap()
    }

    fn offset(ptr: NonNull<u8>, bytes: usize) -> NonNull<u8> {
        // SAFETY: Tests only offset within the arena of a superblock.
        unsafe { ptr.add(bytes) }
    }

    #[test]
    fn builds_with_expected_geometry() {
        let sb = superblock(64, 6400);

        assert_eq!(sb.object_size(), 64);
        assert_eq!(sb.total_slots(), 6400);
        assert_eq!(sb.arena_len(), 64 * 6400);
        assert!(sb.memory_region().is_none());
        assert!(sb.is_valid());

        let guard = sb.lock();
        assert_eq!(guard.objects_free(), 6400);
        assert_eq!(guard.reapable_objects(), 6400);
        assert_eq!(guard.allocated_objects(), 0);
        assert_eq!(guard.pinned_objects(), 0);
        assert!(guard.is_empty());
        assert!(!guard.is_full());
        guard.integrity_check();
    }

    #[test]
    fn arena_tail_does_not_form_a_slot() {
        let sb = Superblock::builder(48).arena_size(100).build().unwrap();

        assert_eq!(sb.total_slots(), 2);
        assert_eq!(sb.arena_len(), 100);

        let tail = offset(sb.arena_start(), 96);
        assert!(!sb.contains(tail));
        assert!(matches!(
            sb.normalize(tail),
            Err(Error::ForeignPointer { .. })
        ));
    }

    #[test]
    fn malloc_reaps_in_address_order() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        for index in 0..4 {
            let slot = guard.malloc().unwrap().unwrap();
            assert_eq!(slot, offset(sb.arena_start(), index * 64));
        }

        assert!(guard.is_full());
        assert_eq!(guard.malloc().unwrap(), None);
        guard.integrity_check();
    }

    #[test]
    fn exhausting_6400_slots_then_freeing_one() {
        let sb = superblock(64, 6400);
        let mut guard = sb.lock();

        let mut slots = Vec::with_capacity(6400);
        while let Some(slot) = guard.malloc().unwrap() {
            slots.push(slot);
        }

        assert_eq!(slots.len(), 6400);
        assert_eq!(guard.objects_free(), 0);
        assert_eq!(guard.reapable_objects(), 0);

        let unique: HashSet<_> = slots.iter().copied().collect();
        assert_eq!(unique.len(), 6400);

        for slot in &slots {
            assert_eq!(slot.addr().get() % ALIGNMENT, 0);
        }

        guard.free(slots[17]).unwrap();
        assert_eq!(guard.objects_free(), 1);

        assert_eq!(guard.malloc().unwrap(), Some(slots[17]));
        assert_eq!(guard.malloc().unwrap(), None);
        guard.integrity_check();
    }

    #[test]
    fn free_list_is_lifo() {
        let sb = superblock(32, 8);
        let mut guard = sb.lock();

        let slots: Vec<_> = (0..8).map(|_| guard.malloc().unwrap().unwrap()).collect();

        guard.free(slots[2]).unwrap();
        guard.free(slots[5]).unwrap();
        guard.free(slots[0]).unwrap();

        assert_eq!(guard.malloc().unwrap(), Some(slots[0]));
        assert_eq!(guard.malloc().unwrap(), Some(slots[5]));
        assert_eq!(guard.malloc().unwrap(), Some(slots[2]));
        assert_eq!(guard.malloc().unwrap(), None);
    }

    #[test]
    fn reaping_takes_priority_over_free_list() {
        let sb = superblock(32, 4);
        let mut guard = sb.lock();

        let first = guard.malloc().unwrap().unwrap();
        let _second = guard.malloc().unwrap().unwrap();
        guard.free(first).unwrap();

        let third = guard.malloc().unwrap().unwrap();
        assert_eq!(third, offset(sb.arena_start(), 64));
        assert_eq!(guard.slot_state(first).unwrap(), SlotState::Free);
        guard.integrity_check();
    }

    #[test]
    fn freeing_every_slot_resets() {
        let sb = superblock(64, 3);
        let mut guard = sb.lock();

        let slots: Vec<_> = (0..3).map(|_| guard.malloc().unwrap().unwrap()).collect();

        guard.free(slots[1]).unwrap();
        guard.free(slots[2]).unwrap();
        assert_eq!(guard.reapable_objects(), 0);

        guard.free(slots[0]).unwrap();
        assert_eq!(guard.objects_free(), 3);
        assert_eq!(guard.reapable_objects(), 3);
        assert_eq!(guard.slot_state(slots[1]).unwrap(), SlotState::Reapable);
        guard.integrity_check();

        // After a reset, reaping starts over from the arena start.
        assert_eq!(guard.malloc().unwrap(), Some(sb.arena_start()));
    }

    #[test]
    fn normalize_maps_interior_pointers_to_slot_start() {
        for object_size in [64, 48] {
            let sb = superblock(object_size, 10);
            let mut guard = sb.lock();
            let slots: Vec<_> = (0..10).map(|_| guard.malloc().unwrap().unwrap()).collect();
            drop(guard);

            for slot in slots {
                for delta in [0, 1, 15, object_size - 1] {
                    let interior = offset(slot, delta);

                    assert_eq!(sb.normalize(interior).unwrap(), slot);
                    assert_eq!(sb.get_size(interior).unwrap(), object_size - delta);
                }

                let normalized = sb.normalize(offset(slot, 7)).unwrap();
                assert_eq!(sb.normalize(normalized).unwrap(), normalized);
            }
        }
    }

    #[test]
    fn power_of_two_and_modulo_paths_agree() {
        let mask_based = superblock(32, 6);
        let modulo_based = superblock(96, 2);

        for delta in 0..192 {
            let expected_slot_offset = delta / 32 * 32;
            let ptr = offset(mask_based.arena_start(), delta);
            assert_eq!(
                mask_based.normalize(ptr).unwrap(),
                offset(mask_based.arena_start(), expected_slot_offset)
            );

            let expected_slot_offset = delta / 96 * 96;
            let ptr = offset(modulo_based.arena_start(), delta);
            assert_eq!(
                modulo_based.normalize(ptr).unwrap(),
                offset(modulo_based.arena_start(), expected_slot_offset)
            );
        }
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let sb = superblock(64, 4);
        let other = superblock(64, 4);

        let foreign = other.lock().malloc().unwrap().unwrap();

        assert!(!sb.contains(foreign));
        assert!(matches!(
            sb.lock().free(foreign),
            Err(Error::ForeignPointer { address }) if address == foreign.addr().get()
        ));
        assert!(matches!(
            sb.get_size(foreign),
            Err(Error::ForeignPointer { .. })
        ));
    }

    #[test]
    fn single_slot_may_have_unaligned_size() {
        let sb = Superblock::builder(100).arena_size(100).build().unwrap();
        assert_eq!(sb.total_slots(), 1);

        let mut guard = sb.lock();
        let slot = guard.malloc().unwrap().unwrap();

        assert_eq!(slot, sb.arena_start());
        assert_eq!(slot.addr().get() % ALIGNMENT, 0);
        assert_eq!(sb.get_size(offset(slot, 99)).unwrap(), 1);
        assert_eq!(guard.malloc().unwrap(), None);

        guard.free(slot).unwrap();
        assert!(guard.is_empty());
    }

    #[test]
    fn unaligned_size_with_multiple_slots_is_rejected() {
        let result = Superblock::builder(100).arena_size(200).build();
        assert!(matches!(result, Err(Error::InvalidGeometry { .. })));
    }

    #[test]
    fn free_of_interior_pointer_frees_slot() {
        let sb = superblock(64, 2);
        let mut guard = sb.lock();

        let slot = guard.malloc().unwrap().unwrap();
        guard.free(offset(slot, 40)).unwrap();

        assert_eq!(guard.slot_state(slot).unwrap(), SlotState::Free);
    }

    #[test]
    fn free_of_reapable_slot_is_rejected() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        guard.malloc().unwrap().unwrap();

        let never_allocated = offset(sb.arena_start(), 128);
        assert!(matches!(
            guard.free(never_allocated),
            Err(Error::NotAllocated { .. })
        ));
        assert_eq!(guard.objects_free(), 3);
        guard.integrity_check();
    }

    #[test]
    fn double_free_is_detected() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        let a = guard.malloc().unwrap().unwrap();
        let _b = guard.malloc().unwrap().unwrap();

        guard.free(a).unwrap();
        assert!(matches!(guard.free(a), Err(Error::DoubleFree { .. })));
        assert_eq!(guard.objects_free(), 3);
        guard.integrity_check();
    }

    #[test]
    fn double_free_does_not_corrupt_counts() {
        let sb = superblock(64, 3);
        let mut guard = sb.lock();

        let a = guard.malloc().unwrap().unwrap();
        let b = guard.malloc().unwrap().unwrap();
        let c = guard.malloc().unwrap().unwrap();

        guard.free(a).unwrap();
        assert!(matches!(guard.free(a), Err(Error::DoubleFree { .. })));
        assert_eq!(guard.objects_free(), 1);

        // With `c` still allocated, this must not vacate the superblock.
        guard.free(b).unwrap();
        assert_eq!(guard.objects_free(), 2);
        assert_eq!(guard.reapable_objects(), 0);
        assert_eq!(guard.slot_state(c).unwrap(), SlotState::Allocated);
        assert_eq!(guard.slot_state(a).unwrap(), SlotState::Free);
        guard.integrity_check();

        // Each freed slot comes back exactly once.
        let first = guard.malloc().unwrap().unwrap();
        let second = guard.malloc().unwrap().unwrap();
        assert_eq!(first, b);
        assert_eq!(second, a);
        assert_eq!(guard.malloc().unwrap(), None);
        guard.integrity_check();
    }

    #[test]
    fn double_free_through_interior_pointer_is_detected() {
        let sb = superblock(48, 4);
        let mut guard = sb.lock();

        let a = guard.malloc().unwrap().unwrap();
        let _b = guard.malloc().unwrap().unwrap();

        guard.free(offset(a, 17)).unwrap();
        assert!(matches!(
            guard.free(offset(a, 40)),
            Err(Error::DoubleFree { slot_address }) if slot_address == a.addr().get()
        ));
        guard.integrity_check();
    }

    #[test]
    fn pin_free_unpin_sequence() {
        let sb = superblock(64, 100);
        let mut guard = sb.lock();

        let slot = guard.malloc().unwrap().unwrap();
        let _keep_busy = guard.malloc().unwrap().unwrap();
        assert_eq!(guard.objects_free(), 98);

        guard.pin(slot).unwrap();
        assert_eq!(guard.slot_state(slot).unwrap(), SlotState::Pinned);

        guard.free(slot).unwrap();
        assert_eq!(guard.objects_free(), 98);
        assert_eq!(guard.slot_state(slot).unwrap(), SlotState::PinnedFreedPending);

        guard.unpin(slot).unwrap();
        assert_eq!(guard.objects_free(), 99);
        assert_eq!(guard.pinned_objects(), 0);
        assert_eq!(guard.slot_state(slot).unwrap(), SlotState::Free);
        guard.integrity_check();
    }

    #[test]
    fn unpin_before_free_keeps_slot_allocated() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        let slot = guard.malloc().unwrap().unwrap();
        guard.pin(offset(slot, 3)).unwrap();
        guard.unpin(offset(slot, 60)).unwrap();

        assert_eq!(guard.slot_state(slot).unwrap(), SlotState::Allocated);
        assert_eq!(guard.objects_free(), 3);

        guard.free(slot).unwrap();
        assert!(guard.is_empty());
    }

    #[test]
    fn deferred_free_of_last_slot_resets() {
        let sb = superblock(64, 2);
        let mut guard = sb.lock();

        let slot = guard.malloc().unwrap().unwrap();
        guard.pin(slot).unwrap();
        guard.free(slot).unwrap();
        assert_eq!(guard.reapable_objects(), 1);

        guard.unpin(slot).unwrap();
        assert_eq!(guard.reapable_objects(), 2);
        assert_eq!(guard.slot_state(slot).unwrap(), SlotState::Reapable);
    }

    #[test]
    fn second_free_while_pinned_is_double_free() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        let slot = guard.malloc().unwrap().unwrap();
        guard.pin(slot).unwrap();
        guard.free(slot).unwrap();

        assert!(matches!(guard.free(slot), Err(Error::DoubleFree { .. })));

        guard.unpin(slot).unwrap();
        assert!(guard.is_empty());
    }

    #[test]
    fn unpin_without_pin_is_rejected() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        let slot = guard.malloc().unwrap().unwrap();

        assert!(matches!(
            guard.unpin(slot),
            Err(Error::UnknownPinnedAddress { slot_address }) if slot_address == slot.addr().get()
        ));
    }

    #[test]
    fn pin_rejects_unallocated_and_repeated_pins() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        let reapable = sb.arena_start();
        assert!(matches!(
            guard.pin(reapable),
            Err(Error::NotAllocated { .. })
        ));

        let slot = guard.malloc().unwrap().unwrap();
        guard.pin(slot).unwrap();
        assert!(matches!(
            guard.pin(offset(slot, 8)),
            Err(Error::AlreadyPinned { .. })
        ));

        guard.free(slot).unwrap();
        assert!(matches!(guard.pin(slot), Err(Error::NotAllocated { .. })));

        guard.unpin(slot).unwrap();
    }

    #[test]
    fn pin_of_free_slot_is_rejected() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        let a = guard.malloc().unwrap().unwrap();
        let _b = guard.malloc().unwrap().unwrap();
        guard.free(a).unwrap();

        assert!(matches!(guard.pin(a), Err(Error::NotAllocated { .. })));
        assert_eq!(guard.pinned_objects(), 0);
        assert_eq!(guard.slot_state(a).unwrap(), SlotState::Free);
        guard.integrity_check();
    }

    #[test]
    fn rejected_pin_leaves_free_slot_reusable() {
        let sb = superblock(64, 2);
        let mut guard = sb.lock();

        let a = guard.malloc().unwrap().unwrap();
        let b = guard.malloc().unwrap().unwrap();
        guard.free(a).unwrap();

        assert!(matches!(guard.pin(a), Err(Error::NotAllocated { .. })));

        // The slot is handed out again as a plain allocation, not as a pinned one.
        let again = guard.malloc().unwrap().unwrap();
        assert_eq!(again, a);
        assert_eq!(guard.slot_state(again).unwrap(), SlotState::Allocated);
        assert!(matches!(guard.unpin(again), Err(Error::UnknownPinnedAddress { .. })));

        guard.free(again).unwrap();
        guard.free(b).unwrap();
        assert!(guard.is_empty());
        assert_eq!(guard.reapable_objects(), 2);
    }

    #[test]
    fn pin_table_holds_exactly_capacity_pins() {
        let sb = superblock(64, 200);
        let mut guard = sb.lock();

        let slots: Vec<_> = (0..=PIN_TABLE_CAPACITY)
            .map(|_| guard.malloc().unwrap().unwrap())
            .collect();

        for slot in &slots[..PIN_TABLE_CAPACITY] {
            guard.pin(*slot).unwrap();
        }

        let last = slots[PIN_TABLE_CAPACITY];
        assert!(matches!(
            guard.pin(last),
            Err(Error::PinTableExhausted { slot_address, capacity })
                if slot_address == last.addr().get() && capacity == PIN_TABLE_CAPACITY
        ));
        assert_eq!(guard.pinned_objects(), PIN_TABLE_CAPACITY);

        // Releasing one pin makes room for another.
        guard.unpin(slots[0]).unwrap();
        guard.pin(last).unwrap();

        for slot in &slots[1..] {
            guard.unpin(*slot).unwrap();
        }
        assert_eq!(guard.pinned_objects(), 0);
    }

    #[test]
    fn corrupted_header_refuses_every_operation() {
        let mut sb = superblock(64, 4);
        let slot = sb.lock().malloc().unwrap().unwrap();

        let original = sb.replace_validity_tag(0xdead_beef);
        assert!(!sb.is_valid());

        {
            let mut guard = sb.lock();

            assert!(matches!(
                guard.malloc(),
                Err(Error::CorruptedSuperblock { .. })
            ));
            assert!(matches!(
                guard.free(slot),
                Err(Error::CorruptedSuperblock { .. })
            ));
            assert!(matches!(
                guard.pin(slot),
                Err(Error::CorruptedSuperblock { .. })
            ));
            assert!(matches!(
                guard.unpin(slot),
                Err(Error::CorruptedSuperblock { .. })
            ));
            assert!(matches!(
                guard.set_owner(Some(HeapId::new(1))),
                Err(Error::CorruptedSuperblock { .. })
            ));
            assert!(matches!(
                guard.set_prev(Some(SuperblockId::new(1))),
                Err(Error::CorruptedSuperblock { .. })
            ));
            assert!(matches!(
                guard.set_next(Some(SuperblockId::new(1))),
                Err(Error::CorruptedSuperblock { .. })
            ));

            // Reads of the bookkeeping do not validate and still report the last known values.
            assert_eq!(guard.objects_free(), 3);
            assert_eq!(guard.allocated_objects(), 1);
            assert_eq!(guard.owner(), None);
            assert_eq!(guard.prev(), None);
            assert_eq!(guard.next(), None);
        }

        assert!(matches!(
            sb.normalize(slot),
            Err(Error::CorruptedSuperblock { header_address })
                if header_address == sb.header.addr().get()
        ));
        assert!(matches!(
            sb.get_size(slot),
            Err(Error::CorruptedSuperblock { .. })
        ));

        // Restore the tag so the superblock can be dropped normally.
        sb.replace_validity_tag(original);
        assert!(sb.is_valid());
    }

    #[test]
    fn owner_and_sibling_links_round_trip() {
        let sb = superblock(64, 4);
        let mut guard = sb.lock();

        assert_eq!(guard.owner(), None);
        assert_eq!(guard.prev(), None);
        assert_eq!(guard.next(), None);

        guard.set_owner(Some(HeapId::new(2))).unwrap();
        guard.set_prev(Some(SuperblockId::new(10))).unwrap();
        guard.set_next(Some(SuperblockId::new(12))).unwrap();

        assert_eq!(guard.owner(), Some(HeapId::new(2)));
        assert_eq!(guard.prev(), Some(SuperblockId::new(10)));
        assert_eq!(guard.next(), Some(SuperblockId::new(12)));

        // A reset only concerns slots, not the place of the superblock in its heap.
        let slot = guard.malloc().unwrap().unwrap();
        guard.free(slot).unwrap();
        assert_eq!(guard.owner(), Some(HeapId::new(2)));
    }

    #[test]
    fn registers_arena_and_deregisters_once_on_drop() {
        let mut provider = MockRegionProvider::new();

        provider
            .expect_register_region()
            .withf(|_, len, access| *len == 4096 && *access == AccessFlags::SUPERBLOCK)
            .times(1)
            .returning(|address, len, access| {
                Ok(MemoryRegion::new(1, address.addr().get(), len, 5, 6, access))
            });

        provider
            .expect_deregister_region()
            .withf(|region| region.id() == 1)
            .times(1)
            .returning(|_| Ok(()));

        let sb = Superblock::builder(64)
            .arena_size(4096)
            .region_provider(Arc::new(provider))
            .build()
            .unwrap();

        let region = sb.memory_region().unwrap();
        assert_eq!(region.address(), sb.arena_start().addr().get());
        assert_eq!(region.len(), 4096);
        assert_eq!(region.local_key(), 5);
        assert_eq!(region.remote_key(), 6);

        drop(sb);
    }

    #[test]
    fn registration_failure_fails_build() {
        let mut provider = MockRegionProvider::new();

        provider
            .expect_register_region()
            .times(1)
            .returning(|_, _, _| Err(io::Error::from(io::ErrorKind::PermissionDenied)));

        provider.expect_deregister_region().never();

        let result = Superblock::builder(64)
            .arena_size(4096)
            .region_provider(Arc::new(provider))
            .build();

        assert!(matches!(
            result,
            Err(Error::RdmaRegistrationFailed { len: 4096, .. })
        ));
    }

    #[test]
    fn region_slice_resolves_keys_and_offsets() {
        let provider = Arc::new(SoftwareRegionProvider::new());
        let sb = Superblock::builder(64)
            .arena_size(64 * 8)
            .region_provider(provider)
            .build()
            .unwrap();

        let mut guard = sb.lock();
        let _first = guard.malloc().unwrap().unwrap();
        let second = guard.malloc().unwrap().unwrap();
        drop(guard);

        let slice = sb.region_slice(offset(second, 16), 48).unwrap();
        let region = sb.memory_region().unwrap();

        assert_eq!(slice.address(), second.addr().get() + 16);
        assert_eq!(slice.len(), 48);
        assert_eq!(slice.slot_address(), second.addr().get());
        assert_eq!(slice.offset_in_slot(), 16);
        assert_eq!(slice.offset_in_region(), 80);
        assert_eq!(slice.local_key(), region.local_key());
        assert_eq!(slice.remote_key(), region.remote_key());

        assert!(matches!(
            sb.region_slice(offset(second, 16), 49),
            Err(Error::SliceOutOfSlot { len: 49, .. })
        ));
    }

    #[test]
    fn region_slice_requires_region() {
        let sb = superblock(64, 2);

        assert!(matches!(
            sb.region_slice(sb.arena_start(), 8),
            Err(Error::NoMemoryRegion)
        ));
    }

    #[test]
    #[should_panic]
    fn drop_with_pinned_slot_panics() {
        let sb = Superblock::builder(64)
            .arena_size(1024)
            .region_provider(Arc::new(SoftwareRegionProvider::new()))
            .build()
            .unwrap();

        let mut guard = sb.lock();
        let slot = guard.malloc().unwrap().unwrap();
        guard.pin(slot).unwrap();
        drop(guard);

        drop(sb);
    }

    #[test]
    fn drop_with_allocated_slot_is_allowed_by_default() {
        let sb = superblock(64, 4);
        sb.lock().malloc().unwrap().unwrap();

        drop(sb);
    }

    #[test]
    #[should_panic]
    fn drop_with_allocated_slot_panics_with_strict_policy() {
        let sb = Superblock::builder(64)
            .arena_size(256)
            .drop_policy(DropPolicy::MustNotDropAllocated)
            .build()
            .unwrap();

        sb.lock().malloc().unwrap().unwrap();

        drop(sb);
    }

    #[test]
    fn drop_when_empty_with_strict_policy_is_ok() {
        let sb = Superblock::builder(64)
            .arena_size(256)
            .drop_policy(DropPolicy::MustNotDropAllocated)
            .build()
            .unwrap();

        let mut guard = sb.lock();
        let slot = guard.malloc().unwrap().unwrap();
        guard.free(slot).unwrap();
        drop(guard);

        drop(sb);
    }

    #[test]
    fn region_is_released_before_drop_panics() {
        let provider = Arc::new(SoftwareRegionProvider::new());

        let result = thread::spawn({
            let provider = Arc::clone(&provider);

            move || {
                let sb = Superblock::builder(64)
                    .arena_size(1024)
                    .region_provider(provider)
                    .build()
                    .unwrap();

                let mut guard = sb.lock();
                let slot = guard.malloc().unwrap().unwrap();
                guard.pin(slot).unwrap();
            }
        })
        .join();

        assert!(result.is_err());
        assert_eq!(provider.live_regions(), 0);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let sb = Arc::new(superblock(64, 4));

        let result = thread::spawn({
            let sb = Arc::clone(&sb);

            move || {
                let _guard = sb.lock();
                panic!("panicking while holding the superblock lock");
            }
        })
        .join();
        assert!(result.is_err());

        let mut guard = sb.lock();
        assert!(guard.malloc().unwrap().is_some());
    }

    #[test]
    fn superblock_is_usable_from_multiple_threads() {
        let sb = Arc::new(superblock(64, 64));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sb = Arc::clone(&sb);

                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut guard = sb.lock();
                        let slot = guard.malloc().unwrap().unwrap();
                        guard.pin(slot).unwrap();
                        guard.free(slot).unwrap();
                        guard.unpin(slot).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let guard = sb.lock();
        assert!(guard.is_empty());
        guard.integrity_check();
    }
}
