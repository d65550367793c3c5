use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::{
    AllocationMap, Error, FreeList, HeapId, PIN_TABLE_CAPACITY, PinState, PinTable, RegionBinding, Result,
    SlotState, SuperblockId, is_aligned,
};

/// Mixed with the header address to form the validity tag.
const MAGIC_NUMBER: usize = 0xcafe_d00d;

/// Slot size and count of a superblock, validated by the builder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Geometry {
    pub(crate) object_size: usize,
    pub(crate) total_slots: usize,
}

impl Geometry {
    /// Bytes of the arena covered by slots. Any tail beyond this belongs to no slot.
    #[must_use]
    pub(crate) fn slots_len(&self) -> usize {
        self.object_size
            .checked_mul(self.total_slots)
            .expect("guarded by geometry validation in the builder")
    }
}

/// Metadata of a superblock, placed immediately before the arena it describes.
///
/// The immutable geometry lives directly in the header. Everything that changes during
/// allocation lives in [`HeaderState`] behind the header lock and is only reachable through a
/// [`SuperblockGuard`][crate::SuperblockGuard], which is how callers are forced to hold the lock
/// for every mutating operation.
///
/// The header must never move after [`write()`][Self::write], because the validity tag is
/// derived from its address.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct SuperblockHeader {
    /// `MAGIC_NUMBER ^ address of self`. Anything else means the header memory was overwritten
    /// or was never a live header.
    validity_tag: usize,

    object_size: usize,

    /// Allows normalization to use a mask instead of a division.
    object_size_is_power_of_two: bool,

    total_slots: usize,

    arena_start: NonNull<u8>,

    region: Option<RegionBinding>,

    state: Mutex<HeaderState>,
}

/// The part of the header that is only accessed under the header lock.
#[derive(Debug)]
pub(crate) struct HeaderState {
    /// Slots at or beyond the cursor have never been handed out since the last reset.
    reapable_slots: usize,

    /// Includes reapable slots.
    free_slots: usize,

    /// Bump cursor for reap allocation.
    cursor: NonNull<u8>,

    free_list: FreeList,

    /// Tells allocated slots apart from free ones without walking the free list.
    allocated: AllocationMap,

    pins: PinTable,

    owner: Option<HeapId>,

    prev: Option<SuperblockId>,

    next: Option<SuperblockId>,
}

impl SuperblockHeader {
    /// Writes a fresh header to `place`, describing the arena at `arena_start`.
    ///
    /// # Safety
    ///
    /// `place` must be valid for writes of a `SuperblockHeader`, aligned for it and must not move
    /// or be reused while the header is alive. `arena_start` must be aligned to [`ALIGNMENT`][crate::ALIGNMENT]
    /// and point to at least `geometry.slots_len()` bytes that are exclusively owned by this
    /// header for as long as it lives.
    pub(crate) unsafe fn write(
        place: NonNull<Self>,
        geometry: Geometry,
        arena_start: NonNull<u8>,
        region: Option<RegionBinding>,
    ) {
        debug_assert!(is_aligned(arena_start.addr().get()));

        let header = Self {
            validity_tag: expected_tag(place),
            object_size: geometry.object_size,
            object_size_is_power_of_two: geometry.object_size.is_power_of_two(),
            total_slots: geometry.total_slots,
            arena_start,
            region,
            state: Mutex::new(HeaderState {
                reapable_slots: geometry.total_slots,
                free_slots: geometry.total_slots,
                cursor: arena_start,
                free_list: FreeList::new(),
                allocated: AllocationMap::new(geometry.total_slots),
                pins: PinTable::new(),
                owner: None,
                prev: None,
                next: None,
            }),
        };

        // SAFETY: Forwarding the guarantees of our own safety requirements.
        unsafe {
            place.write(header);
        }
    }

    #[must_use]
    pub(crate) fn is_valid(&self) -> bool {
        self.validity_tag == expected_tag(NonNull::from(self))
    }

    pub(crate) fn check_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::CorruptedSuperblock {
                header_address: NonNull::from(self).addr().get(),
            })
        }
    }

    /// Overwrites the validity tag, returning the previous value.
    ///
    /// # Safety
    ///
    /// `header` must point to a header that is not referenced by anyone else for the duration
    /// of the call.
    pub(crate) unsafe fn replace_validity_tag(header: NonNull<Self>, tag: usize) -> usize {
        // SAFETY: Forwarding the guarantees of our own safety requirements. No reference is
        // created, only a pointer to the field.
        let tag_ptr = unsafe { &raw mut (*header.as_ptr()).validity_tag };

        // SAFETY: Forwarding the guarantees of our own safety requirements.
        unsafe { tag_ptr.replace(tag) }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HeaderState> {
        // Every operation validates before it mutates, so a panic never leaves the bookkeeping
        // half-updated and poisoning carries no information.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub(crate) fn object_size(&self) -> usize {
        self.object_size
    }

    #[must_use]
    pub(crate) fn total_slots(&self) -> usize {
        self.total_slots
    }

    #[must_use]
    pub(crate) fn arena_start(&self) -> NonNull<u8> {
        self.arena_start
    }

    #[must_use]
    pub(crate) fn slots_len(&self) -> usize {
        Geometry {
            object_size: self.object_size,
            total_slots: self.total_slots,
        }
        .slots_len()
    }

    #[must_use]
    pub(crate) fn region(&self) -> Option<&RegionBinding> {
        self.region.as_ref()
    }

    /// Distance of `ptr` from the arena start, if `ptr` points into a slot of this superblock.
    pub(crate) fn arena_offset(&self, ptr: NonNull<u8>) -> Result<usize> {
        ptr.addr()
            .get()
            .checked_sub(self.arena_start.addr().get())
            .filter(|&offset| offset < self.slots_len())
            .ok_or(Error::ForeignPointer {
                address: ptr.addr().get(),
            })
    }

    /// Distance of an arena offset from the start of its slot.
    #[must_use]
    fn offset_in_slot(&self, arena_offset: usize) -> usize {
        if self.object_size_is_power_of_two {
            let mask = self
                .object_size
                .checked_sub(1)
                .expect("object size is never zero");

            arena_offset & mask
        } else {
            arena_offset
                .checked_rem(self.object_size)
                .expect("object size is never zero")
        }
    }

    fn slot_at(&self, slot_offset: usize) -> NonNull<u8> {
        debug_assert!(slot_offset < self.slots_len());

        // SAFETY: Callers only pass offsets of slots inside the arena.
        unsafe { self.arena_start.add(slot_offset) }
    }

    /// Returns the start of the slot containing `ptr`.
    pub(crate) fn normalize(&self, ptr: NonNull<u8>) -> Result<NonNull<u8>> {
        self.check_valid()?;

        let arena_offset = self.arena_offset(ptr)?;
        let slot_offset = arena_offset
            .checked_sub(self.offset_in_slot(arena_offset))
            .expect("offset within a slot cannot exceed the offset within the arena");

        Ok(self.slot_at(slot_offset))
    }

    /// Returns the number of bytes from `ptr` to the end of its slot.
    pub(crate) fn get_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        self.check_valid()?;

        let arena_offset = self.arena_offset(ptr)?;
        Ok(self
            .object_size
            .checked_sub(self.offset_in_slot(arena_offset))
            .expect("offset within a slot is always less than the object size"))
    }

    /// Whether the slot has been handed out since the last reset (it may have been returned).
    fn is_reaped(state: &HeaderState, slot: NonNull<u8>) -> bool {
        slot < state.cursor
    }

    /// Position of a normalized slot in the arena.
    fn slot_index(&self, slot: NonNull<u8>) -> usize {
        slot.addr()
            .get()
            .checked_sub(self.arena_start.addr().get())
            .and_then(|offset| offset.checked_div(self.object_size))
            .expect("normalized slots are inside the arena and the object size is never zero")
    }

    pub(crate) fn malloc(&self, state: &mut HeaderState) -> Result<Option<NonNull<u8>>> {
        self.check_valid()?;

        let slot = self
            .reap_alloc(state)
            .or_else(|| Self::free_list_alloc(state));

        match slot {
            Some(slot) => {
                debug_assert!(is_aligned(slot.addr().get()));
                debug_assert!(self.get_size(slot).is_ok_and(|size| size == self.object_size));

                let newly_allocated = state.allocated.set(self.slot_index(slot));
                debug_assert!(newly_allocated, "handed out a slot that is already allocated");
            }
            None => debug_assert!(state.free_list.is_empty() && state.free_slots == 0),
        }

        Ok(slot)
    }

    fn reap_alloc(&self, state: &mut HeaderState) -> Option<NonNull<u8>> {
        if state.reapable_slots == 0 {
            return None;
        }

        let slot = state.cursor;

        // SAFETY: There was at least one reapable slot at the cursor, so advancing by one slot
        // lands at most one byte past the last slot, which is still within the arena allocation.
        state.cursor = unsafe { slot.add(self.object_size) };
        state.reapable_slots = state
            .reapable_slots
            .checked_sub(1)
            .expect("guarded by the zero check above");
        state.free_slots = state
            .free_slots
            .checked_sub(1)
            .expect("reapable slots are a subset of free slots");

        Some(slot)
    }

    fn free_list_alloc(state: &mut HeaderState) -> Option<NonNull<u8>> {
        let slot = state.free_list.pop()?;

        state.free_slots = state
            .free_slots
            .checked_sub(1)
            .expect("slots on the free list are counted as free");

        Some(slot)
    }

    pub(crate) fn free(&self, state: &mut HeaderState, ptr: NonNull<u8>) -> Result<()> {
        let slot = self.normalize(ptr)?;
        let slot_address = slot.addr().get();

        if !Self::is_reaped(state, slot) {
            return Err(Error::NotAllocated { slot_address });
        }

        // Reaped but unmarked means the slot is back on the free list.
        if !state.allocated.is_set(self.slot_index(slot)) {
            return Err(Error::DoubleFree { slot_address });
        }

        match state.pins.mark_freed(slot) {
            PinState::Pinned => {
                trace!(slot_address, "deferring free of pinned slot until unpin");
                return Ok(());
            }
            PinState::FreedPending => return Err(Error::DoubleFree { slot_address }),
            PinState::Unpinned => {}
        }

        self.release(state, slot);
        Ok(())
    }

    pub(crate) fn pin(&self, state: &mut HeaderState, ptr: NonNull<u8>) -> Result<()> {
        let slot = self.normalize(ptr)?;
        let slot_address = slot.addr().get();

        if !Self::is_reaped(state, slot) || !state.allocated.is_set(self.slot_index(slot)) {
            return Err(Error::NotAllocated { slot_address });
        }

        match state.pins.state(slot) {
            PinState::Unpinned => {}
            PinState::Pinned => return Err(Error::AlreadyPinned { slot_address }),
            PinState::FreedPending => return Err(Error::NotAllocated { slot_address }),
        }

        state
            .pins
            .insert(slot)
            .map_err(|_full| Error::PinTableExhausted {
                slot_address,
                capacity: PIN_TABLE_CAPACITY,
            })
    }

    pub(crate) fn unpin(&self, state: &mut HeaderState, ptr: NonNull<u8>) -> Result<()> {
        let slot = self.normalize(ptr)?;
        let slot_address = slot.addr().get();

        match state.pins.remove(slot) {
            None | Some(PinState::Unpinned) => Err(Error::UnknownPinnedAddress { slot_address }),
            Some(PinState::Pinned) => Ok(()),
            Some(PinState::FreedPending) => {
                trace!(slot_address, "completing deferred free on unpin");
                self.release(state, slot);
                Ok(())
            }
        }
    }

    /// Classifies the slot containing `ptr`. Scans the pin table, so this is O(pins).
    pub(crate) fn slot_state(&self, state: &HeaderState, ptr: NonNull<u8>) -> Result<SlotState> {
        let slot = self.normalize(ptr)?;
        let allocated = state.allocated.is_set(self.slot_index(slot));

        Ok(match state.pins.state(slot) {
            PinState::Pinned => SlotState::Pinned,
            PinState::FreedPending => SlotState::PinnedFreedPending,
            PinState::Unpinned if !Self::is_reaped(state, slot) => SlotState::Reapable,
            PinState::Unpinned if !allocated => SlotState::Free,
            PinState::Unpinned => SlotState::Allocated,
        })
    }

    /// Returns a slot to the free list, resetting the superblock once every slot is free.
    fn release(&self, state: &mut HeaderState, slot: NonNull<u8>) {
        let was_allocated = state.allocated.clear(self.slot_index(slot));
        debug_assert!(was_allocated, "released a slot that was not allocated");
        debug_assert!(!state.free_list.contains(slot));

        // SAFETY: The slot is inside the arena, aligned to `ALIGNMENT` (at least pointer-sized and
        // pointer-aligned) and was allocated until now, so nobody else may touch it any more.
        unsafe {
            state.free_list.push(slot);
        }

        state.free_slots = state
            .free_slots
            .checked_add(1)
            .expect("guarded by the allocation checks above");

        debug_assert!(state.free_slots <= self.total_slots);

        if state.free_slots == self.total_slots {
            self.reset(state);
        }
    }

    /// Returns the superblock to its freshly built state.
    pub(crate) fn reset(&self, state: &mut HeaderState) {
        debug_assert!(
            state.pins.is_empty(),
            "a pinned slot is allocated, so a vacated superblock cannot have pins"
        );

        state.free_list.clear();
        state.allocated.clear_all();
        state.free_slots = self.total_slots;
        state.reapable_slots = self.total_slots;
        state.cursor = self.arena_start;

        trace!(
            arena_start = self.arena_start.addr().get(),
            total_slots = self.total_slots,
            "superblock vacated and reset"
        );
    }
}

impl HeaderState {
    #[must_use]
    pub(crate) fn free_slots(&self) -> usize {
        self.free_slots
    }

    #[must_use]
    pub(crate) fn reapable_slots(&self) -> usize {
        self.reapable_slots
    }

    #[must_use]
    pub(crate) fn pinned_slots(&self) -> usize {
        self.pins.len()
    }

    #[must_use]
    pub(crate) fn owner(&self) -> Option<HeapId> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Option<HeapId>) {
        self.owner = owner;
    }

    #[must_use]
    pub(crate) fn prev(&self) -> Option<SuperblockId> {
        self.prev
    }

    pub(crate) fn set_prev(&mut self, prev: Option<SuperblockId>) {
        self.prev = prev;
    }

    #[must_use]
    pub(crate) fn next(&self) -> Option<SuperblockId> {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Option<SuperblockId>) {
        self.next = next;
    }

    /// Free list length plus reapable slots must always equal the free slot count.
    #[cfg(test)]
    pub(crate) fn integrity_check(&self, total_slots: usize) {
        let listed = self
            .free_list
            .len()
            .checked_add(self.reapable_slots)
            .expect("counts are bounded by the slot count");

        assert_eq!(
            listed, self.free_slots,
            "free list length plus reapable slots does not match the free slot count"
        );
        assert!(self.reapable_slots <= total_slots);
        assert!(self.free_slots <= total_slots);
        assert!(self.pins.len() <= PIN_TABLE_CAPACITY);
        assert_eq!(
            self.allocated.count(),
            total_slots
                .checked_sub(self.free_slots)
                .expect("free slots never exceed the total"),
            "allocation map does not match the allocated slot count"
        );
    }
}

fn expected_tag(header: NonNull<SuperblockHeader>) -> usize {
    MAGIC_NUMBER ^ header.addr().get()
}
