use std::ptr::NonNull;
use std::sync::MutexGuard;

use crate::{HeaderState, HeapId, Result, SlotState, SuperblockHeader, SuperblockId};

/// Exclusive access to the allocation bookkeeping of a [`Superblock`][crate::Superblock].
///
/// Obtained from [`Superblock::lock()`][crate::Superblock::lock]. The superblock lock is held
/// for as long as the guard exists and is released when the guard is dropped, so every mutating
/// operation is performed under the lock.
///
/// Operations that take a pointer accept any pointer into a slot, not only the slot start. The
/// pointer is normalized to the start of its slot first.
///
/// Every operation that changes the superblock validates the header first and fails with
/// [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if it has been overwritten.
/// The counters and the owner and sibling getters do not validate. They report the last values
/// recorded under the lock, which is what a heap needs to decide what to do with a superblock
/// that [`is_valid()`][crate::Superblock::is_valid] rejects.
#[derive(Debug)]
pub struct SuperblockGuard<'a> {
    header: &'a SuperblockHeader,
    state: MutexGuard<'a, HeaderState>,
}

impl<'a> SuperblockGuard<'a> {
    pub(crate) fn new(header: &'a SuperblockHeader) -> Self {
        Self {
            state: header.lock(),
            header,
        }
    }

    /// Allocates a slot, returning a pointer to its start.
    ///
    /// Slots that have never been handed out are used before recycled ones. Among recycled
    /// slots, the most recently freed one is handed out first.
    ///
    /// Returns `Ok(None)` if every slot is in use. The returned pointer is aligned to
    /// [`ALIGNMENT`][crate::ALIGNMENT] and valid for reads and writes of
    /// [`object_size()`][crate::Superblock::object_size] bytes until the slot is freed.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    /// validation.
    pub fn malloc(&mut self) -> Result<Option<NonNull<u8>>> {
        self.header.malloc(&mut self.state)
    }

    /// Returns the slot containing `ptr` to the superblock.
    ///
    /// If the slot is pinned, reclamation is deferred until it is unpinned and the slot keeps
    /// counting as allocated until then.
    ///
    /// # Errors
    ///
    /// * [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    ///   validation.
    /// * [`Error::ForeignPointer`][crate::Error::ForeignPointer] if `ptr` is not inside a slot.
    /// * [`Error::NotAllocated`][crate::Error::NotAllocated] if the slot has not been handed out.
    /// * [`Error::DoubleFree`][crate::Error::DoubleFree] if the slot was already freed.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        self.header.free(&mut self.state, ptr)
    }

    /// Pins the slot containing `ptr`, deferring its reclamation until [`unpin()`][Self::unpin].
    ///
    /// Pin a slot before handing it to network hardware and unpin it once the transfer has
    /// completed. At most [`PIN_TABLE_CAPACITY`][crate::PIN_TABLE_CAPACITY] slots can be pinned
    /// at the same time.
    ///
    /// # Errors
    ///
    /// * [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    ///   validation.
    /// * [`Error::ForeignPointer`][crate::Error::ForeignPointer] if `ptr` is not inside a slot.
    /// * [`Error::NotAllocated`][crate::Error::NotAllocated] if the slot is not allocated.
    /// * [`Error::AlreadyPinned`][crate::Error::AlreadyPinned] if the slot is already pinned.
    /// * [`Error::PinTableExhausted`][crate::Error::PinTableExhausted] if the maximum number of
    ///   slots is already pinned.
    pub fn pin(&mut self, ptr: NonNull<u8>) -> Result<()> {
        self.header.pin(&mut self.state, ptr)
    }

    /// Removes the pin of the slot containing `ptr`.
    ///
    /// If the slot was freed while pinned, it is reclaimed now.
    ///
    /// # Errors
    ///
    /// * [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    ///   validation.
    /// * [`Error::ForeignPointer`][crate::Error::ForeignPointer] if `ptr` is not inside a slot.
    /// * [`Error::UnknownPinnedAddress`][crate::Error::UnknownPinnedAddress] if the slot is not
    ///   pinned.
    pub fn unpin(&mut self, ptr: NonNull<u8>) -> Result<()> {
        self.header.unpin(&mut self.state, ptr)
    }

    /// Reports the lifecycle state of the slot containing `ptr`.
    ///
    /// This scans the pin table, so it is meant for diagnostics rather than hot paths.
    ///
    /// # Errors
    ///
    /// * [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    ///   validation.
    /// * [`Error::ForeignPointer`][crate::Error::ForeignPointer] if `ptr` is not inside a slot.
    pub fn slot_state(&self, ptr: NonNull<u8>) -> Result<SlotState> {
        self.header.slot_state(&self.state, ptr)
    }

    /// Number of slots that are not allocated, including those never handed out.
    ///
    /// Does not validate the header.
    #[must_use]
    pub fn objects_free(&self) -> usize {
        self.state.free_slots()
    }

    /// Number of slots never handed out since the superblock was built or last reset.
    #[must_use]
    pub fn reapable_objects(&self) -> usize {
        self.state.reapable_slots()
    }

    /// Number of allocated slots, including slots freed while pinned that await their unpin.
    #[must_use]
    pub fn allocated_objects(&self) -> usize {
        self.header
            .total_slots()
            .checked_sub(self.state.free_slots())
            .expect("free slots never exceed the total")
    }

    /// Number of slots currently pinned, including slots freed while pinned.
    #[must_use]
    pub fn pinned_objects(&self) -> usize {
        self.state.pinned_slots()
    }

    /// Whether every slot is free.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.free_slots() == self.header.total_slots()
    }

    /// Whether every slot is allocated.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.free_slots() == 0
    }

    /// The heap currently holding the superblock, if any. Does not validate the header.
    #[must_use]
    pub fn owner(&self) -> Option<HeapId> {
        self.state.owner()
    }

    /// Records the heap holding the superblock. The superblock never resolves the identifier.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    /// validation. Nothing is recorded in that case.
    pub fn set_owner(&mut self, owner: Option<HeapId>) -> Result<()> {
        self.header.check_valid()?;
        self.state.set_owner(owner);
        Ok(())
    }

    /// The previous superblock in the list of the owning heap, if any. Does not validate the
    /// header.
    #[must_use]
    pub fn prev(&self) -> Option<SuperblockId> {
        self.state.prev()
    }

    /// Sets the previous superblock in the list of the owning heap.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    /// validation. Nothing is recorded in that case.
    pub fn set_prev(&mut self, prev: Option<SuperblockId>) -> Result<()> {
        self.header.check_valid()?;
        self.state.set_prev(prev);
        Ok(())
    }

    /// The next superblock in the list of the owning heap, if any. Does not validate the header.
    #[must_use]
    pub fn next(&self) -> Option<SuperblockId> {
        self.state.next()
    }

    /// Sets the next superblock in the list of the owning heap.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptedSuperblock`][crate::Error::CorruptedSuperblock] if the header failed
    /// validation. Nothing is recorded in that case.
    pub fn set_next(&mut self, next: Option<SuperblockId>) -> Result<()> {
        self.header.check_valid()?;
        self.state.set_next(next);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        self.state.integrity_check(self.header.total_slots());
    }
}
