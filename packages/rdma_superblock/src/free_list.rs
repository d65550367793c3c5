use std::ptr::NonNull;

/// The link stored in the first bytes of every slot that is on the free list.
#[repr(C)]
struct FreeEntry {
    next: Option<NonNull<FreeEntry>>,
}

/// Intrusive LIFO list of reclaimed slots.
///
/// The list nodes are the freed slots themselves: pushing a slot writes the current head into
/// the first bytes of the slot and popping reads it back. The list therefore needs no storage of
/// its own, but every slot must be at least as large as a pointer and aligned for one.
///
/// Memory of a slot is only ever touched by the list while that slot is on the list.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<NonNull<FreeEntry>>,

    len: usize,
}

impl FreeList {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Only used for diagnostics and assertions.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes a slot onto the list.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `slot` points to at least `size_of::<usize>()` writable
    /// bytes aligned for a pointer, that nothing else accesses this memory until the slot is
    /// popped again and that the slot is not already on the list.
    pub(crate) unsafe fn push(&mut self, slot: NonNull<u8>) {
        let entry = slot.cast::<FreeEntry>();

        // SAFETY: Forwarding the guarantees of our own safety requirements.
        unsafe {
            entry.write(FreeEntry { next: self.head });
        }

        self.head = Some(entry);
        self.len = self
            .len
            .checked_add(1)
            .expect("a free list cannot hold more slots than fit in the address space");
    }

    /// Pops the most recently pushed slot, if any.
    #[must_use]
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let entry = self.head?;

        // SAFETY: Every entry on the list was written by `push()` and its memory has not been
        // handed out since, so it still holds a valid `FreeEntry`.
        self.head = unsafe { entry.read().next };
        self.len = self
            .len
            .checked_sub(1)
            .expect("list had a head so it cannot be empty");

        Some(entry.cast())
    }

    /// Whether `slot` is currently on the list. This walks the whole list.
    #[must_use]
    pub(crate) fn contains(&self, slot: NonNull<u8>) -> bool {
        let mut current = self.head;

        while let Some(entry) = current {
            if entry.cast::<u8>() == slot {
                return true;
            }

            // SAFETY: See `pop()`, every linked entry holds a valid `FreeEntry`.
            current = unsafe { entry.read().next };
        }

        false
    }

    /// Forgets every slot on the list. The slot memory itself is not touched.
    pub(crate) fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }
}
