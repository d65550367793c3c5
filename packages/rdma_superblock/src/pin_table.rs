use std::ptr::NonNull;

/// Maximum number of slots of one superblock that may be pinned at the same time.
pub const PIN_TABLE_CAPACITY: usize = 100;

/// Pin status of a single slot, as recorded in the pin table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PinState {
    /// The slot has no pin table entry.
    Unpinned,

    /// The slot is pinned and its owner has not freed it yet.
    Pinned,

    /// The slot was freed while pinned. Reclamation happens on unpin.
    FreedPending,
}

#[derive(Clone, Copy, Debug)]
struct PinEntry {
    slot: NonNull<u8>,

    /// Cleared when the slot is freed while pinned.
    in_use: bool,
}

impl PinEntry {
    fn state(&self) -> PinState {
        if self.in_use {
            PinState::Pinned
        } else {
            PinState::FreedPending
        }
    }
}

/// Returned when every pin table entry is occupied.
#[derive(Debug)]
pub(crate) struct PinTableFull;

/// Fixed-capacity set of pinned slot addresses, scanned linearly.
///
/// Each slot has at most one entry. Entries are keyed by the normalized slot address, so callers
/// must normalize before calling into the table.
#[derive(Debug, Default)]
pub(crate) struct PinTable {
    entries: heapless::Vec<PinEntry, PIN_TABLE_CAPACITY>,
}

impl PinTable {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, slot: NonNull<u8>) -> Option<usize> {
        self.entries.iter().position(|entry| entry.slot == slot)
    }

    #[must_use]
    pub(crate) fn state(&self, slot: NonNull<u8>) -> PinState {
        self.entries
            .iter()
            .find(|entry| entry.slot == slot)
            .map_or(PinState::Unpinned, PinEntry::state)
    }

    /// Adds an in-use entry for `slot`. The caller ensures the slot has no entry yet.
    pub(crate) fn insert(&mut self, slot: NonNull<u8>) -> Result<(), PinTableFull> {
        debug_assert_eq!(self.state(slot), PinState::Unpinned);

        self.entries
            .push(PinEntry { slot, in_use: true })
            .map_err(|_rejected| PinTableFull)
    }

    /// Records that the owner freed `slot`. Returns the state the slot was in before the call.
    ///
    /// Only a [`PinState::Pinned`] entry is modified (it becomes [`PinState::FreedPending`]).
    pub(crate) fn mark_freed(&mut self, slot: NonNull<u8>) -> PinState {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.slot == slot) else {
            return PinState::Unpinned;
        };

        let previous = entry.state();
        entry.in_use = false;
        previous
    }

    /// Removes the entry of `slot`, returning the state it was in, or `None` if the slot had no
    /// entry.
    pub(crate) fn remove(&mut self, slot: NonNull<u8>) -> Option<PinState> {
        let index = self.position(slot)?;

        // Order of entries carries no meaning, so the cheap removal is fine.
        let entry = self.entries.swap_remove(index);
        Some(entry.state())
    }
}
