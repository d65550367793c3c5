/// Lifecycle state of a single slot, as reported by
/// [`SuperblockGuard::slot_state()`][crate::SuperblockGuard::slot_state].
///
/// A slot moves `Reapable → Allocated → Free → Allocated → ...`, with an optional detour
/// through `Pinned` and `PinnedFreedPending` while a network transfer references it. A reset of
/// the superblock returns every slot to `Reapable`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SlotState {
    /// Never handed out since the superblock was built or last reset.
    Reapable,

    /// Handed out and not pinned.
    Allocated,

    /// Handed out and pinned by an in-flight transfer.
    Pinned,

    /// Freed by its owner while pinned. Reclaimed once unpinned.
    PinnedFreedPending,

    /// On the free list, waiting to be handed out again.
    Free,
}
