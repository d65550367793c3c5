/// Determines how a superblock treats slots that are still allocated when it is dropped.
///
/// Slots that are still pinned are never acceptable at drop time, regardless of policy, because
/// the registered memory region may still be referenced by in-flight RDMA operations.
///
/// # Examples
///
/// ```
/// use rdma_superblock::{DropPolicy, Superblock};
///
/// let superblock = Superblock::builder(64)
///     .arena_size(4096)
///     .drop_policy(DropPolicy::MustNotDropAllocated)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Allocated slots are silently reclaimed when the superblock is dropped. This is the default.
    #[default]
    MayDropAllocated,

    /// The superblock will panic if any slot is still allocated when it is dropped.
    ///
    /// This may be valuable if the owning heap is expected to return every slot before retiring
    /// a superblock, making a leftover allocation a sign of a leak.
    MustNotDropAllocated,
}
