use std::fmt;

/// Identifies the heap that currently holds a superblock.
///
/// The superblock only stores this value on behalf of the heap. It never resolves it and does
/// not influence the lifetime of the heap.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HeapId(u64);

impl HeapId {
    /// Creates an identifier from a raw value chosen by the heap.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// Identifies a superblock in the registry of its owning heap.
///
/// Used for the sibling links of a superblock. As with [`HeapId`], the links are plain values
/// that only the owning heap knows how to resolve.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SuperblockId(u64);

impl SuperblockId {
    /// Creates an identifier from a raw value chosen by the heap.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SuperblockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "superblock#{}", self.0)
    }
}
