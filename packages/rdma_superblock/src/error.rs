use std::io;

use thiserror::Error;

/// Errors that can occur when building or operating a superblock.
///
/// Apart from [`Error::RdmaRegistrationFailed`], which reports a problem in the environment,
/// every variant reports a caller programming error or memory corruption. None of them are
/// retried internally and none of them leave the superblock bookkeeping modified.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The validity tag of the superblock header did not match the value derived from the
    /// header address. The memory holding the header has been overwritten or is not a live
    /// superblock header. The superblock must not be used any further.
    #[error("superblock header at {header_address:#x} failed validation, memory is corrupted")]
    CorruptedSuperblock {
        /// Address of the header that failed validation.
        header_address: usize,
    },

    /// The pin table already holds the maximum number of concurrent pins.
    #[error("cannot pin slot {slot_address:#x}, all {capacity} pin table entries are in use")]
    PinTableExhausted {
        /// Normalized address of the slot that could not be pinned.
        slot_address: usize,

        /// Capacity of the pin table.
        capacity: usize,
    },

    /// An unpin was requested for a slot that has no pin table entry.
    #[error("slot {slot_address:#x} is not pinned")]
    UnknownPinnedAddress {
        /// Normalized address of the slot.
        slot_address: usize,
    },

    /// A slot was freed twice without being allocated in between.
    #[error("slot {slot_address:#x} was already freed")]
    DoubleFree {
        /// Normalized address of the slot.
        slot_address: usize,
    },

    /// The region provider refused to register the arena as an RDMA memory region.
    #[error("failed to register {len} byte arena at {address:#x} as an RDMA memory region")]
    RdmaRegistrationFailed {
        /// Start address of the arena.
        address: usize,

        /// Length of the arena in bytes.
        len: usize,

        /// The error reported by the region provider.
        #[source]
        source: io::Error,
    },

    /// The requested superblock geometry violates the layout rules.
    #[error("invalid superblock geometry: {problem}")]
    InvalidGeometry {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The pointer does not point into the arena of this superblock.
    #[error("address {address:#x} is outside the superblock arena")]
    ForeignPointer {
        /// The offending address.
        address: usize,
    },

    /// The slot is not currently allocated (it has never been handed out since the superblock
    /// was built or last reset).
    #[error("slot {slot_address:#x} is not allocated")]
    NotAllocated {
        /// Normalized address of the slot.
        slot_address: usize,
    },

    /// The slot already has an outstanding pin.
    #[error("slot {slot_address:#x} is already pinned")]
    AlreadyPinned {
        /// Normalized address of the slot.
        slot_address: usize,
    },

    /// A region slice was requested that extends past the end of its slot.
    #[error("{len} bytes at {address:#x} extend past the end of the containing slot")]
    SliceOutOfSlot {
        /// Start address of the requested slice.
        address: usize,

        /// Requested length of the slice.
        len: usize,
    },

    /// The superblock was built without a region provider, so it has no memory region.
    #[error("superblock arena is not registered as an RDMA memory region")]
    NoMemoryRegion,
}

/// A specialized `Result` type for superblock operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
