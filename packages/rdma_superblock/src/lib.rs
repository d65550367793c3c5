#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A slab ("superblock") memory manager for zero-copy RDMA networking.
//!
//! A superblock carves a fixed-size arena into equal-size object slots and hands them out with
//! minimal overhead. The arena can be registered as an RDMA memory region, so every slot can be
//! the source or target of a network transfer without copying. Because network hardware may
//! still be accessing a slot after the application is done with it, slots can be pinned: freeing
//! a pinned slot only marks it, and the slot is reclaimed once the transfer completes and the
//! slot is unpinned.
//!
//! A superblock is meant to be owned by a heap that manages many of them. The heap identifiers
//! and sibling links stored in a superblock are plain values for the heap to interpret.
//!
//! # Allocation
//!
//! Slots are handed out in two ways:
//!
//! * Reaping: slots never allocated since the superblock was built or last reset are handed
//!   out in address order by advancing a cursor.
//! * Free list: freed slots are kept on an intrusive LIFO list stored inside the freed slots
//!   themselves. Once reaping is exhausted, the most recently freed slot is handed out first.
//!
//! Whenever every slot of a superblock is free again, the superblock resets itself to its
//! freshly built state.
//!
//! # Locking
//!
//! All bookkeeping that changes during allocation is protected by a lock. Operations that touch
//! it are methods of [`SuperblockGuard`], obtained from [`Superblock::lock()`], so it is not
//! possible to call them without holding the lock. Geometry queries such as
//! [`Superblock::normalize()`] need no lock.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use rdma_superblock::{SoftwareRegionProvider, Superblock};
//!
//! let provider = Arc::new(SoftwareRegionProvider::new());
//!
//! let superblock = Superblock::builder(64)
//!     .arena_size(64 * 100)
//!     .region_provider(provider)
//!     .build()
//!     .unwrap();
//!
//! let mut guard = superblock.lock();
//!
//! let buffer = guard.malloc().unwrap().expect("a fresh superblock has free slots");
//!
//! // The buffer is about to be handed to the network hardware.
//! guard.pin(buffer).unwrap();
//!
//! // The application is done with the buffer but the transfer is still in flight.
//! guard.free(buffer).unwrap();
//! assert_eq!(guard.objects_free(), 99);
//!
//! // The transfer completed, so the slot is reclaimed.
//! guard.unpin(buffer).unwrap();
//! assert_eq!(guard.objects_free(), 100);
//! ```

mod allocation_map;
mod builder;
mod drop_policy;
mod error;
mod free_list;
mod guard;
mod header;
mod ids;
mod layout;
mod pin_table;
mod region;
mod slot_state;
mod superblock;

pub(crate) use allocation_map::*;
pub use builder::*;
pub use drop_policy::*;
pub use error::*;
pub(crate) use free_list::*;
pub use guard::*;
pub(crate) use header::*;
pub use ids::*;
pub use layout::*;
pub use pin_table::*;
pub use region::*;
pub use slot_state::*;
pub use superblock::*;
