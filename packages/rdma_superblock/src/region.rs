//! Registration of superblock arenas as RDMA memory regions.
//!
//! The provider of memory regions (typically a protection domain of an RDMA device) is an
//! injected capability. Superblocks built without one skip registration entirely, which allows
//! the allocator to work in environments without RDMA hardware.

mod abstractions;
pub use abstractions::*;

mod binding;
pub(crate) use binding::*;

mod slice;
pub use slice::*;

mod software;
pub use software::*;
