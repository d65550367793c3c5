use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// Access rights requested when registering a memory region.
    ///
    /// The bit values match the verbs access flags, so [`bits()`][Self::bits] can be handed to
    /// the device as is. Flags combine with `|`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rdma_superblock::AccessFlags;
    ///
    /// let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
    ///
    /// assert!(access.contains(AccessFlags::REMOTE_WRITE));
    /// assert!(!access.contains(AccessFlags::REMOTE_READ));
    /// ```
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct AccessFlags: u32 {
        /// The local device may write into the region.
        const LOCAL_WRITE = 1;

        /// Remote peers may write into the region.
        const REMOTE_WRITE = 1 << 1;

        /// Remote peers may read from the region.
        const REMOTE_READ = 1 << 2;

        /// The access rights every superblock arena is registered with.
        const SUPERBLOCK = Self::LOCAL_WRITE.bits() | Self::REMOTE_WRITE.bits();
    }
}

/// A memory range registered with a [`RegionProvider`].
///
/// Carries the keys that work requests use to reference memory inside the region: the local key
/// for operations posted by this process and the remote key handed to peers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    id: u64,
    address: usize,
    len: usize,
    local_key: u32,
    remote_key: u32,
    access: AccessFlags,
}

impl MemoryRegion {
    /// Describes a region registered by a provider. Only providers need to call this.
    #[must_use]
    pub const fn new(
        id: u64,
        address: usize,
        len: usize,
        local_key: u32,
        remote_key: u32,
        access: AccessFlags,
    ) -> Self {
        Self {
            id,
            address,
            len,
            local_key,
            remote_key,
            access,
        }
    }

    /// Provider-assigned identifier of the registration.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Start address of the registered range.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// Length of the registered range in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the registered range is empty. Superblock regions never are.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Key used by local work requests.
    #[must_use]
    pub const fn local_key(&self) -> u32 {
        self.local_key
    }

    /// Key handed to remote peers.
    #[must_use]
    pub const fn remote_key(&self) -> u32 {
        self.remote_key
    }

    /// Access rights granted at registration.
    #[must_use]
    pub const fn access(&self) -> AccessFlags {
        self.access
    }
}

/// Registers and deregisters memory regions with RDMA hardware (or a stand-in for it).
///
/// A superblock registers its arena once when built and deregisters it once when dropped.
/// Implementations must be shareable between threads because superblocks are.
#[cfg_attr(test, mockall::automock)]
pub trait RegionProvider: Debug + Send + Sync + 'static {
    /// Registers `len` bytes starting at `address` with the requested access rights.
    ///
    /// The memory stays valid and at the same address until the returned region is passed to
    /// [`deregister_region()`][Self::deregister_region].
    fn register_region(
        &self,
        address: NonNull<u8>,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion>;

    /// Releases a region previously returned by [`register_region()`][Self::register_region].
    fn deregister_region(&self, region: &MemoryRegion) -> io::Result<()>;
}
