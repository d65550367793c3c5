use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use crate::{AccessFlags, MemoryRegion, RegionProvider};

/// A [`RegionProvider`] implemented entirely in software.
///
/// It hands out unique keys and keeps track of live registrations without talking to any
/// hardware. Useful wherever code paths that depend on registered memory need to run without an
/// RDMA device, and for observing the registration lifecycle of superblocks.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use rdma_superblock::{SoftwareRegionProvider, Superblock};
///
/// let provider = Arc::new(SoftwareRegionProvider::new());
///
/// let superblock = Superblock::builder(64)
///     .arena_size(4096)
///     .region_provider(Arc::<SoftwareRegionProvider>::clone(&provider))
///     .build()
///     .unwrap();
///
/// assert_eq!(provider.live_regions(), 1);
///
/// drop(superblock);
/// assert_eq!(provider.live_regions(), 0);
/// ```
#[derive(Debug, Default)]
pub struct SoftwareRegionProvider {
    state: Mutex<SoftwareState>,
}

#[derive(Debug, Default)]
struct SoftwareState {
    next_id: u64,

    /// Live registrations by id: (address, len).
    live: HashMap<u64, (usize, usize)>,

    total_registrations: u64,

    fail_next_registration: bool,
}

/// Remote keys are offset from local keys so the two can never be confused in tests.
const REMOTE_KEY_BASE: u32 = 0x8000_0000;

impl SoftwareRegionProvider {
    /// Creates a provider with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next registration attempt fail, as a provider that ran out of resources would.
    pub fn fail_next_registration(&self) {
        self.state().fail_next_registration = true;
    }

    /// Number of regions currently registered.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.state().live.len()
    }

    /// Number of successful registrations over the lifetime of the provider.
    #[must_use]
    pub fn total_registrations(&self) -> u64 {
        self.state().total_registrations
    }

    /// Whether `address` lies inside any live registration.
    #[must_use]
    pub fn is_registered(&self, address: usize) -> bool {
        self.state()
            .live
            .values()
            .any(|&(start, len)| address >= start && address - start < len)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SoftwareState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegionProvider for SoftwareRegionProvider {
    fn register_region(
        &self,
        address: NonNull<u8>,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let mut state = self.state();

        if state.fail_next_registration {
            state.fail_next_registration = false;
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "software region provider was told to fail this registration",
            ));
        }

        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot register an empty memory region",
            ));
        }

        let id = state.next_id;
        state.next_id = id
            .checked_add(1)
            .expect("registering 2^64 regions is not a realistic scenario");

        let local_key = u32::try_from(id & u64::from(REMOTE_KEY_BASE - 1))
            .expect("masked to fit in 31 bits");
        let remote_key = REMOTE_KEY_BASE | local_key;

        state.live.insert(id, (address.addr().get(), len));
        state.total_registrations = state
            .total_registrations
            .checked_add(1)
            .expect("registering 2^64 regions is not a realistic scenario");

        Ok(MemoryRegion::new(
            id,
            address.addr().get(),
            len,
            local_key,
            remote_key,
            access,
        ))
    }

    fn deregister_region(&self, region: &MemoryRegion) -> io::Result<()> {
        match self.state().live.remove(&region.id()) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("memory region {} is not registered", region.id()),
            )),
        }
    }
}
