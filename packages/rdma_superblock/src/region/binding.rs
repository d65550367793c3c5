use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{AccessFlags, Error, MemoryRegion, RegionProvider, Result};

/// Ties a registered memory region to the provider that registered it.
///
/// Owning a binding means owning the registration: dropping the binding deregisters the region,
/// so a region can only ever be deregistered once.
#[derive(Debug)]
pub(crate) struct RegionBinding {
    provider: Arc<dyn RegionProvider>,
    region: MemoryRegion,
}

impl RegionBinding {
    /// Registers the arena at `address` with superblock access rights.
    pub(crate) fn register(
        provider: Arc<dyn RegionProvider>,
        address: NonNull<u8>,
        len: usize,
    ) -> Result<Self> {
        let region = provider
            .register_region(address, len, AccessFlags::SUPERBLOCK)
            .map_err(|source| Error::RdmaRegistrationFailed {
                address: address.addr().get(),
                len,
                source,
            })?;

        debug!(
            region_id = region.id(),
            address = region.address(),
            len = region.len(),
            local_key = region.local_key(),
            remote_key = region.remote_key(),
            "registered superblock arena as memory region"
        );

        Ok(Self { provider, region })
    }

    #[must_use]
    pub(crate) fn region(&self) -> &MemoryRegion {
        &self.region
    }
}

impl Drop for RegionBinding {
    fn drop(&mut self) {
        // Drop cannot report the failure, so the best we can do is make it visible.
        match self.provider.deregister_region(&self.region) {
            Ok(()) => debug!(region_id = self.region.id(), "deregistered memory region"),
            Err(error) => warn!(
                region_id = self.region.id(),
                %error,
                "failed to deregister memory region"
            ),
        }
    }
}
