//! Basic usage of the `rdma_superblock` crate:
//!
//! * Building a superblock registered as a memory region.
//! * Allocating and freeing slots.
//! * Pinning a slot for the duration of a simulated network transfer.

use std::sync::Arc;

use rdma_superblock::{SlotState, SoftwareRegionProvider, Superblock};
use tracing::Level;

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::TRACE).init();

    // Without RDMA hardware, the software provider stands in for a protection domain.
    let provider = Arc::new(SoftwareRegionProvider::new());

    let superblock = Superblock::builder(64)
        .arena_size(64 * 6400)
        .region_provider(Arc::<SoftwareRegionProvider>::clone(&provider))
        .build()
        .unwrap();

    let region = superblock.memory_region().unwrap();
    println!(
        "Superblock with {} slots of {} bytes, registered with local key {:#x} and remote key {:#x}",
        superblock.total_slots(),
        superblock.object_size(),
        region.local_key(),
        region.remote_key()
    );

    let mut guard = superblock.lock();

    let message = guard.malloc().unwrap().unwrap();
    let reply = guard.malloc().unwrap().unwrap();
    println!("Allocated two slots, {} remain free", guard.objects_free());

    // The network hardware is about to read from `message`, so it must not be reused until
    // the transfer completes.
    guard.pin(message).unwrap();

    // The application is done with the message before the transfer has completed.
    guard.free(message).unwrap();
    println!(
        "Message slot is {:?}, {} slots free",
        guard.slot_state(message).unwrap(),
        guard.objects_free()
    );

    // The transfer completed.
    guard.unpin(message).unwrap();
    assert_eq!(guard.slot_state(message).unwrap(), SlotState::Free);
    println!("After unpin, {} slots free", guard.objects_free());

    // Freeing the last allocated slot resets the superblock.
    guard.free(reply).unwrap();
    println!(
        "After freeing everything, {} of {} slots are reapable",
        guard.reapable_objects(),
        superblock.total_slots()
    );

    drop(guard);
    drop(superblock);

    println!(
        "Superblock dropped, {} memory regions remain registered",
        provider.live_regions()
    );
}
