//! Resolving buffers inside a registered superblock to the keys and offsets that RDMA work
//! requests reference them by.

use std::sync::Arc;

use rdma_superblock::{Error, SoftwareRegionProvider, Superblock};

fn main() {
    tracing_subscriber::fmt().init();

    let superblock = Superblock::builder(4096)
        .arena_size(4096 * 32)
        .region_provider(Arc::new(SoftwareRegionProvider::new()))
        .build()
        .unwrap();

    let mut guard = superblock.lock();

    let _earlier = guard.malloc().unwrap().unwrap();
    let buffer = guard.malloc().unwrap().unwrap();

    // The first 64 bytes hold an application header, the payload goes after it.
    // SAFETY: The slot is 4096 bytes long.
    let payload = unsafe { buffer.add(64) };

    let slice = superblock.region_slice(payload, 4096 - 64).unwrap();
    println!(
        "Payload: {} bytes at {:#x}, {} bytes into the region, remote key {:#x}",
        slice.len(),
        slice.address(),
        slice.offset_in_region(),
        slice.remote_key()
    );

    // Recovering the slot from the payload pointer, e.g. when a completion arrives.
    assert_eq!(superblock.normalize(payload).unwrap(), buffer);
    assert_eq!(slice.slot_address(), buffer.addr().get());

    // A range that crosses into the next slot cannot be described by a single slice.
    match superblock.region_slice(payload, 4096) {
        Err(Error::SliceOutOfSlot { address, len }) => {
            println!("Refused {len} bytes at {address:#x}, they would cross the slot boundary");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    guard.pin(buffer).unwrap();
    guard.free(buffer).unwrap();
    guard.unpin(buffer).unwrap();
}
