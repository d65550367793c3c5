//! Placing superblocks into memory obtained by an owning heap and linking them together,
//! the way a heap that manages many superblocks would.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use rdma_superblock::{ALIGNMENT, HEADER_SIZE, HeapId, Superblock, SuperblockId};

const SUPERBLOCK_LEN: usize = 16 * 1024;
const SUPERBLOCK_COUNT: usize = 4;

fn main() {
    tracing_subscriber::fmt().init();

    // The heap obtains memory for all of its superblocks in one go.
    let layout = Layout::from_size_align(SUPERBLOCK_LEN * SUPERBLOCK_COUNT, ALIGNMENT).unwrap();

    // SAFETY: The layout has a non-zero size.
    let memory = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();

    let heap = HeapId::new(1);

    let superblocks: Vec<_> = (0..SUPERBLOCK_COUNT)
        .map(|index| {
            // SAFETY: Each superblock gets its own non-overlapping part of the memory.
            let buffer = unsafe { memory.add(index * SUPERBLOCK_LEN) };

            // SAFETY: The memory outlives the superblocks (we drop them before releasing it)
            // and nothing else touches it while they exist.
            unsafe { Superblock::builder(256).build_in(buffer, SUPERBLOCK_LEN) }.unwrap()
        })
        .collect();

    for (index, superblock) in superblocks.iter().enumerate() {
        let mut guard = superblock.lock();

        guard.set_owner(Some(heap)).unwrap();
        guard
            .set_prev(index.checked_sub(1).map(superblock_id))
            .unwrap();
        guard
            .set_next(
                Some(index + 1)
                    .filter(|&next| next < SUPERBLOCK_COUNT)
                    .map(superblock_id),
            )
            .unwrap();
    }

    println!(
        "Each {SUPERBLOCK_LEN} byte buffer holds a {HEADER_SIZE} byte header and {} slots of 256 bytes",
        superblocks[0].total_slots()
    );

    // Fill up the first superblock, then move on to the next one like a heap would.
    let mut allocated = Vec::new();
    let mut current = 0;

    while allocated.len() < 100 {
        let mut guard = superblocks[current].lock();

        if let Some(slot) = guard.malloc().unwrap() {
            allocated.push((current, slot));
        } else {
            let next = guard.next().expect("the heap has enough superblocks");
            println!("Superblock {current} is full, moving on to {next}");
            current = usize::try_from(next.get()).unwrap();
        }
    }

    for superblock in &superblocks {
        let guard = superblock.lock();
        println!(
            "Owner {:?}, prev {:?}, next {:?}: {} allocated",
            guard.owner(),
            guard.prev(),
            guard.next(),
            guard.allocated_objects()
        );
    }

    for (index, slot) in allocated {
        superblocks[index].lock().free(slot).unwrap();
    }

    drop(superblocks);

    // SAFETY: The superblocks are gone and the layout matches the allocation.
    unsafe {
        dealloc(memory.as_ptr(), layout);
    }
}

fn superblock_id(index: usize) -> SuperblockId {
    SuperblockId::new(u64::try_from(index).unwrap())
}
