use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{
    ALIGNMENT, Backing, DropPolicy, Error, Geometry, HEADER_SIZE, MIN_OBJECT_SIZE,
    RegionProvider, Result, Superblock, is_aligned,
};

/// Arena size used unless [`SuperblockBuilder::arena_size()`] says otherwise.
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024;

/// Builder for creating an instance of [`Superblock`].
///
/// Obtained from [`Superblock::builder()`], which takes the object size because a superblock
/// has no sensible default for it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use rdma_superblock::{DropPolicy, SoftwareRegionProvider, Superblock};
///
/// let superblock = Superblock::builder(128)
///     .arena_size(128 * 1024)
///     .region_provider(Arc::new(SoftwareRegionProvider::new()))
///     .drop_policy(DropPolicy::MustNotDropAllocated)
///     .build()
///     .unwrap();
///
/// assert_eq!(superblock.total_slots(), 1024);
/// ```
#[derive(Debug)]
#[must_use]
pub struct SuperblockBuilder {
    object_size: usize,

    arena_size: usize,

    region_provider: Option<Arc<dyn RegionProvider>>,

    drop_policy: DropPolicy,
}

impl SuperblockBuilder {
    pub(crate) fn new(object_size: usize) -> Self {
        Self {
            object_size,
            arena_size: DEFAULT_ARENA_SIZE,
            region_provider: None,
            drop_policy: DropPolicy::default(),
        }
    }

    /// Sets the size of the arena that is divided into slots, in bytes.
    ///
    /// The arena holds `arena_size / object_size` slots. Any remainder is left unused. The
    /// header is stored in addition to the arena, not inside it.
    ///
    /// Ignored by [`build_in()`][Self::build_in], where the arena is whatever remains of the
    /// supplied buffer after the header.
    pub fn arena_size(mut self, arena_size: usize) -> Self {
        self.arena_size = arena_size;
        self
    }

    /// Registers the arena as an RDMA memory region with this provider.
    ///
    /// Without a provider, the superblock works the same but has no memory region.
    pub fn region_provider(mut self, provider: Arc<dyn RegionProvider>) -> Self {
        self.region_provider = Some(provider);
        self
    }

    /// Sets the [drop policy][DropPolicy] for the superblock. This governs how to treat slots
    /// that are still allocated when the superblock is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Allocates memory for the header and arena and builds the superblock in it.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidGeometry`] if the object size or arena size violate the layout rules.
    /// * [`Error::RdmaRegistrationFailed`] if a region provider was configured and refused to
    ///   register the arena. The memory is released before returning.
    pub fn build(self) -> Result<Superblock> {
        let geometry = self.geometry(self.arena_size)?;

        let block_len = HEADER_SIZE
            .checked_add(self.arena_size)
            .ok_or_else(|| invalid_geometry("arena size overflows the address space"))?;

        let layout = Layout::from_size_align(block_len, ALIGNMENT).map_err(|_layout_error| {
            invalid_geometry("arena size overflows the address space")
        })?;

        // SAFETY: The layout has a non-zero size because the header is never empty.
        let block = NonNull::new(unsafe { alloc(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));

        // SAFETY: We just allocated the block with the right alignment and size and nobody else
        // knows about it.
        let result = unsafe {
            Superblock::initialize(
                block,
                self.arena_size,
                geometry,
                self.region_provider,
                Backing::Owned(layout),
                self.drop_policy,
            )
        };

        if result.is_err() {
            // SAFETY: Initialization failed, so the block is still ours. The layout matches.
            unsafe {
                dealloc(block.as_ptr(), layout);
            }
        }

        result
    }

    /// Builds the superblock in a buffer supplied by the caller, typically memory obtained by the
    /// owning heap in bulk.
    ///
    /// The header occupies the first [`HEADER_SIZE`] bytes of the buffer and the arena is the
    /// rest. The configured [arena size][Self::arena_size] is ignored.
    ///
    /// The buffer is not released when the superblock is dropped.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidGeometry`] if the buffer is not aligned to [`ALIGNMENT`], is too small
    ///   to hold the header and one slot or if the object size violates the layout rules.
    /// * [`Error::RdmaRegistrationFailed`] if a region provider was configured and refused to
    ///   register the arena.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `buffer` is valid for reads and writes of `len` bytes and
    /// that nothing else accesses this memory until the returned superblock has been dropped.
    pub unsafe fn build_in(self, buffer: NonNull<u8>, len: usize) -> Result<Superblock> {
        if !is_aligned(buffer.addr().get()) {
            return Err(invalid_geometry(format!(
                "buffer at {:#x} is not aligned to {ALIGNMENT} bytes",
                buffer.addr().get()
            )));
        }

        let arena_size = len.checked_sub(HEADER_SIZE).ok_or_else(|| {
            invalid_geometry(format!(
                "buffer of {len} bytes cannot hold the {HEADER_SIZE} byte header"
            ))
        })?;

        let geometry = self.geometry(arena_size)?;

        // SAFETY: Alignment and size were checked above, exclusivity is forwarded from our own
        // safety requirements.
        unsafe {
            Superblock::initialize(
                buffer,
                arena_size,
                geometry,
                self.region_provider,
                Backing::Borrowed,
                self.drop_policy,
            )
        }
    }

    fn geometry(&self, arena_size: usize) -> Result<Geometry> {
        let object_size = self.object_size;

        if object_size < MIN_OBJECT_SIZE {
            return Err(invalid_geometry(format!(
                "object size {object_size} is below the minimum of {MIN_OBJECT_SIZE}"
            )));
        }

        let total_slots = arena_size
            .checked_div(object_size)
            .expect("object size was checked to be non-zero above");

        if total_slots == 0 {
            return Err(invalid_geometry(format!(
                "arena of {arena_size} bytes cannot hold a single object of {object_size} bytes"
            )));
        }

        // Every slot is aligned only if the object size keeps the alignment of the arena start.
        // A lone slot is aligned by the arena start itself.
        if total_slots > 1 && !is_aligned(object_size) {
            return Err(invalid_geometry(format!(
                "object size {object_size} is not a multiple of {ALIGNMENT}"
            )));
        }

        Ok(Geometry {
            object_size,
            total_slots,
        })
    }
}

fn invalid_geometry(problem: impl Into<String>) -> Error {
    Error::InvalidGeometry {
        problem: problem.into(),
    }
}
