//! Layout rules shared by the superblock header and its arena.

use static_assertions::const_assert;

use crate::SuperblockHeader;

/// Every slot handed out by a superblock is aligned to this many bytes, as is the arena start.
pub const ALIGNMENT: usize = 16;

/// The smallest permitted object size. A freed slot stores a free list link in its first bytes,
/// so it must be at least as large as a pointer, and we round that up to the alignment.
pub const MIN_OBJECT_SIZE: usize = ALIGNMENT;

/// Number of padding bytes appended after a header of `size` bytes so that whatever follows the
/// header starts on an [`ALIGNMENT`] boundary.
///
/// A header that is already a multiple of the alignment still receives a full alignment unit of
/// padding. The arena therefore never shares a 16-byte line with the header fields.
#[must_use]
pub const fn header_padding(size: usize) -> usize {
    ALIGNMENT - size % ALIGNMENT
}

/// Bytes occupied by a padded superblock header. The arena of a superblock begins exactly this
/// many bytes after the start of the header.
pub const HEADER_SIZE: usize =
    size_of::<SuperblockHeader>() + header_padding(size_of::<SuperblockHeader>());

const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(align_of::<SuperblockHeader>() <= ALIGNMENT);
const_assert!(MIN_OBJECT_SIZE >= size_of::<usize>());

#[must_use]
pub(crate) fn is_aligned(address: usize) -> bool {
    address.trailing_zeros() >= ALIGNMENT.trailing_zeros()
}
