const BITS_PER_WORD: usize = 64;

/// One bit per slot, set while the slot is allocated.
///
/// Slots that were freed while pinned stay marked until their unpin completes the free, so the
/// map agrees with the allocated slot count at all times.
#[derive(Debug)]
pub(crate) struct AllocationMap {
    words: Vec<u64>,
}

impl AllocationMap {
    #[must_use]
    pub(crate) fn new(slot_count: usize) -> Self {
        Self {
            words: vec![0; slot_count.div_ceil(BITS_PER_WORD)],
        }
    }

    #[must_use]
    pub(crate) fn is_set(&self, index: usize) -> bool {
        let (word, mask) = locate(index);

        self.words
            .get(word)
            .is_some_and(|bits| bits & mask != 0)
    }

    /// Marks the slot as allocated, returning whether it was unmarked before.
    pub(crate) fn set(&mut self, index: usize) -> bool {
        let (word, mask) = locate(index);
        let bits = self
            .words
            .get_mut(word)
            .expect("slot index is always within the slot count");

        let was_clear = *bits & mask == 0;
        *bits |= mask;
        was_clear
    }

    /// Marks the slot as not allocated, returning whether it was marked before.
    pub(crate) fn clear(&mut self, index: usize) -> bool {
        let (word, mask) = locate(index);
        let bits = self
            .words
            .get_mut(word)
            .expect("slot index is always within the slot count");

        let was_set = *bits & mask != 0;
        *bits &= !mask;
        was_set
    }

    pub(crate) fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of marked slots.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Only used for diagnostics and assertions.
    pub(crate) fn count(&self) -> usize {
        self.words
            .iter()
            .map(|bits| usize::try_from(bits.count_ones()).expect("at most 64 bits per word"))
            .sum()
    }
}

fn locate(index: usize) -> (usize, u64) {
    let word = index
        .checked_div(BITS_PER_WORD)
        .expect("word size is never zero");
    let bit = index
        .checked_rem(BITS_PER_WORD)
        .expect("word size is never zero");

    let mask = u32::try_from(bit)
        .ok()
        .and_then(|bit| 1_u64.checked_shl(bit))
        .expect("bit position is below the word size");

    (word, mask)
}
