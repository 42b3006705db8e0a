//! Provides `PrioBitmap`, a bit array structure supporting constant-time bit
//! scan operations.
use alloc::{vec, vec::Vec};
use core::fmt;

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;

/// The maximum bit count supported by [`PrioBitmap`].
pub(crate) const PRIO_BITMAP_MAX_LEN: usize = WORD_LEN * WORD_LEN;

/// A two-level bit array. The length is chosen at construction time.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone)]
pub(crate) struct PrioBitmap {
    len: usize,
    // Invariant: `first & (1 << i) != 0` iff `second[i] != 0`
    first: Word,
    second: Vec<Word>,
}

impl PrioBitmap {
    pub fn new(len: usize) -> Self {
        assert!(
            len <= PRIO_BITMAP_MAX_LEN,
            "a priority bitmap can hold at most {PRIO_BITMAP_MAX_LEN} bits"
        );
        Self {
            len,
            first: 0,
            second: vec![0; (len + WORD_LEN - 1) / WORD_LEN],
        }
    }

    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len);
        self.second[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    /// Clear the bit at the specified position.
    pub fn clear(&mut self, i: usize) {
        assert!(i < self.len);
        let group = &mut self.second[i / WORD_LEN];
        *group &= !(1 << (i % WORD_LEN));
        if *group == 0 {
            self.first &= !(1 << (i / WORD_LEN));
        }
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        assert!(i < self.len);
        self.second[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.first |= 1 << (i / WORD_LEN);
    }

    /// Get the position of the first set bit.
    pub fn find_set(&self) -> Option<usize> {
        if self.first == 0 {
            return None;
        }
        let group_i = self.first.trailing_zeros() as usize;
        let group = self.second[group_i];
        debug_assert_ne!(group, 0);
        Some(group_i * WORD_LEN + group.trailing_zeros() as usize)
    }

    fn one_digits(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.one_digits()).finish()
    }
}
