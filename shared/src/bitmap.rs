//! A fixed-size array of bits packed into machine words.

use alloc::{boxed::Box, vec};

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Box<[u64]>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the value of bit `idx`.
    ///
    /// Panics if `idx` is out of range.
    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        self.words[idx / WORD_BITS] >> (idx % WORD_BITS) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        let word = &mut self.words[idx / WORD_BITS];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Clears bit `idx`, returning its previous value.
    pub fn reset(&mut self, idx: usize) -> bool {
        let was_set = self.test(idx);
        self.set(idx, false);
        was_set
    }

    /// Finds the first clear bit, sets it, and returns its index.
    ///
    /// Returns [`None`] if every bit is set.
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let idx = i * WORD_BITS + (!*word).trailing_zeros() as usize;
            // The tail of the last word is padding, not real bits.
            if idx >= self.len {
                return None;
            }
            *word |= 1 << (idx % WORD_BITS);
            return Some(idx);
        }
        None
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}
