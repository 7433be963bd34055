//! Fixed-capacity two-dimensional bitmap
//!
//! A `BitmaskArray` holds `count` entries of `size` bits each, packed into
//! 64-bit words. Coding routines use one entry per stripe as a chunk liveness
//! map; stripe list generation uses one entry per list to remember which
//! nodes have already been picked.

use std::fmt;

const WORD_BITS: usize = 64;

#[derive(Clone, PartialEq, Eq)]
pub struct BitmaskArray {
    size: usize,
    count: usize,
    words: Vec<u64>,
}

impl BitmaskArray {
    /// Allocate `size * count` zeroed bits
    pub fn new(size: usize, count: usize) -> Self {
        let bits = size * count;
        Self {
            size,
            count,
            words: vec![0; (bits + WORD_BITS - 1) / WORD_BITS],
        }
    }

    /// Bits per entry
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of entries
    pub fn entries(&self) -> usize {
        self.count
    }

    #[inline]
    fn locate(&self, entry: usize, bit: usize) -> (usize, u64) {
        assert!(
            entry < self.count && bit < self.size,
            "bit ({}, {}) outside {}x{} bitmask",
            entry,
            bit,
            self.count,
            self.size
        );
        let pos = entry * self.size + bit;
        (pos / WORD_BITS, 1u64 << (pos % WORD_BITS))
    }

    pub fn set(&mut self, entry: usize, bit: usize) {
        let (word, mask) = self.locate(entry, bit);
        self.words[word] |= mask;
    }

    pub fn unset(&mut self, entry: usize, bit: usize) {
        let (word, mask) = self.locate(entry, bit);
        self.words[word] &= !mask;
    }

    pub fn check(&self, entry: usize, bit: usize) -> bool {
        let (word, mask) = self.locate(entry, bit);
        self.words[word] & mask != 0
    }

    /// Zero every bit of one entry
    pub fn clear(&mut self, entry: usize) {
        assert!(entry < self.count, "entry {} outside bitmask", entry);
        let mut pos = entry * self.size;
        let end = pos + self.size;

        // Leading bits up to the next word boundary
        while pos < end && pos % WORD_BITS != 0 {
            self.words[pos / WORD_BITS] &= !(1u64 << (pos % WORD_BITS));
            pos += 1;
        }
        // Whole words
        while pos + WORD_BITS <= end {
            self.words[pos / WORD_BITS] = 0;
            pos += WORD_BITS;
        }
        // Trailing bits
        while pos < end {
            self.words[pos / WORD_BITS] &= !(1u64 << (pos % WORD_BITS));
            pos += 1;
        }
    }

    /// Number of set bits in one entry
    pub fn count(&self, entry: usize) -> usize {
        self.ones(entry).count()
    }

    /// Indices of the set bits in one entry, ascending
    pub fn ones(&self, entry: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&bit| self.check(entry, bit))
    }

    /// Indices of the unset bits in one entry, ascending
    pub fn zeros(&self, entry: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&bit| !self.check(entry, bit))
    }

    /// XOR entry `src` of `other` into entry `dst` of `self`
    ///
    /// Both arrays must share the same entry size.
    pub fn xor_entry(&mut self, dst: usize, other: &BitmaskArray, src: usize) {
        assert_eq!(self.size, other.size, "bitmask entry sizes differ");
        for bit in other.ones(src) {
            let (word, mask) = self.locate(dst, bit);
            self.words[word] ^= mask;
        }
    }
}

impl fmt::Debug for BitmaskArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for entry in 0..self.count {
            let bits: String = (0..self.size)
                .map(|bit| if self.check(entry, bit) { '1' } else { '0' })
                .collect();
            list.entry(&bits);
        }
        list.finish()
    }
}
