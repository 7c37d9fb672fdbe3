//! Bitmap allocator.
//!
//! A [`BitVector`] tracks the free/used state of fixed-size allocation units, one bit
//! per unit. It knows nothing about addresses or segments; the remote memory manager
//! and the dynamic memory mapper translate between bit indices and device addresses.
//!
//! Searches are lowest-index-first. This keeps allocations packed toward the bottom of
//! a segment, which matters for segments whose upper part is handed out as overlay
//! memory through reservations.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{Error, Result};

const BITS_PER_WORD: usize = usize::BITS as usize;

/// A fixed-length packed vector of bits.
///
/// Bits at indices `>= len()` exist only as padding in the last word. They are never
/// tested, set, or reported by a search.
#[derive(Clone, PartialEq, Eq)]
pub struct BitVector {
    words: Box<[usize]>,
    length: usize,
}

impl BitVector {
    /// Creates a vector of `length` bits, all clear.
    ///
    /// Returns [`Error::OutOfMemory`] if the backing storage cannot be obtained.
    pub fn new(length: usize) -> Result<Self> {
        let word_count = length.div_ceil(BITS_PER_WORD);
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| Error::OutOfMemory)?;
        words.resize(word_count, 0);

        Ok(Self {
            words: words.into_boxed_slice(),
            length,
        })
    }

    /// Returns the number of valid bits.
    #[inline]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Returns true if the vector holds no bits at all.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of backing words.
    #[inline]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Sets `bit`. The caller guarantees `bit < len()`.
    #[inline]
    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.length, "bit {bit} out of range");
        self.words[bit / BITS_PER_WORD] |= 1 << (bit % BITS_PER_WORD);
    }

    /// Clears `bit`. The caller guarantees `bit < len()`.
    #[inline]
    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.length, "bit {bit} out of range");
        self.words[bit / BITS_PER_WORD] &= !(1 << (bit % BITS_PER_WORD));
    }

    /// Returns whether `bit` is set.
    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.length, "bit {bit} out of range");
        self.words[bit / BITS_PER_WORD] & (1 << (bit % BITS_PER_WORD)) != 0
    }

    /// Returns the lowest clear bit, or `None` if every bit in `[0, len())` is set.
    pub fn find_first_clear(&self) -> Option<usize> {
        self.find_next_clear(0)
    }

    /// Returns the lowest clear bit at or above `from`.
    pub fn find_next_clear(&self, from: usize) -> Option<usize> {
        if from >= self.length {
            return None;
        }

        let mut index = from / BITS_PER_WORD;
        // Ignore bits below `from` in the first word.
        let mut mask = usize::MAX << (from % BITS_PER_WORD);

        while index < self.words.len() {
            let free = !self.words[index] & mask;
            if free != 0 {
                let bit = index * BITS_PER_WORD + free.trailing_zeros() as usize;
                // The scan stops at `length`, not at the word boundary.
                return (bit < self.length).then_some(bit);
            }
            mask = usize::MAX;
            index += 1;
        }

        None
    }

    /// Finds the lowest clear bit and sets it.
    pub fn find_and_set(&mut self) -> Option<usize> {
        let bit = self.find_first_clear()?;
        self.set(bit);
        Some(bit)
    }

    /// Sets `count` bits starting at `start`.
    pub fn set_range(&mut self, start: usize, count: usize) {
        for bit in start..start + count {
            self.set(bit);
        }
    }

    /// Clears `count` bits starting at `start`.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        for bit in start..start + count {
            self.clear(bit);
        }
    }

    /// Returns true if `[start, start + count)` lies inside the vector and is entirely clear.
    pub fn is_range_clear(&self, start: usize, count: usize) -> bool {
        match start.checked_add(count) {
            Some(end) if end <= self.length => (start..end).all(|bit| !self.test(bit)),
            _ => false,
        }
    }

    /// Returns the first index `>= from` that starts a clear run of `count` bits.
    pub fn find_clear_run(&self, from: usize, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }

        let mut candidate = self.find_next_clear(from)?;
        loop {
            if candidate.checked_add(count)? > self.length {
                return None;
            }
            match (candidate..candidate + count).find(|&bit| self.test(bit)) {
                None => return Some(candidate),
                Some(used) => candidate = self.find_next_clear(used + 1)?,
            }
        }
    }

    /// Returns the number of set bits.
    pub fn count_set(&self) -> usize {
        let full_words = self.length / BITS_PER_WORD;
        let mut count: usize = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum();

        let tail = self.length % BITS_PER_WORD;
        if tail != 0 {
            let mask = (1usize << tail) - 1;
            count += (self.words[full_words] & mask).count_ones() as usize;
        }
        count
    }

    /// Returns an iterator over maximal clear runs as `(start, length)` pairs.
    pub fn clear_runs(&self) -> ClearRuns<'_> {
        ClearRuns {
            bits: self,
            next: 0,
        }
    }
}

impl core::fmt::Debug for BitVector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitVector")
            .field("length", &self.length)
            .field("set", &self.count_set())
            .finish()
    }
}

/// Iterator over the maximal clear runs of a [`BitVector`].
pub struct ClearRuns<'a> {
    bits: &'a BitVector,
    next: usize,
}

impl Iterator for ClearRuns<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.bits.find_next_clear(self.next)?;
        let mut end = start + 1;
        while end < self.bits.len() && !self.bits.test(end) {
            end += 1;
        }
        self.next = end;
        Some((start, end - start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        let bits = BitVector::new(100).unwrap();
        assert_eq!(bits.len(), 100);
        assert_eq!(bits.word_count(), 100usize.div_ceil(BITS_PER_WORD));
        assert!((0..100).all(|b| !bits.test(b)));
        assert_eq!(bits.find_first_clear(), Some(0));
        assert_eq!(bits.count_set(), 0);
    }

    #[test]
    fn test_reflects_latest_set_or_clear() {
        let mut bits = BitVector::new(70).unwrap();
        bits.set(3);
        bits.set(64);
        bits.clear(3);
        bits.set(69);
        assert!(!bits.test(3));
        assert!(bits.test(64));
        assert!(bits.test(69));
        assert_eq!(bits.count_set(), 2);
    }

    #[test]
    fn find_first_clear_returns_lowest() {
        let mut bits = BitVector::new(10).unwrap();
        bits.set(0);
        bits.set(1);
        bits.set(3);
        assert_eq!(bits.find_first_clear(), Some(2));
        assert_eq!(bits.find_next_clear(3), Some(4));
    }

    #[test]
    fn find_stops_at_length_not_word_boundary() {
        // 5 valid bits in a word with plenty of clear padding above them.
        let mut bits = BitVector::new(5).unwrap();
        for b in 0..5 {
            bits.set(b);
        }
        assert_eq!(bits.find_first_clear(), None);
        assert_eq!(bits.find_and_set(), None);
    }

    #[test]
    fn find_crosses_word_boundaries() {
        let length = BITS_PER_WORD * 2 + 3;
        let mut bits = BitVector::new(length).unwrap();
        bits.set_range(0, BITS_PER_WORD + 1);
        assert_eq!(bits.find_first_clear(), Some(BITS_PER_WORD + 1));
        bits.set_range(BITS_PER_WORD + 1, length - BITS_PER_WORD - 2);
        assert_eq!(bits.find_first_clear(), Some(length - 1));
        bits.set(length - 1);
        assert_eq!(bits.find_first_clear(), None);
    }

    #[test]
    fn find_and_set_claims_in_order() {
        let mut bits = BitVector::new(3).unwrap();
        assert_eq!(bits.find_and_set(), Some(0));
        assert_eq!(bits.find_and_set(), Some(1));
        bits.clear(0);
        assert_eq!(bits.find_and_set(), Some(0));
        assert_eq!(bits.find_and_set(), Some(2));
        assert_eq!(bits.find_and_set(), None);
    }

    #[test]
    fn clear_runs_and_ranges() {
        let mut bits = BitVector::new(16).unwrap();
        bits.set_range(2, 3);
        bits.set(10);

        assert!(bits.is_range_clear(5, 5));
        assert!(!bits.is_range_clear(4, 2));
        assert!(!bits.is_range_clear(12, 5));

        assert_eq!(bits.find_clear_run(0, 2), Some(0));
        assert_eq!(bits.find_clear_run(0, 3), Some(5));
        assert_eq!(bits.find_clear_run(0, 6), None);
        assert_eq!(bits.find_clear_run(6, 5), Some(11));

        let runs: Vec<_> = bits.clear_runs().collect();
        assert_eq!(runs, vec![(0, 2), (5, 5), (11, 5)]);

        bits.clear_range(2, 3);
        assert_eq!(bits.count_set(), 1);
    }

    #[test]
    fn empty_vector() {
        let mut bits = BitVector::new(0).unwrap();
        assert!(bits.is_empty());
        assert_eq!(bits.find_first_clear(), None);
        assert_eq!(bits.find_and_set(), None);
        assert_eq!(bits.clear_runs().count(), 0);
    }
}
