//! Atomic bit-packed array: fixed-width integers packed into `AtomicU32` words.
//!
//! Each element occupies exactly `width` bits (0, 1, 2, 4, 8, or 16), so an
//! element never straddles a word boundary and every single-element operation
//! is one atomic word operation (or a compare-exchange retry loop). There is
//! no per-element locking: callers that mutate through this layer are expected
//! to already hold the owning coordinator's update permit, which only excludes
//! representation swaps, not each other.

use std::sync::atomic::{AtomicU32, Ordering};

/// Bits per backing word.
const WORD_BITS: u32 = 32;

/// A fixed-width unsigned integer array backed by atomic 32-bit words.
pub struct AtomicBitArray {
    /// Raw storage; elements are packed little-end first within each word.
    words: Box<[AtomicU32]>,
    /// Bits per element (0, 1, 2, 4, 8, or 16).
    width: u8,
    /// Total number of logical elements.
    len: usize,
    /// `log2` of elements per word; index `i` lives in word `i >> word_shift`.
    word_shift: u32,
    /// Mask selecting the sub-index within a word.
    sub_index_mask: usize,
    /// Unshifted value mask, `(1 << width) - 1`.
    value_mask: u32,
}

impl AtomicBitArray {
    /// Creates a new array with `len` elements, all zero.
    ///
    /// # Panics
    ///
    /// Panics if `width` is not one of 0, 1, 2, 4, 8, or 16.
    pub fn new(width: u8, len: usize) -> Self {
        assert!(
            matches!(width, 0 | 1 | 2 | 4 | 8 | 16),
            "width must be 0, 1, 2, 4, 8, or 16, got {width}"
        );
        let word_count = if width == 0 {
            0
        } else {
            (len * width as usize).div_ceil(WORD_BITS as usize)
        };
        let words = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        Self::with_words(width, len, words)
    }

    /// Rebuilds an array from exported words (see [`AtomicBitArray::words`]).
    ///
    /// The word slice must hold exactly `len` elements of `width` bits; the
    /// caller validates that before handing data in.
    pub fn from_words(width: u8, len: usize, words: &[u32]) -> Self {
        let words = words.iter().map(|&w| AtomicU32::new(w)).collect();
        Self::with_words(width, len, words)
    }

    fn with_words(width: u8, len: usize, words: Box<[AtomicU32]>) -> Self {
        let (word_shift, value_mask) = if width == 0 {
            (0, 0)
        } else {
            (
                (WORD_BITS / u32::from(width)).trailing_zeros(),
                (1u32 << width) - 1,
            )
        };
        Self {
            words,
            width,
            len,
            word_shift,
            sub_index_mask: (1usize << word_shift) - 1,
            value_mask,
        }
    }

    /// Returns the element at `index`.
    pub fn get(&self, index: usize) -> u32 {
        debug_assert!(index < self.len, "index {index} out of bounds");
        if self.width == 0 {
            return 0;
        }
        let word = self.words[index >> self.word_shift].load(Ordering::Acquire);
        (word >> self.bit_offset(index)) & self.value_mask
    }

    /// Sets the element at `index`.
    pub fn set(&self, index: usize, value: u32) {
        self.get_and_set(index, value);
    }

    /// Sets the element at `index` and returns the previous value.
    pub fn get_and_set(&self, index: usize, value: u32) -> u32 {
        debug_assert!(index < self.len, "index {index} out of bounds");
        if self.width == 0 {
            debug_assert!(value == 0, "cannot store {value} in a 0-bit array");
            return 0;
        }
        debug_assert!(
            value <= self.value_mask,
            "value {value} exceeds {}-bit capacity",
            self.width
        );
        let offset = self.bit_offset(index);
        let slot = &self.words[index >> self.word_shift];
        let mut prev = slot.load(Ordering::Acquire);
        loop {
            let next = (prev & !(self.value_mask << offset)) | (value << offset);
            match slot.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return (prev >> offset) & self.value_mask,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Sets the element at `index` to `update` only if it currently equals
    /// `expect`. Returns `true` on success.
    pub fn compare_and_set(&self, index: usize, expect: u32, update: u32) -> bool {
        debug_assert!(index < self.len, "index {index} out of bounds");
        if self.width == 0 {
            return expect == 0 && update == 0;
        }
        debug_assert!(update <= self.value_mask);
        let offset = self.bit_offset(index);
        let slot = &self.words[index >> self.word_shift];
        let mut prev = slot.load(Ordering::Acquire);
        loop {
            if (prev >> offset) & self.value_mask != expect {
                return false;
            }
            let next = (prev & !(self.value_mask << offset)) | (update << offset);
            match slot.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Returns the number of bits per element.
    pub fn width(&self) -> u8 {
        self.width
    }

    /// Returns the number of logical elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies out the raw backing words.
    ///
    /// Each word is read atomically but the words are not read at a single
    /// instant; concurrent writers may tear the copy as a whole.
    pub fn words(&self) -> Vec<u32> {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect()
    }

    /// Number of backing words required for `len` elements of `width` bits.
    pub fn word_count(width: u8, len: usize) -> usize {
        if width == 0 {
            0
        } else {
            (len * width as usize).div_ceil(WORD_BITS as usize)
        }
    }

    fn bit_offset(&self, index: usize) -> u32 {
        (index & self.sub_index_mask) as u32 * u32::from(self.width)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_width_array() {
        let arr = AtomicBitArray::new(0, 64);
        assert_eq!(arr.get(0), 0);
        assert_eq!(arr.get(63), 0);
        assert!(arr.words().is_empty());
        assert!(arr.compare_and_set(5, 0, 0));
    }

    #[test]
    fn test_roundtrip_all_widths() {
        for &width in &[1u8, 2, 4, 8, 16] {
            let len = 96;
            let arr = AtomicBitArray::new(width, len);
            let modulus = 1u32 << width;
            for i in 0..len {
                arr.set(i, i as u32 % modulus);
            }
            for i in 0..len {
                assert_eq!(arr.get(i), i as u32 % modulus, "width {width}, index {i}");
            }
        }
    }

    #[test]
    fn test_get_and_set_returns_previous() {
        let arr = AtomicBitArray::new(4, 8);
        assert_eq!(arr.get_and_set(3, 9), 0);
        assert_eq!(arr.get_and_set(3, 5), 9);
        assert_eq!(arr.get(3), 5);
    }

    #[test]
    fn test_neighbors_unaffected() {
        let arr = AtomicBitArray::new(2, 16);
        for i in 0..16 {
            arr.set(i, 3);
        }
        arr.set(7, 0);
        for i in 0..16 {
            assert_eq!(arr.get(i), if i == 7 { 0 } else { 3 });
        }
    }

    #[test]
    fn test_compare_and_set() {
        let arr = AtomicBitArray::new(8, 4);
        arr.set(1, 42);
        assert!(!arr.compare_and_set(1, 41, 99), "wrong expect must fail");
        assert_eq!(arr.get(1), 42);
        assert!(arr.compare_and_set(1, 42, 99));
        assert_eq!(arr.get(1), 99);
        assert!(!arr.compare_and_set(1, 42, 7), "stale expect cannot win twice");
    }

    #[test]
    fn test_word_export_roundtrip() {
        let arr = AtomicBitArray::new(4, 40);
        for i in 0..40 {
            arr.set(i, (i as u32 * 3) % 16);
        }
        let words = arr.words();
        assert_eq!(words.len(), AtomicBitArray::word_count(4, 40));
        let back = AtomicBitArray::from_words(4, 40, &words);
        for i in 0..40 {
            assert_eq!(back.get(i), arr.get(i));
        }
    }

    #[test]
    fn test_partial_final_word() {
        // 10 elements at 16 bits is 5 words, no rounding slack; 9 elements
        // needs a half-used final word.
        assert_eq!(AtomicBitArray::word_count(16, 9), 5);
        let arr = AtomicBitArray::new(16, 9);
        arr.set(8, 0xFFFF);
        assert_eq!(arr.get(8), 0xFFFF);
    }

    #[test]
    fn test_concurrent_disjoint_writers() {
        // Writers hammer disjoint indices that share backing words; every
        // final value must be the last one its writer stored.
        let arr = Arc::new(AtomicBitArray::new(4, 64));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let arr = Arc::clone(&arr);
            handles.push(std::thread::spawn(move || {
                for round in 0..1000u32 {
                    for i in (t as usize..64).step_by(4) {
                        arr.set(i, (round + t) % 16);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..4u32 {
            for i in (t as usize..64).step_by(4) {
                assert_eq!(arr.get(i), (999 + t) % 16);
            }
        }
    }

    #[test]
    fn test_concurrent_cas_single_winner() {
        // All threads CAS the same slot from 0; exactly one may win.
        let arr = Arc::new(AtomicBitArray::new(8, 32));
        let mut handles = Vec::new();
        for t in 1..=8u32 {
            let arr = Arc::clone(&arr);
            handles.push(std::thread::spawn(move || arr.compare_and_set(0, 0, t)));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
        assert_ne!(arr.get(0), 0);
    }
}
