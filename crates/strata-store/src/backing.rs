//! Backing representations for the concurrent cell array.
//!
//! Exactly one representation is active at a time and it is replaced
//! wholesale, never mutated in shape: `Uniform` (one value for every cell),
//! `Palette` (bit-packed ids into a small value table), or `Direct` (one
//! full-width value per cell). A representation that cannot encode a
//! requested value reports [`NeedsUpgrade`]; the coordinator catches that,
//! installs the next larger representation, and retries. `Direct` is
//! terminal and never signals.

use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashSet;

use crate::palette::{PaletteBacking, allowed_palette_len};

/// Control signal: the current representation cannot encode the value.
///
/// This is expected, frequent control flow between the representation layer
/// and the coordinator, not an error; it must be raised before any visible
/// mutation so the operation can be retried against a larger representation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct NeedsUpgrade;

/// The active in-memory encoding of a cell array.
pub(crate) enum Backing {
    /// Every cell holds the same value; O(1) in space.
    Uniform(UniformBacking),
    /// Bit-packed palette ids plus an id → value table.
    Palette(PaletteBacking),
    /// One full-width value per cell; terminal for growth.
    Direct(DirectBacking),
}

impl Backing {
    /// A fresh all-zero array: the construction-time representation.
    pub(crate) fn new_uniform(len: usize) -> Self {
        Backing::Uniform(UniformBacking::new(len, 0))
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Backing::Uniform(u) => u.len,
            Backing::Palette(p) => p.len(),
            Backing::Direct(d) => d.cells.len(),
        }
    }

    /// Bits allocated per cell: 0 (uniform), the palette width, or 32.
    pub(crate) fn width(&self) -> u8 {
        match self {
            Backing::Uniform(_) => 0,
            Backing::Palette(p) => p.width(),
            Backing::Direct(_) => 32,
        }
    }

    pub(crate) fn get(&self, index: usize) -> u32 {
        match self {
            Backing::Uniform(u) => u.get(),
            Backing::Palette(p) => p.get(index),
            Backing::Direct(d) => d.get(index),
        }
    }

    /// Stores `value` at `index`, returning the previous value, or signals
    /// that this representation cannot hold `value`.
    pub(crate) fn set(&self, index: usize, value: u32) -> Result<u32, NeedsUpgrade> {
        match self {
            Backing::Uniform(u) => u.set(value),
            Backing::Palette(p) => p.set(index, value),
            Backing::Direct(d) => Ok(d.set(index, value)),
        }
    }

    /// Atomically replaces the value at `index` with `update` if it equals
    /// `expect`. `Ok(false)` means the expectation failed; `NeedsUpgrade`
    /// means `update` cannot be encoded here (and nothing was changed).
    pub(crate) fn compare_and_set(
        &self,
        index: usize,
        expect: u32,
        update: u32,
    ) -> Result<bool, NeedsUpgrade> {
        match self {
            Backing::Uniform(u) => u.compare_and_set(expect, update),
            Backing::Palette(p) => p.compare_and_set(index, expect, update),
            Backing::Direct(d) => Ok(d.compare_and_set(index, expect, update)),
        }
    }

    /// Builds the next larger representation holding the same cell values.
    ///
    /// Growth is monotonic: `Uniform` becomes a 1-bit `Palette`, a `Palette`
    /// doubles its width, and a `Palette` at its maximum allowed size (or
    /// already at 16-bit width) becomes `Direct`.
    ///
    /// # Panics
    ///
    /// Panics if called on `Direct`; it never signals [`NeedsUpgrade`], so a
    /// grow request against it is a broken coordinator.
    pub(crate) fn grown(&self) -> Backing {
        match self {
            Backing::Uniform(_) => Backing::Palette(PaletteBacking::expand_from(self)),
            Backing::Palette(p) if p.is_max_size() || p.width() >= 16 => {
                Backing::Direct(DirectBacking::from_backing(self))
            }
            Backing::Palette(_) => Backing::Palette(PaletteBacking::expand_from(self)),
            Backing::Direct(_) => panic!("direct representation asked to grow"),
        }
    }

    /// Counts distinct cell values, recording each one in `seen`.
    ///
    /// The returned count covers this array alone, even when `seen` already
    /// holds entries from elsewhere.
    pub(crate) fn distinct_into(&self, seen: &mut FxHashSet<u32>) -> usize {
        match self {
            Backing::Uniform(u) => {
                seen.insert(u.get());
                1
            }
            _ => {
                let mut local = FxHashSet::default();
                for i in 0..self.len() {
                    local.insert(self.get(i));
                }
                seen.extend(local.iter().copied());
                local.len()
            }
        }
    }

    /// The value table in use, or an empty vector for `Direct` (whose packed
    /// array is already flat). `Uniform` reports its single value.
    pub(crate) fn palette(&self) -> Vec<u32> {
        match self {
            Backing::Uniform(u) => vec![u.get()],
            Backing::Palette(p) => p.palette(),
            Backing::Direct(_) => Vec::new(),
        }
    }

    /// The packed word array: bit-packed ids for `Palette`, flat cell values
    /// for `Direct`, empty for `Uniform`.
    pub(crate) fn packed_words(&self) -> Vec<u32> {
        match self {
            Backing::Uniform(_) => Vec::new(),
            Backing::Palette(p) => p.packed_words(),
            Backing::Direct(d) => d.values(),
        }
    }

    /// Palette id capacity (1 for `Uniform`, cell count for `Direct`).
    pub(crate) fn palette_capacity(&self) -> usize {
        match self {
            Backing::Uniform(_) => 1,
            Backing::Palette(p) => p.capacity(),
            Backing::Direct(d) => d.cells.len(),
        }
    }

    /// Palette ids handed out so far.
    pub(crate) fn palette_usage(&self) -> usize {
        match self {
            Backing::Uniform(_) => 1,
            Backing::Palette(p) => p.usage(),
            Backing::Direct(d) => d.cells.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Uniform
// ---------------------------------------------------------------------------

/// Single-value representation: the whole array reads as one value.
pub(crate) struct UniformBacking {
    len: usize,
    value: u32,
}

impl UniformBacking {
    pub(crate) fn new(len: usize, value: u32) -> Self {
        Self { len, value }
    }

    /// Collapses any representation known to hold exactly one distinct value.
    pub(crate) fn from_backing(previous: &Backing) -> Self {
        Self::new(previous.len(), previous.get(0))
    }

    pub(crate) fn get(&self) -> u32 {
        self.value
    }

    fn set(&self, value: u32) -> Result<u32, NeedsUpgrade> {
        if value == self.value {
            Ok(self.value)
        } else {
            Err(NeedsUpgrade)
        }
    }

    fn compare_and_set(&self, expect: u32, update: u32) -> Result<bool, NeedsUpgrade> {
        if expect != self.value {
            Ok(false)
        } else if update == self.value {
            Ok(true)
        } else {
            Err(NeedsUpgrade)
        }
    }
}

// ---------------------------------------------------------------------------
// Direct
// ---------------------------------------------------------------------------

/// Full-width representation: one `AtomicU32` per cell, no packing.
pub(crate) struct DirectBacking {
    cells: Box<[AtomicU32]>,
}

impl DirectBacking {
    /// Copies every cell out of an overflowing smaller representation.
    pub(crate) fn from_backing(previous: &Backing) -> Self {
        Self::from_values_iter(previous.len(), (0..previous.len()).map(|i| previous.get(i)))
    }

    pub(crate) fn from_values(values: &[u32]) -> Self {
        Self::from_values_iter(values.len(), values.iter().copied())
    }

    fn from_values_iter(len: usize, values: impl Iterator<Item = u32>) -> Self {
        let cells: Box<[AtomicU32]> = values.take(len).map(AtomicU32::new).collect();
        debug_assert_eq!(cells.len(), len);
        Self { cells }
    }

    fn get(&self, index: usize) -> u32 {
        self.cells[index].load(Ordering::Acquire)
    }

    fn set(&self, index: usize, value: u32) -> u32 {
        self.cells[index].swap(value, Ordering::AcqRel)
    }

    fn compare_and_set(&self, index: usize, expect: u32, update: u32) -> bool {
        self.cells[index]
            .compare_exchange(expect, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn values(&self) -> Vec<u32> {
        self.cells
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .collect()
    }
}

/// Picks the smallest representation for a known distinct-value count.
pub(crate) fn choose_for_values(values: &[u32], distinct: usize) -> Backing {
    if distinct <= 1 {
        Backing::Uniform(UniformBacking::new(
            values.len(),
            values.first().copied().unwrap_or(0),
        ))
    } else if distinct > allowed_palette_len(values.len()) {
        Backing::Direct(DirectBacking::from_values(values))
    } else {
        Backing::Palette(PaletteBacking::with_initial(distinct, values))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_set_same_value_is_noop() {
        let backing = Backing::new_uniform(64);
        assert_eq!(backing.set(10, 0), Ok(0));
        assert_eq!(backing.get(10), 0);
    }

    #[test]
    fn test_uniform_set_new_value_signals_upgrade() {
        let backing = Backing::new_uniform(64);
        assert_eq!(backing.set(10, 7), Err(NeedsUpgrade));
        // Signaling must not have changed anything.
        assert_eq!(backing.get(10), 0);
    }

    #[test]
    fn test_uniform_compare_and_set() {
        let backing = Backing::Uniform(UniformBacking::new(64, 5));
        assert_eq!(backing.compare_and_set(0, 4, 9), Ok(false));
        assert_eq!(backing.compare_and_set(0, 5, 5), Ok(true));
        assert_eq!(backing.compare_and_set(0, 5, 9), Err(NeedsUpgrade));
    }

    #[test]
    fn test_uniform_grows_to_one_bit_palette() {
        let backing = Backing::new_uniform(64);
        let grown = backing.grown();
        assert!(matches!(grown, Backing::Palette(_)));
        assert_eq!(grown.width(), 1);
        for i in 0..64 {
            assert_eq!(grown.get(i), 0, "growth must preserve cell values");
        }
        assert_eq!(grown.set(3, 9), Ok(0));
        assert_eq!(grown.get(3), 9);
    }

    #[test]
    fn test_direct_never_signals() {
        let backing = Backing::Direct(DirectBacking::from_values(&vec![0; 32]));
        for value in [1u32, 500, u32::MAX] {
            assert!(backing.set(0, value).is_ok());
        }
        assert_eq!(backing.get(0), u32::MAX);
        assert_eq!(backing.compare_and_set(0, u32::MAX, 3), Ok(true));
        assert_eq!(backing.compare_and_set(0, u32::MAX, 3), Ok(false));
    }

    #[test]
    #[should_panic(expected = "asked to grow")]
    fn test_direct_grow_is_a_defect() {
        let backing = Backing::Direct(DirectBacking::from_values(&[0; 4]));
        let _ = backing.grown();
    }

    #[test]
    fn test_distinct_counts_this_array_only() {
        let backing = Backing::Direct(DirectBacking::from_values(&[1, 1, 2, 3]));
        let mut seen = FxHashSet::default();
        seen.insert(2); // pre-seeded by another store
        assert_eq!(backing.distinct_into(&mut seen), 3);
        assert!(seen.contains(&1) && seen.contains(&2) && seen.contains(&3));
    }

    #[test]
    fn test_choose_for_values() {
        let uniform = choose_for_values(&[7; 4096], 1);
        assert!(matches!(uniform, Backing::Uniform(_)));
        assert_eq!(uniform.get(11), 7);

        let two: Vec<u32> = (0..4096).map(|i| i % 2).collect();
        let palette = choose_for_values(&two, 2);
        assert!(matches!(palette, Backing::Palette(_)));
        assert_eq!(palette.width(), 1);

        let wide: Vec<u32> = (0..4096).map(|i| i % 1500).collect();
        let direct = choose_for_values(&wide, 1500);
        assert!(matches!(direct, Backing::Direct(_)));
        for i in 0..4096u32 {
            assert_eq!(direct.get(i as usize), i % 1500);
        }
    }
}
