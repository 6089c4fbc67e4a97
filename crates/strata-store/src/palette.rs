//! The palette representation: bit-packed ids into a small value table.
//!
//! Cells store compact ids through an [`AtomicBitArray`]; the table maps ids
//! back to full values and a concurrent reverse map resolves values to ids,
//! inserting on demand. Id allocation is the only write-side coordination
//! point between concurrent mutators and it is lock-free: a bounded counter
//! increment, then an atomic insert-if-absent where racing threads keep
//! whichever id actually committed.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxBuildHasher;

use crate::backing::{Backing, NeedsUpgrade};
use crate::packed::AtomicBitArray;

/// Maps a distinct-value count's highest id to the smallest admissible
/// width in `{1, 2, 4, 8, 16}` whose capacity covers it.
pub(crate) fn round_up_width(max_id: usize) -> u8 {
    match usize::BITS - max_id.leading_zeros() {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        5..=8 => 8,
        _ => 16,
    }
}

/// Largest palette the array may use before the coordinator must go direct:
/// one quarter of the cell count.
pub(crate) fn allowed_palette_len(len: usize) -> usize {
    len >> 2
}

/// Bit-packed palette backing array.
pub(crate) struct PaletteBacking {
    /// Bits per packed id, one of `{1, 2, 4, 8, 16}`.
    width: u8,
    /// Id capacity: `min(1 << width, allowed_palette_len(len))`.
    capacity: usize,
    /// Whether `capacity` hit the allowed-palette bound; growth past this
    /// point must switch to the direct representation.
    max_size: bool,
    /// Packed id per cell.
    packed: AtomicBitArray,
    /// Id → value. Slots at or beyond the usage counter are unpublished.
    table: Box<[AtomicU32]>,
    /// Value → id, insert-if-absent under concurrent mutation.
    reverse: DashMap<u32, u16, FxBuildHasher>,
    /// Ids handed out so far (monotonic; a lost allocation race leaks one).
    used: AtomicUsize,
}

impl PaletteBacking {
    fn with_width(len: usize, width: u8) -> Self {
        let capacity = (1usize << width).min(allowed_palette_len(len));
        Self {
            width,
            capacity,
            max_size: capacity == allowed_palette_len(len),
            packed: AtomicBitArray::new(width, len),
            table: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            reverse: DashMap::with_capacity_and_hasher(
                capacity + (capacity >> 2),
                FxBuildHasher,
            ),
            used: AtomicUsize::new(0),
        }
    }

    /// Builds the palette that replaces `previous` after an allocation
    /// overflow: 1-bit for a uniform source, double width otherwise.
    pub(crate) fn expand_from(previous: &Backing) -> Self {
        let width = match previous.width() {
            0 => 1,
            w if w <= 8 => w << 1,
            _ => 16,
        };
        let palette = Self::with_width(previous.len(), width);
        palette.fill_from(previous);
        palette
    }

    /// Builds the smallest palette that holds `previous`'s current values;
    /// used by compression, never by growth.
    pub(crate) fn compressed_from(previous: &Backing, distinct: usize) -> Self {
        let palette = Self::with_width(previous.len(), round_up_width(distinct - 1));
        palette.fill_from(previous);
        palette
    }

    /// Builds a palette directly from a flat value array with a known
    /// distinct count (the bulk-replace path).
    pub(crate) fn with_initial(distinct: usize, values: &[u32]) -> Self {
        let palette = Self::with_width(values.len(), round_up_width(distinct - 1));
        for (i, &value) in values.iter().enumerate() {
            let Ok(id) = palette.id_for(value) else {
                panic!(
                    "palette overflow while loading {} values ({distinct} distinct, width {})",
                    values.len(),
                    palette.width,
                );
            };
            palette.packed.set(i, u32::from(id));
        }
        palette
    }

    /// Rebuilds a palette from an exported `(palette, width, words)` triple.
    ///
    /// The caller has already validated the width and word count; packed ids
    /// out of the table's range panic on first access.
    pub(crate) fn from_parts(len: usize, palette: &[u32], width: u8, words: &[u32]) -> Self {
        let capacity = palette.len();
        let reverse = DashMap::with_capacity_and_hasher(capacity + (capacity >> 2), FxBuildHasher);
        for (id, &value) in palette.iter().enumerate() {
            // First occurrence wins if the palette carries duplicate values.
            reverse.entry(value).or_insert(id as u16);
        }
        Self {
            width,
            capacity,
            max_size: capacity >= allowed_palette_len(len),
            packed: AtomicBitArray::from_words(width, len, words),
            table: palette.iter().map(|&v| AtomicU32::new(v)).collect(),
            reverse,
            used: AtomicUsize::new(capacity),
        }
    }

    /// Copies every cell of `previous` into this freshly built palette.
    ///
    /// Runs under the exclusive resize permit, so there are no concurrent
    /// mutators; overflow here means the width choice was wrong, which is a
    /// defect, not a runtime condition.
    fn fill_from(&self, previous: &Backing) {
        if let Backing::Uniform(u) = previous {
            // All packed ids are already zero; publishing the uniform value
            // as id 0 makes every cell read correctly. For a never-written
            // array this is the id 0 → value 0 sentinel.
            match self.id_for(u.get()) {
                Ok(0) => return,
                Ok(id) => panic!("first palette id was {id}, expected the 0 sentinel"),
                Err(NeedsUpgrade) => panic!("empty palette rejected its first value"),
            }
        }
        for i in 0..self.packed.len() {
            let value = previous.get(i);
            let Ok(id) = self.id_for(value) else {
                panic!(
                    "palette overflow while rebuilding: width {}, capacity {}",
                    self.width, self.capacity,
                );
            };
            self.packed.set(i, u32::from(id));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.packed.len()
    }

    pub(crate) fn width(&self) -> u8 {
        self.width
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn usage(&self) -> usize {
        self.used.load(Ordering::Acquire).min(self.capacity)
    }

    pub(crate) fn is_max_size(&self) -> bool {
        self.max_size
    }

    pub(crate) fn get(&self, index: usize) -> u32 {
        self.table[self.packed.get(index) as usize].load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, index: usize, value: u32) -> Result<u32, NeedsUpgrade> {
        let id = self.id_for(value)?;
        let old_id = self.packed.get_and_set(index, u32::from(id));
        Ok(self.table[old_id as usize].load(Ordering::Acquire))
    }

    /// Fails without signaling when `expect` has no id: a value absent from
    /// the palette cannot be stored anywhere in the packed array.
    pub(crate) fn compare_and_set(
        &self,
        index: usize,
        expect: u32,
        update: u32,
    ) -> Result<bool, NeedsUpgrade> {
        let Some(expect_id) = self.reverse.get(&expect).map(|id| *id) else {
            return Ok(false);
        };
        let update_id = self.id_for(update)?;
        Ok(self
            .packed
            .compare_and_set(index, u32::from(expect_id), u32::from(update_id)))
    }

    /// Resolves `value` to its id, allocating one if absent.
    ///
    /// Allocation is side-effect-free on overflow: the usage counter only
    /// advances while below capacity, so a rejected call leaves the palette
    /// exactly as it found it and the operation can be retried elsewhere.
    fn id_for(&self, value: u32) -> Result<u16, NeedsUpgrade> {
        if let Some(id) = self.reverse.get(&value) {
            return Ok(*id);
        }
        let Ok(id) = self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            (used < self.capacity).then_some(used + 1)
        }) else {
            return Err(NeedsUpgrade);
        };
        match self.reverse.entry(value) {
            // Lost the insertion race: keep the id that committed. Our
            // reserved id stays unused (bounded by the thread count).
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                // Publish the table slot before the id becomes resolvable.
                self.table[id].store(value, Ordering::Release);
                entry.insert(id as u16);
                Ok(id as u16)
            }
        }
    }

    /// The id → value table up to the current usage. Slots leaked to lost
    /// allocation races export as value 0.
    pub(crate) fn palette(&self) -> Vec<u32> {
        (0..self.usage())
            .map(|id| self.table[id].load(Ordering::Acquire))
            .collect()
    }

    pub(crate) fn packed_words(&self) -> Vec<u32> {
        self.packed.words()
    }

    /// The raw packed id at `index`, for construction-time validation.
    pub(crate) fn packed_id(&self, index: usize) -> u32 {
        self.packed.get(index)
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
    fn test_round_up_width_thresholds() {
        assert_eq!(round_up_width(0), 1);
        assert_eq!(round_up_width(1), 1);
        assert_eq!(round_up_width(2), 2);
        assert_eq!(round_up_width(3), 2);
        assert_eq!(round_up_width(4), 4);
        assert_eq!(round_up_width(15), 4);
        assert_eq!(round_up_width(16), 8);
        assert_eq!(round_up_width(255), 8);
        assert_eq!(round_up_width(256), 16);
        assert_eq!(round_up_width(65535), 16);
    }

    #[test]
    fn test_allowed_palette_is_quarter_of_volume() {
        assert_eq!(allowed_palette_len(4096), 1024);
        assert_eq!(allowed_palette_len(64), 16);
    }

    fn grown_from_zero(len: usize) -> PaletteBacking {
        PaletteBacking::expand_from(&Backing::new_uniform(len))
    }

    #[test]
    fn test_sentinel_id_zero_maps_to_zero() {
        let palette = grown_from_zero(64);
        assert_eq!(palette.width(), 1);
        assert_eq!(palette.usage(), 1);
        assert_eq!(palette.palette(), vec![0]);
        for i in 0..64 {
            assert_eq!(palette.get(i), 0, "never-written cells read as zero");
        }
    }

    #[test]
    fn test_set_returns_previous_value() {
        let palette = grown_from_zero(64);
        assert_eq!(palette.set(5, 40), Ok(0));
        assert_eq!(palette.set(5, 0), Ok(40));
    }

    #[test]
    fn test_overflow_signals_without_side_effects() {
        // Width 1, capacity 2: ids for 0 and 40 fill it.
        let palette = grown_from_zero(64);
        palette.set(0, 40).unwrap();
        let usage = palette.usage();
        assert_eq!(palette.set(1, 41), Err(NeedsUpgrade));
        assert_eq!(palette.usage(), usage, "rejected set must not allocate");
        assert_eq!(palette.get(1), 0, "rejected set must not write");
    }

    #[test]
    fn test_compare_and_set_unknown_expect_fails_silently() {
        let palette = grown_from_zero(64);
        assert_eq!(palette.compare_and_set(0, 99, 40), Ok(false));
        assert_eq!(palette.usage(), 1, "no id may be allocated for update");
    }

    #[test]
    fn test_compare_and_set_allocates_update_id() {
        let palette = grown_from_zero(64);
        assert_eq!(palette.compare_and_set(0, 0, 40), Ok(true));
        assert_eq!(palette.get(0), 40);
        // Stale expectation cannot win twice.
        assert_eq!(palette.compare_and_set(0, 0, 40), Ok(false));
    }

    #[test]
    fn test_expand_doubles_width_and_preserves_values() {
        let palette = grown_from_zero(64);
        palette.set(0, 40).unwrap();
        let wider = PaletteBacking::expand_from(&Backing::Palette(palette));
        assert_eq!(wider.width(), 2);
        assert_eq!(wider.get(0), 40);
        for i in 1..64 {
            assert_eq!(wider.get(i), 0);
        }
        wider.set(1, 41).unwrap();
        wider.set(2, 42).unwrap();
        assert_eq!(wider.set(3, 43), Err(NeedsUpgrade), "2-bit palette is full");
    }

    #[test]
    fn test_from_parts_roundtrip() {
        let palette = grown_from_zero(64);
        palette.set(0, 40).unwrap();
        let rebuilt = PaletteBacking::from_parts(
            64,
            &palette.palette(),
            palette.width(),
            &palette.packed_words(),
        );
        for i in 0..64 {
            assert_eq!(rebuilt.get(i), palette.get(i));
        }
        // The rebuilt reverse map must resolve existing values, not realloc.
        assert_eq!(rebuilt.set(9, 40), Ok(0));
        assert_eq!(rebuilt.usage(), 2);
    }

    #[test]
    fn test_concurrent_allocation_single_id_per_value() {
        // Many threads race to insert the same new value; all must end up
        // using the same committed id.
        let palette = Arc::new(PaletteBacking::expand_from(&Backing::new_uniform(4096)));
        let mut handles = Vec::new();
        for t in 0..8usize {
            let palette = Arc::clone(&palette);
            handles.push(std::thread::spawn(move || {
                palette.set(t, 77).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8 {
            assert_eq!(palette.get(t), 77);
        }
        let ids: Vec<u32> = (0..8).map(|i| palette.packed_words()[0] >> i & 1).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]), "one id for one value");
    }
}
