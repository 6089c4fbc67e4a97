//! Concurrent cell array coordinator.
//!
//! [`AtomicCellArray`] owns an atomically swappable reference to the current
//! backing representation and arbitrates many concurrent accessors against
//! representation swaps. Reads are wait-free: they load the current backing
//! and delegate, never taking a permit. Writes run under the shared update
//! permit and resolve the representation's "needs upgrade" signal with a
//! bounded upgrade-and-retry loop; growth is monotonic,
//! `Uniform → Palette(1) → Palette(2) → Palette(4) → Palette(8) →
//! Palette(16) → Direct`, at most six steps for any single write.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;

use crate::backing::{self, Backing, NeedsUpgrade};
use crate::error::StoreError;
use crate::packed::AtomicBitArray;
use crate::palette::{self, PaletteBacking};
use crate::permit::Permits;

/// An atomic fixed-length `u32` array that picks the cheapest in-memory
/// encoding for the values currently present.
pub struct AtomicCellArray {
    len: usize,
    backing: ArcSwap<Backing>,
    permits: Permits,
}

impl AtomicCellArray {
    /// Creates an all-zero array of `len` cells in the uniform encoding.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            backing: ArcSwap::from_pointee(Backing::new_uniform(len)),
            permits: Permits::new(),
        }
    }

    /// Returns the number of cells.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the array has no cells.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bits currently allocated per cell (0 uniform, 1–16 palette, 32 direct).
    pub fn width(&self) -> u8 {
        self.backing.load().width()
    }

    /// Returns `true` while the array is in the single-value encoding.
    pub fn is_uniform(&self) -> bool {
        matches!(**self.backing.load(), Backing::Uniform(_))
    }

    /// Id capacity of the current palette (1 when uniform, `len` when direct).
    pub fn palette_capacity(&self) -> usize {
        self.backing.load().palette_capacity()
    }

    /// Palette ids handed out so far in the current representation.
    pub fn palette_usage(&self) -> usize {
        self.backing.load().palette_usage()
    }

    /// Returns the value at `index`.
    ///
    /// Wait-free: reads a consistent snapshot of the current representation
    /// and may race a swap, but never observes a partially built one.
    pub fn get(&self, index: usize) -> u32 {
        self.backing.load().get(index)
    }

    /// Stores `value` at `index` and returns the previous value.
    ///
    /// Proceeds concurrently with other writers; blocks only while a
    /// representation swap is in progress.
    pub fn set(&self, index: usize, value: u32) -> u32 {
        loop {
            {
                let _update = self.permits.update();
                if let Ok(old) = self.backing.load().set(index, value) {
                    return old;
                }
            }
            if let Some(old) = self.upgrade(|backing| backing.set(index, value)) {
                return old;
            }
        }
    }

    /// Stores `update` at `index` only if the current value equals `expect`.
    pub fn compare_and_set(&self, index: usize, expect: u32, update: u32) -> bool {
        loop {
            {
                let _update = self.permits.update();
                if let Ok(done) = self.backing.load().compare_and_set(index, expect, update) {
                    return done;
                }
            }
            if let Some(done) = self.upgrade(|backing| backing.compare_and_set(index, expect, update))
            {
                return done;
            }
        }
    }

    /// Takes the resize permit, re-checks the operation (another thread may
    /// already have grown the representation), and otherwise installs the
    /// next larger one. Returns the operation's result if the re-check won.
    fn upgrade<T>(&self, op: impl Fn(&Backing) -> Result<T, NeedsUpgrade>) -> Option<T> {
        let _resize = self.permits.resize();
        let current = self.backing.load_full();
        match op(&current) {
            Ok(value) => Some(value),
            Err(NeedsUpgrade) => {
                let next = current.grown();
                tracing::trace!(
                    from = current.width(),
                    to = next.width(),
                    len = self.len,
                    "cell array representation grown"
                );
                self.backing.store(Arc::new(next));
                None
            }
        }
    }

    /// Replaces the whole array with `values`, choosing the smallest
    /// representation for their distinct count in one step.
    ///
    /// # Errors
    ///
    /// [`StoreError::LengthMismatch`] if `values` is not exactly `len` long.
    pub fn replace_all(&self, values: &[u32]) -> Result<(), StoreError> {
        let _resize = self.permits.resize();
        self.check_len(values.len())?;
        let distinct = values.iter().collect::<FxHashSet<_>>().len();
        self.backing
            .store(Arc::new(backing::choose_for_values(values, distinct)));
        Ok(())
    }

    /// Replaces the whole array with `values` in the direct encoding,
    /// skipping the distinct-count scan and any compression.
    pub fn replace_all_uncompressed(&self, values: &[u32]) -> Result<(), StoreError> {
        let _resize = self.permits.resize();
        self.check_len(values.len())?;
        self.backing.store(Arc::new(Backing::Direct(
            backing::DirectBacking::from_values(values),
        )));
        Ok(())
    }

    /// Replaces the whole array from an exported `(palette, width, words)`
    /// triple: an empty palette means `words` holds flat full-width values,
    /// a single entry means uniform, anything else is a packed palette.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidWidth`] for a width outside `{1, 2, 4, 8, 16}`
    /// (palette case), [`StoreError::LengthMismatch`] for a word count that
    /// does not match, and [`StoreError::PaletteIdOutOfRange`] when a packed
    /// id points past the palette.
    pub fn replace_with_parts(
        &self,
        palette: &[u32],
        width: u8,
        words: &[u32],
    ) -> Result<(), StoreError> {
        let _resize = self.permits.resize();
        let next = match palette {
            [] => {
                self.check_len(words.len())?;
                Backing::Direct(backing::DirectBacking::from_values(words))
            }
            [value] => Backing::Uniform(backing::UniformBacking::new(self.len, *value)),
            _ => {
                if !matches!(width, 1 | 2 | 4 | 8 | 16) {
                    return Err(StoreError::InvalidWidth(width));
                }
                let expected = AtomicBitArray::word_count(width, self.len);
                if words.len() != expected {
                    return Err(StoreError::LengthMismatch {
                        expected,
                        actual: words.len(),
                    });
                }
                let rebuilt = PaletteBacking::from_parts(self.len, palette, width, words);
                for index in 0..self.len {
                    let id = rebuilt.packed_id(index);
                    if id as usize >= palette.len() {
                        return Err(StoreError::PaletteIdOutOfRange {
                            index,
                            id,
                            palette_len: palette.len(),
                        });
                    }
                }
                Backing::Palette(rebuilt)
            }
        };
        self.backing.store(Arc::new(next));
        Ok(())
    }

    /// Attempts to install a strictly smaller representation; never grows
    /// and never changes any `get` result. A no-op if already minimal.
    pub fn compress(&self) {
        self.compress_with(&mut FxHashSet::default());
    }

    /// Like [`AtomicCellArray::compress`], additionally recording every
    /// distinct value still present into `in_use` for the caller.
    pub fn compress_with(&self, in_use: &mut FxHashSet<u32>) {
        let _resize = self.permits.resize();
        let current = self.backing.load_full();
        if matches!(*current, Backing::Uniform(_)) {
            return;
        }
        let distinct = current.distinct_into(in_use);
        if distinct > palette::allowed_palette_len(self.len) {
            return;
        }
        let next = if distinct == 1 {
            Backing::Uniform(backing::UniformBacking::from_backing(&current))
        } else {
            if palette::round_up_width(distinct - 1) >= current.width() {
                return;
            }
            Backing::Palette(PaletteBacking::compressed_from(&current, distinct))
        };
        tracing::debug!(
            from = current.width(),
            to = next.width(),
            distinct,
            "cell array compressed"
        );
        self.backing.store(Arc::new(next));
    }

    /// Counts the distinct values currently present.
    pub fn distinct(&self) -> usize {
        self.backing
            .load()
            .distinct_into(&mut FxHashSet::default())
    }

    /// The current palette table, or an empty vector when no palette is in
    /// use (direct encoding). May tear under concurrent mutation.
    pub fn palette(&self) -> Vec<u32> {
        self.backing.load().palette()
    }

    /// The current packed word array: bit-packed ids, or flat values when no
    /// palette is in use. May tear under concurrent mutation.
    pub fn packed_words(&self) -> Vec<u32> {
        self.backing.load().packed_words()
    }

    /// Copies every cell out through `get`.
    pub fn to_values(&self) -> Vec<u32> {
        let backing = self.backing.load();
        (0..self.len).map(|i| backing.get(i)).collect()
    }

    /// Acquires the exclusive resize permit, stopping all writes until
    /// [`AtomicCellArray::unlock`]. Re-entrant for the holding thread, which
    /// may keep issuing its own reads and writes.
    pub fn lock(&self) {
        self.permits.acquire_resize();
    }

    /// Releases one [`AtomicCellArray::lock`] hold.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the lock.
    pub fn unlock(&self) {
        self.permits.release_resize();
    }

    /// Attempts [`AtomicCellArray::lock`] without blocking.
    pub fn try_lock(&self) -> bool {
        self.permits.try_acquire_resize()
    }

    fn check_len(&self, actual: usize) -> Result<(), StoreError> {
        if actual != self.len {
            return Err(StoreError::LengthMismatch {
                expected: self.len,
                actual,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
