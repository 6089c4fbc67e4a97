//! Block store: maps 3D coordinates onto a concurrent cell array and keeps a
//! bounded log of which cells changed since the last flush.
//!
//! One store covers one chunk-sized cubic volume (`side = 2^shift`). Reads
//! never block; writes proceed concurrently and every logged change advances
//! an atomically maintained dirty counter and axis-aligned bounding box, so a
//! network collaborator can drain per-cell deltas once per tick, or fall
//! back to resending the whole region when the log overflowed.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::array::AtomicCellArray;
use crate::error::StoreError;
use crate::state::BlockState;
use rustc_hash::FxHashSet;

/// Construction parameters for a [`BlockStore`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Volume bit-shift: the store covers `(1 << shift)³` cells. Must be in
    /// `1..=8` so coordinates fit the byte-sized dirty log slots.
    pub shift: u32,
    /// Whether to retain the before/after packed states per dirty entry.
    pub record_states: bool,
    /// Whether bulk-loaded data is scanned for the cheapest representation.
    /// Loading from a pre-built palette requires this.
    pub compress: bool,
    /// Number of per-cell slots in the dirty log.
    pub dirty_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            shift: 4,
            record_states: false,
            compress: true,
            dirty_capacity: 10,
        }
    }
}

/// Concurrent, palette-compressed storage for one cubic block volume.
pub struct BlockStore {
    side: u32,
    shift: u32,
    double_shift: u32,
    cells: AtomicCellArray,
    dirty_x: Box<[AtomicU8]>,
    dirty_y: Box<[AtomicU8]>,
    dirty_z: Box<[AtomicU8]>,
    /// Before/after packed states per slot, present when
    /// [`StoreOptions::record_states`] is set.
    old_states: Option<Box<[AtomicU32]>>,
    new_states: Option<Box<[AtomicU32]>>,
    /// Total dirty entries since the last reset; saturates just past the
    /// slot capacity so overflow stays detectable.
    dirty_count: AtomicUsize,
    min_x: AtomicI32,
    min_y: AtomicI32,
    min_z: AtomicI32,
    max_x: AtomicI32,
    max_y: AtomicI32,
    max_z: AtomicI32,
}

impl BlockStore {
    /// Creates an empty store (every cell reads as id 0, data 0).
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidShift`] if `options.shift` is outside `1..=8`.
    pub fn new(options: StoreOptions) -> Result<Self, StoreError> {
        if !(1..=8).contains(&options.shift) {
            return Err(StoreError::InvalidShift(options.shift));
        }
        let side = 1u32 << options.shift;
        let volume = (side as usize).pow(3);
        let byte_slots = |n| (0..n).map(|_| AtomicU8::new(0)).collect();
        let state_slots = |n| (0..n).map(|_| AtomicU32::new(0)).collect();
        Ok(Self {
            side,
            shift: options.shift,
            double_shift: options.shift << 1,
            cells: AtomicCellArray::new(volume),
            dirty_x: byte_slots(options.dirty_capacity),
            dirty_y: byte_slots(options.dirty_capacity),
            dirty_z: byte_slots(options.dirty_capacity),
            old_states: options.record_states.then(|| state_slots(options.dirty_capacity)),
            new_states: options.record_states.then(|| state_slots(options.dirty_capacity)),
            dirty_count: AtomicUsize::new(0),
            min_x: AtomicI32::new(i32::MAX),
            min_y: AtomicI32::new(i32::MAX),
            min_z: AtomicI32::new(i32::MAX),
            max_x: AtomicI32::new(i32::MIN),
            max_y: AtomicI32::new(i32::MIN),
            max_z: AtomicI32::new(i32::MIN),
        })
    }

    /// Creates a store pre-filled from flat per-cell id and data arrays.
    ///
    /// With `options.compress` the cheapest representation is chosen up
    /// front; without it the data is installed full-width.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidShift`] or [`StoreError::LengthMismatch`] when
    /// either array is not exactly `volume` long.
    pub fn with_blocks(
        options: StoreOptions,
        ids: &[u16],
        data: Option<&[u16]>,
    ) -> Result<Self, StoreError> {
        let store = Self::new(options)?;
        let volume = store.volume();
        if ids.len() != volume {
            return Err(StoreError::LengthMismatch {
                expected: volume,
                actual: ids.len(),
            });
        }
        if let Some(data) = data
            && data.len() != volume
        {
            return Err(StoreError::LengthMismatch {
                expected: volume,
                actual: data.len(),
            });
        }
        let values: Vec<u32> = ids
            .iter()
            .enumerate()
            .map(|(i, &id)| BlockState::pack(id, data.map_or(0, |d| d[i])).raw())
            .collect();
        if options.compress {
            store.cells.replace_all(&values)?;
        } else {
            store.cells.replace_all_uncompressed(&values)?;
        }
        Ok(store)
    }

    /// Creates a store from an exported `(palette, width, packed)` triple
    /// (the deserialization path).
    ///
    /// # Errors
    ///
    /// [`StoreError::CompressionDisabled`] when `options.compress` is off
    /// (palette data is inherently compressed), plus any triple validation
    /// error from the cell array.
    pub fn from_palette(
        options: StoreOptions,
        palette: &[u32],
        width: u8,
        packed: &[u32],
    ) -> Result<Self, StoreError> {
        if !options.compress {
            return Err(StoreError::CompressionDisabled);
        }
        let store = Self::new(options)?;
        store.cells.replace_with_parts(palette, width, packed)?;
        Ok(store)
    }

    /// Cells per edge of the cubic volume.
    pub fn side(&self) -> u32 {
        self.side
    }

    /// The volume bit-shift this store was built with.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Total number of cells.
    pub fn volume(&self) -> usize {
        self.cells.len()
    }

    /// Returns the packed state at `(x, y, z)`.
    ///
    /// Never blocks. Out-of-bounds coordinates read as [`BlockState::EMPTY`]
    /// with a warning log.
    pub fn get_full_state(&self, x: u32, y: u32, z: u32) -> BlockState {
        let Some(index) = self.index(x, y, z) else {
            return BlockState::EMPTY;
        };
        BlockState(self.cells.get(index))
    }

    /// Returns the type id at `(x, y, z)`.
    pub fn get_block_id(&self, x: u32, y: u32, z: u32) -> u16 {
        self.get_full_state(x, y, z).id()
    }

    /// Returns the auxiliary data at `(x, y, z)`.
    pub fn get_block_data(&self, x: u32, y: u32, z: u32) -> u16 {
        self.get_full_state(x, y, z).data()
    }

    /// Stores a block and returns the previous packed state.
    ///
    /// Always logs a dirty entry, even when the new state equals the old:
    /// a direct set means "resend this cell" regardless of the value.
    /// Out-of-bounds coordinates are ignored with a warning log.
    pub fn get_and_set_block(&self, x: u32, y: u32, z: u32, id: u16, data: u16) -> BlockState {
        let Some(index) = self.index(x, y, z) else {
            return BlockState::EMPTY;
        };
        let new = BlockState::pack(id, data);
        let old = BlockState(self.cells.set(index, new.raw()));
        self.mark_dirty(x, y, z, old, new);
        old
    }

    /// Stores a block, discarding the previous state.
    pub fn set_block(&self, x: u32, y: u32, z: u32, id: u16, data: u16) {
        self.get_and_set_block(x, y, z, id, data);
    }

    /// Stores a block only if the current state matches the expectation.
    ///
    /// Logs a dirty entry only when the write was accepted *and* actually
    /// changed the state; a matching no-op write stays silent.
    pub fn compare_and_set_block(
        &self,
        x: u32,
        y: u32,
        z: u32,
        expect_id: u16,
        expect_data: u16,
        new_id: u16,
        new_data: u16,
    ) -> bool {
        let Some(index) = self.index(x, y, z) else {
            return false;
        };
        let expect = BlockState::pack(expect_id, expect_data);
        let update = BlockState::pack(new_id, new_data);
        let success = self.cells.compare_and_set(index, expect.raw(), update.raw());
        if success && expect != update {
            self.mark_dirty(x, y, z, expect, update);
        }
        success
    }

    /// Forces a dirty-log entry for `(x, y, z)` without changing its value,
    /// so the cell is re-sent on the next flush. Returns the current state.
    pub fn touch_block(&self, x: u32, y: u32, z: u32) -> BlockState {
        let state = self.get_full_state(x, y, z);
        if self.index(x, y, z).is_some() {
            self.mark_dirty(x, y, z, state, state);
        }
        state
    }

    /// Extracts the auxiliary-data bit field selected by `bits`.
    pub fn get_data_field(&self, x: u32, y: u32, z: u32, bits: u16) -> u16 {
        self.get_full_state(x, y, z).data_field(bits)
    }

    /// Atomically replaces the auxiliary-data bit field selected by `bits`
    /// with `value`, returning the field's previous contents. Logs a dirty
    /// entry only when the stored state changed.
    pub fn set_data_field(&self, x: u32, y: u32, z: u32, bits: u16, value: u16) -> u16 {
        self.update_state(x, y, z, |state| state.with_data_field(bits, value))
            .data_field(bits)
    }

    /// Atomically adds `value` to the auxiliary-data bit field selected by
    /// `bits`, wrapping within the field. Returns the field's previous
    /// contents.
    pub fn add_data_field(&self, x: u32, y: u32, z: u32, bits: u16, value: u16) -> u16 {
        self.update_state(x, y, z, |state| state.with_data_field_added(bits, value))
            .data_field(bits)
    }

    /// Compare-and-retry read-modify-write of one cell; returns the previous
    /// state.
    fn update_state(&self, x: u32, y: u32, z: u32, f: impl Fn(BlockState) -> BlockState) -> BlockState {
        let Some(index) = self.index(x, y, z) else {
            return BlockState::EMPTY;
        };
        loop {
            let old = BlockState(self.cells.get(index));
            let new = f(old);
            if self.cells.compare_and_set(index, old.raw(), new.raw()) {
                if old != new {
                    self.mark_dirty(x, y, z, old, new);
                }
                return old;
            }
        }
    }

    /// Recomputes the distinct-value count and installs a strictly smaller
    /// representation when one suffices. No `get` result changes.
    pub fn compress(&self) {
        self.cells.compress();
    }

    /// Like [`BlockStore::compress`], recording every packed state still
    /// present into `in_use`.
    pub fn compress_with(&self, in_use: &mut FxHashSet<u32>) {
        self.cells.compress_with(in_use);
    }

    // -----------------------------------------------------------------------
    // Dirty log
    // -----------------------------------------------------------------------

    /// Dirty entries logged since the last reset. May exceed the slot
    /// capacity by one when the log overflowed.
    pub fn dirty_count(&self) -> usize {
        self.dirty_count.load(Ordering::Acquire)
    }

    /// Returns `true` if anything was logged since the last reset.
    pub fn is_dirty(&self) -> bool {
        self.dirty_count() > 0
    }

    /// Returns `true` when more entries were logged than the log can hold;
    /// per-cell deltas are incomplete and callers should resend the whole
    /// region.
    pub fn is_dirty_overflow(&self) -> bool {
        self.dirty_count() >= self.dirty_x.len()
    }

    /// The coordinate in dirty slot `i`, or `None` past the recorded window.
    pub fn dirty_coordinate(&self, i: usize) -> Option<(u8, u8, u8)> {
        if i >= self.recorded_dirty() {
            return None;
        }
        Some((
            self.dirty_x[i].load(Ordering::Acquire),
            self.dirty_y[i].load(Ordering::Acquire),
            self.dirty_z[i].load(Ordering::Acquire),
        ))
    }

    /// The packed state slot `i` held before its logged change. `None` when
    /// states are not recorded or `i` is past the recorded window.
    pub fn dirty_old_state(&self, i: usize) -> Option<BlockState> {
        let states = self.old_states.as_ref()?;
        (i < self.recorded_dirty()).then(|| BlockState(states[i].load(Ordering::Acquire)))
    }

    /// The packed state slot `i` held after its logged change.
    pub fn dirty_new_state(&self, i: usize) -> Option<BlockState> {
        let states = self.new_states.as_ref()?;
        (i < self.recorded_dirty()).then(|| BlockState(states[i].load(Ordering::Acquire)))
    }

    /// Minimum corner of the dirty bounding box. `(i32::MAX, …)` when
    /// nothing has been logged since the last reset.
    pub fn min_dirty(&self) -> (i32, i32, i32) {
        (
            self.min_x.load(Ordering::Acquire),
            self.min_y.load(Ordering::Acquire),
            self.min_z.load(Ordering::Acquire),
        )
    }

    /// Maximum corner of the dirty bounding box. `(i32::MIN, …)` when
    /// nothing has been logged since the last reset.
    pub fn max_dirty(&self) -> (i32, i32, i32) {
        (
            self.max_x.load(Ordering::Acquire),
            self.max_y.load(Ordering::Acquire),
            self.max_z.load(Ordering::Acquire),
        )
    }

    /// Clears the dirty log and rearms the bounding box. Returns whether
    /// anything had been dirty.
    pub fn reset_dirty(&self) -> bool {
        self.min_x.store(i32::MAX, Ordering::Release);
        self.min_y.store(i32::MAX, Ordering::Release);
        self.min_z.store(i32::MAX, Ordering::Release);
        self.max_x.store(i32::MIN, Ordering::Release);
        self.max_y.store(i32::MIN, Ordering::Release);
        self.max_z.store(i32::MIN, Ordering::Release);
        self.dirty_count.swap(0, Ordering::AcqRel) > 0
    }

    /// Logs a change: grows the bounding box, then claims a slot if any
    /// remain. The box covers every logged coordinate even when the per-cell
    /// slots overflowed.
    fn mark_dirty(&self, x: u32, y: u32, z: u32, old: BlockState, new: BlockState) {
        self.min_x.fetch_min(x as i32, Ordering::AcqRel);
        self.min_y.fetch_min(y as i32, Ordering::AcqRel);
        self.min_z.fetch_min(z as i32, Ordering::AcqRel);
        self.max_x.fetch_max(x as i32, Ordering::AcqRel);
        self.max_y.fetch_max(y as i32, Ordering::AcqRel);
        self.max_z.fetch_max(z as i32, Ordering::AcqRel);

        let index = self.advance_dirty();
        if index < self.dirty_x.len() {
            self.dirty_x[index].store(x as u8, Ordering::Release);
            self.dirty_y[index].store(y as u8, Ordering::Release);
            self.dirty_z[index].store(z as u8, Ordering::Release);
            if let Some(states) = &self.old_states {
                states[index].store(old.raw(), Ordering::Release);
            }
            if let Some(states) = &self.new_states {
                states[index].store(new.raw(), Ordering::Release);
            }
        }
    }

    /// Claims the next dirty slot index via compare-and-retry. The counter
    /// saturates one past capacity so overflow remains observable without
    /// running away.
    fn advance_dirty(&self) -> usize {
        let capacity = self.dirty_x.len();
        let mut current = self.dirty_count.load(Ordering::Acquire);
        loop {
            if current > capacity {
                return current;
            }
            match self.dirty_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Slots that actually hold recorded coordinates.
    fn recorded_dirty(&self) -> usize {
        self.dirty_count().min(self.dirty_x.len())
    }

    // -----------------------------------------------------------------------
    // Snapshot and lock surface
    // -----------------------------------------------------------------------

    /// Copies out every cell's type id. Not a linearizable snapshot:
    /// concurrent mutation may tear; hold the write lock for an exact copy.
    pub fn block_id_array(&self) -> Vec<u16> {
        self.cells
            .to_values()
            .into_iter()
            .map(|v| BlockState(v).id())
            .collect()
    }

    /// Copies out every cell's auxiliary data. Same tearing caveat as
    /// [`BlockStore::block_id_array`].
    pub fn block_data_array(&self) -> Vec<u16> {
        self.cells
            .to_values()
            .into_iter()
            .map(|v| BlockState(v).data())
            .collect()
    }

    /// The current palette table (empty when the store is full-width).
    /// May tear under concurrent mutation.
    pub fn palette(&self) -> Vec<u32> {
        self.cells.palette()
    }

    /// The current packed word array. May tear under concurrent mutation.
    pub fn packed_array(&self) -> Vec<u32> {
        self.cells.packed_words()
    }

    /// Bits per cell in the current representation.
    pub fn packed_width(&self) -> u8 {
        self.cells.width()
    }

    /// Returns `true` while every cell holds the same value.
    pub fn is_uniform(&self) -> bool {
        self.cells.is_uniform()
    }

    /// Acquires the store's exclusive lock, stopping all writes so a
    /// collaborator can span many logical operations (or take an exact
    /// snapshot). Re-entrant for the holding thread.
    pub fn write_lock(&self) {
        self.cells.lock();
    }

    /// Attempts [`BlockStore::write_lock`] without blocking.
    pub fn try_write_lock(&self) -> bool {
        self.cells.try_lock()
    }

    /// Releases one [`BlockStore::write_lock`] hold.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the lock.
    pub fn write_unlock(&self) {
        self.cells.unlock();
    }

    /// Maps a coordinate to its linear cell index, or `None` (with a
    /// warning log) when any component is outside `[0, side)`.
    fn index(&self, x: u32, y: u32, z: u32) -> Option<usize> {
        if x >= self.side || y >= self.side || z >= self.side {
            tracing::warn!(x, y, z, side = self.side, "block access out of bounds");
            return None;
        }
        Some(((y << self.double_shift) | (z << self.shift) | x) as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
