//! Snapshot serialization for [`BlockStore`].
//!
//! A snapshot is the `(palette, width, packed)` triple the store already
//! exposes, tagged with the volume shift. Taking one does not stop writers,
//! so a snapshot of a store under concurrent mutation may tear; hold the
//! write lock around [`BlockStore::snapshot`] when exactness matters.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{BlockStore, StoreOptions};

/// A serializable copy of a store's contents.
///
/// An empty `palette` means `packed` holds flat full-width cell values; a
/// single entry means the whole volume is that value and `packed` is empty;
/// otherwise `packed` holds `width`-bit palette ids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Volume bit-shift of the source store.
    pub shift: u32,
    /// Bits per packed entry.
    pub width: u8,
    /// Palette value table.
    pub palette: Vec<u32>,
    /// Packed words.
    pub packed: Vec<u32>,
}

impl BlockStore {
    /// Captures the current representation as a snapshot.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            shift: self.shift(),
            width: self.packed_width(),
            palette: self.palette(),
            packed: self.packed_array(),
        }
    }

    /// Rebuilds a store from a snapshot.
    ///
    /// # Errors
    ///
    /// [`StoreError::ShiftMismatch`] when the snapshot was taken from a
    /// differently sized store, plus any triple validation error from
    /// [`BlockStore::from_palette`].
    pub fn from_snapshot(
        options: StoreOptions,
        snapshot: &StoreSnapshot,
    ) -> Result<Self, StoreError> {
        if snapshot.shift != options.shift {
            return Err(StoreError::ShiftMismatch {
                expected: options.shift,
                actual: snapshot.shift,
            });
        }
        Self::from_palette(options, &snapshot.palette, snapshot.width, &snapshot.packed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> StoreOptions {
        StoreOptions::default()
    }

    #[test]
    fn test_snapshot_of_empty_store_is_uniform() {
        let store = BlockStore::new(options()).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.shift, 4);
        assert_eq!(snapshot.width, 0);
        assert_eq!(snapshot.palette, vec![0]);
        assert!(snapshot.packed.is_empty());
    }

    #[test]
    fn test_snapshot_restores_contents() {
        let store = BlockStore::new(options()).unwrap();
        for i in 0..100u16 {
            store.set_block((i % 16) as u32, (i / 16) as u32, 0, i % 11, i % 3);
        }
        let snapshot = store.snapshot();
        let restored = BlockStore::from_snapshot(options(), &snapshot).unwrap();
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(
                    store.get_full_state(x, y, 0),
                    restored.get_full_state(x, y, 0)
                );
            }
        }
    }

    #[test]
    fn test_snapshot_survives_json() {
        let store = BlockStore::new(options()).unwrap();
        store.set_block(3, 1, 4, 159, 26);
        let json = serde_json::to_string(&store.snapshot()).unwrap();
        let decoded: StoreSnapshot = serde_json::from_str(&json).unwrap();
        let restored = BlockStore::from_snapshot(options(), &decoded).unwrap();
        assert_eq!(restored.get_block_id(3, 1, 4), 159);
        assert_eq!(restored.get_block_data(3, 1, 4), 26);
    }

    #[test]
    fn test_shift_mismatch_rejected() {
        let small = BlockStore::new(StoreOptions {
            shift: 3,
            ..options()
        })
        .unwrap();
        let result = BlockStore::from_snapshot(options(), &small.snapshot());
        assert_eq!(
            result.err(),
            Some(StoreError::ShiftMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_corrupt_width_rejected() {
        let store = BlockStore::new(options()).unwrap();
        store.set_block(0, 0, 0, 1, 0);
        store.set_block(1, 0, 0, 2, 0);
        let mut snapshot = store.snapshot();
        snapshot.width = 3;
        assert_eq!(
            BlockStore::from_snapshot(options(), &snapshot).err(),
            Some(StoreError::InvalidWidth(3))
        );
    }
}
