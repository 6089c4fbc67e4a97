//! Packed block state: one 32-bit value combining a block's type id and
//! auxiliary data.
//!
//! The high 16 bits hold the type id, the low 16 bits hold per-block
//! auxiliary data. Everything the storage layers move around (palette
//! entries, direct cells, dirty-log states) is one of these.

use serde::{Deserialize, Serialize};

/// One packed cell value: 16-bit type id (high) + 16-bit auxiliary data (low).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockState(pub u32);

impl BlockState {
    /// The all-zero state (id 0, data 0) that never-written cells report.
    pub const EMPTY: BlockState = BlockState(0);

    /// Packs a type id and auxiliary data into one state.
    pub fn pack(id: u16, data: u16) -> Self {
        Self((u32::from(id) << 16) | u32::from(data))
    }

    /// Returns the type id (high 16 bits).
    pub fn id(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Returns the auxiliary data (low 16 bits).
    pub fn data(self) -> u16 {
        self.0 as u16
    }

    /// Returns the raw packed value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Extracts the bit field selected by `bits` from the auxiliary data.
    ///
    /// The field's shift is implied by the lowest set bit of `bits`, so
    /// `data_field(0b0111_0000)` on data `0b0101_0000` yields `0b101`.
    pub fn data_field(self, bits: u16) -> u16 {
        (self.data() & bits) >> field_shift(bits)
    }

    /// Returns a copy with the bit field selected by `bits` replaced by
    /// `value` (shifted into place and masked).
    pub fn with_data_field(self, bits: u16, value: u16) -> Self {
        let shift = field_shift(bits);
        let data = (self.data() & !bits) | ((value << shift) & bits);
        Self::pack(self.id(), data)
    }

    /// Returns a copy with `value` added to the bit field selected by
    /// `bits`, wrapping within the field.
    pub fn with_data_field_added(self, bits: u16, value: u16) -> Self {
        let shift = field_shift(bits);
        let data = (self.data() & !bits) | (self.data().wrapping_add(value << shift) & bits);
        Self::pack(self.id(), data)
    }
}

/// Implied shift of a bit-field mask: the position of its lowest set bit.
fn field_shift(bits: u16) -> u32 {
    debug_assert!(bits != 0, "empty bit-field mask");
    bits.trailing_zeros()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
