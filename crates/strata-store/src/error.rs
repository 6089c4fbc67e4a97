//! Caller-error reporting for store construction and bulk operations.
//!
//! These are parameter-validation failures, reported immediately and never
//! retried. The internal "needs upgrade" signal used between the backing
//! representations and the coordinator is not an error and never surfaces
//! here; broken internal invariants panic instead of returning a variant.

use thiserror::Error;

/// Errors produced by invalid construction parameters or bulk inputs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A bulk input array does not match the store's cell count.
    #[error("array length mismatch, expected {expected}, got {actual}")]
    LengthMismatch {
        /// Required element count (the store's volume or word count).
        expected: usize,
        /// Element count actually supplied.
        actual: usize,
    },
    /// A packed-data width is not one of the admissible values.
    #[error("invalid packed width: {0} (expected 1, 2, 4, 8, or 16)")]
    InvalidWidth(u8),
    /// The volume bit-shift is outside the supported range.
    #[error("invalid volume shift: {0} (expected 1..=8)")]
    InvalidShift(u32),
    /// A snapshot was built for a differently sized store.
    #[error("snapshot shift mismatch, expected {expected}, got {actual}")]
    ShiftMismatch {
        /// Shift of the store being constructed.
        expected: u32,
        /// Shift recorded in the snapshot.
        actual: u32,
    },
    /// Packed data references a palette id past the end of the palette.
    #[error("packed entry {index} references palette id {id}, but palette has {palette_len} entries")]
    PaletteIdOutOfRange {
        /// Cell index holding the offending id.
        index: usize,
        /// The out-of-range id.
        id: u32,
        /// Entries actually present in the supplied palette.
        palette_len: usize,
    },
    /// Loading from a pre-built palette requires compression enabled.
    #[error("cannot load palette data with compression disabled")]
    CompressionDisabled,
}
