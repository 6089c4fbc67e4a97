//! Concurrent palette-compressed block storage with wait-free reads, lock-free
//! writes, and bounded change tracking.

pub mod array;
pub mod error;
pub mod packed;
pub mod serial;
pub mod state;
pub mod store;

mod backing;
mod palette;
mod permit;

pub use array::AtomicCellArray;
pub use error::StoreError;
pub use packed::AtomicBitArray;
pub use serial::StoreSnapshot;
pub use state::BlockState;
pub use store::{BlockStore, StoreOptions};
