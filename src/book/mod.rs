//! Order book reconstruction
//!
//! - `engine`: snapshot/delta application and sorted price indexes
//! - `checksum`: CRC-32 integrity check against exchange values
//! - `row`: fixed-width depth-25 rows for persistence

pub mod checksum;
pub mod engine;
pub mod row;

pub use checksum::ChecksumMismatch;
pub use engine::{BookState, DeltaOutcome, LevelUpdate, PriceLevel, Side, BOOK_DEPTH};
pub use row::{build_row, RankSlot, SnapshotRow};
