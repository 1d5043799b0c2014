//! Wide snapshot rows
//!
//! One row per processed data message: timestamp, pair, sequence, then 25
//! fixed rank slots per side. Missing ranks stay `None` so every row has the
//! same shape regardless of book depth.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;

use super::engine::{BookState, Side, BOOK_DEPTH};

/// One rank slot; both fields are `None` when the rank is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankSlot {
    pub price: Option<Decimal>,
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    /// Wall-clock time the row was built.
    pub timestamp: DateTime<Utc>,
    pub pair: String,
    pub sequence: Option<u64>,
    pub bids: [RankSlot; BOOK_DEPTH],
    pub asks: [RankSlot; BOOK_DEPTH],
}

impl SnapshotRow {
    /// `ts` column value, e.g. `2024-03-01T23:59:59.900Z`.
    pub fn ts_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// `YYYY_MM_DD_HH` of the row timestamp; selects the output file.
    pub fn hour_key(&self) -> String {
        hour_key(&self.timestamp)
    }
}

pub fn hour_key(ts: &DateTime<Utc>) -> String {
    ts.format("%Y_%m_%d_%H").to_string()
}

/// Project the current book into a row.
///
/// Returns `None` until a snapshot has been applied on this connection.
pub fn build_row(
    book: &BookState,
    pair: &str,
    sequence: Option<u64>,
    now: DateTime<Utc>,
) -> Option<SnapshotRow> {
    if !book.has_snapshot() {
        return None;
    }

    Some(SnapshotRow {
        timestamp: now,
        pair: pair.to_string(),
        sequence,
        bids: slots(book, Side::Bid),
        asks: slots(book, Side::Ask),
    })
}

fn slots(book: &BookState, side: Side) -> [RankSlot; BOOK_DEPTH] {
    std::array::from_fn(|rank| match book.level_at(side, rank) {
        Some(level) => RankSlot {
            price: Some(level.price),
            amount: Some(level.amount),
        },
        None => RankSlot::default(),
    })
}
