//! Order book engine
//!
//! Rebuilds the depth-25 book from one snapshot followed by single-level
//! deltas. Bids and asks are kept in `BTreeMap`s keyed by price and mirrored
//! into explicit price indexes (bids descending, asks ascending) after every
//! applied message. Those indexes are the only "top of book" view handed to
//! the checksum and row builder.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Ranks retained per side.
pub const BOOK_DEPTH: usize = 25;

/// Sequence jumps larger than this are reported as gaps.
pub const SEQUENCE_GAP_WARN: u64 = 10;

// =============================================================================
// WIRE-FACING TYPES
// =============================================================================

/// Book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Side encoded by the sign of a wire amount: `>= 0` is a bid, `< 0` an ask.
    #[inline]
    pub fn from_amount(amount: Decimal) -> Self {
        if amount < Decimal::ZERO {
            Self::Ask
        } else {
            Self::Bid
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "bid"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// One `[price, count, amount]` entry as received (amount still signed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelUpdate {
    pub price: Decimal,
    pub count: u32,
    pub amount: Decimal,
}

impl LevelUpdate {
    pub fn new(price: Decimal, count: u32, amount: Decimal) -> Self {
        Self {
            price,
            count,
            amount,
        }
    }

    #[inline]
    pub fn side(&self) -> Side {
        Side::from_amount(self.amount)
    }

    /// Stored form of this update; amount is made non-negative.
    #[inline]
    fn to_level(self) -> PriceLevel {
        PriceLevel {
            price: self.price,
            count: self.count,
            amount: self.amount.abs(),
        }
    }
}

/// Aggregate quantity resting at one price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    /// Number of orders at this price.
    pub count: u32,
    /// Always non-negative; the side is implied by which map holds the level.
    pub amount: Decimal,
}

/// What a delta did to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Inserted,
    Updated,
    Removed,
    /// Deletion for a price that was not on the book.
    Ignored,
}

// =============================================================================
// BOOK STATE
// =============================================================================

/// Full book state for one connection lifetime.
#[derive(Debug, Clone, Default)]
pub struct BookState {
    bids: BTreeMap<Decimal, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    /// Bid prices, best (highest) first. `None` until the first snapshot.
    bid_index: Option<Vec<Decimal>>,
    /// Ask prices, best (lowest) first. `None` until the first snapshot.
    ask_index: Option<Vec<Decimal>>,
    message_count: u64,
    last_sequence: Option<u64>,
}

impl BookState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything; the next data message must be a snapshot.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Replace the whole book with `levels`.
    pub fn apply_snapshot(&mut self, levels: &[LevelUpdate]) {
        self.message_count = 0;
        self.bids.clear();
        self.asks.clear();

        for update in levels {
            if update.count == 0 {
                debug!(price = %update.price, "skipping zero-count level in snapshot");
                continue;
            }
            let level = update.to_level();
            self.side_mut(update.side()).insert(level.price, level);
        }

        self.rebuild_indexes();
        self.message_count += 1;
    }

    /// Apply one incremental update. `count == 0` deletes the price.
    pub fn apply_delta(&mut self, update: &LevelUpdate) -> DeltaOutcome {
        let side = update.side();
        let levels = self.side_mut(side);

        let outcome = if update.count == 0 {
            match levels.remove(&update.price) {
                Some(_) => DeltaOutcome::Removed,
                None => DeltaOutcome::Ignored,
            }
        } else {
            let level = update.to_level();
            match levels.insert(level.price, level) {
                Some(_) => DeltaOutcome::Updated,
                None => DeltaOutcome::Inserted,
            }
        };

        self.rebuild_indexes();
        self.message_count += 1;
        outcome
    }

    /// Record an exchange sequence number.
    ///
    /// Returns the jump size when it exceeds [`SEQUENCE_GAP_WARN`]. Gaps are
    /// only reported; the checksum is what detects real desync.
    pub fn observe_sequence(&mut self, sequence: u64) -> Option<u64> {
        let gap = match self.last_sequence {
            Some(last) if sequence > last.saturating_add(SEQUENCE_GAP_WARN) => {
                let jump = sequence - last;
                warn!(last, sequence, jump, "large sequence gap");
                Some(jump)
            }
            Some(last) if sequence <= last => {
                debug!(last, sequence, "sequence did not advance");
                None
            }
            _ => None,
        };
        self.last_sequence = Some(sequence);
        gap
    }

    /// Set the sequence only if none has been seen yet (heartbeats).
    pub fn seed_sequence(&mut self, sequence: u64) {
        if self.last_sequence.is_none() {
            self.last_sequence = Some(sequence);
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, PriceLevel> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn rebuild_indexes(&mut self) {
        // BTreeMap keys are ascending; bids need best (highest) first.
        self.bid_index = Some(self.bids.keys().rev().copied().collect());
        self.ask_index = Some(self.asks.keys().copied().collect());
    }

    // -------------------------------------------------------------------------
    // Read views
    // -------------------------------------------------------------------------

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// True once a snapshot has been applied on this connection.
    pub fn has_snapshot(&self) -> bool {
        self.bid_index.is_some() && self.ask_index.is_some()
    }

    pub fn bid_index(&self) -> Option<&[Decimal]> {
        self.bid_index.as_deref()
    }

    pub fn ask_index(&self) -> Option<&[Decimal]> {
        self.ask_index.as_deref()
    }

    pub fn level(&self, side: Side, price: &Decimal) -> Option<&PriceLevel> {
        match side {
            Side::Bid => self.bids.get(price),
            Side::Ask => self.asks.get(price),
        }
    }

    /// Level at `rank` (0 = best) on `side`, resolved through the index.
    pub fn level_at(&self, side: Side, rank: usize) -> Option<&PriceLevel> {
        let index = match side {
            Side::Bid => self.bid_index.as_ref()?,
            Side::Ask => self.ask_index.as_ref()?,
        };
        index.get(rank).and_then(|price| self.level(side, price))
    }

    /// Best `n` bids, highest price first.
    pub fn bid_levels(&self, n: usize) -> Vec<PriceLevel> {
        (0..n).map_while(|rank| self.level_at(Side::Bid, rank).copied()).collect()
    }

    /// Best `n` asks, lowest price first.
    pub fn ask_levels(&self, n: usize) -> Vec<PriceLevel> {
        (0..n).map_while(|rank| self.level_at(Side::Ask, rank).copied()).collect()
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.level_at(Side::Bid, 0)
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.level_at(Side::Ask, 0)
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }
}
