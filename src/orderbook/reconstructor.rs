//! Snapshot + delta order-book reconstruction, exactly the procedure of
//! spec §4.3: fetch a REST snapshot, discard stale buffered deltas, apply
//! in-sequence deltas, and restart from a fresh snapshot on any gap.
//!
//! `OrderBook` holds the live, already-synced book. `Reconstructor` wraps
//! it with the pre-snapshot buffering state a caller needs while waiting
//! for the first (or a post-gap) snapshot to land.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;

use crate::exchange::{ExchangeLevel, ExchangeOrderBookDelta, ExchangeOrderBookSnapshot};
use crate::model::{OrderBookSnapshot, PriceLevel};

/// A synced local book for one market. Bids and asks are kept sorted so
/// best-of-book lookups are a map-boundary read, not a scan.
pub struct OrderBook {
    market_id: i64,
    bids: BTreeMap<OrderedFloat<f64>, f64>,
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    last_applied: i64,
}

impl OrderBook {
    fn from_snapshot(market_id: i64, snapshot: &ExchangeOrderBookSnapshot) -> Self {
        let mut book = Self {
            market_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_applied: snapshot.update_id,
        };
        for level in &snapshot.bids {
            set_level(&mut book.bids, level);
        }
        for level in &snapshot.asks {
            set_level(&mut book.asks, level);
        }
        book
    }

    /// Applies a delta in sequence. Returns `Err` (a sequence gap) without
    /// mutating the book when `first_update_id > last_applied + 1`; the
    /// caller must then force a resync (spec §4.3 step 3).
    fn apply_delta(&mut self, delta: &ExchangeOrderBookDelta) -> Result<(), i64> {
        if delta.last_update_id <= self.last_applied {
            return Ok(()); // stale, already covered
        }
        if delta.first_update_id > self.last_applied + 1 {
            return Err(self.last_applied);
        }
        for level in &delta.bids {
            set_level(&mut self.bids, level);
        }
        for level in &delta.asks {
            set_level(&mut self.asks, level);
        }
        self.last_applied = delta.last_update_id;
        Ok(())
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|p| p.into_inner())
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|p| p.into_inner())
    }

    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    pub fn spread_abs(&self) -> Option<f64> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid_price()?;
        if mid == 0.0 {
            return None;
        }
        Some(self.spread_abs()? / mid * 10_000.0)
    }

    pub fn top_n(&self, n: usize, timestamp_ms: i64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            market_id: self.market_id,
            timestamp_ms,
            bids: self
                .bids
                .iter()
                .rev()
                .take(n)
                .map(|(p, q)| PriceLevel { price: p.into_inner(), quantity: *q })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(n)
                .map(|(p, q)| PriceLevel { price: p.into_inner(), quantity: *q })
                .collect(),
            update_id: self.last_applied,
        }
    }
}

fn set_level(side: &mut BTreeMap<OrderedFloat<f64>, f64>, level: &ExchangeLevel) {
    let key = OrderedFloat(level.price);
    if level.quantity > 0.0 {
        side.insert(key, level.quantity);
    } else {
        side.remove(&key);
    }
}

/// The pre-sync/live state machine around one `OrderBook`. A fresh
/// reconstructor (or one that just hit a sequence gap) buffers incoming
/// deltas until a snapshot arrives, mirroring spec §4.3 step 2 ("discard
/// any buffered delta with `lastUpdateId <= U0`").
enum State {
    AwaitingSnapshot { buffered: Vec<ExchangeOrderBookDelta> },
    Live(OrderBook),
}

pub struct Reconstructor {
    market_id: i64,
    state: State,
}

impl Reconstructor {
    pub fn new(market_id: i64) -> Self {
        Self { market_id, state: State::AwaitingSnapshot { buffered: Vec::new() } }
    }

    pub fn needs_snapshot(&self) -> bool {
        matches!(self.state, State::AwaitingSnapshot { .. })
    }

    /// Applies a freshly-fetched snapshot, then replays any buffered
    /// deltas not already covered by it. A gap discovered during replay
    /// re-enters the awaiting-snapshot state immediately (no recursion;
    /// the caller's next `fetch_order_book` retry drives it forward).
    pub fn on_snapshot(&mut self, snapshot: ExchangeOrderBookSnapshot) {
        let buffered = match std::mem::replace(
            &mut self.state,
            State::AwaitingSnapshot { buffered: Vec::new() },
        ) {
            State::AwaitingSnapshot { buffered } => buffered,
            State::Live(_) => Vec::new(),
        };

        let mut book = OrderBook::from_snapshot(self.market_id, &snapshot);
        let mut resynced = false;
        for delta in buffered.into_iter().filter(|d| d.last_update_id > snapshot.update_id) {
            if book.apply_delta(&delta).is_err() {
                resynced = true;
                break;
            }
        }

        self.state = if resynced {
            State::AwaitingSnapshot { buffered: Vec::new() }
        } else {
            State::Live(book)
        };
    }

    /// Applies (or buffers) a streamed delta. Returns `true` when the
    /// delta triggered a sequence gap and the reconstructor now needs a
    /// fresh snapshot.
    pub fn on_delta(&mut self, delta: ExchangeOrderBookDelta) -> bool {
        match &mut self.state {
            State::AwaitingSnapshot { buffered } => {
                buffered.push(delta);
                false
            }
            State::Live(book) => {
                if book.apply_delta(&delta).is_err() {
                    self.state = State::AwaitingSnapshot { buffered: Vec::new() };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Forces a resync regardless of current state: the queue-overflow
    /// exemption of spec §4.2 ("the order-book reconstructor is exempt:
    /// on overflow, force a resync").
    pub fn force_resync(&mut self) {
        self.state = State::AwaitingSnapshot { buffered: Vec::new() };
    }

    pub fn book(&self) -> Option<&OrderBook> {
        match &self.state {
            State::Live(book) => Some(book),
            State::AwaitingSnapshot { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, qty: f64) -> ExchangeLevel {
        ExchangeLevel { price, quantity: qty }
    }

    fn snapshot(update_id: i64) -> ExchangeOrderBookSnapshot {
        ExchangeOrderBookSnapshot {
            update_id,
            bids: vec![level(10.0, 1.0), level(9.0, 2.0)],
            asks: vec![level(11.0, 1.5), level(12.0, 3.0)],
        }
    }

    #[test]
    fn snapshot_populates_best_of_book() {
        let mut r = Reconstructor::new(1);
        r.on_snapshot(snapshot(100));
        let book = r.book().unwrap();
        assert_eq!(book.best_bid(), Some(10.0));
        assert_eq!(book.best_ask(), Some(11.0));
        assert_eq!(book.mid_price(), Some(10.5));
    }

    #[test]
    fn in_sequence_delta_applies() {
        let mut r = Reconstructor::new(1);
        r.on_snapshot(snapshot(100));
        let gap = r.on_delta(ExchangeOrderBookDelta {
            first_update_id: 101,
            last_update_id: 101,
            bids: vec![level(10.0, 5.0)],
            asks: vec![],
        });
        assert!(!gap);
        assert_eq!(r.book().unwrap().best_bid(), Some(10.0));
        // quantity updated in place
        assert_eq!(r.book().unwrap().best_ask(), Some(11.0));
    }

    #[test]
    fn zero_quantity_removes_level() {
        let mut r = Reconstructor::new(1);
        r.on_snapshot(snapshot(100));
        r.on_delta(ExchangeOrderBookDelta {
            first_update_id: 101,
            last_update_id: 101,
            bids: vec![level(10.0, 0.0)],
            asks: vec![],
        });
        assert_eq!(r.book().unwrap().best_bid(), Some(9.0));
    }

    #[test]
    fn sequence_gap_forces_resync() {
        let mut r = Reconstructor::new(1);
        r.on_snapshot(snapshot(100));
        // last_applied is 100; a delta starting at 105 skips 101..104
        let gap = r.on_delta(ExchangeOrderBookDelta {
            first_update_id: 105,
            last_update_id: 110,
            bids: vec![],
            asks: vec![],
        });
        assert!(gap);
        assert!(r.needs_snapshot());
    }

    #[test]
    fn stale_snapshot_buffered_deltas_are_discarded() {
        let mut r = Reconstructor::new(1);
        // delta arrives before any snapshot: buffered
        r.on_delta(ExchangeOrderBookDelta {
            first_update_id: 50,
            last_update_id: 95,
            bids: vec![level(8.0, 1.0)],
            asks: vec![],
        });
        // snapshot lands with update_id 100, covering the buffered delta
        r.on_snapshot(snapshot(100));
        // the stale delta's price level (8.0) must not appear: it was
        // filtered out because lastUpdateId(95) <= U0(100)
        assert_eq!(r.book().unwrap().best_bid(), Some(10.0));
    }

    #[test]
    fn top_n_orders_best_first_each_side() {
        let mut r = Reconstructor::new(1);
        r.on_snapshot(snapshot(100));
        let snap = r.book().unwrap().top_n(10, 999);
        assert_eq!(snap.bids[0].price, 10.0);
        assert_eq!(snap.asks[0].price, 11.0);
    }
}
