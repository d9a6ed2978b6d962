//! Process-wide `(exchange, symbol) -> market_id` cache (spec design notes:
//! "market identity resolution is long-lived process state, not re-derived
//! per request"). Every component that needs a market row — the collector,
//! the stream session, the writer — resolves through here instead of
//! querying `markets` directly, so a cold cache only costs one lookup (or
//! one insert) per distinct market for the life of the process.

use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::WriterError;
use crate::model::{Market, MarketType};

/// Resolves and caches market identity. Cheap to clone-share via `Arc` since
/// all mutable state lives behind an `RwLock`.
pub struct MarketCache {
    by_pair: RwLock<HashMap<(String, String), i64>>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            by_pair: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up `market_id` for `(exchange, symbol)`, inserting a new
    /// `markets` row on first sight. `base_asset`/`quote_asset` are only
    /// used the first time a market is created.
    pub fn resolve(
        &self,
        conn: &Connection,
        exchange: &str,
        symbol: &str,
        base_asset: &str,
        quote_asset: &str,
        market_type: MarketType,
    ) -> Result<i64, WriterError> {
        let key = (exchange.to_string(), symbol.to_string());

        if let Some(id) = self.by_pair.read().unwrap().get(&key) {
            return Ok(*id);
        }

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM markets WHERE exchange = ?1 AND symbol = ?2",
                rusqlite::params![exchange, symbol],
                |row| row.get(0),
            )
            .optional()?;

        let market_id = match existing {
            Some(id) => id,
            None => {
                conn.execute(
                    "INSERT INTO markets (exchange, symbol, base_asset, quote_asset, market_type)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        exchange,
                        symbol,
                        base_asset,
                        quote_asset,
                        market_type_str(market_type)
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };

        self.by_pair.write().unwrap().insert(key, market_id);
        Ok(market_id)
    }

    /// Looks up a cached id without touching the database. Used by readers
    /// (quality scanner, retention) that only ever see markets the writer
    /// has already resolved.
    pub fn get(&self, exchange: &str, symbol: &str) -> Option<i64> {
        self.by_pair
            .read()
            .unwrap()
            .get(&(exchange.to_string(), symbol.to_string()))
            .copied()
    }

    pub fn load_row(&self, market: &Market) {
        self.by_pair
            .write()
            .unwrap()
            .insert((market.exchange.clone(), market.symbol.clone()), market.id);
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

fn market_type_str(t: MarketType) -> &'static str {
    match t {
        MarketType::Spot => "spot",
        MarketType::Perp => "perp",
        MarketType::Future => "future",
    }
}
