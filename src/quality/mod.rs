//! Quality & Backfill Engine, quality-scan half (spec §4.5). The scanner
//! walks a `(market, timeframe)` window, computes the completeness/
//! regularity counts and the derived score, and turns any detected gaps
//! into `backfill_tasks` rows for the REST collector to consume. Task
//! lifecycle transitions (claim/complete/fail/requeue) live in
//! `crate::backfill`, which this module calls into for gap-driven task
//! creation.

pub mod scanner;

pub use scanner::{run_scan, ScanOutcome};
