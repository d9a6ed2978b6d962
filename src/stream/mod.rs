//! Stream Collector (spec §4.2): one multiplexed WebSocket session per
//! exchange, generalizing the teacher's per-stream `realtime.rs` task into
//! a single connection covering trades, order-book deltas, and kline
//! updates.

pub mod session;

pub use session::{SessionState, StreamQueues, StreamSession};
