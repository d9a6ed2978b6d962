//! Configuration surface (spec §6).
//!
//! `AppConfig` is the minimal thing `main.rs` needs: a path to a TOML file
//! and a log level, per the spec's "no CLI surface is required by the
//! core; a minimal invocation supplies a config path and a log level."
//! Operator-facing config management (hot reload, schema validation UI,
//! secrets) is the named external collaborator and stays out of this
//! crate; what's here is just the typed shape every component reads from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub min_interval_ms: u64,
    pub max_concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    pub heartbeat_ms: u64,
    pub reconnect_base_ms: u64,
    pub max_attempts: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 30_000,
            reconnect_base_ms: 1_000,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
    pub max_batch_retries: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_ms: 2_000,
            queue_capacity: 10_000,
            max_batch_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub window_ms: i64,
    pub scan_interval_ms: u64,
    pub price_jump_threshold: f64,
    pub volume_spike_k: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window_ms: 24 * 60 * 60 * 1000,
            scan_interval_ms: 10 * 60 * 1000,
            price_jump_threshold: 0.20,
            volume_spike_k: 6.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub priority_floor: i32,
    pub max_retries: i32,
    pub concurrency: usize,
    pub completion_threshold: f64,
    pub retry_cooldown_ms: i64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            priority_floor: 10,
            max_retries: 5,
            concurrency: 2,
            completion_threshold: 0.8,
            retry_cooldown_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub enabled: bool,
    pub symbols: Vec<String>,
    pub streams: Vec<String>,
    pub timeframes: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            symbols: Vec::new(),
            streams: vec!["trade".into(), "orderbook".into(), "kline".into()],
            timeframes: vec!["1m".into(), "5m".into(), "15m".into(), "1h".into()],
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            ws: WsConfig::default(),
            writer: WriterConfig::default(),
            quality: QualityConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub db_path: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(cfg)
    }

    /// Config for an exchange not present in the file is "disabled", per
    /// the spec's "missing exchanges default to disabled."
    pub fn exchange(&self, name: &str) -> ExchangeConfig {
        self.exchanges
            .get(name)
            .cloned()
            .unwrap_or_else(|| ExchangeConfig {
                enabled: false,
                ..ExchangeConfig::default()
            })
    }

    pub fn enabled_exchanges(&self) -> Vec<(&str, &ExchangeConfig)> {
        self.exchanges
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_exchange_defaults_disabled() {
        let cfg = AppConfig::default();
        let ex = cfg.exchange("binance");
        assert!(!ex.enabled);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            db_path = "candles.db"

            [exchanges.binance]
            enabled = true
            symbols = ["BTCUSDT"]
            streams = ["trade"]
            timeframes = ["1m", "5m"]
        "#;
        let cfg: AppConfig = toml::from_str(toml_src).unwrap();
        let ex = cfg.exchange("binance");
        assert!(ex.enabled);
        assert_eq!(ex.symbols, vec!["BTCUSDT".to_string()]);
        // defaults fill in when the table omits sub-sections
        assert_eq!(ex.rate_limit.max_concurrent, 5);
    }
}
