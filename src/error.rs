//! Error taxonomy for the ingestion pipeline (spec §7).
//!
//! Each component-facing error type maps onto the component-agnostic kinds
//! from the design doc; `CollectorError::class()` is what the retry policy
//! and the API error log dispatch on.

use crate::model::ErrorClass;
use thiserror::Error;

/// Errors surfaced by REST/WS exchange adapters.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("network error calling {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("rate limited on {endpoint}, retry_after={retry_after_ms:?}")]
    RateLimited {
        endpoint: String,
        retry_after_ms: Option<u64>,
    },

    #[error("timeout calling {endpoint}")]
    Timeout { endpoint: String },

    #[error("exchange {exchange} rejected {endpoint}: {status} {message}")]
    ExchangeError {
        exchange: String,
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("server error {status} from {endpoint}")]
    ServerError { endpoint: String, status: u16 },

    #[error("failed to parse response from {endpoint}: {message}")]
    ParseError { endpoint: String, message: String },
}

impl CollectorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CollectorError::Network { .. } => ErrorClass::NetworkError,
            CollectorError::RateLimited { .. } => ErrorClass::RateLimited,
            CollectorError::Timeout { .. } => ErrorClass::Timeout,
            CollectorError::ExchangeError { .. } => ErrorClass::ExchangeError,
            CollectorError::ServerError { .. } => ErrorClass::ServerError,
            CollectorError::ParseError { .. } => ErrorClass::ParseError,
        }
    }

    /// Whether the retry policy should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectorError::Network { .. }
                | CollectorError::Timeout { .. }
                | CollectorError::RateLimited { .. }
                | CollectorError::ServerError { .. }
        )
    }
}

/// Errors surfaced by the batch writer.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("constraint violation on batch {fingerprint}: {message}")]
    Constraint { fingerprint: String, message: String },
}

/// Errors surfaced by the order-book reconstructor.
#[derive(Debug, Error)]
pub enum OrderBookError {
    #[error("sequence gap on market {market_id}: expected {expected}, got first={got}")]
    SequenceGap {
        market_id: i64,
        expected: i64,
        got: i64,
    },

    #[error(transparent)]
    Collector(#[from] CollectorError),
}
