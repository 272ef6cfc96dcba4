//! Data fetchers feeding the evaluator
//!
//! Each fetcher turns an external quote into a validated [`Observation`]
//! value; failures are reported per instrument and never stop a polling
//! cycle.
//!
//! [`Observation`]: crate::engine::Observation

pub mod metrics;
pub mod polymarket;
pub mod pyth;

use std::collections::HashMap;

use async_trait::async_trait;

pub use metrics::{KaminoVaultClient, MetricClient, MetricClientRegistry, MetricReading};
pub use polymarket::PolymarketClient;
pub use pyth::PythClient;

use crate::engine::{PredictionObservation, PriceObservation};

/// Oracle price source
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    async fn fetch_price(&self, symbol: &str, feed_id: &str) -> Result<PriceObservation, FetchError>;
}

/// Prediction-market order-book source
#[async_trait]
pub trait PredictionFetcher: Send + Sync {
    /// Quotes for `token_ids`, keyed by token id; tokens without a quote are absent
    async fn fetch_tokens(
        &self,
        token_ids: &[String],
    ) -> Result<HashMap<String, PredictionObservation>, FetchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No data for {0}")]
    NotFound(String),

    #[error("Invalid value: {0}")]
    Invalid(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Map a non-success response to [`FetchError::Status`]
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::Status {
        status: status.as_u16(),
        body,
    })
}
