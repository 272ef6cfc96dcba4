//! Pyth Hermes latest-price client

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{check_status, FetchError, PriceFetcher};
use crate::engine::PriceObservation;

pub const PYTH_API_URL: &str = "https://hermes.pyth.network";

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(default)]
    parsed: Vec<ParsedUpdate>,
}

#[derive(Debug, Deserialize)]
struct ParsedUpdate {
    price: FixedPrice,
}

/// `price * 10^expo`, with `price` as a decimal string
#[derive(Debug, Deserialize)]
struct FixedPrice {
    price: String,
    expo: i32,
    publish_time: i64,
}

pub struct PythClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl PythClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}

#[async_trait]
impl PriceFetcher for PythClient {
    async fn fetch_price(&self, symbol: &str, feed_id: &str) -> Result<PriceObservation, FetchError> {
        let mut request = self
            .client
            .get(format!("{}/v2/updates/price/latest", self.base_url))
            .query(&[("ids[]", feed_id)])
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = check_status(request.send().await?).await?;
        let body = response.bytes().await?;
        parse_latest_price(symbol, &body)
    }
}

/// Decode a Hermes `/v2/updates/price/latest` body into a validated observation
pub fn parse_latest_price(symbol: &str, body: &[u8]) -> Result<PriceObservation, FetchError> {
    let response: LatestResponse =
        serde_json::from_slice(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    let update = response
        .parsed
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::NotFound(symbol.to_string()))?;

    let mantissa: i64 = update
        .price
        .price
        .parse()
        .map_err(|e| FetchError::Parse(format!("price for {}: {}", symbol, e)))?;
    let price = mantissa as f64 * 10f64.powi(update.price.expo);

    let published_at = DateTime::<Utc>::from_timestamp(update.price.publish_time, 0)
        .ok_or_else(|| FetchError::Parse(format!("publish_time {}", update.price.publish_time)))?;

    let observation = PriceObservation {
        symbol: symbol.to_string(),
        price,
        published_at,
    };
    observation.validate().map_err(FetchError::Invalid)?;
    Ok(observation)
}
