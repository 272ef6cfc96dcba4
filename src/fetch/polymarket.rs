//! Polymarket CLOB price client

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{check_status, FetchError, PredictionFetcher};
use crate::engine::PredictionObservation;

pub const POLYMARKET_API_URL: &str = "https://clob.polymarket.com";

/// CLOB numbers arrive either as JSON numbers or as decimal strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Quote {
    Number(f64),
    Text(String),
}

impl Quote {
    fn value(&self) -> Option<f64> {
        match self {
            Quote::Number(v) => Some(*v),
            Quote::Text(s) => s.trim().parse().ok(),
        }
    }
}

pub struct PolymarketClient {
    client: reqwest::Client,
    base_url: String,
}

impl PolymarketClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// GET /midpoints?token_ids=a,b
    async fn midpoints(&self, token_ids: &[String]) -> Result<HashMap<String, f64>, FetchError> {
        let body = self
            .get("/midpoints", &[("token_ids", token_ids.join(","))])
            .await?;
        parse_midpoints(&body)
    }

    /// GET /prices with every token listed once per side
    async fn side_prices(
        &self,
        token_ids: &[String],
    ) -> Result<HashMap<String, (f64, f64)>, FetchError> {
        let mut ids = Vec::with_capacity(token_ids.len() * 2);
        let mut sides = Vec::with_capacity(token_ids.len() * 2);
        for id in token_ids {
            ids.push(id.as_str());
            ids.push(id.as_str());
            sides.push("BUY");
            sides.push("SELL");
        }

        let body = self
            .get(
                "/prices",
                &[("token_ids", ids.join(",")), ("sides", sides.join(","))],
            )
            .await?;
        parse_side_prices(&body)
    }
}

#[async_trait]
impl PredictionFetcher for PolymarketClient {
    async fn fetch_tokens(
        &self,
        token_ids: &[String],
    ) -> Result<HashMap<String, PredictionObservation>, FetchError> {
        if token_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let (midpoints, sides) =
            futures::try_join!(self.midpoints(token_ids), self.side_prices(token_ids))?;

        let mut result = HashMap::with_capacity(token_ids.len());
        for token_id in token_ids {
            let Some(&midpoint) = midpoints.get(token_id) else {
                tracing::debug!(token_id = %token_id, "No midpoint returned for token");
                continue;
            };
            let (buy_price, sell_price) = sides.get(token_id).copied().unwrap_or_default();

            tracing::debug!(
                token_id = %token_id,
                midpoint,
                buy_price,
                sell_price,
                "Prediction token prices"
            );

            result.insert(
                token_id.clone(),
                PredictionObservation {
                    token_id: token_id.clone(),
                    midpoint,
                    buy_price,
                    sell_price,
                },
            );
        }
        Ok(result)
    }
}

/// `{"<token>": "0.45", ...}`; entries that do not parse are skipped
pub fn parse_midpoints(body: &[u8]) -> Result<HashMap<String, f64>, FetchError> {
    let raw: HashMap<String, Quote> =
        serde_json::from_slice(body).map_err(|e| FetchError::Parse(format!("midpoints: {}", e)))?;

    Ok(raw
        .into_iter()
        .filter_map(|(id, quote)| match quote.value() {
            Some(v) => Some((id, v)),
            None => {
                tracing::warn!(token_id = %id, "Unparseable midpoint");
                None
            }
        })
        .collect())
}

/// `{"<token>": {"BUY": 0.45, "SELL": 0.43}, ...}` into `(buy, sell)`
pub fn parse_side_prices(body: &[u8]) -> Result<HashMap<String, (f64, f64)>, FetchError> {
    let raw: HashMap<String, HashMap<String, Quote>> =
        serde_json::from_slice(body).map_err(|e| FetchError::Parse(format!("prices: {}", e)))?;

    Ok(raw
        .into_iter()
        .map(|(id, sides)| {
            let side = |name: &str| sides.get(name).and_then(Quote::value).unwrap_or(0.0);
            let prices = (side("BUY"), side("SELL"));
            (id, prices)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_midpoints_accepts_strings_and_numbers() {
        let parsed = parse_midpoints(br#"{"a": "0.45", "b": 0.5, "c": "n/a"}"#).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["a"], 0.45);
        assert_eq!(parsed["b"], 0.5);
    }

    #[test]
    fn test_parse_side_prices_defaults_missing_side() {
        let parsed = parse_side_prices(br#"{"a": {"BUY": 0.46, "SELL": "0.44"}, "b": {"BUY": 0.1}}"#)
            .unwrap();
        assert_eq!(parsed["a"], (0.46, 0.44));
        assert_eq!(parsed["b"], (0.1, 0.0));
    }

    #[tokio::test]
    async fn test_fetch_tokens_merges_both_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/midpoints"))
            .and(query_param("token_ids", "t1,t2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"t1": "0.62"}"#))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/prices"))
            .and(query_param("token_ids", "t1,t1,t2,t2"))
            .and(query_param("sides", "BUY,SELL,BUY,SELL"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"t1": {"BUY": 0.63, "SELL": 0.61}, "t2": {"BUY": 0.2, "SELL": 0.1}}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = PolymarketClient::new(server.uri(), Duration::from_secs(5));
        let tokens = client
            .fetch_tokens(&["t1".to_string(), "t2".to_string()])
            .await
            .unwrap();

        assert_eq!(tokens.len(), 1);
        let t1 = &tokens["t1"];
        assert_eq!(t1.midpoint, 0.62);
        assert_eq!(t1.buy_price, 0.63);
        assert_eq!(t1.sell_price, 0.61);
    }

    #[tokio::test]
    async fn test_fetch_tokens_empty_input_skips_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let client = PolymarketClient::new(server.uri(), Duration::from_secs(5));
        assert!(client.fetch_tokens(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_tokens_fails_on_endpoint_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/midpoints"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/prices"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let client = PolymarketClient::new(server.uri(), Duration::from_secs(5));
        let err = client.fetch_tokens(&["t1".to_string()]).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
    }
}
