//! Protocol metric clients
//!
//! A [`MetricClientRegistry`] maps protocol names to client factories and
//! keeps one client per (protocol, chain) so connections are reused across
//! polling cycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use super::{check_status, FetchError};
use crate::engine::MetricObservation;
use crate::rules::{MetricField, MetricSubject};

pub const KAMINO_API_URL: &str = "https://api.kamino.finance";

/// One metric value plus the chain it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReading {
    pub value: f64,
    pub chain_name: String,
    /// Instrument name reported by the protocol, e.g. a vault name
    pub display_name: Option<String>,
}

#[async_trait]
pub trait MetricClient: Send + Sync {
    async fn fetch_metric(&self, subject: &MetricSubject) -> Result<MetricReading, FetchError>;
}

/// Builds a client for one chain id
pub type MetricClientFactory =
    Box<dyn Fn(&str) -> Result<Arc<dyn MetricClient>, FetchError> + Send + Sync>;

#[derive(Default)]
pub struct MetricClientRegistry {
    factories: HashMap<String, MetricClientFactory>,
    clients: DashMap<(String, String), Arc<dyn MetricClient>>,
}

impl MetricClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `protocol` (case-insensitive)
    pub fn with_protocol(mut self, protocol: &str, factory: MetricClientFactory) -> Self {
        self.factories.insert(protocol.to_ascii_lowercase(), factory);
        self
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    fn client_for(&self, protocol: &str, chain_id: &str) -> Result<Arc<dyn MetricClient>, FetchError> {
        let key = (protocol.to_ascii_lowercase(), chain_id.to_string());
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let factory = self
            .factories
            .get(&key.0)
            .ok_or_else(|| FetchError::Unsupported(format!("protocol {}", protocol)))?;
        let client = factory(chain_id)?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Read the metric named by `subject`
    pub async fn fetch(&self, subject: &MetricSubject) -> Result<MetricObservation, FetchError> {
        let client = self.client_for(&subject.protocol, &subject.chain_id)?;
        let reading = client.fetch_metric(subject).await?;
        tracing::debug!(
            protocol = %subject.protocol,
            instrument = %subject.instrument,
            name = ?reading.display_name,
            "Metric read"
        );
        if !reading.value.is_finite() {
            return Err(FetchError::Invalid(format!(
                "{} {} on {}",
                subject.field, reading.value, subject.instrument
            )));
        }

        Ok(MetricObservation {
            chain_id: subject.chain_id.clone(),
            instrument: subject.instrument.clone(),
            field: subject.field,
            value: reading.value,
            chain_name: reading.chain_name,
        })
    }
}

/// Display name for the Solana chain ids the Kamino API serves
pub fn solana_chain_name(chain_id: &str) -> Option<&'static str> {
    match chain_id.trim().to_ascii_lowercase().as_str() {
        "solana" | "101" => Some("Solana Mainnet"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct VaultResponse {
    state: VaultState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultState {
    #[serde(default)]
    token_mint_decimals: u32,
    token_available: String,
    #[serde(default)]
    prev_aum: String,
    #[serde(default)]
    vault_allocation_strategy: Vec<Allocation>,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Allocation {
    ctoken_allocation: String,
}

/// Vault balances in smallest token units
#[derive(Debug, Clone, PartialEq)]
pub struct VaultBalances {
    pub name: Option<String>,
    pub decimals: u32,
    pub available: f64,
    pub allocated: f64,
    pub total: f64,
}

impl VaultBalances {
    pub fn field(&self, field: MetricField) -> f64 {
        let scale = 10f64.powi(self.decimals as i32);
        match field {
            MetricField::Tvl => self.total / scale,
            MetricField::Liquidity => self.available / scale,
            MetricField::Utilization => {
                if self.total > 0.0 {
                    self.allocated / self.total * 100.0
                } else {
                    0.0
                }
            }
            // not exposed by the vault endpoint
            MetricField::Apy => 0.0,
        }
    }
}

/// Decode a `/kvaults/vaults/{vault}` body
pub fn parse_vault(body: &[u8]) -> Result<VaultBalances, FetchError> {
    let response: VaultResponse =
        serde_json::from_slice(body).map_err(|e| FetchError::Parse(format!("vault: {}", e)))?;
    let state = response.state;

    let decimals = if state.token_mint_decimals == 0 {
        6
    } else {
        state.token_mint_decimals
    };

    let available: f64 = state
        .token_available
        .trim()
        .parse()
        .map_err(|_| FetchError::Parse(format!("tokenAvailable {:?}", state.token_available)))?;

    let allocated: f64 = state
        .vault_allocation_strategy
        .iter()
        .filter_map(|a| a.ctoken_allocation.trim().parse::<f64>().ok())
        .sum();

    let total = match state.prev_aum.trim().parse::<f64>() {
        Ok(aum) if aum.is_finite() => aum.floor(),
        _ => available + allocated,
    };

    let name = Some(state.name.trim().to_string()).filter(|n| !n.is_empty());

    Ok(VaultBalances {
        name,
        decimals,
        available,
        allocated,
        total,
    })
}

/// Kamino lending vaults via the public REST API
pub struct KaminoVaultClient {
    client: reqwest::Client,
    base_url: String,
    chain_name: &'static str,
}

impl KaminoVaultClient {
    pub fn new(base_url: impl Into<String>, chain_id: &str, timeout: Duration) -> Result<Self, FetchError> {
        let chain_name = solana_chain_name(chain_id).ok_or_else(|| {
            FetchError::Unsupported(format!(
                "chain {}; supported chains: solana, 101 (Solana Mainnet)",
                chain_id
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tripwire/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            chain_name,
        })
    }

    /// Registry factory pointed at `base_url`
    pub fn factory(base_url: impl Into<String>, timeout: Duration) -> MetricClientFactory {
        let base_url = base_url.into();
        Box::new(move |chain_id: &str| {
            let client = KaminoVaultClient::new(base_url.clone(), chain_id, timeout)?;
            Ok(Arc::new(client) as Arc<dyn MetricClient>)
        })
    }

    pub async fn vault_balances(&self, vault: &str) -> Result<VaultBalances, FetchError> {
        let response = self
            .client
            .get(format!("{}/kvaults/vaults/{}", self.base_url, vault))
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = check_status(response).await?;
        parse_vault(&response.bytes().await?)
    }
}

#[async_trait]
impl MetricClient for KaminoVaultClient {
    async fn fetch_metric(&self, subject: &MetricSubject) -> Result<MetricReading, FetchError> {
        let balances = self.vault_balances(&subject.instrument).await?;
        let value = balances.field(subject.field);

        tracing::debug!(
            vault = %subject.instrument,
            field = %subject.field,
            value,
            "Kamino vault metric"
        );

        Ok(MetricReading {
            value,
            chain_name: self.chain_name.to_string(),
            display_name: balances.name,
        })
    }
}
