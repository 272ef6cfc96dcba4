//! Rule sources
//!
//! A source produces a complete [`RuleSet`]; the store decides how it
//! replaces the live rules. The bundled [`FileRuleSource`] reads a JSON array
//! where each entry is classified by its keys:
//!
//! - `protocol` → lending/vault metric rule
//! - `token_id` → prediction-market rule
//! - `symbol` → price rule
//!
//! ```json
//! [
//!   {"symbol": "BTC/USD", "price_feed_id": "0xe62d...", "threshold": 100000,
//!    "direction": ">=", "enabled": true, "recipient_email": "ops@example.com",
//!    "frequency": {"unit": "HOUR", "number": 3}}
//! ]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use super::model::{
    AlertRule, DeliveryTarget, Direction, Frequency, FrequencyUnit, MetricField, MetricSubject,
    PredictionSubject, PriceSubject, RuleSubject,
};
use super::store::RuleSet;

/// Something that can produce the full set of alert rules
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Human-readable origin, used in logs
    fn describe(&self) -> String;

    /// Load every rule; a failure leaves the caller's current rules untouched
    async fn load(&self) -> Result<RuleSet, SourceError>;
}

/// JSON rule file
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn load(&self) -> Result<RuleSet, SourceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(self.path.display().to_string()));
            }
            Err(e) => return Err(SourceError::Io(e)),
        };
        parse_rules(&contents)
    }
}

/// Parse and validate a JSON rule array
pub fn parse_rules(json: &str) -> Result<RuleSet, SourceError> {
    let raw: Vec<RawRule> = serde_json::from_str(json)?;
    let mut rules = RuleSet::new();

    for (index, entry) in raw.into_iter().enumerate() {
        let rule = entry
            .into_rule()
            .map_err(|reason| SourceError::Invalid { index, reason })?;

        if rule.target.is_empty() {
            tracing::warn!(
                index = index,
                rule = %rule.subject.label(),
                "Rule has no recipient and will never notify"
            );
        }
        rules.push(rule);
    }

    Ok(rules)
}

/// Frequency block as written in rule files
#[derive(Debug, Deserialize)]
struct RawFrequency {
    unit: String,
    number: Option<i64>,
}

impl RawFrequency {
    fn into_frequency(self) -> Result<Frequency, String> {
        match self.unit.trim().to_ascii_uppercase().as_str() {
            "DAY" | "HOUR" => {
                let count = self
                    .number
                    .filter(|n| *n > 0)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| {
                        format!(
                            "frequency.number is required and must be positive for unit {}",
                            self.unit
                        )
                    })?;
                let unit = if self.unit.eq_ignore_ascii_case("DAY") {
                    FrequencyUnit::Day
                } else {
                    FrequencyUnit::Hour
                };
                Ok(Frequency { unit, count })
            }
            "ONCE" => Ok(Frequency::once()),
            "NEVER" => Ok(Frequency::never()),
            _ => Err(format!(
                "invalid frequency.unit '{}', must be one of: DAY, HOUR, ONCE, NEVER",
                self.unit
            )),
        }
    }
}

/// Union of every field any rule kind may carry
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRule {
    id: Option<i64>,
    threshold: f64,
    direction: String,
    enabled: bool,
    recipient_email: Option<String>,
    telegram_chat_id: Option<String>,
    frequency: Option<RawFrequency>,

    // price
    symbol: Option<String>,
    price_feed_id: Option<String>,

    // metric
    protocol: Option<String>,
    category: Option<String>,
    version: Option<String>,
    chain_id: Option<String>,
    market_token_contract: Option<String>,
    market_id: Option<String>,
    field: Option<String>,
    market_token_name: Option<String>,
    market_token_pair: Option<String>,
    vault_name: Option<String>,
    borrow_token_contract: Option<String>,
    collateral_token_contract: Option<String>,
    oracle_address: Option<String>,
    irm_address: Option<String>,
    lltv: Option<String>,
    market_contract_address: Option<String>,
    vault_token_address: Option<String>,
    deposit_token_contract: Option<String>,

    // prediction
    predict_market: Option<String>,
    token_id: Option<String>,
    question: Option<String>,
    outcome: Option<String>,
    question_id: Option<String>,
    condition_id: Option<String>,
    neg_risk: bool,
}

/// Treat empty strings as absent
fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl RawRule {
    fn into_rule(self) -> Result<AlertRule, String> {
        let subject = if present(&self.protocol).is_some() {
            self.metric_subject()?
        } else if present(&self.token_id).is_some() {
            self.prediction_subject()?
        } else if present(&self.symbol).is_some() {
            self.price_subject()?
        } else {
            return Err(
                "unable to determine rule type (expected 'symbol', 'protocol' or 'token_id')"
                    .to_string(),
            );
        };

        let label = subject.label();
        let direction: Direction = self
            .direction
            .parse()
            .map_err(|e| format!("{} for {}", e, label))?;

        match &subject {
            RuleSubject::Price(_) if self.threshold <= 0.0 => {
                return Err(format!("threshold must be positive for {}", label));
            }
            RuleSubject::Metric(_) if self.threshold < 0.0 => {
                return Err(format!("threshold must be non-negative for {}", label));
            }
            RuleSubject::Prediction(_) if !(0.0..=1.0).contains(&self.threshold) => {
                return Err(format!("threshold must be within [0, 1] for {}", label));
            }
            _ => {}
        }

        let frequency = match self.frequency {
            Some(raw) => Some(
                raw.into_frequency()
                    .map_err(|e| format!("{} for {}", e, label))?,
            ),
            None => None,
        };

        Ok(AlertRule {
            // 0 is the "never persisted" marker in exported rule files
            id: self.id.filter(|id| *id != 0),
            subject,
            threshold: self.threshold,
            direction,
            enabled: self.enabled,
            frequency,
            last_triggered: None,
            target: DeliveryTarget {
                email: present(&self.recipient_email),
                chat_id: present(&self.telegram_chat_id),
            },
        })
    }

    fn price_subject(&self) -> Result<RuleSubject, String> {
        let symbol = present(&self.symbol).ok_or("symbol cannot be empty")?;
        let price_feed_id = present(&self.price_feed_id)
            .ok_or_else(|| format!("price_feed_id is required for symbol {}", symbol))?;
        Ok(RuleSubject::Price(PriceSubject {
            symbol,
            price_feed_id,
        }))
    }

    fn metric_subject(&self) -> Result<RuleSubject, String> {
        let protocol = present(&self.protocol)
            .ok_or("protocol cannot be empty")?
            .to_ascii_lowercase();
        let version = present(&self.version).ok_or("version cannot be empty")?;
        let chain_id = present(&self.chain_id).ok_or("chain_id cannot be empty")?;
        let category = present(&self.category).map(|c| c.to_ascii_lowercase());

        let instrument = match protocol.as_str() {
            "morpho" => match category.as_deref() {
                Some("market") => present(&self.market_token_contract)
                    .or_else(|| present(&self.market_id))
                    .ok_or("market_id or market_token_contract is required for Morpho market")?,
                Some("vault") => {
                    let vault = present(&self.vault_token_address)
                        .ok_or("vault_token_address is required for Morpho vault")?;
                    present(&self.market_token_contract).unwrap_or(vault)
                }
                _ => return Err("category must be 'market' or 'vault' for Morpho protocol".into()),
            },
            "kamino" => {
                if category.as_deref() != Some("vault") {
                    return Err("category must be 'vault' for Kamino protocol".into());
                }
                let vault = present(&self.vault_token_address)
                    .ok_or("vault_token_address is required for Kamino vault")?;
                if present(&self.deposit_token_contract).is_none() {
                    return Err("deposit_token_contract is required for Kamino vault".into());
                }
                present(&self.market_token_contract).unwrap_or(vault)
            }
            _ => present(&self.market_token_contract)
                .ok_or("market_token_contract cannot be empty")?,
        };

        let field: MetricField = present(&self.field)
            .ok_or("field cannot be empty")?
            .parse()
            .map_err(|e| format!("{} for protocol {} {}", e, protocol, version))?;

        let display_name = present(&self.market_token_name)
            .or_else(|| present(&self.market_token_pair))
            .or_else(|| present(&self.vault_name));

        let mut params = BTreeMap::new();
        for (key, value) in [
            ("borrow_token_contract", &self.borrow_token_contract),
            ("collateral_token_contract", &self.collateral_token_contract),
            ("oracle_address", &self.oracle_address),
            ("irm_address", &self.irm_address),
            ("lltv", &self.lltv),
            ("market_contract_address", &self.market_contract_address),
            ("vault_token_address", &self.vault_token_address),
            ("deposit_token_contract", &self.deposit_token_contract),
        ] {
            if let Some(value) = present(value) {
                params.insert(key.to_string(), value);
            }
        }

        Ok(RuleSubject::Metric(MetricSubject {
            protocol,
            category,
            version,
            chain_id,
            instrument,
            field,
            display_name,
            params,
        }))
    }

    fn prediction_subject(&self) -> Result<RuleSubject, String> {
        let token_id = present(&self.token_id).ok_or("token_id cannot be empty")?;
        let field = present(&self.field)
            .map(|f| f.to_ascii_uppercase())
            .unwrap_or_else(|| "MIDPOINT".to_string());
        if field != "MIDPOINT" {
            return Err(format!(
                "invalid field '{}' for token {}, only MIDPOINT is supported",
                field, token_id
            ));
        }

        Ok(RuleSubject::Prediction(PredictionSubject {
            market: present(&self.predict_market)
                .map(|m| m.to_ascii_lowercase())
                .unwrap_or_else(|| "polymarket".to_string()),
            token_id,
            field,
            question: present(&self.question),
            outcome: present(&self.outcome),
            question_id: present(&self.question_id),
            condition_id: present(&self.condition_id),
            neg_risk: self.neg_risk,
        }))
    }
}

/// Rule loading errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Rule file not found: {0}")]
    NotFound(String),

    #[error("Failed to read rules: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse rules JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid rule at index {index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("No alert rules found in {0}")]
    Empty(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::RuleKind;
    use std::io::Write;

    #[test]
    fn test_parse_price_rule() {
        let json = r#"[{
            "symbol": "BTC/USD",
            "price_feed_id": "0xe62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43",
            "threshold": 100000,
            "direction": ">=",
            "enabled": true,
            "recipient_email": "ops@example.com",
            "frequency": {"unit": "HOUR", "number": 3}
        }]"#;

        let rules = parse_rules(json).unwrap();
        assert_eq!(rules.price.len(), 1);

        let rule = &rules.price[0];
        assert_eq!(rule.id, None);
        assert_eq!(rule.direction, Direction::GreaterOrEqual);
        assert_eq!(rule.frequency, Some(Frequency::hours(3)));
        assert_eq!(rule.target.email.as_deref(), Some("ops@example.com"));
        assert!(rule.enabled);
    }

    #[test]
    fn test_parse_classifies_kinds() {
        let json = r#"[
            {"symbol": "ETH/USD", "price_feed_id": "0xff", "threshold": 2000, "direction": "<", "enabled": true},
            {"protocol": "aave", "version": "v3", "chain_id": "1", "market_token_contract": "0xA0b8",
             "field": "apy", "threshold": 4.5, "direction": "<=", "enabled": true,
             "market_token_name": "USDC", "telegram_chat_id": "-100123"},
            {"token_id": "7193", "threshold": 0.65, "direction": ">", "enabled": false,
             "question": "Will it rain?", "outcome": "YES"}
        ]"#;

        let rules = parse_rules(json).unwrap();
        assert_eq!(rules.rules(RuleKind::Price).len(), 1);
        assert_eq!(rules.rules(RuleKind::Metric).len(), 1);
        assert_eq!(rules.rules(RuleKind::Prediction).len(), 1);

        let RuleSubject::Metric(metric) = &rules.metric[0].subject else {
            panic!("expected metric subject");
        };
        assert_eq!(metric.field, MetricField::Apy);
        assert_eq!(metric.display_name.as_deref(), Some("USDC"));
        assert_eq!(rules.metric[0].target.chat_id.as_deref(), Some("-100123"));

        let RuleSubject::Prediction(prediction) = &rules.prediction[0].subject else {
            panic!("expected prediction subject");
        };
        assert_eq!(prediction.market, "polymarket");
        assert_eq!(prediction.field, "MIDPOINT");
        assert!(!rules.prediction[0].enabled);
    }

    #[test]
    fn test_parse_morpho_market_uses_market_id() {
        let json = r#"[{"protocol": "Morpho", "category": "market", "version": "v1", "chain_id": "8453",
            "market_id": "0x9103", "field": "UTILIZATION", "threshold": 90, "direction": ">=",
            "enabled": true, "lltv": "860000000000000000", "oracle_address": "0x6633"}]"#;

        let rules = parse_rules(json).unwrap();
        let RuleSubject::Metric(metric) = &rules.metric[0].subject else {
            panic!("expected metric subject");
        };
        assert_eq!(metric.protocol, "morpho");
        assert_eq!(metric.instrument, "0x9103");
        assert_eq!(metric.params.get("lltv").map(String::as_str), Some("860000000000000000"));
        assert_eq!(metric.params.len(), 2);
    }

    #[test]
    fn test_parse_keeps_persisted_id_and_zeroes_as_none() {
        let json = r#"[
            {"id": 7, "symbol": "BTC/USD", "price_feed_id": "0x1", "threshold": 1, "direction": ">", "enabled": true},
            {"id": 0, "symbol": "BTC/USD", "price_feed_id": "0x1", "threshold": 1, "direction": ">", "enabled": true}
        ]"#;

        let rules = parse_rules(json).unwrap();
        assert_eq!(rules.price[0].id, Some(7));
        assert_eq!(rules.price[1].id, None);
    }

    #[test]
    fn test_parse_frequency_validation() {
        let missing_number = r#"[{"symbol": "BTC/USD", "price_feed_id": "0x1", "threshold": 1,
            "direction": ">", "enabled": true, "frequency": {"unit": "DAY"}}]"#;
        assert!(matches!(
            parse_rules(missing_number),
            Err(SourceError::Invalid { index: 0, .. })
        ));

        let bad_unit = r#"[{"symbol": "BTC/USD", "price_feed_id": "0x1", "threshold": 1,
            "direction": ">", "enabled": true, "frequency": {"unit": "WEEK", "number": 1}}]"#;
        assert!(parse_rules(bad_unit).is_err());

        let once_ignores_number = r#"[{"symbol": "BTC/USD", "price_feed_id": "0x1", "threshold": 1,
            "direction": ">", "enabled": true, "frequency": {"unit": "ONCE", "number": 9}}]"#;
        let rules = parse_rules(once_ignores_number).unwrap();
        assert_eq!(rules.price[0].frequency, Some(Frequency::once()));
    }

    #[test]
    fn test_parse_rejects_invalid_rules() {
        let cases = [
            r#"[{"threshold": 1, "direction": ">", "enabled": true}]"#,
            r#"[{"symbol": "BTC/USD", "price_feed_id": "0x1", "threshold": 1, "direction": "=>", "enabled": true}]"#,
            r#"[{"symbol": "BTC/USD", "price_feed_id": "0x1", "threshold": -1, "direction": ">", "enabled": true}]"#,
            r#"[{"symbol": "BTC/USD", "threshold": 1, "direction": ">", "enabled": true}]"#,
            r#"[{"protocol": "aave", "version": "v3", "chain_id": "1", "market_token_contract": "0x1",
                 "field": "PRICE", "threshold": 1, "direction": ">", "enabled": true}]"#,
            r#"[{"protocol": "kamino", "category": "vault", "version": "v2", "chain_id": "solana",
                 "vault_token_address": "HDsay", "field": "APY", "threshold": 1, "direction": ">", "enabled": true}]"#,
            r#"[{"token_id": "1", "threshold": 1.5, "direction": ">", "enabled": true}]"#,
        ];

        for case in cases {
            assert!(parse_rules(case).is_err(), "expected rejection: {}", case);
        }
    }

    #[tokio::test]
    async fn test_file_source_loads_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"symbol": "SOL/USD", "price_feed_id": "0xef0d", "threshold": 150, "direction": "<", "enabled": true}}]"#
        )
        .unwrap();

        let source = FileRuleSource::new(file.path());
        let rules = source.load().await.unwrap();
        assert_eq!(rules.price.len(), 1);
        assert!(source.describe().starts_with("file "));
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileRuleSource::new(dir.path().join("missing.json"));
        assert!(matches!(source.load().await, Err(SourceError::NotFound(_))));
    }
}
