//! Wire payloads placed on the alert topics
//!
//! One JSON schema per rule kind, each on its own topic:
//!
//! | Kind       | Topic            | Partition key            |
//! |------------|------------------|--------------------------|
//! | price      | `alerts.token`   | symbol                   |
//! | metric     | `alerts.defi`    | `chain_id:instrument`    |
//! | prediction | `alerts.predict` | token id                 |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::BrokerError;
use crate::engine::{Decision, Observation};
use crate::rules::{DeliveryTarget, Direction, MetricField, RuleKind, RuleSubject};

pub const TOPIC_TOKEN_ALERT: &str = "alerts.token";
pub const TOPIC_METRIC_ALERT: &str = "alerts.defi";
pub const TOPIC_PREDICTION_ALERT: &str = "alerts.predict";

/// Topic carrying alerts of `kind`
pub fn topic_for(kind: RuleKind) -> &'static str {
    match kind {
        RuleKind::Price => TOPIC_TOKEN_ALERT,
        RuleKind::Metric => TOPIC_METRIC_ALERT,
        RuleKind::Prediction => TOPIC_PREDICTION_ALERT,
    }
}

/// Consumer-group name for the delivery worker of `kind`
pub fn group_for(prefix: &str, kind: RuleKind) -> String {
    let suffix = match kind {
        RuleKind::Price => "token",
        RuleKind::Metric => "defi",
        RuleKind::Prediction => "predict",
    };
    format!("{}-{}", prefix, suffix)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAlertEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
    pub symbol: String,
    pub price: f64,
    pub threshold: f64,
    pub direction: Direction,
    /// Oracle publish time of `price`
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAlertEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub version: String,
    pub chain_id: String,
    pub chain_name: String,
    pub instrument: String,
    pub field: MetricField,
    pub threshold: f64,
    pub direction: Direction,
    pub current_value: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Protocol-specific addresses copied from the rule
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionAlertEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
    pub predict_market: String,
    pub token_id: String,
    pub field: String,
    pub threshold: f64,
    pub direction: Direction,
    pub current_midpoint: f64,
    pub current_buy_price: f64,
    pub current_sell_price: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub neg_risk: bool,
    pub triggered_at: DateTime<Utc>,
}

/// A decision projected onto its kind's wire schema
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEnvelope {
    Token(TokenAlertEvent),
    Metric(MetricAlertEvent),
    Prediction(PredictionAlertEvent),
}

impl AlertEnvelope {
    /// Project `decision` together with its rule's delivery target
    pub fn from_decision(decision: &Decision) -> Result<Self, BrokerError> {
        let rule = &decision.rule;
        let DeliveryTarget { email, chat_id } = rule.target.clone();

        match (&rule.subject, &decision.observation) {
            (RuleSubject::Price(_), Observation::Price(obs)) => {
                Ok(AlertEnvelope::Token(TokenAlertEvent {
                    recipient_email: email,
                    telegram_chat_id: chat_id,
                    symbol: obs.symbol.clone(),
                    price: obs.price,
                    threshold: rule.threshold,
                    direction: rule.direction,
                    timestamp: obs.published_at,
                    message: decision.message.clone(),
                }))
            }
            (RuleSubject::Metric(subject), Observation::Metric(obs)) => {
                Ok(AlertEnvelope::Metric(MetricAlertEvent {
                    recipient_email: email,
                    telegram_chat_id: chat_id,
                    protocol: subject.protocol.clone(),
                    category: subject.category.clone(),
                    version: subject.version.clone(),
                    chain_id: subject.chain_id.clone(),
                    chain_name: obs.chain_name.clone(),
                    instrument: subject.instrument.clone(),
                    field: subject.field,
                    threshold: rule.threshold,
                    direction: rule.direction,
                    current_value: obs.value,
                    message: decision.message.clone(),
                    display_name: subject.display_name.clone(),
                    params: subject.params.clone(),
                    triggered_at: decision.triggered_at,
                }))
            }
            (RuleSubject::Prediction(subject), Observation::Prediction(obs)) => {
                Ok(AlertEnvelope::Prediction(PredictionAlertEvent {
                    recipient_email: email,
                    telegram_chat_id: chat_id,
                    predict_market: subject.market.clone(),
                    token_id: subject.token_id.clone(),
                    field: subject.field.clone(),
                    threshold: rule.threshold,
                    direction: rule.direction,
                    current_midpoint: obs.midpoint,
                    current_buy_price: obs.buy_price,
                    current_sell_price: obs.sell_price,
                    message: decision.message.clone(),
                    question: subject.question.clone(),
                    outcome: subject.outcome.clone(),
                    question_id: subject.question_id.clone(),
                    condition_id: subject.condition_id.clone(),
                    neg_risk: subject.neg_risk,
                    triggered_at: decision.triggered_at,
                }))
            }
            (subject, observation) => Err(BrokerError::Envelope(format!(
                "{} rule cannot carry a {} observation",
                subject.kind(),
                observation.kind()
            ))),
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            AlertEnvelope::Token(_) => RuleKind::Price,
            AlertEnvelope::Metric(_) => RuleKind::Metric,
            AlertEnvelope::Prediction(_) => RuleKind::Prediction,
        }
    }

    pub fn topic(&self) -> &'static str {
        topic_for(self.kind())
    }

    /// Partition key; alerts for one instrument stay ordered
    pub fn key(&self) -> String {
        match self {
            AlertEnvelope::Token(e) => e.symbol.clone(),
            AlertEnvelope::Metric(e) => format!("{}:{}", e.chain_id, e.instrument),
            AlertEnvelope::Prediction(e) => e.token_id.clone(),
        }
    }

    pub fn target(&self) -> DeliveryTarget {
        let (email, chat_id) = match self {
            AlertEnvelope::Token(e) => (&e.recipient_email, &e.telegram_chat_id),
            AlertEnvelope::Metric(e) => (&e.recipient_email, &e.telegram_chat_id),
            AlertEnvelope::Prediction(e) => (&e.recipient_email, &e.telegram_chat_id),
        };
        DeliveryTarget {
            email: email.clone(),
            chat_id: chat_id.clone(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AlertEnvelope::Token(e) => &e.message,
            AlertEnvelope::Metric(e) => &e.message,
            AlertEnvelope::Prediction(e) => &e.message,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            AlertEnvelope::Token(e) => serde_json::to_vec(e),
            AlertEnvelope::Metric(e) => serde_json::to_vec(e),
            AlertEnvelope::Prediction(e) => serde_json::to_vec(e),
        }
    }

    /// Decode a payload read from the topic of `kind`
    pub fn decode(kind: RuleKind, payload: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            RuleKind::Price => AlertEnvelope::Token(serde_json::from_slice(payload)?),
            RuleKind::Metric => AlertEnvelope::Metric(serde_json::from_slice(payload)?),
            RuleKind::Prediction => AlertEnvelope::Prediction(serde_json::from_slice(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MetricObservation, PriceObservation};
    use crate::rules::AlertRule;

    fn price_decision() -> Decision {
        let rule = AlertRule::price("BTC/USD", 100_000.0, Direction::GreaterOrEqual)
            .with_email("ops@example.com");
        let observation = Observation::Price(PriceObservation::new("BTC/USD", 101_000.0));
        Decision {
            message: observation.render_message(&rule),
            rule,
            observation,
            triggered_at: Utc::now(),
        }
    }

    #[test]
    fn test_token_envelope_wire_shape() {
        let envelope = AlertEnvelope::from_decision(&price_decision()).unwrap();
        assert_eq!(envelope.topic(), "alerts.token");
        assert_eq!(envelope.key(), "BTC/USD");

        let json: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["recipient_email"], "ops@example.com");
        assert_eq!(json["direction"], ">=");
        assert_eq!(json["price"], 101_000.0);
        assert!(json.get("telegram_chat_id").is_none());
    }

    #[test]
    fn test_decode_uses_topic_kind() {
        let envelope = AlertEnvelope::from_decision(&price_decision()).unwrap();
        let bytes = envelope.to_bytes().unwrap();

        let decoded = AlertEnvelope::decode(RuleKind::Price, &bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert!(AlertEnvelope::decode(RuleKind::Prediction, &bytes).is_err());
        assert!(AlertEnvelope::decode(RuleKind::Price, b"not json").is_err());
    }

    #[test]
    fn test_metric_envelope_key_and_params() {
        let mut rule = AlertRule::metric(
            "morpho",
            "8453",
            "0xmarket",
            MetricField::Utilization,
            90.0,
            Direction::GreaterThan,
        )
        .with_chat_id("-100200");
        if let RuleSubject::Metric(subject) = &mut rule.subject {
            subject.params.insert("lltv".to_string(), "860000000000000000".to_string());
        }
        let observation = Observation::Metric(MetricObservation {
            chain_id: "8453".to_string(),
            instrument: "0xmarket".to_string(),
            field: MetricField::Utilization,
            value: 95.0,
            chain_name: "Base".to_string(),
        });
        let decision = Decision {
            message: observation.render_message(&rule),
            rule,
            observation,
            triggered_at: Utc::now(),
        };

        let envelope = AlertEnvelope::from_decision(&decision).unwrap();
        assert_eq!(envelope.topic(), "alerts.defi");
        assert_eq!(envelope.key(), "8453:0xmarket");
        assert_eq!(envelope.target().chat_id.as_deref(), Some("-100200"));
        match envelope {
            AlertEnvelope::Metric(event) => {
                assert_eq!(event.params.get("lltv").map(String::as_str), Some("860000000000000000"));
                assert_eq!(event.chain_name, "Base");
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_decision_is_rejected() {
        let mut decision = price_decision();
        decision.rule = AlertRule::prediction("polymarket", "1", 0.5, Direction::Equal);
        assert!(matches!(
            AlertEnvelope::from_decision(&decision),
            Err(BrokerError::Envelope(_))
        ));
    }

    #[test]
    fn test_group_names() {
        assert_eq!(group_for("notification-service", RuleKind::Price), "notification-service-token");
        assert_eq!(group_for("notification-service", RuleKind::Metric), "notification-service-defi");
        assert_eq!(group_for("ns", RuleKind::Prediction), "ns-predict");
    }
}
