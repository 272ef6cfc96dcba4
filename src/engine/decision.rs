//! Observations fed to the evaluator and the decisions it produces

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::{AlertRule, MetricField, RuleKind, RuleSubject};

/// Latest oracle price for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub symbol: String,
    pub price: f64,
    /// Oracle publish time
    pub published_at: DateTime<Utc>,
}

impl PriceObservation {
    pub fn new(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            published_at: Utc::now(),
        }
    }

    /// Reject values a fetcher should never hand to the evaluator
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.is_empty() {
            return Err("symbol cannot be empty".to_string());
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(format!("invalid price {} for {}", self.price, self.symbol));
        }
        Ok(())
    }
}

/// Current value of one protocol metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricObservation {
    pub chain_id: String,
    pub instrument: String,
    pub field: MetricField,
    pub value: f64,
    /// Display name of the chain, e.g. "Ethereum"
    pub chain_name: String,
}

/// Order-book prices of one prediction-market token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionObservation {
    pub token_id: String,
    /// Compared against the rule threshold
    pub midpoint: f64,
    pub buy_price: f64,
    pub sell_price: f64,
}

/// A freshly observed value together with its match key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Observation {
    Price(PriceObservation),
    Metric(MetricObservation),
    Prediction(PredictionObservation),
}

impl Observation {
    pub fn kind(&self) -> RuleKind {
        match self {
            Observation::Price(_) => RuleKind::Price,
            Observation::Metric(_) => RuleKind::Metric,
            Observation::Prediction(_) => RuleKind::Prediction,
        }
    }

    /// Value compared against rule thresholds
    pub fn value(&self) -> f64 {
        match self {
            Observation::Price(p) => p.price,
            Observation::Metric(m) => m.value,
            Observation::Prediction(p) => p.midpoint,
        }
    }

    /// Whether this observation is the instrument `subject` watches
    pub fn matches(&self, subject: &RuleSubject) -> bool {
        match (self, subject) {
            (Observation::Price(obs), RuleSubject::Price(s)) => obs.symbol == s.symbol,
            (Observation::Metric(obs), RuleSubject::Metric(s)) => {
                obs.chain_id == s.chain_id && obs.instrument == s.instrument && obs.field == s.field
            }
            (Observation::Prediction(obs), RuleSubject::Prediction(s)) => {
                obs.token_id == s.token_id
            }
            _ => false,
        }
    }

    /// Human-readable alert line for `rule` firing on this observation
    pub fn render_message(&self, rule: &AlertRule) -> String {
        let phrase = rule.direction.phrase();
        match (self, &rule.subject) {
            (Observation::Metric(obs), RuleSubject::Metric(s)) => format!(
                "🚨 Alert: {} {} {} on {} - {} is {}, which {} threshold of {}",
                s.protocol,
                s.version,
                s.field,
                obs.chain_name,
                s.field,
                obs.value,
                phrase,
                rule.threshold
            ),
            (Observation::Prediction(obs), RuleSubject::Prediction(s)) => format!(
                "🚨 Alert: {} token {} midpoint is {:.4}, which {} threshold of {}",
                s.market_display(),
                obs.token_id,
                obs.midpoint,
                phrase,
                rule.threshold
            ),
            (Observation::Price(obs), _) => format!(
                "🚨 Alert: {} price is {}, which {} threshold of {}",
                obs.symbol, obs.price, phrase, rule.threshold
            ),
            _ => format!(
                "🚨 Alert: {} is {}, which {} threshold of {}",
                rule.subject.label(),
                self.value(),
                phrase,
                rule.threshold
            ),
        }
    }
}

/// A rule that fired on an observation
///
/// Only positive outcomes are represented; a rule that did not fire
/// produces no `Decision` at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The rule as it stood right after firing (suppression state updated)
    pub rule: AlertRule,
    pub observation: Observation,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

impl Decision {
    pub fn kind(&self) -> RuleKind {
        self.observation.kind()
    }
}
