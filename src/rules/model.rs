//! Alert rule types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Which family of monitored instrument a rule watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Oracle price of a trading symbol
    Price,
    /// Lending/vault protocol metric (TVL, APY, ...)
    Metric,
    /// Prediction-market token midpoint
    Prediction,
}

impl RuleKind {
    pub const ALL: [RuleKind; 3] = [RuleKind::Price, RuleKind::Metric, RuleKind::Prediction];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Price => "price",
            RuleKind::Metric => "metric",
            RuleKind::Prediction => "prediction",
        }
    }

    /// Tolerance used by [`Direction::Equal`]
    ///
    /// Prediction midpoints live in [0, 1] so they get a tighter band.
    pub fn epsilon(&self) -> f64 {
        match self {
            RuleKind::Price | RuleKind::Metric => 0.01,
            RuleKind::Prediction => 0.0001,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison between the observed value and the rule threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "<")]
    LessThan,
}

impl Direction {
    /// Whether `value` breaches `threshold`; `Equal` accepts `|value - threshold| <= epsilon`
    pub fn holds(&self, value: f64, threshold: f64, epsilon: f64) -> bool {
        match self {
            Direction::GreaterOrEqual => value >= threshold,
            Direction::GreaterThan => value > threshold,
            Direction::Equal => (value - threshold).abs() <= epsilon,
            Direction::LessOrEqual => value <= threshold,
            Direction::LessThan => value < threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Direction::GreaterOrEqual => ">=",
            Direction::GreaterThan => ">",
            Direction::Equal => "=",
            Direction::LessOrEqual => "<=",
            Direction::LessThan => "<",
        }
    }

    /// Phrase used in rendered alert messages ("is >=", "equals", ...)
    pub fn phrase(&self) -> &'static str {
        match self {
            Direction::GreaterOrEqual => "is >=",
            Direction::GreaterThan => "is >",
            Direction::Equal => "equals",
            Direction::LessOrEqual => "is <=",
            Direction::LessThan => "is <",
        }
    }

    /// Long-form wording used in notification bodies
    pub fn describe(&self) -> &'static str {
        match self {
            Direction::GreaterOrEqual => "greater than or equal to",
            Direction::GreaterThan => "greater than",
            Direction::Equal => "equal to",
            Direction::LessOrEqual => "less than or equal to",
            Direction::LessThan => "less than",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">=" => Ok(Direction::GreaterOrEqual),
            ">" => Ok(Direction::GreaterThan),
            "=" | "==" => Ok(Direction::Equal),
            "<=" => Ok(Direction::LessOrEqual),
            "<" => Ok(Direction::LessThan),
            other => Err(ParseDirectionError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid direction '{0}', must be one of: >=, >, =, <=, <")]
pub struct ParseDirectionError(pub String);

/// Unit of a rule's re-fire policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrequencyUnit {
    /// Fire a single time, then disable the rule
    Once,
    /// At most once every `count` hours
    Hour,
    /// At most once every `count` days
    Day,
    /// Armed but silenced
    Never,
}

impl FrequencyUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyUnit::Once => "ONCE",
            FrequencyUnit::Hour => "HOUR",
            FrequencyUnit::Day => "DAY",
            FrequencyUnit::Never => "NEVER",
        }
    }
}

/// Suppression policy for a persistently breaching rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frequency {
    pub unit: FrequencyUnit,
    /// Number of units; only meaningful for `Hour` and `Day`
    #[serde(default)]
    pub count: u32,
}

impl Frequency {
    pub fn once() -> Self {
        Self { unit: FrequencyUnit::Once, count: 0 }
    }

    pub fn never() -> Self {
        Self { unit: FrequencyUnit::Never, count: 0 }
    }

    pub fn hours(count: u32) -> Self {
        Self { unit: FrequencyUnit::Hour, count }
    }

    pub fn days(count: u32) -> Self {
        Self { unit: FrequencyUnit::Day, count }
    }

    /// Minimum spacing between two alerts, for the windowed units
    pub fn cooldown(&self) -> Option<Duration> {
        match self.unit {
            FrequencyUnit::Hour => Some(Duration::hours(i64::from(self.count))),
            FrequencyUnit::Day => Some(Duration::days(i64::from(self.count))),
            FrequencyUnit::Once | FrequencyUnit::Never => None,
        }
    }
}

/// Cooldown applied to rules without a frequency block
pub fn default_cooldown() -> Duration {
    Duration::hours(1)
}

/// Where a fired rule is delivered; both channels are optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl DeliveryTarget {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.chat_id.is_none()
    }
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.email, &self.chat_id) {
            (Some(email), Some(chat)) => write!(f, "{} + chat {}", email, chat),
            (Some(email), None) => f.write_str(email),
            (None, Some(chat)) => write!(f, "chat {}", chat),
            (None, None) => f.write_str("<no recipient>"),
        }
    }
}

/// Price rule match key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSubject {
    /// Trading symbol, e.g. "BTC/USD"
    pub symbol: String,
    /// Oracle feed identifier used by the fetcher
    pub price_feed_id: String,
}

/// Protocol metric being watched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricField {
    Tvl,
    Apy,
    Utilization,
    Liquidity,
}

impl MetricField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Tvl => "TVL",
            MetricField::Apy => "APY",
            MetricField::Utilization => "UTILIZATION",
            MetricField::Liquidity => "LIQUIDITY",
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TVL" => Ok(MetricField::Tvl),
            "APY" => Ok(MetricField::Apy),
            "UTILIZATION" => Ok(MetricField::Utilization),
            "LIQUIDITY" => Ok(MetricField::Liquidity),
            other => Err(format!(
                "invalid field '{}', must be one of: TVL, APY, UTILIZATION, LIQUIDITY",
                other
            )),
        }
    }
}

/// Lending/vault protocol rule match key plus display context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSubject {
    /// Protocol name, e.g. "aave", "morpho", "kamino"
    pub protocol: String,
    /// "market" or "vault" for protocols that have both
    pub category: Option<String>,
    pub version: String,
    pub chain_id: String,
    /// Token contract, market id or vault address depending on protocol
    pub instrument: String,
    pub field: MetricField,
    /// Token name, market pair or vault name for messages
    pub display_name: Option<String>,
    /// Protocol-specific addresses (oracle, irm, lltv, deposit token, ...)
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Prediction-market rule match key plus question context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSubject {
    /// Market venue, e.g. "polymarket"
    pub market: String,
    /// Order-book token id
    pub token_id: String,
    /// Compared field; only "MIDPOINT" is produced by fetchers
    pub field: String,
    pub question: Option<String>,
    pub outcome: Option<String>,
    pub question_id: Option<String>,
    pub condition_id: Option<String>,
    pub neg_risk: bool,
}

impl PredictionSubject {
    /// Venue name with a leading capital, used in messages
    pub fn market_display(&self) -> String {
        let mut chars = self.market.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// What a rule is matched against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuleSubject {
    Price(PriceSubject),
    Metric(MetricSubject),
    Prediction(PredictionSubject),
}

impl RuleSubject {
    pub fn kind(&self) -> RuleKind {
        match self {
            RuleSubject::Price(_) => RuleKind::Price,
            RuleSubject::Metric(_) => RuleKind::Metric,
            RuleSubject::Prediction(_) => RuleKind::Prediction,
        }
    }

    /// Short human label used in logs
    pub fn label(&self) -> String {
        match self {
            RuleSubject::Price(p) => p.symbol.clone(),
            RuleSubject::Metric(m) => format!(
                "{} {} {} on chain {}{}",
                m.protocol,
                m.version,
                m.field,
                m.chain_id,
                m.display_name
                    .as_deref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default()
            ),
            RuleSubject::Prediction(p) => format!(
                "{} token {}{}",
                p.market,
                p.token_id,
                p.outcome
                    .as_deref()
                    .map(|o| format!(" ({})", o))
                    .unwrap_or_default()
            ),
        }
    }
}

/// Operator-defined threshold alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Persisted identity; `None` for rules from sources without durable ids
    pub id: Option<i64>,
    pub subject: RuleSubject,
    pub threshold: f64,
    pub direction: Direction,
    pub enabled: bool,
    /// Re-fire policy; `None` means "at most once per hour"
    pub frequency: Option<Frequency>,
    /// Last successful trigger, only advanced by the evaluator
    pub last_triggered: Option<DateTime<Utc>>,
    pub target: DeliveryTarget,
}

impl AlertRule {
    /// Create an enabled rule with no persisted id, frequency or recipients
    pub fn new(subject: RuleSubject, threshold: f64, direction: Direction) -> Self {
        Self {
            id: None,
            subject,
            threshold,
            direction,
            enabled: true,
            frequency: None,
            last_triggered: None,
            target: DeliveryTarget::default(),
        }
    }

    /// Price rule for `symbol`; the feed id defaults to empty
    pub fn price(symbol: impl Into<String>, threshold: f64, direction: Direction) -> Self {
        Self::new(
            RuleSubject::Price(PriceSubject {
                symbol: symbol.into(),
                price_feed_id: String::new(),
            }),
            threshold,
            direction,
        )
    }

    /// Metric rule for (`chain_id`, `instrument`, `field`) on `protocol`
    pub fn metric(
        protocol: impl Into<String>,
        chain_id: impl Into<String>,
        instrument: impl Into<String>,
        field: MetricField,
        threshold: f64,
        direction: Direction,
    ) -> Self {
        Self::new(
            RuleSubject::Metric(MetricSubject {
                protocol: protocol.into(),
                category: None,
                version: String::new(),
                chain_id: chain_id.into(),
                instrument: instrument.into(),
                field,
                display_name: None,
                params: BTreeMap::new(),
            }),
            threshold,
            direction,
        )
    }

    /// Prediction-market midpoint rule for `token_id`
    pub fn prediction(
        market: impl Into<String>,
        token_id: impl Into<String>,
        threshold: f64,
        direction: Direction,
    ) -> Self {
        Self::new(
            RuleSubject::Prediction(PredictionSubject {
                market: market.into(),
                token_id: token_id.into(),
                field: "MIDPOINT".to_string(),
                question: None,
                outcome: None,
                question_id: None,
                condition_id: None,
                neg_risk: false,
            }),
            threshold,
            direction,
        )
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.target.email = Some(email.into());
        self
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.target.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_last_triggered(mut self, at: DateTime<Utc>) -> Self {
        self.last_triggered = Some(at);
        self
    }

    pub fn kind(&self) -> RuleKind {
        self.subject.kind()
    }
}
