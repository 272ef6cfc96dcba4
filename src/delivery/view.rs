//! Channel-independent view of a delivered alert
//!
//! Built from a decoded envelope; every notifier renders from this shape so
//! email and chat bodies stay consistent.

use chrono::{DateTime, Utc};

use crate::broker::events::AlertEnvelope;
use crate::rules::{DeliveryTarget, Direction, MetricField, RuleKind};

#[derive(Debug, Clone, PartialEq)]
pub struct AlertView {
    pub kind: RuleKind,
    /// "Crypto Alert Triggered", "DeFi Alert Triggered", ...
    pub title: String,
    /// Instrument line, e.g. "BTC/USD" or "aave v3 on Ethereum"
    pub headline: String,
    /// What the threshold was compared against ("Price", "TVL", "Midpoint")
    pub subject: String,
    pub direction: Direction,
    pub threshold: f64,
    pub observed: f64,
    /// Threshold and observed value formatted for the field's unit
    pub threshold_display: String,
    pub observed_display: String,
    /// Pre-rendered one-line message from the evaluator
    pub message: String,
    /// Extra labelled rows shown under the headline
    pub details: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
    pub target: DeliveryTarget,
}

impl AlertView {
    pub fn from_envelope(envelope: &AlertEnvelope) -> Self {
        let target = envelope.target();
        match envelope {
            AlertEnvelope::Token(e) => Self {
                kind: RuleKind::Price,
                title: "Crypto Alert Triggered".to_string(),
                headline: e.symbol.clone(),
                subject: "Price".to_string(),
                direction: e.direction,
                threshold: e.threshold,
                observed: e.price,
                threshold_display: format!("${}", e.threshold),
                observed_display: format!("${}", e.price),
                message: e.message.clone(),
                details: vec![("Symbol".to_string(), e.symbol.clone())],
                timestamp: e.timestamp,
                target,
            },
            AlertEnvelope::Metric(e) => {
                let mut details = Vec::new();
                if let Some(market) = market_info(&e.protocol, e.category.as_deref(), e.display_name.as_deref()) {
                    details.push(("Market".to_string(), market));
                }
                details.push(("Field".to_string(), e.field.to_string()));
                details.push(("Chain".to_string(), e.chain_name.clone()));

                Self {
                    kind: RuleKind::Metric,
                    title: "DeFi Alert Triggered".to_string(),
                    headline: format!("{} {} on {}", e.protocol, e.version, e.chain_name),
                    subject: e.field.to_string(),
                    direction: e.direction,
                    threshold: e.threshold,
                    observed: e.current_value,
                    threshold_display: format_metric(e.field, e.threshold, false),
                    observed_display: format_metric(e.field, e.current_value, true),
                    message: e.message.clone(),
                    details,
                    timestamp: e.triggered_at,
                    target,
                }
            }
            AlertEnvelope::Prediction(e) => {
                let mut details = Vec::new();
                if let Some(question) = &e.question {
                    details.push(("Question".to_string(), question.clone()));
                }
                if let Some(outcome) = &e.outcome {
                    details.push(("Outcome".to_string(), outcome.clone()));
                }
                details.push(("Buy Price".to_string(), format!("{:.4}", e.current_buy_price)));
                details.push(("Sell Price".to_string(), format!("{:.4}", e.current_sell_price)));

                Self {
                    kind: RuleKind::Prediction,
                    title: "Prediction Market Alert".to_string(),
                    headline: capitalize(&e.predict_market),
                    subject: "Midpoint".to_string(),
                    direction: e.direction,
                    threshold: e.threshold,
                    observed: e.current_midpoint,
                    threshold_display: format!("{}", e.threshold),
                    observed_display: format!("{:.4}", e.current_midpoint),
                    message: e.message.clone(),
                    details,
                    timestamp: e.triggered_at,
                    target,
                }
            }
        }
    }

    /// "Price >= $100000"
    pub fn condition(&self) -> String {
        format!("{} {} {}", self.subject, self.direction, self.threshold_display)
    }

    pub fn direction_emoji(&self) -> &'static str {
        match self.direction {
            Direction::GreaterOrEqual | Direction::GreaterThan => "📈",
            Direction::LessOrEqual | Direction::LessThan => "📉",
            Direction::Equal => "⚖️",
        }
    }
}

fn market_info(protocol: &str, category: Option<&str>, display_name: Option<&str>) -> Option<String> {
    match (protocol, category, display_name) {
        ("morpho", Some(category), Some(name)) => Some(format!("{} ({})", category, name)),
        ("morpho", Some(category), None) => Some(category.to_string()),
        (_, _, Some(name)) => Some(name.to_string()),
        _ => None,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Unit-aware rendering: TVL and liquidity as dollar amounts, rates as percents
fn format_metric(field: MetricField, value: f64, with_approx: bool) -> String {
    match field {
        MetricField::Tvl | MetricField::Liquidity => {
            let exact = format!("${}", group_thousands(value));
            match approx_suffix(value) {
                Some(approx) if with_approx => format!("{} (~{})", exact, approx),
                _ => exact,
            }
        }
        MetricField::Apy | MetricField::Utilization => format!("{}%", value),
    }
}

fn group_thousands(value: f64) -> String {
    let rounded = format!("{:.2}", value.abs());
    let (int_part, frac_part) = rounded.split_once('.').unwrap_or((rounded.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, frac_part)
}

fn approx_suffix(value: f64) -> Option<String> {
    let abs = value.abs();
    let (scaled, suffix) = if abs >= 1e9 {
        (value / 1e9, "B")
    } else if abs >= 1e6 {
        (value / 1e6, "M")
    } else if abs >= 1e3 {
        (value / 1e3, "K")
    } else {
        return None;
    };
    Some(format!("{:.2}{}", scaled, suffix))
}
