//! Alert rules, the live rule store and rule sources

pub mod model;
pub mod source;
pub mod store;

pub use model::{
    AlertRule, DeliveryTarget, Direction, Frequency, FrequencyUnit, MetricField, MetricSubject,
    PredictionSubject, PriceSubject, RuleKind, RuleSubject,
};
pub use source::{parse_rules, FileRuleSource, RuleSource, SourceError};
pub use store::{RuleSet, RuleStore};
