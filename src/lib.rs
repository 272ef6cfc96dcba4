//! Tripwire: threshold alerting for oracle prices, protocol metrics and
//! prediction markets
//!
//! Two services share this crate:
//!
//! - the **evaluator** polls data sources, runs each observation through the
//!   live rule set and publishes an alert envelope for every rule that fires
//! - the **notifier** consumes the alert topics with one worker per alert
//!   kind and delivers email / Telegram messages, committing each offset only
//!   after the delivery attempt
//!
//! # Features
//!
//! - **Hot reload**: rule sets are swapped atomically, suppression state is
//!   carried over by rule id
//! - **Frequency suppression**: hourly/daily windows, fire-once and never
//! - **At-least-once delivery**: commit-after-send, fresh consumer groups
//!   pinned to the earliest offset, capped exponential backoff on outages
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tripwire::engine::{Evaluator, Observation, PriceObservation};
//! use tripwire::rules::{AlertRule, Direction, RuleStore};
//!
//! let store = Arc::new(RuleStore::new());
//! store.add_rule(
//!     AlertRule::price("BTC/USD", 100_000.0, Direction::GreaterOrEqual)
//!         .with_email("ops@example.com"),
//! );
//!
//! let evaluator = Evaluator::new(store);
//! let decisions = evaluator.evaluate(&Observation::Price(PriceObservation::new("BTC/USD", 101_000.0)));
//! for decision in decisions {
//!     println!("{}", decision.message);
//! }
//! ```

pub mod broker;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod fetch;
pub mod monitor;
pub mod notify;
pub mod rules;
pub mod shutdown;

// Re-export commonly used types
pub use engine::{Decision, Evaluator, Observation};
pub use rules::{AlertRule, RuleStore};
pub use shutdown::{Shutdown, ShutdownListener};
