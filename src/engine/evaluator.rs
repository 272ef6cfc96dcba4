//! Rule evaluation and frequency-based suppression
//!
//! ## Per-rule state machine
//!
//! ```text
//! Armed --(breach, not suppressed)--> Fired: last_triggered = now --> Armed
//! Armed --(breach, ONCE)------------> Fired --> Disabled (absorbing)
//! ```
//!
//! A rule that recovers and breaches again inside its window stays quiet.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::decision::{Decision, Observation};
use crate::rules::model::default_cooldown;
use crate::rules::{AlertRule, FrequencyUnit, RuleStore};

/// Turns observations into alert decisions against the live rule store
#[derive(Debug, Clone)]
pub struct Evaluator {
    store: Arc<RuleStore>,
}

impl Evaluator {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Evaluate `observation` against every rule of its kind, in store order
    pub fn evaluate(&self, observation: &Observation) -> Vec<Decision> {
        self.evaluate_at(observation, Utc::now())
    }

    /// Same as [`Evaluator::evaluate`] with an explicit clock reading
    pub fn evaluate_at(&self, observation: &Observation, now: DateTime<Utc>) -> Vec<Decision> {
        self.store.with_rules_mut(observation.kind(), |rules| {
            rules
                .iter_mut()
                .filter_map(|rule| Self::evaluate_rule(rule, observation, now))
                .collect()
        })
    }

    /// Evaluate one rule, advancing its suppression state when it fires
    fn evaluate_rule(
        rule: &mut AlertRule,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        if !rule.enabled || !observation.matches(&rule.subject) {
            return None;
        }

        let epsilon = observation.kind().epsilon();
        if !rule
            .direction
            .holds(observation.value(), rule.threshold, epsilon)
        {
            return None;
        }

        if Self::is_suppressed(rule, now) {
            tracing::debug!(
                rule = %rule.subject.label(),
                rule_id = ?rule.id,
                last_triggered = ?rule.last_triggered,
                "Alert suppressed by frequency policy"
            );
            return None;
        }

        rule.last_triggered = Some(now);
        if matches!(rule.frequency, Some(f) if f.unit == FrequencyUnit::Once) {
            rule.enabled = false;
        }

        Some(Decision {
            message: observation.render_message(rule),
            rule: rule.clone(),
            observation: observation.clone(),
            triggered_at: now,
        })
    }

    /// Whether a breaching rule must stay quiet at `now`
    ///
    /// May disable a ONCE rule that already fired (e.g. carried over a reload).
    fn is_suppressed(rule: &mut AlertRule, now: DateTime<Utc>) -> bool {
        let last_triggered = rule.last_triggered;
        let within = |cooldown: chrono::Duration| match last_triggered {
            Some(last) => now - last < cooldown,
            None => false,
        };

        match rule.frequency {
            None => within(default_cooldown()),
            Some(frequency) => match frequency.unit {
                FrequencyUnit::Never => true,
                FrequencyUnit::Once => {
                    if rule.last_triggered.is_some() {
                        rule.enabled = false;
                        true
                    } else {
                        false
                    }
                }
                FrequencyUnit::Hour | FrequencyUnit::Day => {
                    within(frequency.cooldown().unwrap_or_else(default_cooldown))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decision::{MetricObservation, PredictionObservation, PriceObservation};
    use crate::rules::{Direction, Frequency, MetricField, RuleKind, RuleSet};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn price(symbol: &str, value: f64) -> Observation {
        Observation::Price(PriceObservation::new(symbol, value))
    }

    fn evaluator_with(rules: Vec<AlertRule>) -> Evaluator {
        let set: RuleSet = rules.into_iter().collect();
        Evaluator::new(Arc::new(RuleStore::with_rules(set)))
    }

    #[test]
    fn test_comparators() {
        let cases = [
            (Direction::GreaterOrEqual, 50_000.0, 51_000.0, true),
            (Direction::GreaterOrEqual, 50_000.0, 50_000.0, true),
            (Direction::GreaterOrEqual, 50_000.0, 49_999.0, false),
            (Direction::GreaterThan, 2_000.0, 2_000.0, false),
            (Direction::GreaterThan, 2_000.0, 2_000.5, true),
            (Direction::Equal, 1.0, 1.005, true),
            (Direction::Equal, 1.0, 1.02, false),
            (Direction::LessOrEqual, 10.0, 10.0, true),
            (Direction::LessOrEqual, 10.0, 10.1, false),
            (Direction::LessThan, 10.0, 9.99, true),
            (Direction::LessThan, 10.0, 10.0, false),
        ];

        for (direction, threshold, value, expected) in cases {
            let evaluator = evaluator_with(vec![AlertRule::price("X", threshold, direction)]);
            let decisions = evaluator.evaluate_at(&price("X", value), t0());
            assert_eq!(
                decisions.len() == 1,
                expected,
                "{} {} {}",
                value,
                direction,
                threshold
            );
        }
    }

    #[test]
    fn test_prediction_equal_uses_tight_epsilon() {
        let evaluator = evaluator_with(vec![AlertRule::prediction(
            "polymarket",
            "tok",
            0.5,
            Direction::Equal,
        )]);
        let observe = |midpoint| {
            Observation::Prediction(PredictionObservation {
                token_id: "tok".to_string(),
                midpoint,
                buy_price: midpoint,
                sell_price: midpoint,
            })
        };

        assert!(evaluator.evaluate_at(&observe(0.505), t0()).is_empty());
        assert_eq!(evaluator.evaluate_at(&observe(0.50005), t0()).len(), 1);
    }

    #[test]
    fn test_unmatched_key_and_disabled_rule_yield_nothing() {
        let evaluator = evaluator_with(vec![
            AlertRule::price("BTC/USD", 1.0, Direction::GreaterThan),
            AlertRule::price("ETH/USD", 1.0, Direction::GreaterThan).with_enabled(false),
        ]);

        assert!(evaluator.evaluate_at(&price("SOL/USD", 10.0), t0()).is_empty());
        assert!(evaluator.evaluate_at(&price("ETH/USD", 10.0), t0()).is_empty());
    }

    #[test]
    fn test_kind_isolation() {
        let evaluator = evaluator_with(vec![AlertRule::metric(
            "aave",
            "1",
            "BTC/USD",
            MetricField::Tvl,
            1.0,
            Direction::GreaterThan,
        )]);
        assert!(evaluator.evaluate_at(&price("BTC/USD", 10.0), t0()).is_empty());
    }

    #[test]
    fn test_default_suppression_is_one_hour() {
        let evaluator = evaluator_with(vec![AlertRule::price("X", 1.0, Direction::GreaterThan)]);

        assert_eq!(evaluator.evaluate_at(&price("X", 2.0), t0()).len(), 1);
        assert!(evaluator
            .evaluate_at(&price("X", 2.0), t0() + Duration::minutes(59))
            .is_empty());
        assert_eq!(
            evaluator
                .evaluate_at(&price("X", 2.0), t0() + Duration::hours(1) + Duration::seconds(1))
                .len(),
            1
        );
    }

    #[test]
    fn test_once_fires_once_and_disables() {
        let evaluator = evaluator_with(vec![
            AlertRule::price("X", 1.0, Direction::GreaterThan)
                .with_id(1)
                .with_frequency(Frequency::once()),
        ]);

        let first = evaluator.evaluate_at(&price("X", 2.0), t0());
        assert_eq!(first.len(), 1);
        assert!(!first[0].rule.enabled);

        let later = t0() + Duration::days(30);
        assert!(evaluator.evaluate_at(&price("X", 1_000_000.0), later).is_empty());

        let stored = evaluator.store().get(RuleKind::Price, 1).unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.last_triggered, Some(t0()));
    }

    #[test]
    fn test_once_rule_reloaded_enabled_stays_silent() {
        let evaluator = evaluator_with(vec![AlertRule::price("X", 1.0, Direction::GreaterThan)
            .with_id(3)
            .with_frequency(Frequency::once())
            .with_last_triggered(t0())]);

        assert!(evaluator
            .evaluate_at(&price("X", 2.0), t0() + Duration::days(1))
            .is_empty());
        assert!(!evaluator.store().get(RuleKind::Price, 3).unwrap().enabled);
    }

    #[test]
    fn test_never_always_suppresses() {
        let evaluator = evaluator_with(vec![AlertRule::price("X", 1.0, Direction::GreaterThan)
            .with_id(1)
            .with_frequency(Frequency::never())]);

        for days in [0, 1, 365] {
            assert!(evaluator
                .evaluate_at(&price("X", 2.0), t0() + Duration::days(days))
                .is_empty());
        }
        let stored = evaluator.store().get(RuleKind::Price, 1).unwrap();
        assert!(stored.enabled);
        assert!(stored.last_triggered.is_none());
    }

    #[test]
    fn test_day_window() {
        let evaluator = evaluator_with(vec![
            AlertRule::price("X", 1.0, Direction::GreaterThan).with_frequency(Frequency::days(2)),
        ]);

        assert_eq!(evaluator.evaluate_at(&price("X", 2.0), t0()).len(), 1);
        assert!(evaluator
            .evaluate_at(&price("X", 2.0), t0() + Duration::hours(47))
            .is_empty());
        assert_eq!(
            evaluator
                .evaluate_at(&price("X", 2.0), t0() + Duration::days(2))
                .len(),
            1
        );
    }

    #[test]
    fn test_recovery_inside_window_does_not_refire() {
        let evaluator = evaluator_with(vec![AlertRule::price("X", 10.0, Direction::GreaterThan)]);

        assert_eq!(evaluator.evaluate_at(&price("X", 11.0), t0()).len(), 1);
        assert!(evaluator
            .evaluate_at(&price("X", 9.0), t0() + Duration::minutes(5))
            .is_empty());
        assert!(evaluator
            .evaluate_at(&price("X", 11.0), t0() + Duration::minutes(10))
            .is_empty());
    }

    #[test]
    fn test_no_breach_leaves_state_untouched() {
        let evaluator = evaluator_with(vec![
            AlertRule::price("X", 10.0, Direction::GreaterThan).with_id(9),
        ]);
        evaluator.evaluate_at(&price("X", 5.0), t0());
        assert!(evaluator
            .store()
            .get(RuleKind::Price, 9)
            .unwrap()
            .last_triggered
            .is_none());
    }

    #[test]
    fn test_multiple_rules_fire_in_store_order() {
        let evaluator = evaluator_with(vec![
            AlertRule::price("X", 1.0, Direction::GreaterThan).with_id(1),
            AlertRule::price("X", 5.0, Direction::GreaterThan).with_id(2),
            AlertRule::price("X", 50.0, Direction::GreaterThan).with_id(3),
        ]);

        let decisions = evaluator.evaluate_at(&price("X", 10.0), t0());
        let ids: Vec<_> = decisions.iter().map(|d| d.rule.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_metric_decision_message() {
        let mut rule = AlertRule::metric(
            "aave",
            "1",
            "0xA0b8",
            MetricField::Utilization,
            90.0,
            Direction::GreaterOrEqual,
        );
        if let crate::rules::RuleSubject::Metric(subject) = &mut rule.subject {
            subject.version = "v3".to_string();
        }
        let evaluator = evaluator_with(vec![rule]);

        let decisions = evaluator.evaluate_at(
            &Observation::Metric(MetricObservation {
                chain_id: "1".to_string(),
                instrument: "0xA0b8".to_string(),
                field: MetricField::Utilization,
                value: 92.5,
                chain_name: "Ethereum".to_string(),
            }),
            t0(),
        );
        assert_eq!(
            decisions[0].message,
            "🚨 Alert: aave v3 UTILIZATION on Ethereum - UTILIZATION is 92.5, which is >= threshold of 90"
        );
    }

    #[test]
    fn test_btc_hourly_scenario() {
        let evaluator = evaluator_with(vec![AlertRule::price(
            "BTC/USD",
            100_000.0,
            Direction::GreaterOrEqual,
        )
        .with_id(1)
        .with_frequency(Frequency::hours(3))]);

        assert!(evaluator.evaluate_at(&price("BTC/USD", 99_000.0), t0()).is_empty());

        let first = evaluator.evaluate_at(&price("BTC/USD", 101_000.0), t0());
        assert_eq!(first.len(), 1);
        assert_eq!(
            evaluator.store().get(RuleKind::Price, 1).unwrap().last_triggered,
            Some(t0())
        );

        assert!(evaluator
            .evaluate_at(&price("BTC/USD", 102_000.0), t0() + Duration::minutes(30))
            .is_empty());

        let later = t0() + Duration::hours(3) + Duration::minutes(1);
        let second = evaluator.evaluate_at(&price("BTC/USD", 101_500.0), later);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].triggered_at, later);
    }

    #[test]
    fn test_concurrent_evaluate_and_reload() {
        use std::thread;

        let old: RuleSet = (0..50)
            .map(|i| AlertRule::price("X", 1.0, Direction::GreaterThan).with_id(i))
            .collect();
        let evaluator = evaluator_with(old.price.clone());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let evaluator = evaluator.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        evaluator.evaluate(&price("X", 3.0));
                        let snapshot = evaluator.store().snapshot(RuleKind::Price);
                        let first = snapshot[0].threshold;
                        assert!(snapshot.iter().all(|r| r.threshold == first));
                    }
                })
            })
            .collect();

        for round in 0..20 {
            let threshold = if round % 2 == 0 { 2.0 } else { 1.0 };
            let incoming: RuleSet = (0..50)
                .map(|i| AlertRule::price("X", threshold, Direction::GreaterThan).with_id(i))
                .collect();
            evaluator.store().replace_all(incoming);
        }

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(evaluator.store().snapshot(RuleKind::Price).len(), 50);
    }
}
