use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::model::{AlertRule, RuleKind};

/// Rules grouped by kind, in load order
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub price: Vec<AlertRule>,
    pub metric: Vec<AlertRule>,
    pub prediction: Vec<AlertRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule to the list matching its subject
    pub fn push(&mut self, rule: AlertRule) {
        self.rules_mut(rule.kind()).push(rule);
    }

    pub fn rules(&self, kind: RuleKind) -> &[AlertRule] {
        match kind {
            RuleKind::Price => &self.price,
            RuleKind::Metric => &self.metric,
            RuleKind::Prediction => &self.prediction,
        }
    }

    pub fn rules_mut(&mut self, kind: RuleKind) -> &mut Vec<AlertRule> {
        match kind {
            RuleKind::Price => &mut self.price,
            RuleKind::Metric => &mut self.metric,
            RuleKind::Prediction => &mut self.prediction,
        }
    }

    pub fn len(&self) -> usize {
        self.price.len() + self.metric.len() + self.prediction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<AlertRule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = AlertRule>>(iter: I) -> Self {
        let mut set = RuleSet::new();
        for rule in iter {
            set.push(rule);
        }
        set
    }
}

/// Live rule set shared by the evaluator and the reload task
///
/// Every read and write goes through one mutex, so a reload is observed
/// either entirely or not at all.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Mutex<RuleSet>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: RuleSet) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }

    /// Append a rule; no duplicate detection
    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.lock().push(rule);
    }

    /// Copy of the rules of one kind
    ///
    /// Rules are values: suppression changes made after this call are not
    /// reflected in the copy, re-read them with [`RuleStore::get`].
    pub fn snapshot(&self, kind: RuleKind) -> Vec<AlertRule> {
        self.rules.lock().rules(kind).to_vec()
    }

    /// Copy of every rule, grouped by kind
    pub fn snapshot_all(&self) -> RuleSet {
        self.rules.lock().clone()
    }

    /// Re-fetch a persisted rule by id
    pub fn get(&self, kind: RuleKind, id: i64) -> Option<AlertRule> {
        self.rules
            .lock()
            .rules(kind)
            .iter()
            .find(|r| r.id == Some(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in a freshly loaded rule set
    ///
    /// `last_triggered` is carried over from the outgoing rule with the same
    /// persisted id. Rules without an id start with no suppression history.
    pub fn replace_all(&self, mut incoming: RuleSet) -> usize {
        let mut rules = self.rules.lock();
        let mut carried = 0;

        for kind in RuleKind::ALL {
            let previous: HashMap<i64, Option<DateTime<Utc>>> = rules
                .rules(kind)
                .iter()
                .filter_map(|r| r.id.map(|id| (id, r.last_triggered)))
                .collect();

            for rule in incoming.rules_mut(kind).iter_mut() {
                let Some(id) = rule.id else { continue };
                if let Some(last) = previous.get(&id) {
                    rule.last_triggered = *last;
                    carried += 1;
                }
            }
        }

        *rules = incoming;
        carried
    }

    /// Run `f` over the live rules of one kind while holding the lock
    pub(crate) fn with_rules_mut<R>(
        &self,
        kind: RuleKind,
        f: impl FnOnce(&mut [AlertRule]) -> R,
    ) -> R {
        let mut rules = self.rules.lock();
        f(rules.rules_mut(kind).as_mut_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{Direction, MetricField};
    use chrono::Duration;

    fn btc(threshold: f64) -> AlertRule {
        AlertRule::price("BTC/USD", threshold, Direction::GreaterOrEqual)
    }

    #[test]
    fn test_add_and_snapshot_by_kind() {
        let store = RuleStore::new();
        store.add_rule(btc(1.0));
        store.add_rule(AlertRule::metric(
            "aave",
            "1",
            "0xabc",
            MetricField::Apy,
            5.0,
            Direction::LessThan,
        ));
        store.add_rule(btc(2.0));

        let price = store.snapshot(RuleKind::Price);
        assert_eq!(price.len(), 2);
        assert_eq!(price[0].threshold, 1.0);
        assert_eq!(price[1].threshold, 2.0);
        assert_eq!(store.snapshot(RuleKind::Metric).len(), 1);
        assert!(store.snapshot(RuleKind::Prediction).is_empty());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = RuleStore::new();
        store.add_rule(btc(1.0).with_id(1));

        let mut snapshot = store.snapshot(RuleKind::Price);
        snapshot[0].enabled = false;

        assert!(store.get(RuleKind::Price, 1).unwrap().enabled);
    }

    #[test]
    fn test_replace_all_carries_last_triggered_by_id() {
        let fired_at = Utc::now() - Duration::minutes(10);
        let store = RuleStore::new();
        store.add_rule(btc(1.0).with_id(7).with_last_triggered(fired_at));
        store.add_rule(btc(1.0).with_last_triggered(fired_at));

        let incoming: RuleSet = vec![btc(3.0).with_id(7), btc(1.0)].into_iter().collect();
        let carried = store.replace_all(incoming);

        assert_eq!(carried, 1);
        let reloaded = store.get(RuleKind::Price, 7).unwrap();
        assert_eq!(reloaded.threshold, 3.0);
        assert_eq!(reloaded.last_triggered, Some(fired_at));

        let unpersisted = store
            .snapshot(RuleKind::Price)
            .into_iter()
            .find(|r| r.id.is_none())
            .unwrap();
        assert!(unpersisted.last_triggered.is_none());
    }

    #[test]
    fn test_replace_all_drops_absent_rules() {
        let store = RuleStore::new();
        store.add_rule(btc(1.0).with_id(1));
        store.add_rule(btc(2.0).with_id(2));

        store.replace_all(vec![btc(2.0).with_id(2)].into_iter().collect());

        assert!(store.get(RuleKind::Price, 1).is_none());
        assert!(store.get(RuleKind::Price, 2).is_some());
    }

    #[test]
    fn test_replace_all_matches_ids_within_kind() {
        let fired_at = Utc::now();
        let store = RuleStore::new();
        store.add_rule(btc(1.0).with_id(5).with_last_triggered(fired_at));

        let metric = AlertRule::metric("aave", "1", "0xabc", MetricField::Tvl, 1.0, Direction::LessThan)
            .with_id(5);
        store.replace_all(vec![metric].into_iter().collect());

        assert!(store.get(RuleKind::Metric, 5).unwrap().last_triggered.is_none());
    }
}
