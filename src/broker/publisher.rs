use std::sync::Arc;

use super::events::AlertEnvelope;
use super::{BrokerError, EventSink};
use crate::engine::Decision;

/// Producer side of the evaluation/delivery split
///
/// Rule state is never touched here; suppression was already advanced by
/// the evaluator when the decision was made.
#[derive(Clone)]
pub struct AlertPublisher {
    sink: Arc<dyn EventSink>,
}

impl AlertPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Serialize `decision` and append it to its kind's topic
    pub async fn publish(&self, decision: &Decision) -> Result<(), BrokerError> {
        let envelope = AlertEnvelope::from_decision(decision)?;
        let payload = envelope.to_bytes()?;
        let topic = envelope.topic();

        self.sink.send(topic, &envelope.key(), payload).await?;

        tracing::info!(
            topic = %topic,
            rule_id = ?decision.rule.id,
            recipient = %envelope.target(),
            "Published alert: {}",
            decision.message
        );
        Ok(())
    }
}
