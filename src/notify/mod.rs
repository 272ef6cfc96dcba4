//! Notification gateway
//!
//! Turns a delivered [`AlertView`] into an email and/or chat message. The
//! delivery worker treats every error returned here as terminal for the
//! message: it is logged and the offset is still committed.

pub mod email;
pub mod format;
pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;

pub use email::EmailNotifier;
pub use telegram::TelegramNotifier;

use crate::delivery::view::AlertView;
use crate::rules::DeliveryTarget;

/// A delivery channel
///
/// Implementations ignore targets that carry nothing for their channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, target: &DeliveryTarget, view: &AlertView) -> Result<(), NotifyError>;
}

/// Fans one alert out to every configured channel
#[derive(Clone, Default)]
pub struct Gateway {
    channels: Vec<Arc<dyn Notifier>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

#[async_trait]
impl Notifier for Gateway {
    fn name(&self) -> &'static str {
        "gateway"
    }

    /// Try every channel; one failing channel does not stop the others
    async fn send(&self, target: &DeliveryTarget, view: &AlertView) -> Result<(), NotifyError> {
        if target.is_empty() {
            tracing::debug!(kind = %view.kind, "Alert has no recipient, nothing to send");
            return Ok(());
        }

        let mut errors = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.send(target, view).await {
                tracing::warn!(channel = channel.name(), error = %e, "Channel delivery failed");
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(NotifyError::Multiple(errors)),
        }
    }
}

/// Writes alerts to the log instead of sending them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, target: &DeliveryTarget, view: &AlertView) -> Result<(), NotifyError> {
        tracing::warn!(
            kind = %view.kind,
            recipient = %target,
            "Alert triggered: {}",
            view.message
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Email error: {0}")]
    Email(String),

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error("Multiple notification failures: {0:?}")]
    Multiple(Vec<NotifyError>),
}
