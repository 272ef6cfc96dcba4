//! Tripwire notifier
//!
//! Consumes the alert topics and delivers email / Telegram notifications.
//!
//! Run with: cargo run --features kafka --bin tripwire-notifier
//!
//! Environment variables:
//! - RESEND_API_KEY / RESEND_FROM_EMAIL: Email delivery (required)
//! - TELEGRAM_BOT_TOKEN: Chat delivery (optional)
//! - TRIPWIRE_SHUTDOWN_GRACE_MS: Time allowed for workers to stop (default: 1000)
//! - KAFKA_BROKERS, KAFKA_GROUP_PREFIX, KAFKA_AUTO_OFFSET_RESET
//! - RUST_LOG: Log level (default: tripwire=info)

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tripwire::broker::kafka::{KafkaAdmin, KafkaConsumerFactory};
use tripwire::config::{KafkaConfig, NotifierConfig};
use tripwire::delivery::{start_delivery, DeliverySettings};
use tripwire::notify::{EmailNotifier, Gateway, Notifier, TelegramNotifier};
use tripwire::Shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tripwire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NotifierConfig::from_env()?;
    let kafka_config = KafkaConfig::from_env()?;

    let mut gateway = Gateway::new().with_channel(Arc::new(EmailNotifier::with_base_url(
        config.resend_api_url.clone(),
        config.resend_api_key.clone(),
        config.resend_from_email.clone(),
    )));
    match &config.telegram_bot_token {
        Some(token) => {
            gateway = gateway.with_channel(Arc::new(TelegramNotifier::new(token.clone())));
        }
        None => tracing::warn!("TELEGRAM_BOT_TOKEN not set, Telegram delivery disabled"),
    }

    tracing::info!("Tripwire notifier configuration:");
    tracing::info!("  Brokers: {}", kafka_config.brokers);
    tracing::info!("  Group prefix: {}", kafka_config.group_prefix);
    tracing::info!("  Offset reset: {}", kafka_config.auto_offset_reset);
    tracing::info!("  Channels: {:?}", gateway.channel_names());

    let settings = DeliverySettings {
        group_prefix: kafka_config.group_prefix.clone(),
        fetch_timeout: kafka_config.fetch_timeout,
        probe_timeout: kafka_config.probe_timeout,
    };
    let admin = KafkaAdmin::new(kafka_config.clone());
    let factory = Arc::new(KafkaConsumerFactory::new(kafka_config));
    let notifier: Arc<dyn Notifier> = Arc::new(gateway);

    let shutdown = Arc::new(Shutdown::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal.trigger();
        }
    });

    let workers = start_delivery(&admin, factory, notifier, &settings, &shutdown).await;
    if workers.is_empty() {
        tracing::info!("Tripwire notifier stopped before workers started");
        return Ok(());
    }

    let mut listener = shutdown.listener();
    listener.cancelled().await;

    let stats: Vec<_> = workers.iter().map(|w| (w.kind, w.stats.clone())).collect();
    let handles = workers.into_iter().map(|w| w.handle);
    if tokio::time::timeout(config.shutdown_grace, futures::future::join_all(handles))
        .await
        .is_err()
    {
        tracing::warn!(grace = ?config.shutdown_grace, "Delivery workers did not stop within the grace period");
    }

    for (kind, stats) in stats {
        let stats = stats.read();
        tracing::info!(
            kind = %kind,
            received = stats.messages_received,
            delivered = stats.delivered,
            send_failures = stats.send_failures,
            "Delivery worker stopped"
        );
    }
    Ok(())
}
