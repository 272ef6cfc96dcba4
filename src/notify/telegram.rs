//! Chat delivery through the Telegram Bot API

use std::time::Duration;

use async_trait::async_trait;

use super::format::telegram_html;
use super::{Notifier, NotifyError};
use crate::delivery::view::AlertView;
use crate::rules::DeliveryTarget;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_base_url(TELEGRAM_API_URL, bot_token)
    }

    pub fn with_base_url(base_url: impl Into<String>, bot_token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        }
    }

    /// Post an HTML-formatted message to `chat_id`
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        if chat_id.is_empty() {
            return Err(NotifyError::Telegram("chat id is required".to_string()));
        }

        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        let response = self
            .client
            .post(format!("{}/bot{}/sendMessage", self.base_url, self.bot_token))
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Telegram(format!("Failed to send message: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Telegram(format!(
                "Telegram API returned status {}: {}",
                status, body
            )));
        }

        tracing::info!(chat_id = %chat_id, "Telegram message sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, target: &DeliveryTarget, view: &AlertView) -> Result<(), NotifyError> {
        let Some(chat_id) = target.chat_id.as_deref() else {
            return Ok(());
        };
        self.send_message(chat_id, &telegram_html(view)).await
    }
}
