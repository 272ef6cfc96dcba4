//! Email delivery through the Resend HTTP API

use std::time::Duration;

use async_trait::async_trait;

use super::format::{email_html, email_subject, email_text};
use super::{Notifier, NotifyError};
use crate::delivery::view::AlertView;
use crate::rules::DeliveryTarget;

pub const RESEND_API_URL: &str = "https://api.resend.com";

pub struct EmailNotifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl EmailNotifier {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self::with_base_url(RESEND_API_URL, api_key, from)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Send one email with both plain-text and HTML bodies
    pub async fn send_email(
        &self,
        to: &str,
        subject: &str,
        text: &str,
        html: &str,
    ) -> Result<(), NotifyError> {
        if to.is_empty() {
            return Err(NotifyError::Email("recipient email is required".to_string()));
        }

        let payload = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "text": text,
            "html": html,
        });

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Email(format!("Failed to send email: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Email(format!(
                "Resend API returned status {}: {}",
                status, body
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, target: &DeliveryTarget, view: &AlertView) -> Result<(), NotifyError> {
        let Some(to) = target.email.as_deref() else {
            return Ok(());
        };
        self.send_email(to, &email_subject(view), &email_text(view), &email_html(view))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::events::{AlertEnvelope, TokenAlertEvent};
    use crate::rules::Direction;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn view(email: Option<&str>) -> AlertView {
        AlertView::from_envelope(&AlertEnvelope::Token(TokenAlertEvent {
            recipient_email: email.map(str::to_string),
            telegram_chat_id: None,
            symbol: "SOL/USD".to_string(),
            price: 250.0,
            threshold: 200.0,
            direction: Direction::GreaterThan,
            timestamp: Utc::now(),
            message: "m".to_string(),
        }))
    }

    #[tokio::test]
    async fn test_posts_to_resend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer re_test"))
            .and(body_partial_json(serde_json::json!({
                "from": "alerts@example.com",
                "to": ["ops@example.com"],
                "subject": "🚨 Crypto Alert: SOL/USD > $200",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = EmailNotifier::with_base_url(server.uri(), "re_test", "alerts@example.com");
        let view = view(Some("ops@example.com"));
        notifier.send(&view.target, &view).await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid `to` field"))
            .mount(&server)
            .await;

        let notifier = EmailNotifier::with_base_url(server.uri(), "re_test", "alerts@example.com");
        let view = view(Some("not-an-address"));
        let err = notifier.send(&view.target, &view).await.unwrap_err();
        assert!(err.to_string().contains("422"));
    }

    #[tokio::test]
    async fn test_no_email_target_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let notifier = EmailNotifier::with_base_url(server.uri(), "re_test", "alerts@example.com");
        let view = view(None);
        notifier.send(&view.target, &view).await.unwrap();
    }
}
