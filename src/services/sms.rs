use async_trait::async_trait;

use crate::config::SmsConfig;
use crate::db::Notification;
use crate::error::{AppError, AppResult};
use crate::services::notifications::Notifier;

#[derive(Debug, Clone)]
struct TwilioCredentials {
    account_sid: String,
    auth_token: String,
    from_number: String,
}

/// Sends SMS notifications through the Twilio Messages API.
pub struct SmsNotifier {
    client: reqwest::Client,
    credentials: Option<TwilioCredentials>,
    api_base_url: String,
}

impl SmsNotifier {
    pub fn new(config: &SmsConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let credentials = match (&config.account_sid, &config.auth_token, &config.from_number) {
            (Some(sid), Some(token), Some(from)) => Some(TwilioCredentials {
                account_sid: sid.clone(),
                auth_token: token.clone(),
                from_number: from.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            client,
            credentials,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }
}

#[async_trait]
impl Notifier for SmsNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        let to = notification.metadata_str("phoneNumber").ok_or_else(|| {
            AppError::Delivery("phoneNumber is required for SMS notifications".to_string())
        })?;

        let creds = self.credentials.as_ref().ok_or_else(|| {
            AppError::Config("Twilio credentials are not configured".to_string())
        })?;

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base_url, creds.account_sid
        );
        let body = format!("{}\n{}", notification.title, notification.message);

        let response = self
            .client
            .post(&url)
            .basic_auth(&creds.account_sid, Some(&creds.auth_token))
            .form(&[
                ("To", to),
                ("From", creds.from_number.as_str()),
                ("Body", body.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Delivery(format!(
                "SMS gateway returned {}: {}",
                status, error_text
            )));
        }

        tracing::debug!("SMS for notification {} accepted by gateway", notification.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::queue::tests::make_notification;
    use axum::{extract::State, http::StatusCode, routing::post, Form, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Captured = Arc<Mutex<Vec<HashMap<String, String>>>>;

    /// Start a local stand-in for the gateway that answers every request with `status`.
    async fn fake_gateway(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/2010-04-01/Accounts/:sid/Messages.json",
                post(
                    move |State(captured): State<Captured>,
                          Form(form): Form<HashMap<String, String>>| async move {
                        captured.lock().await.push(form);
                        status
                    },
                ),
            )
            .with_state(captured.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), captured)
    }

    fn config(base_url: &str) -> SmsConfig {
        SmsConfig {
            account_sid: Some("AC123".to_string()),
            auth_token: Some("secret".to_string()),
            from_number: Some("+15550000000".to_string()),
            api_base_url: base_url.to_string(),
        }
    }

    fn sms_notification() -> Notification {
        let mut notification = make_notification("u1");
        notification.metadata = json!({ "phoneNumber": "+15551234567" })
            .as_object()
            .cloned()
            .unwrap();
        notification
    }

    #[tokio::test]
    async fn posts_title_and_message_to_gateway() {
        let (base_url, captured) = fake_gateway(StatusCode::CREATED).await;
        let notifier = SmsNotifier::new(&config(&base_url)).unwrap();

        notifier.send(&sms_notification()).await.unwrap();

        let forms = captured.lock().await;
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0]["To"], "+15551234567");
        assert_eq!(forms[0]["From"], "+15550000000");
        assert_eq!(forms[0]["Body"], "Hi\nBody");
    }

    #[tokio::test]
    async fn gateway_error_is_a_delivery_failure() {
        let (base_url, _) = fake_gateway(StatusCode::INTERNAL_SERVER_ERROR).await;
        let notifier = SmsNotifier::new(&config(&base_url)).unwrap();

        let err = notifier.send(&sms_notification()).await.unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_phone_number_fails_before_any_request() {
        let notifier = SmsNotifier::new(&config("http://127.0.0.1:9")).unwrap();
        let err = notifier.send(&make_notification("u1")).await.unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
    }

    #[tokio::test]
    async fn missing_credentials_is_a_config_error() {
        let notifier = SmsNotifier::new(&crate::config::Config::default().sms).unwrap();
        assert!(!notifier.is_configured());
        let err = notifier.send(&sms_notification()).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
