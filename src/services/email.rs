use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::OnceCell;

use crate::config::SmtpConfig;
use crate::db::Notification;
use crate::error::{AppError, AppResult};
use crate::services::notifications::Notifier;

/// Sends EMAIL notifications over SMTP.
///
/// The recipient is `metadata.email`, the subject is the notification title
/// and the plain-text body is the message. The pooled SMTP transport spawns
/// onto the tokio runtime when built, so it is created on the first send.
pub struct EmailNotifier {
    server: Option<SmtpServer>,
    from: Option<String>,
    transport: OnceCell<AsyncSmtpTransport<Tokio1Executor>>,
}

struct SmtpServer {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
}

impl SmtpServer {
    fn build_transport(&self) -> AsyncSmtpTransport<Tokio1Executor> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.host.as_str())
                .port(self.port);
        if let Some(credentials) = &self.credentials {
            builder = builder.credentials(credentials.clone());
        }
        builder.build()
    }
}

impl EmailNotifier {
    pub fn new(config: &SmtpConfig) -> Self {
        let server = config.host.as_ref().map(|host| SmtpServer {
            host: host.clone(),
            port: config.port,
            credentials: match (&config.user, &config.password) {
                (Some(user), Some(password)) => {
                    Some(Credentials::new(user.clone(), password.clone()))
                }
                _ => None,
            },
        });

        Self {
            server,
            from: config.from.clone(),
            transport: OnceCell::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.server.is_some() && self.from.is_some()
    }

    fn build_message(&self, from: &str, to: &str, notification: &Notification) -> AppResult<Message> {
        let from: Mailbox = from
            .parse()
            .map_err(|e| AppError::Config(format!("invalid SMTP_FROM address: {}", e)))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| AppError::Delivery(format!("invalid recipient address {}: {}", to, e)))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(notification.title.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.message.clone())
            .map_err(|e| AppError::Delivery(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        let to = notification.metadata_str("email").ok_or_else(|| {
            AppError::Delivery("email address is required for EMAIL notifications".to_string())
        })?;

        let (Some(server), Some(from)) = (&self.server, &self.from) else {
            return Err(AppError::Config(
                "SMTP_HOST and SMTP_FROM must be set to send email".to_string(),
            ));
        };

        let message = self.build_message(from, to, notification)?;
        let transport = self
            .transport
            .get_or_init(|| async { server.build_transport() })
            .await;
        transport
            .send(message)
            .await
            .map_err(|e| AppError::Delivery(format!("SMTP send failed: {}", e)))?;

        tracing::debug!("Email for notification {} accepted by SMTP server", notification.id);
        Ok(())
    }
}
