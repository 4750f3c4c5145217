//! Failure alerting.
//!
//! Internal failures are always written to the error log. When alerting is
//! enabled they are also mailed through the configured SMTP server and, if a
//! webhook relay is set, posted to it as JSON.

use crate::config::AlertingConfig;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where alerts are delivered
#[derive(Clone)]
pub enum AlertChannel {
    Log,
    Email(MailChannel),
    Webhook { url: String },
}

impl std::fmt::Debug for AlertChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertChannel::Log => f.write_str("Log"),
            AlertChannel::Email(mail) => f
                .debug_struct("Email")
                .field("server", &mail.server)
                .field("recipients", &mail.to.len())
                .finish(),
            AlertChannel::Webhook { url } => f.debug_struct("Webhook").field("url", url).finish(),
        }
    }
}

/// SMTP delivery of alert mails
#[derive(Clone)]
pub struct MailChannel {
    server: String,
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
}

impl MailChannel {
    /// Build the channel from the mail settings. No connection is made here.
    pub fn from_config(config: &AlertingConfig) -> Result<Option<Self>, AlertError> {
        let Some(server) = config.mail_server.clone() else {
            return Ok(None);
        };

        let from = config
            .from_addr
            .as_deref()
            .ok_or(AlertError::MissingSender)?
            .parse::<Mailbox>()
            .map_err(|e| AlertError::Address(e.to_string()))?;
        let to = config
            .to_addrs
            .iter()
            .map(|addr| addr.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AlertError::Address(e.to_string()))?;
        if to.is_empty() {
            return Err(AlertError::MissingRecipients);
        }

        let mut builder = if config.mail_use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&server)
                .map_err(|e| AlertError::Transport(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&server)
        };
        builder = builder.port(config.mail_port).timeout(Some(SMTP_TIMEOUT));
        if let (Some(user), Some(pass)) = (&config.mail_username, &config.mail_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Some(Self {
            server,
            from,
            to,
            transport: Arc::new(builder.build()),
        }))
    }

    /// Compose the alert mail
    pub fn message(&self, payload: &AlertPayload) -> Result<Message, AlertError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("[{}] {}", payload.service, payload.subject))
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }

        let body = format!(
            "{}\n\nService: {}\nTime: {}\n\n{}\n",
            payload.summary,
            payload.service,
            payload.timestamp.to_rfc3339(),
            payload.details
        );
        builder
            .body(body)
            .map_err(|e| AlertError::Message(e.to_string()))
    }

    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError> {
        let message = self.message(payload)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Errors raised while preparing or sending alerts
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert sender address is not configured")]
    MissingSender,

    #[error("alert recipients are not configured")]
    MissingRecipients,

    #[error("invalid mail address: {0}")]
    Address(String),

    #[error("failed to build alert mail: {0}")]
    Message(String),

    #[error("mail transport error: {0}")]
    Transport(String),
}

/// Body posted to the webhook relay
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub service: String,
    pub subject: String,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub summary: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// Forwards internal failures to the configured channels
#[derive(Debug, Clone)]
pub struct Alerter {
    service: String,
    subject: String,
    from_addr: Option<String>,
    to_addrs: Vec<String>,
    channels: Vec<AlertChannel>,
    http: reqwest::Client,
}

impl Alerter {
    pub fn new(service: &str, config: &AlertingConfig) -> Self {
        let mut channels = vec![AlertChannel::Log];
        if config.enabled {
            match MailChannel::from_config(config) {
                Ok(Some(mail)) => channels.push(AlertChannel::Email(mail)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Mail alerting disabled"),
            }
            if let Some(ref url) = config.webhook_url {
                channels.push(AlertChannel::Webhook { url: url.clone() });
            }
        }

        let http = match reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Failed to build alert HTTP client, webhook timeout not applied");
                reqwest::Client::new()
            }
        };

        Self {
            service: service.to_string(),
            subject: config.subject.clone(),
            from_addr: config.from_addr.clone(),
            to_addrs: config.to_addrs.clone(),
            channels,
            http,
        }
    }

    /// Log-only alerter
    pub fn log_only(service: &str) -> Self {
        Self::new(service, &AlertingConfig::default())
    }

    pub fn channels(&self) -> &[AlertChannel] {
        &self.channels
    }

    pub fn payload(&self, summary: &str, details: &str) -> AlertPayload {
        AlertPayload {
            service: self.service.clone(),
            subject: self.subject.clone(),
            from: self.from_addr.clone(),
            to: self.to_addrs.clone(),
            summary: summary.to_string(),
            details: details.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Deliver an alert. Delivery failures are logged and never propagate.
    pub async fn notify(&self, summary: &str, details: &str) {
        let payload = self.payload(summary, details);
        for channel in &self.channels {
            match channel {
                AlertChannel::Log => {
                    error!(
                        service = %self.service,
                        subject = %self.subject,
                        details = %details,
                        "{}",
                        summary
                    );
                }
                AlertChannel::Email(mail) => match mail.send(&payload).await {
                    Ok(()) => {
                        counter!("predict.alerts.sent", "channel" => "email").increment(1);
                        debug!(server = %mail.server, "Alert mailed");
                    }
                    Err(e) => {
                        counter!("predict.alerts.failed", "channel" => "email").increment(1);
                        warn!(server = %mail.server, error = %e, "Failed to mail alert");
                    }
                },
                AlertChannel::Webhook { url } => {
                    match self.http.post(url).json(&payload).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            counter!("predict.alerts.sent", "channel" => "webhook").increment(1);
                            debug!(url = %url, "Alert delivered");
                        }
                        Ok(resp) => {
                            counter!("predict.alerts.failed", "channel" => "webhook").increment(1);
                            warn!(url = %url, status = %resp.status(), "Alert relay rejected alert");
                        }
                        Err(e) => {
                            counter!("predict.alerts.failed", "channel" => "webhook").increment(1);
                            warn!(url = %url, error = %e, "Failed to deliver alert");
                        }
                    }
                }
            }
        }
    }
}
