use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What happened, as seen by whoever receives the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SignalDetected,
    OrderPlaced,
    PositionOpened,
    PositionClosed,
    OrderCancelled,
    UnfilledOrder,
    Error,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SignalDetected => "signal_detected",
            NotificationKind::OrderPlaced => "order_placed",
            NotificationKind::PositionOpened => "position_opened",
            NotificationKind::PositionClosed => "position_closed",
            NotificationKind::OrderCancelled => "order_cancelled",
            NotificationKind::UnfilledOrder => "unfilled_order",
            NotificationKind::Error => "error",
        }
    }

    fn color(&self) -> u32 {
        match self {
            NotificationKind::SignalDetected => 0x0099ff,
            NotificationKind::OrderPlaced | NotificationKind::PositionOpened => 0x00ff00,
            NotificationKind::PositionClosed => 0xffcc00,
            NotificationKind::OrderCancelled | NotificationKind::UnfilledOrder => 0xff6600,
            NotificationKind::Error => 0xff0000,
        }
    }
}

/// A notification to be dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub symbol: Option<String>,
    pub user_id: Option<i64>,
    /// Should stay visible until the user dismisses it
    pub persistent: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            symbol: None,
            user_id: None,
            persistent: false,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn for_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn for_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    fn title(&self) -> String {
        match &self.symbol {
            Some(symbol) => format!("{} · {}", self.kind.as_str(), symbol),
            None => self.kind.as_str().to_string(),
        }
    }
}

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
    fn name(&self) -> &str;
}

/// Errors from the notification system.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Discord webhook error: {0}")]
    Discord(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Configuration for the notification service.
#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub discord_webhook_url: Option<String>,
    /// Also write every notification to the log
    pub log_notifications: bool,
}

impl NotificationConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        Self {
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            log_notifications: std::env::var("LOG_NOTIFICATIONS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }
}

/// Dispatches notifications to all configured channels. Delivery failures are
/// logged and never returned to the caller.
#[derive(Clone)]
pub struct NotificationService {
    channels: Arc<Vec<Box<dyn NotificationChannel>>>,
}

impl NotificationService {
    pub fn new(config: &NotificationConfig) -> Self {
        let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();

        if config.log_notifications {
            channels.push(Box::new(LogNotifier));
        }

        // Add Discord webhook channel if configured
        if let Some(ref webhook_url) = config.discord_webhook_url {
            match DiscordWebhookNotifier::new(webhook_url.clone()) {
                Ok(notifier) => {
                    channels.push(Box::new(notifier));
                    tracing::info!("Discord webhook notifications enabled");
                }
                Err(e) => tracing::warn!("Failed to initialize Discord notifier: {}", e),
            }
        }

        if channels.is_empty() {
            tracing::info!("No notification channels configured (set DISCORD_WEBHOOK_URL)");
        }

        Self::with_channels(channels)
    }

    pub fn with_channels(channels: Vec<Box<dyn NotificationChannel>>) -> Self {
        Self {
            channels: Arc::new(channels),
        }
    }

    /// A service with no channels; every notification is dropped.
    pub fn disabled() -> Self {
        Self::with_channels(Vec::new())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Send to all configured channels (fire-and-forget via tokio::spawn).
    pub fn notify(&self, notification: Notification) {
        if self.channels.is_empty() {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            service.notify_async(&notification).await;
        });
    }

    /// Send to all channels, awaiting completion.
    pub async fn notify_async(&self, notification: &Notification) {
        for channel in self.channels.iter() {
            match channel.send(notification).await {
                Ok(()) => tracing::debug!("Sent notification via {}", channel.name()),
                Err(e) => {
                    tracing::warn!("Failed to send notification via {}: {}", channel.name(), e)
                }
            }
        }
    }
}

/// Writes notifications to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl NotificationChannel for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        tracing::info!(
            kind = notification.kind.as_str(),
            symbol = notification.symbol.as_deref().unwrap_or("-"),
            user_id = notification.user_id.unwrap_or_default(),
            persistent = notification.persistent,
            "{}",
            notification.message
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Discord webhook notifier.
pub struct DiscordWebhookNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordWebhookNotifier {
    pub fn new(webhook_url: String) -> Result<Self, NotificationError> {
        if !webhook_url.starts_with("https://") && !webhook_url.starts_with("http://") {
            return Err(NotificationError::Config(format!(
                "webhook URL must be http(s): {}",
                webhook_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| NotificationError::Config(e.to_string()))?;
        Ok(Self { webhook_url, client })
    }

    fn payload(notification: &Notification) -> serde_json::Value {
        let mut fields = Vec::new();
        if let Some(symbol) = &notification.symbol {
            fields.push(serde_json::json!({ "name": "Symbol", "value": symbol, "inline": true }));
        }
        if let Some(user_id) = notification.user_id {
            fields.push(serde_json::json!({ "name": "User", "value": user_id.to_string(), "inline": true }));
        }

        serde_json::json!({
            "embeds": [{
                "title": notification.title(),
                "description": notification.message,
                "color": notification.kind.color(),
                "fields": fields,
                "timestamp": notification.timestamp.to_rfc3339(),
            }]
        })
    }
}

#[async_trait]
impl NotificationChannel for DiscordWebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&Self::payload(notification))
            .send()
            .await
            .map_err(|e| NotificationError::Discord(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotificationError::Discord(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "discord-webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Arc<Mutex<Vec<Notification>>>);

    #[async_trait]
    impl NotificationChannel for Recording {
        async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct Failing;

    #[async_trait]
    impl NotificationChannel for Failing {
        async fn send(&self, _: &Notification) -> Result<(), NotificationError> {
            Err(NotificationError::Discord("offline".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = NotificationService::with_channels(vec![
            Box::new(Failing),
            Box::new(Recording(seen.clone())),
        ]);

        let n = Notification::new(NotificationKind::UnfilledOrder, "order not filled")
            .for_symbol("AAPL")
            .for_user(7)
            .persistent();
        service.notify_async(&n).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].symbol.as_deref(), Some("AAPL"));
        assert_eq!(seen[0].user_id, Some(7));
        assert!(seen[0].persistent);
    }

    #[test]
    fn discord_payload_has_fields() {
        let n = Notification::new(NotificationKind::PositionOpened, "filled").for_symbol("MSFT");
        let payload = DiscordWebhookNotifier::payload(&n);
        assert_eq!(payload["embeds"][0]["title"], "position_opened · MSFT");
        assert_eq!(payload["embeds"][0]["fields"][0]["value"], "MSFT");
    }

    #[test]
    fn webhook_url_must_be_http() {
        assert!(DiscordWebhookNotifier::new("not a url".to_string()).is_err());
        assert!(DiscordWebhookNotifier::new("https://discord.com/api/webhooks/1/x".to_string()).is_ok());
    }

    #[test]
    fn config_without_webhook_logs_only() {
        let service = NotificationService::new(&NotificationConfig {
            discord_webhook_url: None,
            log_notifications: true,
        });
        assert_eq!(service.channel_count(), 1);
        assert_eq!(NotificationService::disabled().channel_count(), 0);
    }
}
