//! Notification clients. Delivery providers live outside the hub; the two
//! built-in types log the message (`log`) or simulate a provider (`fake`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::model::NotificationClientConfig;

#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn send_message(&self, title: &str, message: &str) -> Result<()>;
}

/// Writes notifications to the tracing log.
pub struct LogClient {
    name: String,
}

#[async_trait]
impl NotificationClient for LogClient {
    async fn send_message(&self, title: &str, message: &str) -> Result<()> {
        info!(client = %self.name, title, message, "notification");
        Ok(())
    }
}

/// Options: `create_error` fails construction, `send_message_error` fails
/// every send.
#[derive(Debug, Default, Deserialize)]
pub struct FakeClient {
    #[serde(default)]
    create_error: Option<String>,
    #[serde(default)]
    send_message_error: Option<String>,
}

#[async_trait]
impl NotificationClient for FakeClient {
    async fn send_message(&self, _title: &str, _message: &str) -> Result<()> {
        match &self.send_message_error {
            Some(msg) => bail!("{msg}"),
            None => Ok(()),
        }
    }
}

/// Build a client from its stored config.
pub fn new_client(config: &NotificationClientConfig) -> Result<Arc<dyn NotificationClient>> {
    match config.kind.as_str() {
        "log" => Ok(Arc::new(LogClient {
            name: config.name.clone(),
        })),
        "fake" => {
            let options = if config.options.is_null() {
                serde_json::json!({})
            } else {
                config.options.clone()
            };
            let client: FakeClient =
                serde_json::from_value(options).context("invalid fake notification client options")?;
            if let Some(msg) = &client.create_error {
                bail!("{msg}");
            }
            Ok(Arc::new(client))
        }
        other => bail!("invalid notification client type '{other}'"),
    }
}
