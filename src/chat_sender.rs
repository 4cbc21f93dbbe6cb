use crate::utils::errors::RelayError;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Attempts delivery of plain text to a chat id (§4.C). A capability trait
/// so the Processor and Delivery Worker depend only on the contract, not on
/// a concrete transport.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), RelayError>;
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse {
    ok: bool,
    description: Option<String>,
}

/// Sends plain text through the Telegram Bot API's `sendMessage` method.
pub struct TelegramChatSender {
    http: reqwest::Client,
    token: String,
}

impl TelegramChatSender {
    pub fn new(token: String) -> Self {
        Self { http: reqwest::Client::new(), token }
    }
}

#[async_trait]
impl ChatSender for TelegramChatSender {
    #[instrument(skip(self, text), fields(chat_id))]
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), RelayError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        debug!("sending message to telegram chat {}", chat_id);

        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| RelayError::Transient(format!("chat send failed: {e}")))?;

        let status = response.status();
        let body: TelegramApiResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Transient(format!("chat API response not valid JSON: {e}")))?;

        if !status.is_success() || !body.ok {
            warn!(chat_id, status = %status, description = ?body.description, "chat send rejected");
            return Err(RelayError::Transient(format!(
                "chat API rejected message: {}",
                body.description.unwrap_or_else(|| status.to_string())
            )));
        }

        Ok(())
    }
}
