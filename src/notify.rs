use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Chat delivery failures. Delivery problems never block the scheduler:
/// `send` retries once as plain text internally and the tick handler swallows
/// whatever is left.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("chat transport rejected the message (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to reach the chat transport: {message}")]
    Unreachable { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    Private,
    Group,
}

/// Opaque chat reference pushes are delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub chat_id: i64,
    pub kind: ChatKind,
}

impl Destination {
    pub fn private(chat_id: i64) -> Self {
        Self {
            chat_id,
            kind: ChatKind::Private,
        }
    }

    pub fn group(chat_id: i64) -> Self {
        Self {
            chat_id,
            kind: ChatKind::Group,
        }
    }

    /// Previous push messages are only deleted in multi-user chats; in a
    /// one-to-one chat the history stays.
    pub fn is_shared(&self) -> bool {
        self.kind == ChatKind::Group
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    /// Whether the text carries Markdown formatting. A rejected rich send is
    /// retried once with formatting stripped off.
    pub markdown: bool,
}

impl OutgoingMessage {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markdown: true,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markdown: false,
        }
    }
}

/// Outbound chat transport consumed by the scheduler.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers a message and returns its transport message id.
    async fn send(
        &self,
        destination: &Destination,
        message: &OutgoingMessage,
    ) -> Result<i64, DeliveryError>;

    async fn edit(
        &self,
        destination: &Destination,
        message_id: i64,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError>;

    async fn delete(
        &self,
        destination: &Destination,
        message_id: i64,
    ) -> Result<(), DeliveryError>;
}

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
}

/// Telegram Bot API transport.
pub struct TelegramNotifier {
    http: Client,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str) -> Result<Self> {
        Self::with_base_url(format!("{TELEGRAM_API_BASE}/bot{bot_token}"))
    }

    /// Test seam; lets the Bot API root point at a local mock server.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .context("failed to build HTTP client for the chat transport")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, DeliveryError> {
        let url = format!("{base}/{method}", base = self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| DeliveryError::Unreachable {
                message: format!("{method} request failed: {err}"),
            })?;

        let status = response.status().as_u16();
        let parsed: TgResponse<T> =
            response
                .json()
                .await
                .map_err(|err| DeliveryError::Unreachable {
                    message: format!("failed to decode {method} response: {err}"),
                })?;

        if !parsed.ok {
            return Err(DeliveryError::Rejected {
                status,
                message: parsed
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            });
        }
        parsed.result.ok_or_else(|| DeliveryError::Unreachable {
            message: format!("{method} response carried no result"),
        })
    }

    fn message_body(
        destination: &Destination,
        message: &OutgoingMessage,
        markdown: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "chat_id": destination.chat_id,
            "text": message.text,
        });
        if markdown {
            body["parse_mode"] = json!("Markdown");
        }
        body
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(
        &self,
        destination: &Destination,
        message: &OutgoingMessage,
    ) -> Result<i64, DeliveryError> {
        let first = self
            .call::<TgMessage>(
                "sendMessage",
                Self::message_body(destination, message, message.markdown),
            )
            .await;

        let sent = match first {
            Ok(sent) => sent,
            // Formatting the transport will not take is resent once as plain
            // text rather than dropped.
            Err(DeliveryError::Rejected { status, message: reason }) if message.markdown => {
                debug!(
                    "rich send to chat {chat_id} rejected (status {status}): {reason}, retrying as plain text",
                    chat_id = destination.chat_id
                );
                self.call::<TgMessage>(
                    "sendMessage",
                    Self::message_body(destination, message, false),
                )
                .await?
            }
            Err(err) => return Err(err),
        };
        Ok(sent.message_id)
    }

    async fn edit(
        &self,
        destination: &Destination,
        message_id: i64,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError> {
        let mut body = Self::message_body(destination, message, message.markdown);
        body["message_id"] = json!(message_id);
        self.call::<TgMessage>("editMessageText", body).await?;
        Ok(())
    }

    async fn delete(
        &self,
        destination: &Destination,
        message_id: i64,
    ) -> Result<(), DeliveryError> {
        self.call::<bool>(
            "deleteMessage",
            json!({
                "chat_id": destination.chat_id,
                "message_id": message_id,
            }),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_returns_message_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sendMessage")
            .match_body(mockito::Matcher::PartialJson(json!({
                "chat_id": 7,
                "parse_mode": "Markdown",
            })))
            .with_status(200)
            .with_body(json!({"ok": true, "result": {"message_id": 55}}).to_string())
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url(server.url()).unwrap();
        let id = notifier
            .send(&Destination::private(7), &OutgoingMessage::markdown("hi"))
            .await
            .unwrap();
        assert_eq!(id, 55);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_rich_send_falls_back_to_plain() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/sendMessage")
            .match_body(mockito::Matcher::PartialJson(json!({
                "parse_mode": "Markdown",
            })))
            .with_status(400)
            .with_body(
                json!({"ok": false, "description": "Bad Request: can't parse entities"})
                    .to_string(),
            )
            .create_async()
            .await;
        let plain = server
            .mock("POST", "/sendMessage")
            .match_body(mockito::Matcher::PartialJson(json!({
                "text": "*broken",
            })))
            .with_status(200)
            .with_body(json!({"ok": true, "result": {"message_id": 56}}).to_string())
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url(server.url()).unwrap();
        let id = notifier
            .send(
                &Destination::group(-100),
                &OutgoingMessage::markdown("*broken"),
            )
            .await
            .unwrap();
        assert_eq!(id, 56);
        rejected.assert_async().await;
        plain.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_plain_send_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sendMessage")
            .with_status(403)
            .with_body(json!({"ok": false, "description": "Forbidden: bot was blocked"}).to_string())
            .expect(1)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url(server.url()).unwrap();
        let err = notifier
            .send(&Destination::private(7), &OutgoingMessage::plain("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 403, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn edit_targets_the_existing_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/editMessageText")
            .match_body(mockito::Matcher::PartialJson(json!({
                "chat_id": 7,
                "message_id": 55,
                "text": "updated",
            })))
            .with_status(200)
            .with_body(json!({"ok": true, "result": {"message_id": 55}}).to_string())
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url(server.url()).unwrap();
        notifier
            .edit(&Destination::private(7), 55, &OutgoingMessage::plain("updated"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn delete_posts_chat_and_message_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/deleteMessage")
            .match_body(mockito::Matcher::PartialJson(json!({
                "chat_id": -100,
                "message_id": 55,
            })))
            .with_status(200)
            .with_body(json!({"ok": true, "result": true}).to_string())
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_base_url(server.url()).unwrap();
        notifier
            .delete(&Destination::group(-100), 55)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn only_group_destinations_are_shared() {
        assert!(Destination::group(-1).is_shared());
        assert!(!Destination::private(1).is_shared());
    }
}
