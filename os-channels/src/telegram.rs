use crate::traits::ChannelAdapter;
use crate::types::{
    ActionButton, ActionId, ConversationId, InboundAction, InteractiveMessage, MessageHandle,
    MessageId,
};
use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["callback_query"]"#;
const TELEGRAM_NOT_MODIFIED: &str = "message is not modified";
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    /// Point the adapter at a different Bot API host (local bot api server, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))?)
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={text}"
            ));
        }
        let parsed: TelegramResponse = serde_json::from_str(&text)
            .with_context(|| format!("parse telegram {method} response"))?;
        if !parsed.ok {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: {}",
                parsed.description.unwrap_or_default()
            ));
        }
        Ok(parsed.result)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundAction>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send_interactive(
        &self,
        conversation_id: &ConversationId,
        message: InteractiveMessage,
    ) -> Result<MessageHandle> {
        let mut body = json!({
            "chat_id": conversation_id.as_str(),
            "text": message.content,
        });
        if let Some(markup) = inline_keyboard(&message.actions) {
            body["reply_markup"] = markup;
        }
        let result = self.call("sendMessage", body).await?;
        let sent: TelegramSentMessage =
            serde_json::from_value(result).context("parse telegram sent message")?;
        Ok(MessageHandle {
            conversation_id: sent.chat.id.to_string().into(),
            message_id: MessageId::new(sent.message_id.to_string()),
        })
    }

    async fn replace_message(
        &self,
        handle: &MessageHandle,
        message: InteractiveMessage,
    ) -> Result<()> {
        let message_id: i64 = handle.message_id.as_str().parse().with_context(|| {
            format!("telegram message id {:?} is not numeric", handle.message_id)
        })?;
        let mut body = json!({
            "chat_id": handle.conversation_id.as_str(),
            "message_id": message_id,
            "text": message.content,
        });
        // Omitting reply_markup strips the inline keyboard.
        if let Some(markup) = inline_keyboard(&message.actions) {
            body["reply_markup"] = markup;
        }
        let result = self.call("editMessageText", body).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains(TELEGRAM_NOT_MODIFIED) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn acknowledge(&self, action_id: &ActionId, text: &str) -> Result<()> {
        self.call(
            "answerCallbackQuery",
            json!({
                "callback_query_id": action_id.as_str(),
                "text": text,
            }),
        )
        .await?;
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundAction>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(action) = build_inbound_action(&update) {
                    tx.send(action)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn inline_keyboard(actions: &[ActionButton]) -> Option<serde_json::Value> {
    if actions.is_empty() {
        return None;
    }
    let row: Vec<serde_json::Value> = actions
        .iter()
        .map(|action| json!({ "text": action.label, "callback_data": action.payload }))
        .collect();
    Some(json!({ "inline_keyboard": [row] }))
}

fn build_inbound_action(update: &TelegramUpdate) -> Option<InboundAction> {
    let query = update.callback_query.as_ref()?;
    let payload = query.data.as_deref().map(str::trim).filter(|d| !d.is_empty())?;
    let message = query
        .message
        .as_ref()
        .and_then(|message| {
            let chat = message.chat.as_ref()?;
            Some(MessageHandle {
                conversation_id: chat.id.to_string().into(),
                message_id: MessageId::new(message.message_id.to_string()),
            })
        });

    Some(InboundAction {
        action_id: query.id.clone().into(),
        channel_id: TELEGRAM_CHANNEL_ID.to_string(),
        sender_id: query.from.id.to_string().into(),
        message,
        payload: payload.to_string(),
        received_at: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramCallbackMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackMessage {
    message_id: i64,
    #[serde(default)]
    chat: Option<TelegramChat>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
    chat: TelegramChat,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}
