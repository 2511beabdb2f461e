//! Telegram Bot API client using raw reqwest (no framework).
//!
//! Uses long-polling via `getUpdates`, replies via `sendMessage` /
//! `editMessageText`, and answers the liveness question via `getMe`.
//! Request URLs embed the credential, so reqwest errors are always logged
//! with the URL stripped.

use super::{ApiCheck, Channel, ChannelEvent, Gateway, InlineButton, OutboundMessage};
use crate::config::TelegramConfig;
use crate::credential::Credential;
use async_trait::async_trait;
use color_eyre::eyre::Result;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Maximum message length for Telegram (we chunk below this).
const MAX_MESSAGE_LEN: usize = 4000;

/// Backoff after a failed poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

// --- Telegram API response types ---

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    message: Option<TgMessage>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    from: Option<TgUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    username: Option<String>,
}

impl TgUser {
    fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.first_name.clone())
    }
}

/// Stateless access to the Bot API, keyed by credential per call.
#[derive(Debug, Clone)]
pub struct TelegramApi {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramApi {
    pub fn new(config: &TelegramConfig) -> Self {
        // Long polls hold the connection for poll_timeout_secs.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 15))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {e}");
                reqwest::Client::new()
            });
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, credential: &Credential, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, credential.expose())
    }

    /// Call `getMe` for `credential`, classifying every failure mode.
    pub async fn get_me(&self, credential: &Credential, timeout: Duration) -> ApiCheck {
        let started = Instant::now();
        let resp = match self
            .client
            .get(self.url(credential, "getMe"))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return classify(e),
        };

        let status = resp.status();
        match resp.json::<TgResponse<TgUser>>().await {
            Ok(body) if body.ok => ApiCheck::Ok {
                username: body.result.and_then(|u| u.username),
                response_time: started.elapsed(),
            },
            Ok(body) => ApiCheck::ApiError(
                body.description
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            ),
            Err(e) if e.is_timeout() => ApiCheck::Timeout,
            Err(_) => ApiCheck::ApiError(format!("HTTP {}", status.as_u16())),
        }
    }
}

#[async_trait]
impl Gateway for TelegramApi {
    async fn who_am_i(&self, credential: &Credential, timeout: Duration) -> ApiCheck {
        self.get_me(credential, timeout).await
    }
}

fn classify(e: reqwest::Error) -> ApiCheck {
    if e.is_timeout() {
        ApiCheck::Timeout
    } else if e.is_connect() {
        ApiCheck::ConnectionError(e.without_url().to_string())
    } else {
        ApiCheck::ApiError(e.without_url().to_string())
    }
}

/// The bot's own inbound/outbound channel.
pub struct TelegramChannel {
    api: TelegramApi,
    credential: Credential,
    poll_timeout_secs: u64,
}

impl TelegramChannel {
    pub fn new(api: TelegramApi, credential: Credential, poll_timeout_secs: u64) -> Self {
        Self {
            api,
            credential,
            poll_timeout_secs,
        }
    }

    async fn post(&self, method: &str, payload: &serde_json::Value) -> Result<()> {
        let resp = self
            .api
            .client
            .post(self.api.url(&self.credential, method))
            .json(payload)
            .send()
            .await
            .map_err(|e| color_eyre::eyre::eyre!("{method} failed: {}", e.without_url()))?;

        let body: TgResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| color_eyre::eyre::eyre!("{method} response: {}", e.without_url()))?;
        if !body.ok {
            let desc = body.description.unwrap_or_default();
            color_eyre::eyre::bail!("{method} rejected: {desc}");
        }
        Ok(())
    }

    /// Long-poll for updates from Telegram.
    async fn get_updates(&self, offset: i64) -> Result<Vec<TgUpdate>> {
        let resp = self
            .api
            .client
            .get(self.api.url(&self.credential, "getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout_secs.to_string()),
            ])
            .send()
            .await
            .map_err(|e| color_eyre::eyre::eyre!("{}", e.without_url()))?;

        let body: TgResponse<Vec<TgUpdate>> = resp
            .json()
            .await
            .map_err(|e| color_eyre::eyre::eyre!("{}", e.without_url()))?;

        if !body.ok {
            let desc = body.description.unwrap_or_default();
            color_eyre::eyre::bail!("Telegram API error: {desc}");
        }

        Ok(body.result.unwrap_or_default())
    }
}

/// Parse one update into a `ChannelEvent`.
fn parse_update(update: TgUpdate) -> Option<ChannelEvent> {
    if let Some(cq) = update.callback_query {
        let data = cq.data?;
        return Some(ChannelEvent::CallbackQuery {
            chat_id: cq.message.as_ref().map_or(cq.from.id, |m| m.chat.id),
            message_id: cq.message.as_ref().map(|m| m.message_id),
            user_id: cq.from.id,
            user_name: cq.from.display_name(),
            data,
            callback_query_id: cq.id,
        });
    }

    let msg = update.message?;
    let text = msg.text.as_deref()?.trim();
    if text.is_empty() {
        return None;
    }
    let user = msg.from.as_ref()?;

    if let Some(rest) = text.strip_prefix('/') {
        let (command, args) = rest.split_once(' ').unwrap_or((rest, ""));
        // "/status@mybot" -> "status"
        let command = command.split('@').next().unwrap_or(command);
        Some(ChannelEvent::Command {
            chat_id: msg.chat.id,
            user_id: user.id,
            user_name: user.display_name(),
            command: command.to_lowercase(),
            args: args.trim().to_owned(),
        })
    } else {
        Some(ChannelEvent::Message {
            chat_id: msg.chat.id,
            user_id: user.id,
            user_name: user.display_name(),
            text: text.to_owned(),
        })
    }
}

fn keyboard(buttons: &[Vec<InlineButton>]) -> serde_json::Value {
    let rows: Vec<Vec<serde_json::Value>> = buttons
        .iter()
        .map(|row| {
            row.iter()
                .map(|btn| {
                    serde_json::json!({
                        "text": btn.text,
                        "callback_data": btn.callback_data,
                    })
                })
                .collect()
        })
        .collect();
    serde_json::json!({ "inline_keyboard": rows })
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn run(&self, tx: Sender<ChannelEvent>, cancel: CancellationToken) {
        let mut offset: i64 = 0;

        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.get_updates(offset) => match result {
                    Ok(updates) => updates,
                    Err(e) => {
                        tracing::warn!("telegram poll error: {e}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                        }
                    }
                },
            };

            for update in updates {
                offset = update.update_id + 1;
                if let Some(event) = parse_update(update)
                    && tx.send(event).await.is_err()
                {
                    // Receiver dropped: shut down.
                    return;
                }
            }
        }
    }

    async fn send_message(&self, msg: &OutboundMessage) -> Result<()> {
        let chunks = chunk_message(&msg.text);
        let last_idx = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = serde_json::json!({
                "chat_id": msg.chat_id,
                "text": chunk,
                "parse_mode": "HTML",
            });
            // Buttons go on the last chunk only.
            if i == last_idx && !msg.buttons.is_empty() {
                payload["reply_markup"] = keyboard(&msg.buttons);
            }
            if let Err(e) = self.post("sendMessage", &payload).await {
                // Retry as plain text in case the HTML did not parse.
                tracing::debug!("{e}; retrying without parse_mode");
                if let Some(obj) = payload.as_object_mut() {
                    obj.remove("parse_mode");
                }
                self.post("sendMessage", &payload).await?;
            }
        }
        Ok(())
    }

    async fn edit_message(&self, message_id: i64, msg: &OutboundMessage) -> Result<()> {
        let mut payload = serde_json::json!({
            "chat_id": msg.chat_id,
            "message_id": message_id,
            "text": chunk_message(&msg.text)[0],
            "parse_mode": "HTML",
        });
        if !msg.buttons.is_empty() {
            payload["reply_markup"] = keyboard(&msg.buttons);
        }
        self.post("editMessageText", &payload).await
    }

    async fn answer_callback_query(&self, callback_query_id: &str) {
        let payload = serde_json::json!({ "callback_query_id": callback_query_id });
        if let Err(e) = self.post("answerCallbackQuery", &payload).await {
            tracing::debug!("{e}");
        }
    }
}

/// Escape text for Telegram's HTML parse mode.
///
/// Use on dynamic content only; structural tags we emit ourselves stay as-is.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Split a message into chunks that fit within Telegram's limit, preferring
/// newline boundaries. Never splits inside a UTF-8 character.
fn chunk_message(text: &str) -> Vec<&str> {
    if text.len() <= MAX_MESSAGE_LEN {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= MAX_MESSAGE_LEN {
            chunks.push(remaining);
            break;
        }

        let mut limit = MAX_MESSAGE_LEN;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let split_at = match remaining[..limit].rfind('\n') {
            Some(0) | None => limit,
            Some(i) => i,
        };

        let (chunk, rest) = remaining.split_at(split_at);
        chunks.push(chunk);
        remaining = rest.strip_prefix('\n').unwrap_or(rest);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: serde_json::Value) -> TgUpdate {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_chunk_message_short() {
        assert_eq!(chunk_message("hello"), vec!["hello"]);
    }

    #[test]
    fn test_chunk_message_long() {
        let line = "x".repeat(100);
        let text = vec![line.as_str(); 50].join("\n");
        let chunks = chunk_message(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_MESSAGE_LEN);
        }
    }

    #[test]
    fn test_chunk_message_multibyte_without_newlines() {
        let text = "ж".repeat(3000);
        let chunks = chunk_message(&text);
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_MESSAGE_LEN);
        }
    }

    #[test]
    fn test_parse_command_with_bot_suffix() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 5,
                "chat": {"id": 100},
                "from": {"id": 7, "first_name": "Ann", "username": "ann"},
                "text": "/Status@understudy_bot now"
            }
        })))
        .unwrap();
        match event {
            ChannelEvent::Command {
                command,
                args,
                user_name,
                ..
            } => {
                assert_eq!(command, "status");
                assert_eq!(args, "now");
                assert_eq!(user_name, "ann");
            }
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_regular_message() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 5,
                "chat": {"id": 100},
                "from": {"id": 7, "first_name": "Ann"},
                "text": "  hello world "
            }
        })))
        .unwrap();
        match event {
            ChannelEvent::Message {
                text, user_name, ..
            } => {
                assert_eq!(text, "hello world");
                assert_eq!(user_name, "Ann");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_callback_query() {
        let event = parse_update(update(serde_json::json!({
            "update_id": 2,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 7, "first_name": "Ann"},
                "message": {"message_id": 9, "chat": {"id": 100}},
                "data": "confirm_promote"
            }
        })))
        .unwrap();
        match event {
            ChannelEvent::CallbackQuery {
                chat_id,
                message_id,
                user_id,
                data,
                callback_query_id,
                ..
            } => {
                assert_eq!(chat_id, 100);
                assert_eq!(message_id, Some(9));
                assert_eq!(user_id, 7);
                assert_eq!(data, "confirm_promote");
                assert_eq!(callback_query_id, "cb-1");
            }
            other => panic!("expected CallbackQuery, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ignores_blank_and_textless_messages() {
        let blank = update(serde_json::json!({
            "update_id": 1,
            "message": {"message_id": 1, "chat": {"id": 1}, "from": {"id": 1}, "text": "  "}
        }));
        assert!(parse_update(blank).is_none());
        let textless = update(serde_json::json!({
            "update_id": 2,
            "message": {"message_id": 1, "chat": {"id": 1}, "from": {"id": 1}}
        }));
        assert!(parse_update(textless).is_none());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_url_embeds_credential_under_api_base() {
        let api = TelegramApi::new(&TelegramConfig {
            api_base: "http://127.0.0.1:9/".into(),
            poll_timeout_secs: 1,
        });
        let cred = Credential::parse("123456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(
            api.url(&cred, "getMe"),
            "http://127.0.0.1:9/bot123456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA/getMe"
        );
    }

    #[tokio::test]
    async fn test_get_me_unreachable_is_not_ok() {
        // Port 9 (discard) is closed on test machines.
        let api = TelegramApi::new(&TelegramConfig {
            api_base: "http://127.0.0.1:9".into(),
            poll_timeout_secs: 1,
        });
        let cred = Credential::parse("123456:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        let check = api.get_me(&cred, Duration::from_secs(2)).await;
        assert!(!check.is_ok());
    }
}
