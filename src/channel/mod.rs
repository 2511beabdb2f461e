//! Messaging gateway abstraction: inbound events, outbound replies, and the
//! credential-keyed "who am I" liveness call.

pub mod telegram;

use crate::credential::Credential;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// An event received from a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A regular text message from a user.
    Message {
        chat_id: i64,
        user_id: i64,
        user_name: String,
        text: String,
    },

    /// A slash command (e.g. /status, /promote).
    Command {
        chat_id: i64,
        user_id: i64,
        user_name: String,
        command: String,
        args: String,
    },

    /// An inline keyboard button was tapped.
    CallbackQuery {
        chat_id: i64,
        message_id: Option<i64>,
        user_id: i64,
        user_name: String,
        data: String,
        callback_query_id: String,
    },
}

/// An inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// A message to send back through a channel.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    /// Rows of inline buttons attached to the message.
    pub buttons: Vec<Vec<InlineButton>>,
}

impl OutboundMessage {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Vec<InlineButton>>) -> Self {
        self.buttons = buttons;
        self
    }
}

/// Trait for messaging channel integrations.
///
/// Implementations run a background loop that produces `ChannelEvent`s
/// and can send outbound messages.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Run the channel's receive loop, sending events to `tx`.
    /// Should run until `cancel` is triggered.
    async fn run(&self, tx: Sender<ChannelEvent>, cancel: CancellationToken);

    /// Send a message through this channel.
    async fn send_message(&self, msg: &OutboundMessage) -> color_eyre::Result<()>;

    /// Replace the text (and buttons) of a message sent earlier.
    async fn edit_message(&self, message_id: i64, msg: &OutboundMessage)
    -> color_eyre::Result<()>;

    /// Dismiss the client-side spinner of a tapped button.
    async fn answer_callback_query(&self, callback_query_id: &str);
}

/// Outcome of a liveness call against the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCheck {
    /// The platform accepted the credential.
    Ok {
        username: Option<String>,
        response_time: Duration,
    },
    /// No answer within the bound.
    Timeout,
    /// The platform could not be reached.
    ConnectionError(String),
    /// The platform answered but rejected the call.
    ApiError(String),
}

impl ApiCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Ok {
                username: Some(u),
                response_time,
            } => format!("@{u} answered in {:.2}s", response_time.as_secs_f64()),
            Self::Ok { response_time, .. } => {
                format!("answered in {:.2}s", response_time.as_secs_f64())
            }
            Self::Timeout => "API timeout".into(),
            Self::ConnectionError(e) => format!("API connection failed: {e}"),
            Self::ApiError(e) => format!("API error: {e}"),
        }
    }
}

/// The messaging platform's identity endpoint.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Ask the platform who `credential` belongs to, within `timeout`.
    async fn who_am_i(&self, credential: &Credential, timeout: Duration) -> ApiCheck;
}
