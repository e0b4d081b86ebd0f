//! WebSocket Protocol Types
//!
//! The server's own messages are typed; agent events are forwarded as
//! arbitrary JSON next to them on the same channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::relay::RunCommand;

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// First message on every connection
    Connected {
        #[serde(rename = "wsId")]
        ws_id: String,
        #[serde(rename = "chatId")]
        chat_id: Option<String>,
    },
    /// A new command is starting; clients clear their per-run view
    Reset {
        message: String,
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    Error {
        message: String,
    },
    /// Terminal event of a command that ran to exit
    Result {
        subtype: ResultSubtype,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSubtype {
    Success,
    Error,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn result(exit_code: i32) -> Self {
        let subtype = if exit_code == 0 {
            ResultSubtype::Success
        } else {
            ResultSubtype::Error
        };
        ServerMessage::Result { subtype, exit_code }
    }
}

/// Anything that goes out on a session's socket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Message(ServerMessage),
    Event(Value),
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Outbound::Message(msg)
    }
}

impl From<Value> for Outbound {
    fn from(event: Value) -> Self {
        Outbound::Event(event)
    }
}

/// What a client text frame asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Send(RunCommand),
    /// Not actionable; the reason is for logs only
    Ignored(&'static str),
}

/// Interpret a client text frame.
///
/// Only `{"type":"send","chatId":<non-empty string>,"prompt":<non-empty string>}`
/// is actionable. Extra fields are allowed.
pub fn parse_client_message(text: &str) -> ClientMessage {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return ClientMessage::Ignored("invalid JSON");
    };

    if value.get("type").and_then(Value::as_str) != Some("send") {
        return ClientMessage::Ignored("unsupported message type");
    }

    let non_empty = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match (non_empty("chatId"), non_empty("prompt")) {
        (Some(chat_id), Some(prompt)) => ClientMessage::Send(RunCommand { chat_id, prompt }),
        _ => ClientMessage::Ignored("missing chatId or prompt"),
    }
}
