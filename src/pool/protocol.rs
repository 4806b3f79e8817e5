//! Line-delimited JSON protocol spoken by tokenizer worker processes.
//!
//! Startup: the worker prints `{"status":"ready", ...}` once its vocabulary is
//! loaded, or `{"status":"error","message":...}` and exits.
//!
//! Requests are one JSON object per line:
//!
//! ```text
//! {"command":"TOKENIZE","id":"<uuid>","text":"fn main"}
//! {"command":"DETOKENIZE","id":"<uuid>","tokens":[105,113]}
//! {"command":"PING","id":"<uuid>"}
//! {"command":"SHUTDOWN","id":"<uuid>"}
//! ```
//!
//! Responses echo the id: `{"status":"ok","id":...,"result":...,"length":n}`
//! or `{"status":"error","id":...,"message":...}`.

use crate::model::TokenId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Worker command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Text → token ids.
    Tokenize,
    /// Token ids → text.
    Detokenize,
    /// Liveness probe.
    Ping,
    /// Graceful exit.
    Shutdown,
}

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Verb.
    pub command: Command,
    /// Correlation id, echoed by the worker.
    pub id: String,
    /// Input text for `TOKENIZE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Input ids for `DETOKENIZE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<TokenId>>,
}

impl WorkerRequest {
    fn new(command: Command) -> Self {
        Self {
            command,
            id: Uuid::new_v4().to_string(),
            text: None,
            tokens: None,
        }
    }

    /// `TOKENIZE` request.
    pub fn tokenize(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(Command::Tokenize)
        }
    }

    /// `DETOKENIZE` request.
    pub fn detokenize(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens: Some(tokens),
            ..Self::new(Command::Detokenize)
        }
    }

    /// `PING` request.
    pub fn ping() -> Self {
        Self::new(Command::Ping)
    }

    /// `SHUTDOWN` request.
    pub fn shutdown() -> Self {
        Self::new(Command::Shutdown)
    }
}

/// Status field of every worker line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Startup finished.
    Ready,
    /// Request succeeded.
    Ok,
    /// Startup or request failed.
    Error,
}

/// One response (or startup) line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Outcome.
    pub status: Status,
    /// Echoed request id; absent on startup lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Payload: token array or text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error detail or informational text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Length of `result`, when the worker reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

impl WorkerResponse {
    /// Successful reply to `id`.
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        let length = match &result {
            serde_json::Value::Array(items) => Some(items.len()),
            serde_json::Value::String(s) => Some(s.chars().count()),
            _ => None,
        };
        Self {
            status: Status::Ok,
            id: Some(id.into()),
            result: Some(result),
            message: None,
            length,
        }
    }

    /// Failed reply to `id` (or a startup failure when `id` is `None`).
    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            id,
            result: None,
            message: Some(message.into()),
            length: None,
        }
    }

    /// Startup line.
    pub fn ready(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ready,
            id: None,
            result: None,
            message: Some(message.into()),
            length: None,
        }
    }

    /// Interpret `result` as token ids.
    pub fn tokens(&self) -> Option<Vec<TokenId>> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Interpret `result` as text.
    pub fn text(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|v| v.as_str().map(str::to_owned))
    }
}
