//! Control-plane envelope and its typed command view.
//!
//! Every frame on the control socket is one JSON [`ControlMessage`]. Wire
//! field names are `camelCase`. Unknown fields are ignored on decode so newer
//! peers can add fields without breaking older ones.
//!
//! Two error channels exist and mean different things:
//!
//! - the top-level `error` reports a transport or protocol failure (no
//!   handler for the category, malformed request);
//! - an `error` inside the payload reports an application failure specific to
//!   the action (for example a spawn denied by permissions).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ProtocolError;
use crate::{AppError, Result};

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Expects exactly one response with the same id.
    Request,
    /// Answers a request.
    Response,
    /// Fire-and-forget notification.
    Event,
}

/// Protocol domain of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Terminal sessions (`spawn`).
    Terminal,
    /// Router and server housekeeping (`ready`, `ping`).
    System,
    /// Notification delivery.
    Notification,
    /// Repository status.
    Git,
}

impl Category {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::System => "system",
            Self::Notification => "notification",
            Self::Git => "git",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "terminal" => Ok(Self::Terminal),
            "system" => Ok(Self::System),
            "notification" => Ok(Self::Notification),
            "git" => Ok(Self::Git),
            other => Err(ProtocolError::NoHandlerForCategory(other.to_owned())),
        }
    }
}

/// One framed control message.
///
/// `category` stays a string on the wire type so a request for a category
/// this build does not know can still be answered with an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Correlation id.
    pub id: String,
    /// Envelope kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Category wire name.
    pub category: String,
    /// Verb scoped to the category.
    pub action: String,
    /// Action-specific body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Terminal session the message concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Transport or protocol failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlMessage {
    fn build(
        kind: MessageType,
        category: Category,
        action: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            category: category.as_str().to_owned(),
            action: action.into(),
            payload,
            session_id: None,
            error: None,
        }
    }

    /// New request with a fresh id.
    #[must_use]
    pub fn request(category: Category, action: impl Into<String>, payload: Option<Value>) -> Self {
        Self::build(MessageType::Request, category, action, payload)
    }

    /// New event with a fresh id.
    #[must_use]
    pub fn event(category: Category, action: impl Into<String>, payload: Option<Value>) -> Self {
        Self::build(MessageType::Event, category, action, payload)
    }

    /// Attach a session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Successful response to `request`; id, category, action and session id
    /// are copied.
    #[must_use]
    pub fn response_to(request: &Self, payload: Option<Value>) -> Self {
        Self {
            id: request.id.clone(),
            kind: MessageType::Response,
            category: request.category.clone(),
            action: request.action.clone(),
            payload,
            session_id: request.session_id.clone(),
            error: None,
        }
    }

    /// Protocol-level failure response to `request`.
    #[must_use]
    pub fn error_response(request: &Self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::response_to(request, None)
        }
    }

    /// Typed category, if known to this build.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NoHandlerForCategory` for unknown names.
    pub fn category(&self) -> std::result::Result<Category, ProtocolError> {
        self.category.parse()
    }

    /// Whether this is a request.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.kind == MessageType::Request
    }

    /// Application-level error carried inside the payload.
    #[must_use]
    pub fn payload_error(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("error"))
            .and_then(Value::as_str)
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedMessage` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(AppError::from)
    }

    /// Parse from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedMessage` on invalid JSON or missing
    /// required fields.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(AppError::from)
    }
}

/// Routing fields read before the payload is looked at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    /// Correlation id.
    pub id: String,
    /// Envelope kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Category wire name.
    pub category: String,
    /// Verb.
    pub action: String,
    /// Session id.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl EnvelopeHeader {
    /// Decode only the routing fields of a frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedMessage` when a routing field is
    /// missing or has the wrong type.
    pub fn peek(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(AppError::from)
    }

    /// Response with neither payload nor error, correlated to this header.
    #[must_use]
    pub fn empty_reply(&self) -> ControlMessage {
        ControlMessage {
            id: self.id.clone(),
            kind: MessageType::Response,
            category: self.category.clone(),
            action: self.action.clone(),
            payload: None,
            session_id: self.session_id.clone(),
            error: None,
        }
    }

    /// Skeleton message used to answer this header with an error.
    #[must_use]
    pub fn error_reply(&self, error: impl Into<String>) -> ControlMessage {
        ControlMessage {
            error: Some(error.into()),
            ..self.empty_reply()
        }
    }
}

/// Body of a `terminal/spawn` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnRequest {
    /// Command to run in the new terminal; the user's shell when absent.
    pub command: Option<String>,
    /// Arguments for `command`.
    pub args: Vec<String>,
    /// Starting directory.
    pub working_directory: Option<PathBuf>,
    /// Window title hint.
    pub title: Option<String>,
    /// Session the terminal belongs to; filled from the envelope when absent.
    pub session_id: Option<String>,
}

/// Body of a `terminal/spawn` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnResult {
    /// Whether the terminal was launched.
    pub success: bool,
    /// Launched process id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `terminal` actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCommand {
    /// Open a new terminal.
    Spawn(SpawnRequest),
}

/// `system` actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    /// The terminal server finished booting.
    Ready,
    /// Liveness probe.
    Ping,
}

/// A message decoded once into its category and action.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Terminal category.
    Terminal(TerminalCommand),
    /// System category.
    System(SystemCommand),
    /// Notification category; handled by an external collaborator.
    Notification {
        /// Verb.
        action: String,
        /// Body.
        payload: Option<Value>,
    },
    /// Git category; handled by an external collaborator.
    Git {
        /// Verb.
        action: String,
        /// Body.
        payload: Option<Value>,
    },
}

impl ControlCommand {
    /// Decode the typed command carried by `message`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::NoHandlerForCategory` for unknown categories.
    /// - `ProtocolError::MalformedMessage` for unknown actions or bad payloads.
    pub fn from_message(message: &ControlMessage) -> Result<Self> {
        let command = match message.category()? {
            Category::Terminal => match message.action.as_str() {
                "spawn" => {
                    let mut request: SpawnRequest = match &message.payload {
                        Some(payload) => serde_json::from_value(payload.clone())?,
                        None => SpawnRequest::default(),
                    };
                    if request.session_id.is_none() {
                        request.session_id.clone_from(&message.session_id);
                    }
                    Self::Terminal(TerminalCommand::Spawn(request))
                }
                other => return Err(unknown_action(Category::Terminal, other)),
            },
            Category::System => match message.action.as_str() {
                "ready" => Self::System(SystemCommand::Ready),
                "ping" => Self::System(SystemCommand::Ping),
                other => return Err(unknown_action(Category::System, other)),
            },
            Category::Notification => Self::Notification {
                action: message.action.clone(),
                payload: message.payload.clone(),
            },
            Category::Git => Self::Git {
                action: message.action.clone(),
                payload: message.payload.clone(),
            },
        };
        Ok(command)
    }
}

fn unknown_action(category: Category, action: &str) -> AppError {
    ProtocolError::MalformedMessage(format!("unknown {category} action: {action}")).into()
}
