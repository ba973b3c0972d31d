//! Protocol message definitions
//!
//! Defines the debug adapter messages exchanged with the front end. Every
//! message is a JSON object carrying a `seq` number and a `type` of
//! `request`, `response` or `event`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::launch::LaunchConfiguration;

/// Maximum accepted frame body (16MB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Maximum accepted header block
pub const MAX_HEADER_LENGTH: usize = 8 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid arguments for '{command}': {source}")]
    InvalidArguments {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Frame of {0} bytes exceeds maximum of {MAX_FRAME_LENGTH} bytes")]
    FrameTooLarge(usize),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Envelope
// ============================================================================

/// Any message on the session transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl ProtocolMessage {
    /// Parse a message from a frame body
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the message to a frame body
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Sequence number of the message
    pub fn seq(&self) -> i64 {
        match self {
            ProtocolMessage::Request(r) => r.seq,
            ProtocolMessage::Response(r) => r.seq,
            ProtocolMessage::Event(e) => e.seq,
        }
    }
}

/// A request from the front end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[cfg(test)]
impl Request {
    /// Create a request
    pub fn new(seq: i64, command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            seq,
            command: command.into(),
            arguments,
        }
    }
}

/// A response to a front-end request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// An event pushed to the front end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

// ============================================================================
// Client Requests
// ============================================================================

/// Arguments of the `initialize` request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InitializeArguments {
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "clientName", default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(rename = "adapterID", default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
}

/// Arguments of the `disconnect` request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate_debuggee: Option<bool>,
}

/// Requests the bridge understands
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeArguments),
    Launch(LaunchConfiguration),
    Disconnect(DisconnectArguments),
    Threads,
    Unknown(String),
}

impl ClientRequest {
    /// Decode the typed arguments of a request
    pub fn parse(request: &Request) -> ProtocolResult<Self> {
        match request.command.as_str() {
            "initialize" => Ok(ClientRequest::Initialize(arguments_or_default(request)?)),
            "launch" => Ok(ClientRequest::Launch(arguments_or_default(request)?)),
            "disconnect" => Ok(ClientRequest::Disconnect(arguments_or_default(request)?)),
            "threads" => Ok(ClientRequest::Threads),
            other => Ok(ClientRequest::Unknown(other.to_string())),
        }
    }
}

fn arguments_or_default<T>(request: &Request) -> ProtocolResult<T>
where
    T: DeserializeOwned + Default,
{
    match &request.arguments {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|source| ProtocolError::InvalidArguments {
                command: request.command.clone(),
                source,
            })
        }
    }
}

// ============================================================================
// Outgoing Messages
// ============================================================================

/// Which process stream an output chunk came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    Stdout,
    Stderr,
}

/// Events the session emits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Capability negotiation complete
    Initialized,
    /// A chunk of process output
    Output {
        category: OutputCategory,
        output: String,
    },
    /// The launch failed; the session is over
    Terminated,
    /// The process exited
    Exited { exit_code: i32 },
}

impl SessionEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Initialized => "initialized",
            SessionEvent::Output { .. } => "output",
            SessionEvent::Terminated => "terminated",
            SessionEvent::Exited { .. } => "exited",
        }
    }

    /// Event body, if the event has one
    pub fn body(&self) -> Option<Value> {
        match self {
            SessionEvent::Initialized | SessionEvent::Terminated => None,
            SessionEvent::Output { category, output } => {
                Some(json!({ "category": category, "output": output }))
            }
            SessionEvent::Exited { exit_code } => Some(json!({ "exitCode": exit_code })),
        }
    }

    /// Stamp the event with a sequence number
    pub fn into_event(self, seq: i64) -> Event {
        Event {
            seq,
            event: self.name().to_string(),
            body: self.body(),
        }
    }
}

/// A response that has not been assigned a sequence number yet
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub request_seq: i64,
    pub command: String,
    pub success: bool,
    pub message: Option<String>,
    pub body: Option<Value>,
}

impl Reply {
    /// Acknowledge a request
    pub fn success(request: &Request) -> Self {
        Self {
            request_seq: request.seq,
            command: request.command.clone(),
            success: true,
            message: None,
            body: None,
        }
    }

    /// Reject a request with a message
    pub fn error(request: &Request, message: impl Into<String>) -> Self {
        Self {
            request_seq: request.seq,
            command: request.command.clone(),
            success: false,
            message: Some(message.into()),
            body: None,
        }
    }

    /// Attach a body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Stamp the reply with a sequence number
    pub fn into_response(self, seq: i64) -> Response {
        Response {
            seq,
            request_seq: self.request_seq,
            success: self.success,
            command: self.command,
            message: self.message,
            body: self.body,
        }
    }
}

/// Anything queued for the transport writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Reply(Reply),
    Event(SessionEvent),
}

impl Outgoing {
    /// Turn into a wire message with the given sequence number
    pub fn into_message(self, seq: i64) -> ProtocolMessage {
        match self {
            Outgoing::Reply(reply) => ProtocolMessage::Response(reply.into_response(seq)),
            Outgoing::Event(event) => ProtocolMessage::Event(event.into_event(seq)),
        }
    }
}

impl From<Reply> for Outgoing {
    fn from(reply: Reply) -> Self {
        Outgoing::Reply(reply)
    }
}

impl From<SessionEvent> for Outgoing {
    fn from(event: SessionEvent) -> Self {
        Outgoing::Event(event)
    }
}

// ============================================================================
// Tests
// ============================================================================
