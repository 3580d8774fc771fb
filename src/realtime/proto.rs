use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound keepalive probe. Sent as a bare text frame, not JSON.
pub const PING_FRAME: &str = "ping";
/// Inbound keepalive reply. Recognized before any JSON parse attempt.
pub const PONG_FRAME: &str = "pong";

/// Event type of the handshake acknowledgment that binds the tenant scope.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";
/// Event type of server-side error notifications.
pub const SERVER_ERROR: &str = "error";

/// Reserved event type matching every envelope.
pub const WILDCARD: &str = "*";

/// Messages sent by the client after the transport opens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authentication message, always the first frame after open.
    ///
    /// `token` may be empty; the server then falls back to the ambient
    /// credential carried with the transport handshake.
    Auth { token: String },
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Structured envelope carried by all non-keepalive inbound traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Event type name, e.g. `quote.updated`.
    #[serde(rename = "type")]
    pub event: String,
    /// Tenant scope the event belongs to. Absent on scope-free traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Event payload, opaque to the client.
    #[serde(default)]
    pub data: Value,
    /// Server-side timestamp string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Classified inbound message.
///
/// Event types are open-ended strings, so inbound frames are classified by
/// their `type` field: the two control messages become variants, everything
/// else is an [`EventEnvelope`] for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake acknowledgment carrying the bound tenant scope.
    Established { tenant_id: String },
    /// Server error notification. Observed, never dispatched.
    Error { message: String },
    /// Ordinary event traffic.
    Event(EventEnvelope),
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        match value.get("type").and_then(Value::as_str) {
            Some(CONNECTION_ESTABLISHED) => {
                #[derive(Deserialize)]
                struct Ack {
                    tenant_id: String,
                }
                let ack: Ack = serde_json::from_value(value)?;
                Ok(Self::Established {
                    tenant_id: ack.tenant_id,
                })
            }
            Some(SERVER_ERROR) => {
                #[derive(Deserialize)]
                struct ErrorNotice {
                    #[serde(default)]
                    message: String,
                }
                let notice: ErrorNotice = serde_json::from_value(value)?;
                Ok(Self::Error {
                    message: notice.message,
                })
            }
            _ => serde_json::from_value::<EventEnvelope>(value).map(Self::Event),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Established { tenant_id } => serde_json::to_string(&serde_json::json!({
                "type": CONNECTION_ESTABLISHED,
                "tenant_id": tenant_id,
            })),
            Self::Error { message } => serde_json::to_string(&serde_json::json!({
                "type": SERVER_ERROR,
                "message": message,
            })),
            Self::Event(envelope) => serde_json::to_string(envelope),
        }
    }
}
