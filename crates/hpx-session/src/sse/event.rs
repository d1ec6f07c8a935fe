//! Typed session events decoded from completed stream messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{TransportError, TransportResult};

/// An opaque operation record, forwarded unchanged to repositories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation(Value);

impl Operation {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Change notification published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteUpdate {
    /// New operations were pulled, in server order.
    NewOperationsAvailable(Vec<Operation>),
}

/// Error reported by the server inside the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// One decoded stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Update(RemoteUpdate),
    Error(ServerError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EventKind {
    Connected,
    Disconnected,
    Update,
    Error,
}

#[derive(Debug, Deserialize)]
enum UpdateKind {
    #[serde(rename = "operationsPulled")]
    OperationsPulled,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(default)]
    update: Option<UpdateKind>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Decodes completed messages into [`SessionEvent`]s.
///
/// Unknown `type` or `update` values are decoding errors; the caller drops
/// the message and keeps the stream open.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventParser;

impl EventParser {
    pub fn parse(message: &str) -> TransportResult<SessionEvent> {
        let envelope: Envelope = serde_json::from_str(message)?;

        match envelope.kind {
            EventKind::Connected => Ok(SessionEvent::Connected),
            EventKind::Disconnected => Ok(SessionEvent::Disconnected),
            EventKind::Update => {
                let kind = envelope
                    .update
                    .ok_or_else(|| TransportError::decoding("update event without update kind"))?;
                match kind {
                    UpdateKind::OperationsPulled => {
                        let payload = envelope.payload.ok_or_else(|| {
                            TransportError::decoding("operationsPulled without payload")
                        })?;
                        let operations: Vec<Operation> = serde_json::from_value(payload)?;
                        Ok(SessionEvent::Update(RemoteUpdate::NewOperationsAvailable(
                            operations,
                        )))
                    }
                }
            }
            EventKind::Error => {
                let error = match envelope.payload {
                    None | Some(Value::Null) => ServerError::default(),
                    Some(Value::String(message)) => ServerError {
                        code: None,
                        message,
                    },
                    Some(payload) => serde_json::from_value(payload)?,
                };
                Ok(SessionEvent::Error(error))
            }
        }
    }
}
