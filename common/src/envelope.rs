//! JSON envelopes exchanged with the WebSocket relay.
//!
//! The relay emulates a small subset of MQTT control packets. Each frame is one
//! JSON object tagged by `type`; the relay may also forward a bare control
//! record (`{"command": ...}`) without any envelope around it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has neither `type` nor `command`")]
    MissingType,
    #[error("invalid `{kind}` envelope: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEnvelope {
    Connect {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "keepAlive")]
        keep_alive: u16,
    },
    Subscribe {
        #[serde(rename = "clientId")]
        client_id: String,
        topic: String,
        qos: u8,
        #[serde(rename = "messageId")]
        message_id: u16,
    },
    Publish {
        #[serde(rename = "clientId")]
        client_id: String,
        topic: String,
        payload: String,
        qos: u8,
        retain: bool,
        #[serde(rename = "messageId")]
        message_id: u16,
    },
    Pingreq {
        #[serde(rename = "clientId")]
        client_id: String,
    },
}

impl OutboundEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Subscribe { .. } => "subscribe",
            Self::Publish { .. } => "publish",
            Self::Pingreq { .. } => "pingreq",
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEnvelope {
    Connack {
        client_id: Option<String>,
        return_code: u8,
    },
    Suback {
        message_id: Option<u16>,
    },
    Puback {
        message_id: Option<u16>,
    },
    Publish {
        topic: String,
        payload: String,
    },
    Pingresp,
    /// Control record delivered without an envelope; holds the raw json.
    Command(String),
    Unrecognized(String),
}

#[derive(Deserialize)]
struct ConnackFields {
    #[serde(rename = "clientId", default)]
    client_id: Option<String>,
    #[serde(rename = "returnCode")]
    return_code: u8,
}

#[derive(Deserialize)]
struct AckFields {
    #[serde(rename = "messageId", default)]
    message_id: Option<u16>,
}

#[derive(Deserialize)]
struct PublishFields {
    topic: String,
    #[serde(default)]
    payload: Value,
}

impl InboundEnvelope {
    pub fn decode(frame: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(frame)?;
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let kind = match object.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None if object.contains_key("command") => {
                return Ok(Self::Command(frame.trim().to_string()));
            }
            None => return Err(EnvelopeError::MissingType),
        };

        let fields = |source| EnvelopeError::InvalidFields {
            kind: kind.clone(),
            source,
        };

        let envelope = match kind.as_str() {
            "connack" => {
                let f: ConnackFields = serde_json::from_value(value).map_err(fields)?;
                Self::Connack {
                    client_id: f.client_id,
                    return_code: f.return_code,
                }
            }
            "suback" => {
                let f: AckFields = serde_json::from_value(value).map_err(fields)?;
                Self::Suback {
                    message_id: f.message_id,
                }
            }
            "puback" => {
                let f: AckFields = serde_json::from_value(value).map_err(fields)?;
                Self::Puback {
                    message_id: f.message_id,
                }
            }
            "publish" | "message" => {
                let f: PublishFields = serde_json::from_value(value).map_err(fields)?;
                let payload = match f.payload {
                    Value::String(text) => text,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                Self::Publish {
                    topic: f.topic,
                    payload,
                }
            }
            "pingresp" | "pong" => Self::Pingresp,
            other => Self::Unrecognized(other.to_string()),
        };

        Ok(envelope)
    }
}
