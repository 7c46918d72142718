// SPDX-License-Identifier: MPL-2.0

//! Errors surfaced by [`MqttClient`](crate::mqtt_client::MqttClient).
//!
//! Delivery timeouts never show up here: they are retried inside the engine
//! and reported through the event handler. What does show up is grouped by
//! what the caller can do about it, see [`MqttClientError::is_recoverable`]
//! and [`MqttClientError::is_fatal`].

use std::fmt;
use std::io;

use serde::Serialize;

use crate::mqtt_client::transport::TransportError;
use crate::mqtt_serde::mqttv3::connack::connack_description;
use crate::mqtt_serde::parser::ParseError;

/// Longest raw packet prefix shown in messages.
const RAW_PREVIEW_LEN: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub enum MqttClientError {
    /// CONNACK carried a non-zero return code.
    ConnectionRefused { return_code: u8, description: String },
    ConnectionLost { reason: String },
    NetworkError {
        #[serde(skip)]
        kind: io::ErrorKind,
        message: String,
    },

    /// The broker sent something a broker must not send.
    ProtocolViolation { message: String },
    /// A frame could not be decoded. `raw_data` holds the bytes when known.
    PacketParsing { parse_error: String, raw_data: Vec<u8> },

    /// Every message identifier is held by an unfinished handshake.
    PacketIdExhausted,
    OperationTimeout { operation: String, timeout_ms: u64 },

    NotConnected,
    AlreadyConnected,
    /// The inflight queue is at capacity; retry once deliveries complete.
    BufferFull { buffer_type: String, capacity: usize },

    InvalidArgument { name: String, reason: String },
    InvalidConfiguration { field: String, reason: String },
    InternalError { message: String },
}

pub type MqttClientResult<T> = Result<T, MqttClientError>;

impl MqttClientError {
    /// The same call may succeed later, possibly after a reconnect.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionLost { .. }
            | Self::NetworkError { .. }
            | Self::OperationTimeout { .. }
            | Self::NotConnected
            | Self::BufferFull { .. }
            | Self::PacketIdExhausted => true,
            // server unavailable
            Self::ConnectionRefused { return_code, .. } => *return_code == 0x03,
            _ => false,
        }
    }

    /// The connection is gone and a fresh `connect` is worth trying.
    pub fn should_reconnect(&self) -> bool {
        use io::ErrorKind::*;
        match self {
            Self::ConnectionLost { .. } => true,
            Self::NetworkError { kind, .. } => matches!(
                kind,
                ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Retrying cannot help: the input, the configuration or the peer is wrong.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. }
                | Self::InvalidArgument { .. }
                | Self::InvalidConfiguration { .. }
                | Self::InternalError { .. }
        )
    }

    /// Refused for bad credentials (0x04) or missing authorization (0x05).
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused {
                return_code: 0x04 | 0x05,
                ..
            }
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionRefused {
                return_code,
                description,
            } => format!("broker refused connection ({:#04x}): {}", return_code, description),
            Self::ConnectionLost { reason } => format!("connection lost: {}", reason),
            Self::NetworkError { kind, message } => format!("network error [{:?}]: {}", kind, message),
            Self::ProtocolViolation { message } => format!("protocol violation: {}", message),
            Self::PacketParsing {
                parse_error,
                raw_data,
            } if raw_data.is_empty() => format!("malformed packet: {}", parse_error),
            Self::PacketParsing {
                parse_error,
                raw_data,
            } => {
                let shown = raw_data.len().min(RAW_PREVIEW_LEN);
                let ellipsis = if raw_data.len() > shown { ".." } else { "" };
                format!(
                    "malformed packet: {} [{}{}, {} bytes]",
                    parse_error,
                    hex::encode(&raw_data[..shown]),
                    ellipsis,
                    raw_data.len()
                )
            }
            Self::PacketIdExhausted => "no free message identifier".to_string(),
            Self::OperationTimeout {
                operation,
                timeout_ms,
            } => format!("{} timed out after {} ms", operation, timeout_ms),
            Self::NotConnected => "not connected".to_string(),
            Self::AlreadyConnected => "already connected".to_string(),
            Self::BufferFull {
                buffer_type,
                capacity,
            } => format!("{} queue full ({} entries)", buffer_type, capacity),
            Self::InvalidArgument { name, reason } => format!("invalid {}: {}", name, reason),
            Self::InvalidConfiguration { field, reason } => {
                format!("invalid setting {}: {}", field, reason)
            }
            Self::InternalError { message } => format!("internal error: {}", message),
        }
    }

    pub fn from_io_error(error: io::Error, context: &str) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: format!("{}: {}", context, error),
        }
    }

    /// A decode failure together with the frame that caused it.
    pub fn from_parse_error_with_data(error: ParseError, raw_data: Vec<u8>) -> Self {
        Self::PacketParsing {
            parse_error: error.to_string(),
            raw_data,
        }
    }

    pub fn connection_refused(return_code: u8) -> Self {
        Self::ConnectionRefused {
            return_code,
            description: connack_description(return_code).to_string(),
        }
    }

    pub fn invalid_argument(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::InternalError {
            message: format!("{} lock poisoned", what),
        }
    }
}

impl fmt::Display for MqttClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_message())
    }
}

impl std::error::Error for MqttClientError {}

impl From<io::Error> for MqttClientError {
    fn from(error: io::Error) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<ParseError> for MqttClientError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::IoError(e) => e.into(),
            ParseError::ConnectionClosed => Self::ConnectionLost {
                reason: error.to_string(),
            },
            ParseError::Timeout => Self::OperationTimeout {
                operation: "packet read".to_string(),
                timeout_ms: 0,
            },
            ParseError::InvalidMessageId => Self::invalid_argument("message_id", error.to_string()),
            ParseError::InvalidQos(_) => Self::invalid_argument("qos", error.to_string()),
            ParseError::StringTooLong => Self::invalid_argument("string", error.to_string()),
            other => Self::PacketParsing {
                parse_error: other.to_string(),
                raw_data: Vec::new(),
            },
        }
    }
}

impl From<TransportError> for MqttClientError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Io(e) => e.into(),
            TransportError::Closed => Self::ConnectionLost {
                reason: error.to_string(),
            },
            TransportError::Timeout => Self::OperationTimeout {
                operation: "transport".to_string(),
                timeout_ms: 0,
            },
            other => Self::NetworkError {
                kind: io::ErrorKind::Other,
                message: other.to_string(),
            },
        }
    }
}
