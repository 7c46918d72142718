// SPDX-License-Identifier: MPL-2.0

pub mod base_data;
pub mod control_packet;
pub mod mqttv3;
pub mod parser;

use crate::mqtt_serde::base_data::{BinaryData, TwoByteInteger, Utf8String, VariableByteInteger};
use crate::mqtt_serde::parser::ParseError;
//re export
pub use crate::mqtt_serde::parser::stream::{read_packet, MqttParser};

/// Protocol level of MQTT 3.1 ("MQIsdp").
pub const MQTT_V31: u8 = 3;
/// Protocol level of MQTT 3.1.1 ("MQTT").
pub const MQTT_V311: u8 = 4;

pub(crate) fn encode_binary_data(data: &[u8]) -> Result<Vec<u8>, ParseError> {
    if data.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }
    Ok(BinaryData::encode(data))
}

pub(crate) fn encode_utf8_string(s: &str) -> Result<Vec<u8>, ParseError> {
    if s.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }
    Ok(Utf8String::encode(s))
}

pub(crate) fn encode_variable_length(len: usize) -> Vec<u8> {
    VariableByteInteger::encode(len as u32)
}

pub(crate) fn validate_qos(qos: u8) -> Result<u8, ParseError> {
    if qos > 2 {
        return Err(ParseError::InvalidQos(qos));
    }
    Ok(qos)
}

/// Message identifiers travel on the wire only for QoS > 0 and must never be 0.
pub(crate) fn validate_message_id(message_id: u16) -> Result<u16, ParseError> {
    if message_id == 0 {
        return Err(ParseError::InvalidMessageId);
    }
    Ok(message_id)
}

/// PUBLISH topics are concrete names: non-empty, no wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), ParseError> {
    if topic.is_empty() {
        return Err(ParseError::ParseError(
            "Topic name cannot be empty".to_string(),
        ));
    }
    if topic.contains(['+', '#']) {
        return Err(ParseError::ParseError(format!(
            "Topic name must not contain wildcards: {}",
            topic
        )));
    }
    Ok(())
}

/// Subscription filters may use `+` and a trailing `#`, each occupying a whole level.
pub fn validate_topic_filter(topic_filter: &str) -> Result<(), ParseError> {
    if topic_filter.is_empty() {
        return Err(ParseError::ParseError(
            "Topic filter cannot be empty".to_string(),
        ));
    }

    let levels: Vec<&str> = topic_filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(ParseError::ParseError(
                "Multi-level wildcard (#) must be the only character of the last level"
                    .to_string(),
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(ParseError::ParseError(
                "Single-level wildcard (+) must be the only character in topic level".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn packet_id(buffer: &[u8]) -> Result<(u16, usize), ParseError> {
    TwoByteInteger::decode(buffer)
}
