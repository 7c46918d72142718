// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{
    continue_hint, expect_fixed_header, packet_type, parse_utf8_string, ParseError, ParseOk,
};
use crate::mqtt_serde::{encode_utf8_string, validate_message_id};

/// UNSUBSCRIBE, removes one or more topic filters from the session.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttUnsubscribe {
    pub message_id: u16,
    pub topic_filters: Vec<String>,
}

impl MqttUnsubscribe {
    pub fn new(message_id: u16, topic_filters: Vec<String>) -> Self {
        Self {
            message_id,
            topic_filters,
        }
    }
}

impl MqttControlPacket for MqttUnsubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        // For UNSUBSCRIBE, bits 3,2,1,0 MUST be 0,0,1,0
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(validate_message_id(self.message_id)?).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        if self.topic_filters.is_empty() {
            return Err(ParseError::ParseError(
                "UNSUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }
        let mut payload = Vec::new();
        for topic in &self.topic_filters {
            payload.extend(encode_utf8_string(topic)?);
        }
        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        if packet_type(buffer)? != ControlPacketType::UNSUBSCRIBE as u8 {
            return Err(ParseError::InvalidPacketType);
        }
        let Some((mut offset, size)) = expect_fixed_header(buffer, "UNSUBSCRIBE", 0x02)? else {
            return Ok(continue_hint(buffer));
        };
        let total_len = offset + size;

        if size < 2 {
            return Err(ParseError::ParseError(
                "UNSUBSCRIBE packet must have a 2-byte message identifier".to_string(),
            ));
        }
        let (message_id, consumed) = TwoByteInteger::decode(&buffer[offset..total_len])?;
        offset += consumed;

        let mut topic_filters = Vec::new();
        while offset < total_len {
            let (topic, consumed) = parse_utf8_string(&buffer[offset..total_len])?;
            topic_filters.push(topic);
            offset += consumed;
        }

        Ok(ParseOk::Packet(
            MqttPacket::Unsubscribe(MqttUnsubscribe::new(message_id, topic_filters)),
            total_len,
        ))
    }
}
