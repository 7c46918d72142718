use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{
    continue_hint, expect_fixed_header, packet_type, parse_utf8_string, ParseError, ParseOk,
};
use crate::mqtt_serde::{encode_utf8_string, validate_message_id, validate_qos};

/// One topic filter and the maximum QoS requested for it.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SubscriptionTopic {
    pub topic_filter: String,
    pub qos: u8,
}

impl SubscriptionTopic {
    pub fn new(topic_filter: impl Into<String>, qos: u8) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// SUBSCRIBE, answered by a SUBACK carrying the same message id.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttSubscribe {
    pub message_id: u16,
    pub subscriptions: Vec<SubscriptionTopic>,
}

impl MqttSubscribe {
    pub fn new(message_id: u16, subscriptions: Vec<SubscriptionTopic>) -> Self {
        Self {
            message_id,
            subscriptions,
        }
    }
}

impl MqttControlPacket for MqttSubscribe {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBSCRIBE as u8
    }

    fn flags(&self) -> u8 {
        // For SUBSCRIBE, bits 3,2,1,0 MUST be 0,0,1,0
        0x02
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(validate_message_id(self.message_id)?).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        if self.subscriptions.is_empty() {
            return Err(ParseError::ParseError(
                "SUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }
        let mut payload = Vec::new();
        for sub in &self.subscriptions {
            payload.extend(encode_utf8_string(&sub.topic_filter)?);
            payload.push(validate_qos(sub.qos)?);
        }
        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        if packet_type(buffer)? != ControlPacketType::SUBSCRIBE as u8 {
            return Err(ParseError::InvalidPacketType);
        }
        let Some((mut offset, size)) = expect_fixed_header(buffer, "SUBSCRIBE", 0x02)? else {
            return Ok(continue_hint(buffer));
        };
        let total_len = offset + size;

        if size < 2 {
            return Err(ParseError::ParseError(
                "SUBSCRIBE packet must have a 2-byte message identifier".to_string(),
            ));
        }
        let (message_id, consumed) = TwoByteInteger::decode(&buffer[offset..total_len])?;
        offset += consumed;

        let mut subscriptions = Vec::new();
        while offset < total_len {
            let (topic_filter, consumed) = parse_utf8_string(&buffer[offset..total_len])?;
            offset += consumed;

            let qos = *buffer[..total_len].get(offset).ok_or_else(|| {
                ParseError::ParseError("SUBSCRIBE payload is missing QoS byte".to_string())
            })?;
            offset += 1;

            subscriptions.push(SubscriptionTopic {
                topic_filter,
                qos: validate_qos(qos)?,
            });
        }

        if subscriptions.is_empty() {
            return Err(ParseError::ParseError(
                "SUBSCRIBE must contain at least one topic filter".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::Subscribe(MqttSubscribe::new(message_id, subscriptions)),
            total_len,
        ))
    }
}
