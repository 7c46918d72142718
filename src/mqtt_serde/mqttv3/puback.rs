// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{continue_hint, parse_message_id_packet, ParseError, ParseOk};
use crate::mqtt_serde::validate_message_id;

/// PUBACK, the response to a QoS 1 PUBLISH.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPubAck {
    pub message_id: u16,
}

impl MqttPubAck {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

impl MqttControlPacket for MqttPubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(validate_message_id(self.message_id)?).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match parse_message_id_packet(buffer, ControlPacketType::PUBACK as u8, "PUBACK", 0x00)? {
            Some((message_id, consumed)) => Ok(ParseOk::Packet(
                MqttPacket::PubAck(MqttPubAck::new(message_id)),
                consumed,
            )),
            None => Ok(continue_hint(buffer)),
        }
    }
}
