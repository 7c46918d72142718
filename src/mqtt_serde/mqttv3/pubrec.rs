use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{continue_hint, parse_message_id_packet, ParseError, ParseOk};
use crate::mqtt_serde::validate_message_id;

/// PUBREC, the first acknowledgement of a QoS 2 PUBLISH. The sender answers it with PUBREL.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPubRec {
    pub message_id: u16,
}

impl MqttPubRec {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

impl MqttControlPacket for MqttPubRec {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBREC as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(validate_message_id(self.message_id)?).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match parse_message_id_packet(buffer, ControlPacketType::PUBREC as u8, "PUBREC", 0x00)? {
            Some((message_id, consumed)) => Ok(ParseOk::Packet(
                MqttPacket::PubRec(MqttPubRec::new(message_id)),
                consumed,
            )),
            None => Ok(continue_hint(buffer)),
        }
    }
}
