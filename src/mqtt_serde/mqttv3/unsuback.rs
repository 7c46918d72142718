use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{continue_hint, parse_message_id_packet, ParseError, ParseOk};
use crate::mqtt_serde::validate_message_id;

/// UNSUBACK confirms every filter listed in the matching UNSUBSCRIBE.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttUnsubAck {
    pub message_id: u16,
}

impl MqttUnsubAck {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

impl MqttControlPacket for MqttUnsubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::UNSUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(validate_message_id(self.message_id)?).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match parse_message_id_packet(buffer, ControlPacketType::UNSUBACK as u8, "UNSUBACK", 0x00)? {
            Some((message_id, consumed)) => Ok(ParseOk::Packet(
                MqttPacket::UnsubAck(MqttUnsubAck::new(message_id)),
                consumed,
            )),
            None => Ok(continue_hint(buffer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsuback_serialization() {
        let packet = MqttUnsubAck::new(0x1234);
        assert_eq!(packet.to_bytes().unwrap(), vec![0xB0, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_unsuback_deserialization() {
        let bytes = vec![0xB0, 0x02, 0x00, 0x42];
        match MqttUnsubAck::from_bytes(&bytes).unwrap() {
            ParseOk::Packet(MqttPacket::UnsubAck(packet), consumed) => {
                assert_eq!(consumed, 4);
                assert_eq!(packet.message_id, 0x42);
            }
            _ => panic!("Expected UNSUBACK packet"),
        }
    }

    #[test]
    fn test_unsuback_invalid_flags() {
        for first in [0xB1u8, 0xB8] {
            match MqttUnsubAck::from_bytes(&[first, 0x02, 0x00, 0x01]) {
                Err(ParseError::ParseError(msg)) if msg.contains("invalid fixed header flags") => {}
                other => panic!("Expected flags error for {:#x}, got {:?}", first, other),
            }
        }
    }

    #[test]
    fn test_unsuback_invalid_remaining_length() {
        let bytes = vec![0xB0, 0x03, 0x00, 0x01, 0x00];
        match MqttUnsubAck::from_bytes(&bytes) {
            Err(ParseError::ParseError(msg)) if msg.contains("remaining length of 2") => {}
            _ => panic!("Expected ParseError with remaining length message"),
        }
    }

    #[test]
    fn test_unsuback_wrong_packet_type() {
        let bytes = vec![0x40, 0x02, 0x00, 0x01]; // PUBACK
        assert!(matches!(
            MqttUnsubAck::from_bytes(&bytes),
            Err(ParseError::InvalidPacketType)
        ));
    }

    #[test]
    fn test_unsuback_incomplete_packet() {
        assert_eq!(
            MqttUnsubAck::from_bytes(&[0xB0, 0x02, 0x00]).unwrap(),
            ParseOk::Continue(1, 0)
        );
    }
}
