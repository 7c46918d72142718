use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{
    continue_hint, expect_fixed_header, packet_type, ParseError, ParseOk,
};

/// Return code a broker uses in place of a granted QoS when it refuses a filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// SUBACK, one granted QoS (or [`SUBACK_FAILURE`]) per requested filter, in order.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttSubAck {
    pub message_id: u16,
    pub return_codes: Vec<u8>,
}

impl MqttSubAck {
    pub fn new(message_id: u16, return_codes: Vec<u8>) -> Self {
        Self {
            message_id,
            return_codes,
        }
    }
}

fn check_return_code(code: u8) -> Result<u8, ParseError> {
    match code {
        0x00 | 0x01 | 0x02 | SUBACK_FAILURE => Ok(code),
        _ => Err(ParseError::ParseError(format!(
            "Invalid SUBACK return code: {}",
            code
        ))),
    }
}

impl MqttControlPacket for MqttSubAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::SUBACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(TwoByteInteger::encode(self.message_id).to_vec())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        self.return_codes
            .iter()
            .map(|&code| check_return_code(code))
            .collect()
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        if packet_type(buffer)? != ControlPacketType::SUBACK as u8 {
            return Err(ParseError::InvalidPacketType);
        }
        let Some((offset, size)) = expect_fixed_header(buffer, "SUBACK", 0x00)? else {
            return Ok(continue_hint(buffer));
        };
        let total_len = offset + size;

        if size < 2 {
            return Err(ParseError::ParseError(
                "SUBACK packet must have a 2-byte message identifier".to_string(),
            ));
        }
        let (message_id, consumed) = TwoByteInteger::decode(&buffer[offset..total_len])?;

        let return_codes = buffer[offset + consumed..total_len]
            .iter()
            .map(|&code| check_return_code(code))
            .collect::<Result<Vec<u8>, ParseError>>()?;

        Ok(ParseOk::Packet(
            MqttPacket::SubAck(MqttSubAck::new(message_id, return_codes)),
            total_len,
        ))
    }
}
