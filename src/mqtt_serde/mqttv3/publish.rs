use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{
    continue_hint, fixed_header, packet_type, parse_utf8_string, ParseError, ParseOk,
};
use crate::mqtt_serde::{encode_utf8_string, validate_message_id, validate_qos};

/// PUBLISH carries an application message in either direction.
///
/// The payload length is never transmitted: it is whatever remains of the
/// declared remaining length after the topic and the optional message id.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttPublish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic_name: String,
    /// Present exactly when `qos > 0`.
    pub message_id: Option<u16>,
    pub payload: Vec<u8>,
}

impl MqttPublish {
    pub fn new(
        topic_name: String,
        qos: u8,
        payload: Vec<u8>,
        message_id: Option<u16>,
        retain: bool,
        dup: bool,
    ) -> Self {
        Self {
            dup,
            qos,
            retain,
            topic_name,
            message_id,
            payload,
        }
    }
}

impl MqttControlPacket for MqttPublish {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PUBLISH as u8
    }

    fn flags(&self) -> u8 {
        ((self.dup as u8) << 3) | (self.qos << 1) | (self.retain as u8)
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        validate_qos(self.qos)?;
        let mut vh = encode_utf8_string(&self.topic_name)?;
        if self.qos > 0 {
            let msg_id = self.message_id.ok_or(ParseError::InvalidMessageId)?;
            vh.extend_from_slice(&TwoByteInteger::encode(validate_message_id(msg_id)?));
        }
        Ok(vh)
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(self.payload.clone())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        if packet_type(buffer)? != ControlPacketType::PUBLISH as u8 {
            return Err(ParseError::InvalidPacketType);
        }

        let flags = buffer[0] & 0x0F;
        let dup = (flags & 0x08) > 0;
        let qos = validate_qos((flags & 0x06) >> 1)?;
        let retain = (flags & 0x01) > 0;

        let Some((mut offset, size)) = fixed_header(buffer)?.map(|(_, hdr, size)| (hdr, size))
        else {
            return Ok(continue_hint(buffer));
        };
        let total_len = offset + size;

        let (topic_name, consumed) = parse_utf8_string(&buffer[offset..total_len])?;
        offset += consumed;

        let message_id = if qos > 0 {
            if offset + 2 > total_len {
                return Err(ParseError::ParseError(
                    "Missing message ID for QoS > 0".to_string(),
                ));
            }
            let (id, consumed) = TwoByteInteger::decode(&buffer[offset..total_len])?;
            offset += consumed;
            Some(validate_message_id(id)?)
        } else {
            None
        };

        let payload = buffer[offset..total_len].to_vec();

        Ok(ParseOk::Packet(
            MqttPacket::Publish(MqttPublish {
                dup,
                qos,
                retain,
                topic_name,
                message_id,
                payload,
            }),
            total_len,
        ))
    }
}
