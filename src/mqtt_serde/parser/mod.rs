use super::control_packet::MqttPacket;
use crate::mqtt_serde::base_data::{BinaryData, TwoByteInteger, Utf8String, VariableByteInteger};
use std::error::Error;
use std::fmt;
use std::io::Error as IoError;

pub type ParserResult = Result<ParseOk, ParseError>;

// First byte of Fixed header
pub const FIXED_HDR_LEN: usize = 1;

#[derive(Debug)]
pub enum ParseError {
    More(usize, String), // not enough data for processing, hint for how many more bytes are needed
    IoError(IoError),
    ParseError(String),
    Utf8Error(std::str::Utf8Error),
    StringTooLong,
    BufferTooShort,
    BufferEmpty,
    InvalidLength,
    InvalidPacketType,
    InvalidQos(u8),
    InvalidMessageId,
    UnSuppProtoVsn,
    Timeout,
    ConnectionClosed,
    InternalError(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::More(hint, msg) => write!(f, "More data needed ({} bytes): {}", hint, msg),
            ParseError::IoError(e) => write!(f, "IO Error: {}", e),
            ParseError::ParseError(msg) => write!(f, "Parse Error: {}", msg),
            ParseError::Utf8Error(e) => write!(f, "UTF-8 Error: {}", e),
            ParseError::StringTooLong => write!(f, "String Too Long"),
            ParseError::BufferTooShort => write!(f, "Buffer Too Short"),
            ParseError::BufferEmpty => write!(f, "Buffer Empty"),
            ParseError::InvalidLength => write!(f, "Invalid Length"),
            ParseError::InvalidPacketType => write!(f, "Invalid Packet Type"),
            ParseError::InvalidQos(qos) => write!(f, "Invalid QoS level: {}", qos),
            ParseError::InvalidMessageId => write!(f, "Message identifier must be non-zero"),
            ParseError::UnSuppProtoVsn => write!(f, "Unsupported Protocol Version"),
            ParseError::Timeout => write!(f, "Timed out reading packet"),
            ParseError::ConnectionClosed => write!(f, "Connection closed by peer"),
            ParseError::InternalError(msg) => write!(f, "Internal Error: {}", msg),
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ParseError::IoError(e) => Some(e),
            ParseError::Utf8Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ParseError {
    fn from(err: IoError) -> Self {
        ParseError::IoError(err)
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseOk {
    Continue(usize, usize),    // (hint, consumed)
    Packet(MqttPacket, usize), // (packet, consumed)
}

pub fn packet_type(buffer: &[u8]) -> Result<u8, ParseError> {
    if buffer.is_empty() {
        return Err(ParseError::BufferEmpty);
    }
    Ok(buffer[0] >> 4)
}

pub fn parse_remaining_length(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
    VariableByteInteger::decode(buffer)
}

pub fn parse_utf8_string(buffer: &[u8]) -> Result<(String, usize), ParseError> {
    Utf8String::decode(buffer)
}

pub fn parse_packet_id(buffer: &[u8]) -> Result<(u16, usize), ParseError> {
    TwoByteInteger::decode(buffer)
}

pub fn parse_binary_data(buffer: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
    BinaryData::decode(buffer)
}

/// Splits the fixed header off `buffer`.
///
/// Returns `Ok(None)` when the buffer does not yet hold the whole packet,
/// otherwise `(first byte, header length, remaining length)`.
pub fn fixed_header(buffer: &[u8]) -> Result<Option<(u8, usize, usize)>, ParseError> {
    if buffer.is_empty() {
        return Ok(None);
    }
    let (remaining, vbi_len) = match parse_remaining_length(&buffer[FIXED_HDR_LEN..]) {
        Ok(res) => res,
        Err(ParseError::More(_, _)) | Err(ParseError::BufferTooShort) => return Ok(None),
        Err(e) => return Err(e),
    };
    let header_len = FIXED_HDR_LEN + vbi_len;
    if buffer.len() < header_len + remaining {
        return Ok(None);
    }
    Ok(Some((buffer[0], header_len, remaining)))
}

/// Common prologue of every packet decoder: checks the flag nibble against the
/// type's fixed value and waits for the complete packet.
pub(crate) fn expect_fixed_header(
    buffer: &[u8],
    name: &str,
    expected_flags: u8,
) -> Result<Option<(usize, usize)>, ParseError> {
    let Some((byte1, header_len, remaining)) = fixed_header(buffer)? else {
        return Ok(None);
    };
    if byte1 & 0x0f != expected_flags {
        return Err(ParseError::ParseError(format!(
            "{} packet has invalid fixed header flags",
            name
        )));
    }
    Ok(Some((header_len, remaining)))
}

/// Shared decoder for the acknowledgement packets whose whole body is a
/// two-byte message identifier (PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK).
///
/// Returns `Ok(None)` when more bytes are needed, otherwise `(message_id, consumed)`.
pub(crate) fn parse_message_id_packet(
    buffer: &[u8],
    expected_type: u8,
    name: &str,
    expected_flags: u8,
) -> Result<Option<(u16, usize)>, ParseError> {
    if packet_type(buffer)? != expected_type {
        return Err(ParseError::InvalidPacketType);
    }
    let Some((header_len, remaining)) = expect_fixed_header(buffer, name, expected_flags)? else {
        return Ok(None);
    };
    if remaining != 2 {
        return Err(ParseError::ParseError(format!(
            "{} packet must have a remaining length of 2",
            name
        )));
    }
    let (message_id, _) = parse_packet_id(&buffer[header_len..])?;
    Ok(Some((message_id, header_len + remaining)))
}

/// Shared decoder for the header-only packets (PINGREQ, PINGRESP, DISCONNECT).
/// Returns `Ok(None)` when more bytes are needed, otherwise the consumed length.
pub(crate) fn parse_empty_packet(
    buffer: &[u8],
    expected_type: u8,
    name: &str,
) -> Result<Option<usize>, ParseError> {
    if packet_type(buffer)? != expected_type {
        return Err(ParseError::InvalidPacketType);
    }
    let Some((header_len, remaining)) = expect_fixed_header(buffer, name, 0x00)? else {
        return Ok(None);
    };
    if remaining != 0 {
        return Err(ParseError::ParseError(format!(
            "{} packet must have a remaining length of 0",
            name
        )));
    }
    Ok(Some(header_len))
}

/// Hint for `ParseOk::Continue` when `expect_fixed_header` returned `None`.
pub(crate) fn continue_hint(buffer: &[u8]) -> ParseOk {
    let needed = match parse_remaining_length(buffer.get(FIXED_HDR_LEN..).unwrap_or(&[])) {
        Ok((remaining, vbi_len)) => FIXED_HDR_LEN + vbi_len + remaining - buffer.len(),
        Err(_) => 1,
    };
    ParseOk::Continue(needed, 0)
}

pub mod stream;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_header_incomplete() {
        assert_eq!(None, fixed_header(&[]).unwrap());
        assert_eq!(None, fixed_header(&[0x40]).unwrap());
        assert_eq!(None, fixed_header(&[0x40, 0x02, 0x00]).unwrap());
        assert_eq!(
            Some((0x40, 2, 2)),
            fixed_header(&[0x40, 0x02, 0x00, 0x01]).unwrap()
        );
    }

    #[test]
    fn test_expect_fixed_header_rejects_flags() {
        let res = expect_fixed_header(&[0x41, 0x02, 0x00, 0x01], "PUBACK", 0x00);
        assert!(matches!(res, Err(ParseError::ParseError(_))));
    }

    #[test]
    fn test_continue_hint() {
        assert_eq!(ParseOk::Continue(2, 0), continue_hint(&[0x40, 0x02]));
        assert_eq!(ParseOk::Continue(1, 0), continue_hint(&[0x40]));
    }
}
