use crate::mqtt_serde::parser::ParseError;

/// Largest value a remaining length field may carry (four 7-bit groups).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

pub struct TwoByteInteger;

impl TwoByteInteger {
    pub fn encode(val: u16) -> [u8; 2] {
        val.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<(u16, usize), ParseError> {
        if bytes.len() < 2 {
            return Err(ParseError::BufferTooShort);
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), 2))
    }
}

/// Base-128 "remaining length" integer: 7 data bits per byte, 0x80 marks continuation.
pub struct VariableByteInteger;

impl VariableByteInteger {
    pub fn encode(val: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        let mut num = val;
        loop {
            let mut byte = (num % 128) as u8;
            num /= 128;
            if num > 0 {
                byte |= 0x80;
            }
            bytes.push(byte);
            if num == 0 {
                break;
            }
        }
        bytes
    }

    /// Number of bytes `encode` would produce for `val`.
    pub fn encoded_len(val: usize) -> usize {
        match val {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        }
    }

    pub fn decode(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
        if buffer.is_empty() {
            return Err(ParseError::BufferTooShort);
        }

        let mut decoder = VariableByteIntegerDecoder::default();
        for &byte in buffer {
            if let Some(value) = decoder.push(byte)? {
                return Ok((value, decoder.consumed()));
            }
        }
        Err(ParseError::More(
            1,
            "vbi: not enough bytes for remaining length".to_string(),
        ))
    }
}

/// Incremental form of [`VariableByteInteger::decode`], fed one byte at a time
/// by readers that cannot know the field length up front.
#[derive(Debug, Default)]
pub struct VariableByteIntegerDecoder {
    value: usize,
    multiplier: usize,
    consumed: usize,
}

impl VariableByteIntegerDecoder {
    /// Returns `Ok(Some(value))` once the terminating byte has been pushed.
    pub fn push(&mut self, byte: u8) -> Result<Option<usize>, ParseError> {
        if self.consumed == 3 && byte & 0x80 != 0 {
            // a fourth byte with the continuation bit set would need a fifth one
            return Err(ParseError::ParseError(
                "invalid remaining length, MSB is 1".to_string(),
            ));
        }
        if self.multiplier == 0 {
            self.multiplier = 1;
        }

        self.value += (byte & 0x7f) as usize * self.multiplier;
        self.multiplier *= 128;
        self.consumed += 1;

        if byte & 0x80 == 0 {
            Ok(Some(self.value))
        } else {
            Ok(None)
        }
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

pub struct BinaryData;

impl BinaryData {
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
        let (len, _) = TwoByteInteger::decode(bytes)?;
        let end = 2 + len as usize;
        if bytes.len() < end {
            return Err(ParseError::BufferTooShort);
        }
        Ok((bytes[2..end].to_vec(), end))
    }
}

/// Length-prefixed UTF-8 string. The prefix counts bytes, not characters.
pub struct Utf8String;

impl Utf8String {
    pub fn encode(s: &str) -> Vec<u8> {
        BinaryData::encode(s.as_bytes())
    }

    /// Size of the encoded field including its two-byte prefix.
    pub fn measure(s: &str) -> usize {
        2 + s.len()
    }

    pub fn decode(bytes: &[u8]) -> Result<(String, usize), ParseError> {
        let (data, len) = BinaryData::decode(bytes)?;
        let s = String::from_utf8(data).map_err(|e| ParseError::Utf8Error(e.utf8_error()))?;
        Ok((s, len))
    }
}
