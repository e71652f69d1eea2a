//! CoAP frame decoding (RFC 7252 subset) for CoIoT status datagrams.
//!
//! Decoding is a pure function over the datagram bytes; the listener drops
//! any frame that fails to decode.

use serde_json::value::RawValue;
use thiserror::Error;

/// Global device id option: `type#id#protocol`.
pub const COIOT_OPTION_GLOBAL_DEVID: u32 = 3332;
/// Seconds the status stays valid.
pub const COIOT_OPTION_STATUS_VALIDITY: u32 = 3412;
/// Serial incremented on every status change.
pub const COIOT_OPTION_STATUS_SERIAL: u32 = 3420;

const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LENGTH: u8 = 8;

/// Why a datagram is not a usable CoIoT frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoapError {
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },

    #[error("unsupported CoAP version {0}")]
    InvalidVersion(u8),

    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("reserved nibble 15 in {0}")]
    ReservedOptionNibble(&'static str),

    #[error("missing payload marker")]
    MissingPayloadMarker,

    #[error("empty payload")]
    EmptyPayload,

    #[error("payload is not JSON: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u32,
    pub value: Vec<u8>,
}

/// Parsed `type#id#protocol` device identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoiotDeviceId {
    pub device_type: String,
    pub id: String,
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CoapMessage {
    pub version: u8,
    pub message_type: MessageType,
    pub token: Vec<u8>,
    pub code: u8,
    pub message_id: u16,
    pub options: Vec<CoapOption>,
    pub payload: Box<RawValue>,
}

impl CoapMessage {
    /// Code class, the `c` of `c.dd`.
    pub fn code_class(&self) -> u8 {
        self.code >> 5
    }

    /// Code detail, the `dd` of `c.dd`.
    pub fn code_detail(&self) -> u8 {
        self.code & 0x1F
    }

    /// Value of the first option with `number`.
    pub fn option(&self, number: u32) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn coiot_device_id(&self) -> Option<CoiotDeviceId> {
        let raw = std::str::from_utf8(self.option(COIOT_OPTION_GLOBAL_DEVID)?).ok()?;
        let mut parts = raw.split('#');
        let device_type = parts.next()?.to_string();
        let id = parts.next().filter(|s| !s.is_empty())?.to_string();
        let protocol_version = parts.next().and_then(|v| v.parse().ok());
        Some(CoiotDeviceId {
            device_type,
            id,
            protocol_version,
        })
    }

    pub fn status_validity(&self) -> Option<u32> {
        self.option(COIOT_OPTION_STATUS_VALIDITY).and_then(be_uint)
    }

    pub fn status_serial(&self) -> Option<u32> {
        self.option(COIOT_OPTION_STATUS_SERIAL).and_then(be_uint)
    }

    pub fn payload_str(&self) -> &str {
        self.payload.get()
    }
}

/// Big-endian unsigned option value of up to four bytes.
fn be_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Resolve a delta or length nibble, consuming extension bytes.
fn extended(
    nibble: u8,
    buf: &[u8],
    pos: &mut usize,
    field: &'static str,
) -> Result<u32, CoapError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let byte = *buf.get(*pos).ok_or(CoapError::Truncated(field))?;
            *pos += 1;
            Ok(u32::from(byte) + 13)
        }
        14 => {
            let bytes = buf
                .get(*pos..*pos + 2)
                .ok_or(CoapError::Truncated(field))?;
            *pos += 2;
            Ok(u32::from(u16::from_be_bytes([bytes[0], bytes[1]])) + 269)
        }
        _ => Err(CoapError::ReservedOptionNibble(field)),
    }
}

/// Decode one datagram.
pub fn decode(buf: &[u8]) -> Result<CoapMessage, CoapError> {
    if buf.len() < 4 {
        return Err(CoapError::TooShort { len: buf.len() });
    }

    let version = buf[0] >> 6;
    if version != 1 {
        return Err(CoapError::InvalidVersion(version));
    }
    let message_type = MessageType::from_bits(buf[0] >> 4);
    let token_length = buf[0] & 0x0F;
    if token_length > MAX_TOKEN_LENGTH {
        return Err(CoapError::InvalidTokenLength(token_length));
    }
    let code = buf[1];
    let message_id = u16::from_be_bytes([buf[2], buf[3]]);

    let mut pos = 4 + usize::from(token_length);
    let token = buf.get(4..pos).ok_or(CoapError::Truncated("token"))?.to_vec();

    let mut options = Vec::new();
    let mut number = 0u32;
    loop {
        let Some(&byte) = buf.get(pos) else {
            return Err(CoapError::MissingPayloadMarker);
        };
        pos += 1;
        if byte == PAYLOAD_MARKER {
            break;
        }

        let delta = extended(byte >> 4, buf, &mut pos, "option delta")?;
        let length = extended(byte & 0x0F, buf, &mut pos, "option length")? as usize;
        number = number.saturating_add(delta);

        let value = buf
            .get(pos..pos + length)
            .ok_or(CoapError::Truncated("option value"))?;
        options.push(CoapOption {
            number,
            value: value.to_vec(),
        });
        pos += length;
    }

    let payload = &buf[pos..];
    if payload.is_empty() {
        return Err(CoapError::EmptyPayload);
    }
    let payload: Box<RawValue> =
        serde_json::from_slice(payload).map_err(|e| CoapError::InvalidPayload(e.to_string()))?;

    Ok(CoapMessage {
        version,
        message_type,
        token,
        code,
        message_id,
        options,
        payload,
    })
}
