//! The 6-byte device wire framing: `[msg_type:1][action_type:1][data_len:4 LE][data...]`.

use crate::error::WireError;

pub const HEADER_LEN: usize = 6;

/// Declared payload lengths above this are treated as a corrupt header
/// rather than "keep buffering" — without this a garbage length field would
/// make the reader loop grow its buffer without bound waiting for bytes
/// that will never arrive.
pub const MAX_DATA_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Ack,
    Nack,
    Action,
    Data,
    Connect,
    DebugMsg,
}

impl MsgType {
    fn to_byte(self) -> u8 {
        match self {
            MsgType::Ack => 0,
            MsgType::Nack => 1,
            MsgType::Action => 2,
            MsgType::Data => 3,
            MsgType::Connect => 4,
            MsgType::DebugMsg => 5,
        }
    }

    fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(MsgType::Ack),
            1 => Ok(MsgType::Nack),
            2 => Ok(MsgType::Action),
            3 => Ok(MsgType::Data),
            4 => Ok(MsgType::Connect),
            5 => Ok(MsgType::DebugMsg),
            other => Err(WireError::UnknownMsgType(other)),
        }
    }
}

/// Action codes. Unknown device-specific codes round-trip through `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    NoType,
    Settings,
    LogRawCanTraffic,
    StopCurrentAction,
    StartReplay,
    Relay,
    Reset,
    Other(u8),
}

impl ActionType {
    fn to_byte(self) -> u8 {
        match self {
            ActionType::NoType => 0,
            ActionType::Settings => 1,
            ActionType::LogRawCanTraffic => 2,
            ActionType::StopCurrentAction => 3,
            ActionType::StartReplay => 4,
            ActionType::Relay => 5,
            ActionType::Reset => 6,
            ActionType::Other(b) => b,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0 => ActionType::NoType,
            1 => ActionType::Settings,
            2 => ActionType::LogRawCanTraffic,
            3 => ActionType::StopCurrentAction,
            4 => ActionType::StartReplay,
            5 => ActionType::Relay,
            6 => ActionType::Reset,
            other => ActionType::Other(other),
        }
    }
}

/// A single framed unit on the TCP/UDP link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub msg_type: MsgType,
    pub action_type: ActionType,
    pub data: Vec<u8>,
}

impl WireMessage {
    pub fn new(msg_type: MsgType, action_type: ActionType, data: Vec<u8>) -> Self {
        Self { msg_type, action_type, data }
    }

    pub fn ack() -> Self {
        Self::new(MsgType::Ack, ActionType::NoType, Vec::new())
    }

    pub fn nack() -> Self {
        Self::new(MsgType::Nack, ActionType::NoType, Vec::new())
    }

    /// Serialize header + payload, ready to be written to the socket.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.push(self.msg_type.to_byte());
        out.push(self.action_type.to_byte());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode the 6-byte header from the front of `buffer`, returning the
    /// parsed fields and declared data length. Does not touch the payload
    /// bytes; the caller decides whether enough of them are buffered yet.
    pub fn decode_header(buffer: &[u8]) -> Result<(MsgType, ActionType, usize), WireError> {
        if buffer.len() < HEADER_LEN {
            return Err(WireError::HeaderTooShort(buffer.len()));
        }
        let msg_type = MsgType::from_byte(buffer[0])?;
        let action_type = ActionType::from_byte(buffer[1]);
        let data_len = u32::from_le_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]) as usize;
        if data_len > MAX_DATA_LEN {
            return Err(WireError::DeclaredLengthExceedsBuffer { declared: data_len, available: MAX_DATA_LEN });
        }
        Ok((msg_type, action_type, data_len))
    }

    /// Attempt to pull one complete `WireMessage` off the front of `buffer`.
    /// Returns `Some((message, bytes_consumed))` if the buffer holds a full
    /// header + payload, `None` if more bytes are needed. Never reads past
    /// the declared length.
    pub fn try_parse(buffer: &[u8]) -> Result<Option<(WireMessage, usize)>, WireError> {
        if buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let (msg_type, action_type, data_len) = Self::decode_header(buffer)?;
        let total_len = HEADER_LEN + data_len;
        if buffer.len() < total_len {
            return Ok(None);
        }
        let data = buffer[HEADER_LEN..total_len].to_vec();
        Ok(Some((WireMessage::new(msg_type, action_type, data), total_len)))
    }

    pub fn is_ack_or_nack(&self) -> bool {
        matches!(self.msg_type, MsgType::Ack | MsgType::Nack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let msg = WireMessage::new(MsgType::Action, ActionType::Settings, vec![1, 2, 3, 4]);
        let bytes = msg.serialize();
        assert_eq!(bytes.len(), HEADER_LEN + 4);

        let (parsed, consumed) = WireMessage::try_parse(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn header_encodes_little_endian_length() {
        let msg = WireMessage::new(MsgType::Data, ActionType::NoType, vec![0; 300]);
        let bytes = msg.serialize();
        assert_eq!(&bytes[2..6], &300u32.to_le_bytes());
    }

    #[test]
    fn try_parse_returns_none_when_header_incomplete() {
        assert!(WireMessage::try_parse(&[0, 1, 2]).unwrap().is_none());
    }

    #[test]
    fn try_parse_returns_none_when_payload_incomplete() {
        let msg = WireMessage::new(MsgType::Data, ActionType::NoType, vec![9; 10]);
        let bytes = msg.serialize();
        assert!(WireMessage::try_parse(&bytes[..HEADER_LEN + 4]).unwrap().is_none());
    }

    #[test]
    fn try_parse_never_reads_past_declared_length_on_fuzz_like_input() {
        // arbitrary byte soup: must never panic, and must never report a
        // consumed length longer than the buffer.
        for seed in 0u8..64 {
            let buffer: Vec<u8> = (0..37).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect();
            match WireMessage::try_parse(&buffer) {
                Ok(Some((_, consumed))) => assert!(consumed <= buffer.len()),
                Ok(None) | Err(_) => {}
            }
        }
    }

    #[test]
    fn unknown_msg_type_is_rejected_not_panicked() {
        let mut buffer = vec![0xFF, 0, 0, 0, 0, 0];
        buffer.extend_from_slice(&[]);
        assert!(matches!(WireMessage::try_parse(&buffer), Err(WireError::UnknownMsgType(0xFF))));
    }

    #[test]
    fn declared_length_over_the_cap_is_rejected_immediately() {
        let mut buffer = vec![MsgType::Data.to_byte(), ActionType::NoType.to_byte()];
        buffer.extend_from_slice(&((MAX_DATA_LEN + 1) as u32).to_le_bytes());
        let err = WireMessage::try_parse(&buffer).unwrap_err();
        assert!(matches!(err, WireError::DeclaredLengthExceedsBuffer { declared, available } if declared == MAX_DATA_LEN + 1 && available == MAX_DATA_LEN));
    }

    #[test]
    fn ack_and_nack_are_identified() {
        assert!(WireMessage::ack().is_ack_or_nack());
        assert!(WireMessage::nack().is_ack_or_nack());
        assert!(!WireMessage::new(MsgType::Data, ActionType::NoType, vec![]).is_ack_or_nack());
    }
}
