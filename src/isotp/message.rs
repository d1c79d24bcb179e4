//! ISO-TP (ISO 15765-2) byte-level codec and receive state machine.

use crate::error::IsoTpError;
use crate::frame::Frame;

const MAX_PAYLOAD: usize = 4095;
const DEFAULT_MAX_FRAME_LEN: usize = 7;

const FRAME_TYPE_MASK: u8 = 0xF0;
const LEN_OR_CTR_MASK: u8 = 0x0F;

const FT_SINGLE: u8 = 0x00;
const FT_FIRST: u8 = 0x10;
const FT_CONSECUTIVE: u8 = 0x20;
const FT_FLOW_CONTROL: u8 = 0x30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    ExpectSfOrFf,
    ExpectCf,
    SendFc,
    Complete,
    Error,
}

/// An in-flight ISO-TP message, either being assembled for receive or built
/// for transmit.
#[derive(Debug, Clone)]
pub struct IsoTpMessage {
    pub arb_id: Option<u32>,
    pub payload: Vec<u8>,
    pub rx_state: RxState,
    pub num_received: usize,
    pub rx_len: usize,
    pub rx_next_ctr: u8,
    pub padding_byte: Option<u8>,
    last_error: Option<IsoTpError>,
}

impl IsoTpMessage {
    pub fn new(arb_id: Option<u32>) -> Self {
        Self {
            arb_id,
            payload: Vec::new(),
            rx_state: RxState::ExpectSfOrFf,
            num_received: 0,
            rx_len: 0,
            rx_next_ctr: 0,
            padding_byte: None,
            last_error: None,
        }
    }

    pub fn for_send(arb_id: u32, payload: Vec<u8>, padding_byte: Option<u8>) -> Self {
        Self {
            arb_id: Some(arb_id),
            payload,
            rx_state: RxState::ExpectSfOrFf,
            num_received: 0,
            rx_len: 0,
            rx_next_ctr: 0,
            padding_byte,
            last_error: None,
        }
    }

    /// Reuse a completed/errored message for another receive pass.
    pub fn reset(&mut self) {
        self.rx_state = RxState::ExpectSfOrFf;
        self.num_received = 0;
        self.rx_len = 0;
        self.rx_next_ctr = 0;
        self.payload.clear();
        self.last_error = None;
    }

    /// The structured cause of the last `RxState::Error` transition, if any.
    /// Cleared by `reset`.
    pub fn last_error(&self) -> Option<&IsoTpError> {
        self.last_error.as_ref()
    }

    fn fail(&mut self, err: IsoTpError) -> bool {
        self.rx_state = RxState::Error;
        self.last_error = Some(err);
        false
    }

    /// Feed one received CAN frame into the state machine.
    ///
    /// Returns `true` when the message is fully assembled (`Complete`).
    /// Flow-control frames are ignored here; the handler owns FC policy.
    pub fn feed(&mut self, frame: &Frame) -> bool {
        if frame.payload.is_empty() {
            return self.fail(IsoTpError::ShortFrame);
        }

        if frame.payload[0] & FRAME_TYPE_MASK == FT_FLOW_CONTROL {
            return self.rx_state == RxState::Complete;
        }

        match self.rx_state {
            RxState::ExpectSfOrFf => self.feed_sf_or_ff(frame),
            RxState::ExpectCf => self.feed_cf(frame),
            RxState::Complete => true,
            RxState::Error | RxState::SendFc => false,
        }
    }

    fn feed_sf_or_ff(&mut self, frame: &Frame) -> bool {
        if let Some(expected) = self.arb_id {
            if frame.arb_id != expected {
                return self.fail(IsoTpError::ArbIdMismatch { expected, actual: frame.arb_id });
            }
        } else {
            self.arb_id = Some(frame.arb_id);
        }

        let frame_type = frame.payload[0] & FRAME_TYPE_MASK;
        match frame_type {
            FT_SINGLE => {
                let content_length = (frame.payload[0] & LEN_OR_CTR_MASK) as usize;
                let available = &frame.payload[1..];
                let take = content_length.min(available.len());
                self.payload = available[..take].to_vec();
                self.num_received = self.payload.len();
                self.rx_state = RxState::Complete;
                true
            }
            FT_FIRST => {
                if frame.payload.len() < 2 {
                    return self.fail(IsoTpError::ShortFrame);
                }
                self.rx_len = ((frame.payload[0] & LEN_OR_CTR_MASK) as usize) * 256 + frame.payload[1] as usize;
                self.payload = frame.payload[2..].to_vec();
                self.num_received = self.payload.len();
                self.rx_next_ctr = 1;
                self.rx_state = RxState::SendFc;
                false
            }
            other => self.fail(IsoTpError::UnexpectedFrameType(other)),
        }
    }

    fn feed_cf(&mut self, frame: &Frame) -> bool {
        let frame_type = frame.payload[0] & FRAME_TYPE_MASK;
        let ctr = frame.payload[0] & LEN_OR_CTR_MASK;

        if frame_type != FT_CONSECUTIVE {
            return self.fail(IsoTpError::UnexpectedFrameType(frame_type));
        }
        if ctr != self.rx_next_ctr {
            return self.fail(IsoTpError::BadSequence { expected: self.rx_next_ctr, actual: ctr });
        }

        let rx_bytes_remaining = self.rx_len.saturating_sub(self.num_received);
        let rx_bytes_to_read = rx_bytes_remaining.min(7);

        let available = &frame.payload[1..];
        let take = rx_bytes_to_read.min(available.len());
        self.payload.extend_from_slice(&available[..take]);
        self.num_received += take;
        self.rx_next_ctr = (self.rx_next_ctr + 1) % 16;

        if self.num_received >= self.rx_len {
            self.rx_state = RxState::Complete;
            true
        } else {
            false
        }
    }

    /// Call after emitting a flow-control frame while in `SendFc`.
    pub fn on_flow_control_sent(&mut self) {
        if self.rx_state == RxState::SendFc {
            self.rx_state = RxState::ExpectCf;
        }
    }

    /// Encode this message's payload into one or more `Frame`s.
    pub fn format(&self, max_frame_len: usize) -> Result<Vec<Frame>, IsoTpError> {
        let arb_id = self.arb_id.unwrap_or(0);
        let max_frame_len = if max_frame_len == 0 { DEFAULT_MAX_FRAME_LEN } else { max_frame_len };

        if self.payload.len() > max_frame_len {
            let byte_count = self.payload.len();
            if byte_count > MAX_PAYLOAD {
                return Err(IsoTpError::PayloadTooLarge(byte_count));
            }

            let mut frames = Vec::new();

            let len_hi = FT_FIRST | (((byte_count >> 8) & 0x0F) as u8);
            let len_lo = (byte_count & 0xFF) as u8;
            let mut ff_payload = vec![len_hi, len_lo];
            ff_payload.extend_from_slice(&self.payload[..6]);
            frames.push(Frame::new(arb_id, ff_payload));

            let mut ctr = 1u8;
            let mut sent = 6usize;
            while sent < byte_count {
                let chunk_end = (sent + 7).min(byte_count);
                let mut cf_payload = vec![FT_CONSECUTIVE | (ctr % 16)];
                cf_payload.extend_from_slice(&self.payload[sent..chunk_end]);
                frames.push(Frame::new(arb_id, self.pad(cf_payload)));
                sent = chunk_end;
                ctr = ctr.wrapping_add(1);
            }

            Ok(frames)
        } else {
            let mut sf_payload = vec![FT_SINGLE | (self.payload.len() as u8 & LEN_OR_CTR_MASK)];
            sf_payload.extend_from_slice(&self.payload);
            Ok(vec![Frame::new(arb_id, self.pad(sf_payload))])
        }
    }

    fn pad(&self, mut msg: Vec<u8>) -> Vec<u8> {
        if msg.len() < 8 {
            if let Some(pad) = self.padding_byte {
                msg.resize(8, pad);
            }
        }
        msg
    }
}
