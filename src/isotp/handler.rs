//! Binds an `IsoTpMessage` state machine to a CAN-frame interface: sends,
//! receives, and owns flow-control policy.

use std::time::Duration;

use crate::error::{IsoTpError, SessionError};
use crate::frame::Frame;
use crate::isotp::message::{IsoTpMessage, RxState};
use crate::transport::CanFrameInterface;

/// Negative-response tester-present echo: `7F 3E`.
const TESTER_PRESENT_NEG_RESPONSE: [u8; 2] = [0x7F, 0x3E];

pub struct IsoTpHandler<I: CanFrameInterface> {
    interface: I,
    sender_id: u32,
    padding_byte: Option<u8>,
}

impl<I: CanFrameInterface> IsoTpHandler<I> {
    pub fn new(interface: I, sender_id: u32, padding_byte: Option<u8>) -> Self {
        Self { interface, sender_id, padding_byte }
    }

    pub async fn send_message(&self, msg: &IsoTpMessage) -> Result<(), IsoTpError> {
        for frame in msg.format(7)? {
            self.interface.send_frame(frame).await;
        }
        Ok(())
    }

    pub async fn send_data(&self, arb_id: u32, payload: Vec<u8>) -> Result<(), IsoTpError> {
        let msg = IsoTpMessage::for_send(arb_id, payload, self.padding_byte);
        self.send_message(&msg).await
    }

    pub async fn send_flowcontrol(&self, command: u8, block_size: u8, delay: u8) {
        let mut payload = vec![0x30 | command, block_size, delay];
        if let Some(pad) = self.padding_byte {
            payload.resize(8, pad);
        }
        self.interface.send_frame(Frame::new(self.sender_id, payload)).await;
    }

    /// Block (up to `timeout`) assembling one ISO-TP message addressed to
    /// `arb_id` (or any sender, if `None`). Returns the reassembled payload
    /// on success, or `SessionError::NoResponse` on timeout/ERROR.
    pub async fn receive_message(&self, arb_id: Option<u32>, timeout: Duration) -> Result<Vec<u8>, SessionError> {
        if !self.interface.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let mut msg = IsoTpMessage::new(arb_id);

        loop {
            let frame = match self.interface.receive_frame(timeout).await {
                Some(f) => f,
                None => {
                    return Err(SessionError::NoResponse);
                }
            };

            if frame.payload.is_empty() {
                return Err(SessionError::NoResponse);
            }

            if let Some(expected) = arb_id {
                if frame.arb_id != expected {
                    continue;
                }
            }

            if frame.payload.len() >= 3 && frame.payload[1..3] == TESTER_PRESENT_NEG_RESPONSE {
                continue;
            }

            let done = msg.feed(&frame);

            if msg.rx_state == RxState::Error {
                return Err(SessionError::NoResponse);
            }

            if msg.rx_state == RxState::SendFc {
                self.send_flowcontrol(0, 0, 100).await;
                msg.on_flow_control_sent();
            }

            if done && msg.rx_state == RxState::Complete {
                return Ok(msg.payload);
            }
        }
    }
}
