//! UDS diagnostic session: lifecycle, tester-present keepalive, and the
//! service subset used by the daemon (0x10, 0x22, 0x27, 0x34, 0x35, 0x36).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::isotp::handler::IsoTpHandler;
use crate::transport::CanFrameInterface;

const TESTER_PRESENT_INTERVAL: Duration = Duration::from_millis(500);
const TESTER_PRESENT: [u8; 2] = [0x3E, 0x80];
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Setup,
    Idle,
    Declined,
    Failed,
}

/// `((size_len & 0x0F) << 4) | (addr_len & 0x0F)` as a single header byte,
/// shared by `request_upload` and `request_download`.
fn add_len_byte(size_bytes_len: usize, addr_bytes_len: usize) -> u8 {
    (((size_bytes_len as u8) & 0x0F) << 4) | ((addr_bytes_len as u8) & 0x0F)
}

/// Minimum number of big-endian bytes (1..=8) needed to hold `value`.
fn calc_byte_size(value: u64) -> usize {
    let mut n = 1;
    let mut rest = value >> 8;
    while rest > 0 && n < 8 {
        n += 1;
        rest >>= 8;
    }
    n
}

fn be_bytes_sized(value: u64, size: usize) -> Vec<u8> {
    value.to_be_bytes()[8 - size..].to_vec()
}

pub struct Session<I: CanFrameInterface + 'static> {
    handler: Arc<IsoTpHandler<I>>,
    tester_id: u32,
    ecu_id: Option<u32>,
    state: StdMutex<SessionState>,
    halt: Arc<Notify>,
    halted: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    tp_task: Mutex<Option<JoinHandle<()>>>,
}

impl<I: CanFrameInterface + 'static> Session<I> {
    pub fn new(interface: I, tester_id: u32, ecu_id: Option<u32>, padding_byte: Option<u8>) -> Self {
        if ecu_id.is_none() {
            warn!("no ecu_id supplied, session will accept responses from any ECU");
        }
        Self {
            handler: Arc::new(IsoTpHandler::new(interface, tester_id, padding_byte)),
            tester_id,
            ecu_id,
            state: StdMutex::new(SessionState::Setup),
            halt: Arc::new(Notify::new()),
            halted: Arc::new(AtomicBool::new(false)),
            muted: Arc::new(AtomicBool::new(false)),
            tp_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// `[0x10, level]`: `0x50…` → `Idle` (and start the tester-present
    /// worker), `0x7F…` → `Declined`, anything else (including a timeout) →
    /// `Failed`.
    pub async fn start(&self, level: u8, timeout: Duration) -> Result<(), SessionError> {
        let response = self.request(vec![0x10, level], true, timeout).await;
        match response {
            Ok(bytes) if bytes.first() == Some(&0x50) => {
                self.set_state(SessionState::Idle);
                self.start_tester_present().await;
                Ok(())
            }
            Ok(bytes) if bytes.first() == Some(&0x7F) => {
                self.set_state(SessionState::Declined);
                Err(SessionError::NegativeResponse)
            }
            Ok(_) => {
                self.set_state(SessionState::Failed);
                Err(SessionError::NoResponse)
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Send `data`, muting the tester-present worker for the duration, and
    /// optionally wait for the reassembled response filtered by `ecu_id`.
    pub async fn request(&self, data: Vec<u8>, wait_for_response: bool, timeout: Duration) -> Result<Vec<u8>, SessionError> {
        self.muted.store(true, Ordering::SeqCst);
        let result = self.request_inner(data, wait_for_response, timeout).await;
        if self.state() == SessionState::Idle {
            self.muted.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn request_inner(&self, data: Vec<u8>, wait_for_response: bool, timeout: Duration) -> Result<Vec<u8>, SessionError> {
        self.handler.send_data(self.tester_id, data).await?;
        if !wait_for_response {
            return Ok(Vec::new());
        }
        self.handler.receive_message(self.ecu_id, timeout).await
    }

    pub async fn request_data_by_id(&self, did: u16) -> Result<(bool, Vec<u8>), SessionError> {
        let request = vec![0x22, (did >> 8) as u8, (did & 0xFF) as u8];
        let response = self.request(request, true, DEFAULT_REQUEST_TIMEOUT).await?;
        if response.is_empty() {
            return Ok((false, Vec::new()));
        }
        Ok((response[0] == 0x62, response[1..].to_vec()))
    }

    pub async fn request_upload(&self, memory_address: u64, memory_size: u64, data_format_id: u8) -> Result<(bool, Vec<u8>), SessionError> {
        self.memory_transfer_request(0x35, 0x75, memory_address, memory_size, data_format_id).await
    }

    /// Same wire layout as `request_upload` — both share `add_len_byte` so
    /// neither reintroduces the raw-integer header bug.
    pub async fn request_download(&self, memory_address: u64, memory_size: u64, data_format_id: u8) -> Result<(bool, Vec<u8>), SessionError> {
        self.memory_transfer_request(0x34, 0x74, memory_address, memory_size, data_format_id).await
    }

    async fn memory_transfer_request(
        &self,
        service_id: u8,
        positive_response: u8,
        memory_address: u64,
        memory_size: u64,
        data_format_id: u8,
    ) -> Result<(bool, Vec<u8>), SessionError> {
        let addr_len = calc_byte_size(memory_address);
        let size_len = calc_byte_size(memory_size);

        let mut request = vec![service_id, data_format_id, add_len_byte(size_len, addr_len)];
        request.extend(be_bytes_sized(memory_address, addr_len));
        request.extend(be_bytes_sized(memory_size, size_len));

        let response = self.request(request, true, DEFAULT_REQUEST_TIMEOUT).await?;
        if response.is_empty() {
            return Ok((false, Vec::new()));
        }
        Ok((response[0] == positive_response, response[1..].to_vec()))
    }

    pub async fn transfer_data(&self, block_number: u8, length: usize) -> Result<(bool, Vec<u8>), SessionError> {
        if length > 4096 {
            return Err(SessionError::TransferTooLarge(length));
        }
        let response = self.request(vec![0x36, block_number], true, DEFAULT_REQUEST_TIMEOUT).await?;
        if response.is_empty() {
            return Ok((false, Vec::new()));
        }
        Ok((response[0] == 0x76, response[1..].to_vec()))
    }

    /// `[0x27, level]`; on a seed (`0x67…`) invokes `on_seed` and follows up
    /// with `[0x27, level+1, key…]`.
    pub async fn security_access<F>(&self, level: u8, on_seed: F) -> Result<(bool, Vec<u8>), SessionError>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let response = self.request(vec![0x27, level], true, DEFAULT_REQUEST_TIMEOUT).await?;
        if response.is_empty() {
            return Ok((false, Vec::new()));
        }
        if response[0] != 0x67 {
            return Ok((false, response[1..].to_vec()));
        }

        let key = on_seed(&response[1..]);
        let mut follow_up = vec![0x27, level.wrapping_add(1)];
        follow_up.extend(key);

        let response = self.request(follow_up, true, DEFAULT_REQUEST_TIMEOUT).await?;
        if response.is_empty() {
            return Ok((false, Vec::new()));
        }
        Ok((response[0] == 0x67, response[1..].to_vec()))
    }

    async fn start_tester_present(&self) {
        let mut guard = self.tp_task.lock().await;
        if let Some(existing) = guard.take() {
            self.halted.store(true, Ordering::SeqCst);
            self.halt.notify_waiters();
            let _ = existing.await;
        }

        self.halted.store(false, Ordering::SeqCst);
        self.muted.store(false, Ordering::SeqCst);

        let handler = self.handler.clone();
        let tester_id = self.tester_id;
        let halted = self.halted.clone();
        let muted = self.muted.clone();
        let halt = self.halt.clone();

        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(TESTER_PRESENT_INTERVAL) => {}
                    _ = halt.notified() => break,
                }
                if halted.load(Ordering::SeqCst) {
                    break;
                }
                if muted.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = handler.send_data(tester_id, TESTER_PRESENT.to_vec()).await {
                    debug!(error = %e, "tester-present send failed, continuing");
                }
            }
        }));
    }
}

/// Exiting unconditionally halts the tester-present worker. Per the
/// concurrency model this is fire-and-forget — the worker notices on its
/// next wakeup, at most 500 ms later.
impl<I: CanFrameInterface + 'static> Drop for Session<I> {
    fn drop(&mut self) {
        self.halted.store(true, Ordering::SeqCst);
        self.halt.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::transport::MockCanInterface;

    fn iface_with_responses(frames: Vec<Frame>) -> MockCanInterface {
        let iface = MockCanInterface::new();
        for f in frames {
            iface.push_rx(f);
        }
        iface
    }

    #[test]
    fn add_len_byte_uses_corrected_bit_layout() {
        // size_len=2, addr_len=4 -> high nibble from size, low nibble from addr
        assert_eq!(add_len_byte(2, 4), 0x24);
        // the historical bug evaluated `(size<<4) & (0xF0 + addr)` due to
        // operator precedence; this must not reduce to that expression for any
        // size/addr pair that would previously produce 0x24.
        assert_eq!(add_len_byte(0x0F, 0x0F), 0xFF);
    }

    #[test]
    fn calc_byte_size_matches_reference_thresholds() {
        assert_eq!(calc_byte_size(0), 1);
        assert_eq!(calc_byte_size(0xFF), 1);
        assert_eq!(calc_byte_size(0x100), 2);
        assert_eq!(calc_byte_size(0xFFFF), 2);
        assert_eq!(calc_byte_size(0x1_0000), 3);
        assert_eq!(calc_byte_size(u64::MAX), 8);
    }

    #[tokio::test]
    async fn start_transitions_to_idle_on_positive_response() {
        let iface = iface_with_responses(vec![Frame::new(0x7E8, vec![0x02, 0x50, 0x01])]);
        let session = Session::new(iface, 0x7E0, Some(0x7E8), None);
        session.start(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn start_transitions_to_declined_on_negative_response() {
        let iface = iface_with_responses(vec![Frame::new(0x7E8, vec![0x02, 0x7F, 0x10])]);
        let session = Session::new(iface, 0x7E0, Some(0x7E8), None);
        let result = session.start(1, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SessionError::NegativeResponse)));
        assert_eq!(session.state(), SessionState::Declined);
    }

    #[tokio::test]
    async fn start_transitions_to_failed_on_timeout() {
        let iface = MockCanInterface::new();
        let session = Session::new(iface, 0x7E0, Some(0x7E8), None);
        let result = session.start(1, Duration::from_millis(10)).await;
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn request_data_by_id_reports_success_flag() {
        let iface = iface_with_responses(vec![Frame::new(0x7E8, vec![0x03, 0x62, 0xF1, 0x87])]);
        let session = Session::new(iface, 0x7E0, Some(0x7E8), None);
        let (ok, data) = session.request_data_by_id(0xF187).await.unwrap();
        assert!(ok);
        assert_eq!(data, vec![0xF1, 0x87]);
    }

    #[tokio::test]
    async fn request_upload_builds_corrected_header_byte() {
        let iface = iface_with_responses(vec![Frame::new(0x7E8, vec![0x01, 0x75])]);
        let session = Session::new(iface.clone(), 0x7E0, Some(0x7E8), None);
        let (ok, _) = session.request_upload(0x1000, 0x200, 0x00).await.unwrap();
        assert!(ok);

        // request = [0x35, dfi, header, addr_be(2), size_be(2)], 7 bytes total,
        // fits a single frame: SF length nibble 0x07 followed by the request.
        let sent = iface.sent_frames();
        assert_eq!(sent[0].payload[0], 0x07);
        assert_eq!(sent[0].payload[1], 0x35);
        // addr 0x1000 needs 2 bytes, size 0x200 needs 2 bytes -> header 0x22
        assert_eq!(sent[0].payload[3], 0x22);
    }

    #[tokio::test]
    async fn request_download_uses_same_header_convention_as_upload() {
        let upload_iface = iface_with_responses(vec![Frame::new(0x7E8, vec![0x01, 0x75])]);
        let upload_session = Session::new(upload_iface.clone(), 0x7E0, Some(0x7E8), None);
        upload_session.request_upload(0x1000, 0x200, 0x00).await.unwrap();

        let download_iface = iface_with_responses(vec![Frame::new(0x7E8, vec![0x01, 0x74])]);
        let download_session = Session::new(download_iface.clone(), 0x7E0, Some(0x7E8), None);
        download_session.request_download(0x1000, 0x200, 0x00).await.unwrap();

        // both requests carry the identical header byte at the same offset
        assert_eq!(upload_iface.sent_frames()[0].payload[3], download_iface.sent_frames()[0].payload[3]);
    }

    #[tokio::test]
    async fn transfer_data_rejects_oversized_length() {
        let iface = MockCanInterface::new();
        let session = Session::new(iface, 0x7E0, Some(0x7E8), None);
        let result = session.transfer_data(0, 4097).await;
        assert!(matches!(result, Err(SessionError::TransferTooLarge(4097))));
    }

    #[tokio::test]
    async fn security_access_follows_up_after_seed() {
        let iface = iface_with_responses(vec![
            Frame::new(0x7E8, vec![0x03, 0x67, 0x01, 0xAA, 0xBB]),
            Frame::new(0x7E8, vec![0x02, 0x67, 0x02]),
        ]);
        let session = Session::new(iface, 0x7E0, Some(0x7E8), None);
        let (ok, _) = session.security_access(1, |seed| seed.to_vec()).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn security_access_stops_before_seed_on_negative_response() {
        let iface = iface_with_responses(vec![Frame::new(0x7E8, vec![0x02, 0x7F, 0x27])]);
        let session = Session::new(iface, 0x7E0, Some(0x7E8), None);
        let (ok, _) = session.security_access(1, |seed| seed.to_vec()).await.unwrap();
        assert!(!ok);
    }
}
