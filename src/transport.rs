//! Transport worker: owns the UDP rendezvous + TCP framed link to the
//! device, and the device handle facade built on top of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::wire::{ActionType, MsgType, WireMessage};

const TCP_PORT_RANGE: std::ops::RangeInclusive<u16> = 10_000..=13_369;
const RECV_BUF: usize = 4096;
const CONFIGURE_SETTLE: Duration = Duration::from_millis(300);
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unconnected,
    Connected,
    Shutdown,
}

/// Something that can send/receive raw CAN frames — the seam the ISO-TP
/// handler is written against, so it can be driven by the real device
/// handle or by an in-memory double in tests.
#[async_trait::async_trait]
pub trait CanFrameInterface: Clone + Send + Sync {
    async fn send_frame(&self, frame: Frame);
    async fn receive_frame(&self, timeout: Duration) -> Option<Frame>;
    fn is_connected(&self) -> bool;
}

struct WorkerQueues {
    command_tx: mpsc::UnboundedSender<WireMessage>,
    data_rx: Mutex<mpsc::UnboundedReceiver<WireMessage>>,
    ack_rx: Mutex<mpsc::UnboundedReceiver<WireMessage>>,
    status_rx: Mutex<mpsc::UnboundedReceiver<ConnectionStatus>>,
}

/// Owns the sockets and the reader/writer tasks. A fresh worker is spun up
/// on every `connect`/`reset`.
struct TransportWorker {
    queues: WorkerQueues,
    abort: Arc<Notify>,
    aborted: Arc<AtomicBool>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl TransportWorker {
    async fn start(device_ip: std::net::Ipv4Addr, device_udp_port: u16) -> anyhow::Result<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let tcp_port = rand::thread_rng().gen_range(TCP_PORT_RANGE);
        let listener = TcpListener::bind(("0.0.0.0", tcp_port)).await?;

        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        let connect_msg = WireMessage::new(MsgType::Connect, ActionType::NoType, (tcp_port as u32).to_le_bytes().to_vec());
        udp.send_to(&connect_msg.serialize(), (device_ip, device_udp_port)).await?;

        info!(tcp_port, "waiting for device to connect back");
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "device connected");

        let _ = status_tx.send(ConnectionStatus::Connected);

        let stream = Arc::new(Mutex::new(stream));
        let abort = Arc::new(Notify::new());
        let aborted = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(Self::reader_loop(
            stream.clone(),
            data_tx,
            ack_tx,
            status_tx.clone(),
            aborted.clone(),
            abort.clone(),
        ));
        let writer_task = tokio::spawn(Self::writer_loop(stream, command_rx, aborted.clone(), abort.clone()));

        Ok(Self {
            queues: WorkerQueues {
                command_tx,
                data_rx: Mutex::new(data_rx),
                ack_rx: Mutex::new(ack_rx),
                status_rx: Mutex::new(status_rx),
            },
            abort,
            aborted,
            reader_task,
            writer_task,
        })
    }

    async fn reader_loop(
        stream: Arc<Mutex<TcpStream>>,
        data_tx: mpsc::UnboundedSender<WireMessage>,
        ack_tx: mpsc::UnboundedSender<WireMessage>,
        status_tx: mpsc::UnboundedSender<ConnectionStatus>,
        aborted: Arc<AtomicBool>,
        abort: Arc<Notify>,
    ) {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; RECV_BUF];

        loop {
            if aborted.load(Ordering::SeqCst) {
                break;
            }

            let read_result = {
                let mut guard = stream.lock().await;
                tokio_timeout(Duration::from_secs(1), guard.read(&mut chunk)).await
            };

            let n = match read_result {
                Ok(Ok(0)) => {
                    warn!("remote closed the connection");
                    aborted.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(error = %e, "read error, aborting");
                    aborted.store(true, Ordering::SeqCst);
                    break;
                }
                Err(_) => continue, // 1s poll timeout, check abort and retry
            };

            buffer.extend_from_slice(&chunk[..n]);

            loop {
                match WireMessage::try_parse(&buffer) {
                    Ok(Some((msg, consumed))) => {
                        buffer.drain(..consumed);
                        if msg.is_ack_or_nack() {
                            let _ = ack_tx.send(msg);
                        } else {
                            let _ = data_tx.send(msg);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "dropping unparseable bytes");
                        buffer.clear();
                        break;
                    }
                }
            }
        }

        let _ = status_tx.send(ConnectionStatus::Shutdown);
        abort.notify_waiters();
    }

    async fn writer_loop(
        stream: Arc<Mutex<TcpStream>>,
        mut command_rx: mpsc::UnboundedReceiver<WireMessage>,
        aborted: Arc<AtomicBool>,
        abort: Arc<Notify>,
    ) {
        loop {
            let msg = tokio::select! {
                m = command_rx.recv() => m,
                _ = abort.notified() => None,
            };

            let Some(msg) = msg else { break };

            if aborted.load(Ordering::SeqCst) {
                break;
            }

            if msg.msg_type == MsgType::Connect {
                // invalid over an established connection
                continue;
            }

            {
                let mut guard = stream.lock().await;
                if let Err(e) = guard.write_all(&msg.serialize()).await {
                    warn!(error = %e, "write failed, aborting");
                    aborted.store(true, Ordering::SeqCst);
                    break;
                }
            }

            if msg.msg_type == MsgType::Action && msg.action_type == ActionType::Reset {
                aborted.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    async fn shutdown(self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort.notify_waiters();
        let _ = self.reader_task.await;
        let _ = self.writer_task.await;
    }
}

/// Public facade over the transport worker: connect/reset/configure and
/// blocking/timed send & receive operations.
pub struct DeviceHandle {
    device_ip: std::net::Ipv4Addr,
    device_udp_port: u16,
    worker: Mutex<Option<TransportWorker>>,
    status: AtomicBool,
}

impl DeviceHandle {
    pub fn new(device_ip: std::net::Ipv4Addr, device_udp_port: u16) -> Self {
        Self {
            device_ip,
            device_udp_port,
            worker: Mutex::new(None),
            status: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self, connect_timeout: Duration) -> bool {
        let worker = match TransportWorker::start(self.device_ip, self.device_udp_port).await {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failed to start transport worker");
                return false;
            }
        };

        let sub_interval = connect_timeout / 10;
        let mut connected = false;
        {
            let mut status_rx = worker.queues.status_rx.lock().await;
            for _ in 0..10 {
                match tokio_timeout(sub_interval, status_rx.recv()).await {
                    Ok(Some(ConnectionStatus::Connected)) => {
                        connected = true;
                        break;
                    }
                    Ok(Some(_)) | Ok(None) | Err(_) => continue,
                }
            }
        }

        self.status.store(connected, Ordering::SeqCst);
        *self.worker.lock().await = Some(worker);
        connected
    }

    pub async fn configure(&self, settings: &crate::settings::DeviceSettings) -> Result<i32, crate::error::SettingsError> {
        let payload = settings.serialize()?;
        let result = self.send(WireMessage::new(MsgType::Action, ActionType::Settings, payload), false).await;
        tokio::time::sleep(CONFIGURE_SETTLE).await;
        Ok(result)
    }

    /// Enqueue `msg`; if `wait_for_ack`, block on the ack queue up to 1s.
    /// Returns 0 on ACK, -1 on NACK/timeout/empty/not-connected.
    pub async fn send(&self, msg: WireMessage, wait_for_ack: bool) -> i32 {
        let guard = self.worker.lock().await;
        let Some(worker) = guard.as_ref() else { return -1 };

        if worker.queues.command_tx.send(msg).is_err() {
            return -1;
        }

        if !wait_for_ack {
            return 0;
        }

        let mut ack_rx = worker.queues.ack_rx.lock().await;
        match tokio_timeout(ACK_TIMEOUT, ack_rx.recv()).await {
            Ok(Some(reply)) if reply.msg_type == MsgType::Ack => 0,
            _ => -1,
        }
    }

    /// Non-blocking poll, falling back to a blocking wait up to `timeout`.
    pub async fn receive(&self, timeout: Option<Duration>) -> Option<WireMessage> {
        let guard = self.worker.lock().await;
        let worker = guard.as_ref()?;
        let mut data_rx = worker.queues.data_rx.lock().await;

        if let Ok(msg) = data_rx.try_recv() {
            return Some(msg);
        }

        match timeout {
            Some(t) => tokio_timeout(t, data_rx.recv()).await.ok().flatten(),
            None => None,
        }
    }

    pub async fn send_canframe(&self, payload: &[u8], arb_id: u32, interface: u8, extended: bool) -> i32 {
        let mut data = Vec::with_capacity(5 + payload.len());
        data.push(interface);
        let wire_id = if extended { arb_id | crate::frame::EXTENDED_ID_FLAG } else { arb_id };
        data.extend_from_slice(&wire_id.to_be_bytes());
        data.extend_from_slice(payload);
        self.send(WireMessage::new(MsgType::Action, ActionType::StartReplay, data), true).await
    }

    /// Drain DATA messages until one whose embedded arb id (offset 5..9,
    /// big-endian) is in `can_ids` (any, if empty). `(None, None)` on timeout.
    pub async fn receive_canframe(&self, can_ids: Option<&[u32]>, timeout: Duration) -> (Option<u32>, Option<Vec<u8>>) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return (None, None);
            }
            let Some(msg) = self.receive(Some(remaining)).await else {
                return (None, None);
            };
            if msg.data.len() < 14 {
                continue;
            }
            let arb_id = u32::from_be_bytes([msg.data[5], msg.data[6], msg.data[7], msg.data[8]]);
            if let Some(ids) = can_ids {
                if !ids.contains(&arb_id) {
                    continue;
                }
            }
            return (Some(arb_id), Some(msg.data[14..].to_vec()));
        }
    }

    pub async fn set_gpio(&self, num: u8, state: bool) -> i32 {
        self.send(WireMessage::new(MsgType::Action, ActionType::Relay, vec![num, state as u8]), true).await
    }

    pub async fn send_ack(&self) -> i32 {
        self.send(WireMessage::ack(), false).await
    }

    pub async fn send_nack(&self) -> i32 {
        self.send(WireMessage::nack(), false).await
    }

    pub async fn send_stop(&self) -> i32 {
        self.send(WireMessage::new(MsgType::Action, ActionType::StopCurrentAction, Vec::new()), true).await
    }

    pub async fn shutdown_connection(&self) -> i32 {
        self.send(WireMessage::new(MsgType::Action, ActionType::Reset, Vec::new()), false).await
    }

    pub async fn request_settings(&self) -> i32 {
        self.send(WireMessage::new(MsgType::Action, ActionType::Settings, Vec::new()), true).await
    }

    pub async fn start(&self) -> i32 {
        self.send(WireMessage::new(MsgType::Action, ActionType::LogRawCanTraffic, Vec::new()), true).await
    }

    pub async fn stop(&self) -> i32 {
        self.send_stop().await
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        if self.status.load(Ordering::SeqCst) { ConnectionStatus::Connected } else { ConnectionStatus::Unconnected }
    }

    /// Tear down and recreate the worker, draining every queue.
    pub async fn reset(&self) {
        let was_connected = self.status.load(Ordering::SeqCst);
        let mut guard = self.worker.lock().await;

        if let Some(worker) = guard.take() {
            if was_connected {
                let _ = worker.queues.command_tx.send(WireMessage::new(MsgType::Action, ActionType::Reset, Vec::new()));
                // Wait for the writer to forward the RESET and abort itself
                // (its own "forward then abort" path) before tearing the
                // reader down, so an externally-set abort flag never races
                // the write and drops it.
                let _ = worker.writer_task.await;
                worker.aborted.store(true, Ordering::SeqCst);
                worker.abort.notify_waiters();
                let _ = worker.reader_task.await;
            } else {
                worker.shutdown().await;
            }
        }

        self.status.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl CanFrameInterface for Arc<DeviceHandle> {
    async fn send_frame(&self, frame: Frame) {
        let _ = self.send_canframe(&frame.payload, frame.arb_id, 1, frame.is_extended_id()).await;
    }

    async fn receive_frame(&self, timeout: Duration) -> Option<Frame> {
        let (arb_id, payload) = self.receive_canframe(None, timeout).await;
        match (arb_id, payload) {
            (Some(id), Some(p)) => Some(Frame::new(id, p)),
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.status.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
pub use testutil::MockCanInterface;
