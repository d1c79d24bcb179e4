//! A `CanFrameInterface` decorator that tees frame traffic into named,
//! independently enable/disable-able event logs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde_json::{json, Value};

use crate::error::LogError;
use crate::frame::Frame;
use crate::transport::CanFrameInterface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Rx,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Frame { direction: FrameDirection, arb_id: u32, payload: Vec<u8> },
    Named { name: String },
}

impl LogEvent {
    fn to_value(&self) -> Value {
        match self {
            LogEvent::Frame { direction, arb_id, payload } => {
                let type_val = match direction {
                    FrameDirection::Rx => 0,
                    FrameDirection::Tx => 1,
                };
                let payload_str = payload.iter().map(|b| format!("0x{:x}", b)).collect::<Vec<_>>().join(" ");
                json!({ "type": type_val, "arb_id": format!("0x{:x}", arb_id), "payload": payload_str })
            }
            LogEvent::Named { name } => json!({ "type": 2, "name": name }),
        }
    }

    fn from_value(value: &Value) -> Result<Self, LogError> {
        let type_val = value.get("type").and_then(Value::as_i64).ok_or(LogError::MissingType)?;
        match type_val {
            0 | 1 => {
                let arb_id_str = value.get("arb_id").and_then(Value::as_str).ok_or(LogError::MissingField("arb_id"))?;
                let payload_str = value.get("payload").and_then(Value::as_str).ok_or(LogError::MissingField("payload"))?;
                let arb_id = parse_hex_u32(arb_id_str)?;
                let payload = if payload_str.is_empty() {
                    Vec::new()
                } else {
                    payload_str
                        .split(' ')
                        .map(parse_hex_u8)
                        .collect::<Result<Vec<_>, _>>()?
                };
                let direction = if type_val == 0 { FrameDirection::Rx } else { FrameDirection::Tx };
                Ok(LogEvent::Frame { direction, arb_id, payload })
            }
            2 => {
                let name = value.get("name").and_then(Value::as_str).ok_or(LogError::MissingField("name"))?;
                Ok(LogEvent::Named { name: name.to_string() })
            }
            other => Err(LogError::UnknownType(other)),
        }
    }

    fn pretty_print(&self) {
        match self {
            LogEvent::Frame { direction, arb_id, payload } => {
                let tag = if *direction == FrameDirection::Rx { "RX" } else { "TX" };
                let payload_str = payload.iter().map(|b| format!("0x{:x}", b)).collect::<Vec<_>>().join(" ");
                println!("[{tag}] 0x{arb_id:x} {payload_str}");
            }
            LogEvent::Named { name } => println!("-> {name}"),
        }
    }
}

fn parse_hex_u32(s: &str) -> Result<u32, LogError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| LogError::BadHex(s.to_string()))
}

fn parse_hex_u8(s: &str) -> Result<u8, LogError> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| LogError::BadHex(s.to_string()))
}

/// An event plus the wall-clock time it was logged. The timestamp is a
/// pretty-print convenience only — it never appears in the wire JSON shape,
/// which stays exactly `{type, arb_id, payload}` / `{type, name}`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedEvent {
    pub event: LogEvent,
    pub logged_at: DateTime<Local>,
}

#[derive(Debug, Clone, Default)]
pub struct Log {
    pub name: Option<String>,
    pub events: Vec<TimestampedEvent>,
}

impl Log {
    pub fn new(name: Option<String>) -> Self {
        Self { name, events: Vec::new() }
    }

    pub fn log(&mut self, event: LogEvent) {
        self.events.push(TimestampedEvent { event, logged_at: Local::now() });
    }

    pub fn pretty_print(&self) {
        for entry in &self.events {
            print!("[{}] ", entry.logged_at.format("%H:%M:%S%.3f"));
            entry.event.pretty_print();
        }
    }

    pub fn to_json(&self) -> String {
        let array = Value::Array(self.events.iter().map(|e| e.event.to_value()).collect());
        array.to_string()
    }

    pub fn from_json(name: Option<String>, json_str: &str) -> Result<Self, LogError> {
        let value: Value = serde_json::from_str(json_str)?;
        let array = value.as_array().ok_or(LogError::MissingField("events array"))?;
        let events = array
            .iter()
            .map(|v| LogEvent::from_value(v).map(|event| TimestampedEvent { event, logged_at: Local::now() }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { name, events })
    }
}

/// A cloneable identity for one `Log`, usable as a map key the way the
/// distilled ancestor used Python object identity.
#[derive(Clone)]
pub struct LogHandle {
    id: u64,
    pub log: Arc<StdMutex<Log>>,
}

impl PartialEq for LogHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for LogHandle {}

pub struct LoggedInterface<I: CanFrameInterface> {
    underlying: I,
    logs: Arc<StdMutex<Vec<LogHandle>>>,
    status: Arc<StdMutex<HashMap<u64, bool>>>,
    next_id: Arc<AtomicU64>,
}

impl<I: CanFrameInterface> Clone for LoggedInterface<I> {
    fn clone(&self) -> Self {
        Self {
            underlying: self.underlying.clone(),
            logs: self.logs.clone(),
            status: self.status.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<I: CanFrameInterface> LoggedInterface<I> {
    pub fn new(underlying: I) -> Self {
        Self {
            underlying,
            logs: Arc::new(StdMutex::new(Vec::new())),
            status: Arc::new(StdMutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn start_log(&self, name: impl Into<String>) -> LogHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = LogHandle { id, log: Arc::new(StdMutex::new(Log::new(Some(name.into())))) };
        self.logs.lock().unwrap().push(handle.clone());
        self.status.lock().unwrap().insert(id, true);
        handle
    }

    pub fn add_log(&self, handle: LogHandle) {
        self.status.lock().unwrap().insert(handle.id, true);
        self.logs.lock().unwrap().push(handle);
    }

    pub fn enable_log(&self, handle: &LogHandle) {
        self.status.lock().unwrap().insert(handle.id, true);
    }

    /// Disables the given log. The distilled ancestor set this flag back to
    /// `true`, which meant "disabling" a log silently kept it active.
    pub fn disable_log(&self, handle: &LogHandle) {
        self.status.lock().unwrap().insert(handle.id, false);
    }

    pub fn disable_all(&self) {
        let logs = self.logs.lock().unwrap();
        let mut status = self.status.lock().unwrap();
        for handle in logs.iter() {
            status.insert(handle.id, false);
        }
    }

    pub fn stop_log(&self, handle: &LogHandle) -> Option<LogHandle> {
        let mut logs = self.logs.lock().unwrap();
        let pos = logs.iter().position(|l| l.id == handle.id)?;
        let removed = logs.remove(pos);
        self.status.lock().unwrap().remove(&removed.id);
        Some(removed)
    }

    pub fn stop_log_by_name(&self, name: &str) -> Option<LogHandle> {
        let mut logs = self.logs.lock().unwrap();
        let pos = logs.iter().position(|l| l.log.lock().unwrap().name.as_deref() == Some(name))?;
        let removed = logs.remove(pos);
        self.status.lock().unwrap().remove(&removed.id);
        Some(removed)
    }

    pub fn get_log_by_name(&self, name: &str) -> Option<LogHandle> {
        self.logs.lock().unwrap().iter().find(|l| l.log.lock().unwrap().name.as_deref() == Some(name)).cloned()
    }

    fn tee(&self, direction: FrameDirection, frame: &Frame) {
        let logs = self.logs.lock().unwrap();
        let status = self.status.lock().unwrap();
        for handle in logs.iter() {
            if status.get(&handle.id).copied().unwrap_or(false) {
                handle.log.lock().unwrap().log(LogEvent::Frame {
                    direction,
                    arb_id: frame.arb_id,
                    payload: frame.payload.clone(),
                });
            }
        }
    }
}

#[async_trait::async_trait]
impl<I: CanFrameInterface> CanFrameInterface for LoggedInterface<I> {
    async fn send_frame(&self, frame: Frame) {
        self.tee(FrameDirection::Tx, &frame);
        self.underlying.send_frame(frame).await;
    }

    async fn receive_frame(&self, timeout: Duration) -> Option<Frame> {
        let frame = self.underlying.receive_frame(timeout).await;
        if let Some(f) = &frame {
            if !f.payload.is_empty() {
                self.tee(FrameDirection::Rx, f);
            }
        }
        frame
    }

    fn is_connected(&self) -> bool {
        self.underlying.is_connected()
    }
}
