//! Drives the public API end-to-end against an in-process fake device:
//! UDP rendezvous, the TCP framed transport, and a UDS session layered on
//! top, all without touching real hardware.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use canbadger_client::wire::{ActionType, MsgType, WireMessage};
use canbadger_client::{DeviceHandle, DeviceSettings, Session};

/// Builds a `DATA` message payload matching the layout `receive_canframe`
/// expects: arb id at offset 5..9 (big-endian), CAN payload from offset 14.
fn build_canframe_data(arb_id: u32, can_payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 14];
    data[5..9].copy_from_slice(&arb_id.to_be_bytes());
    data.extend_from_slice(can_payload);
    data
}

/// Runs the other end of the wire: accepts the rendezvous, then answers a
/// handful of UDS requests with canned single-frame responses.
async fn run_fake_device(udp: UdpSocket) {
    let mut buf = [0u8; 256];
    let (n, _peer) = udp.recv_from(&mut buf).await.expect("expected a CONNECT datagram");
    let (connect_msg, _) = WireMessage::try_parse(&buf[..n]).unwrap().expect("complete CONNECT message");
    assert_eq!(connect_msg.msg_type, MsgType::Connect);
    let tcp_port = u32::from_le_bytes(connect_msg.data[..4].try_into().unwrap()) as u16;

    let mut stream = TcpStream::connect(("127.0.0.1", tcp_port)).await.expect("connect back to host listener");

    let mut rx_buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        rx_buf.extend_from_slice(&chunk[..n]);

        while let Some((msg, consumed)) = WireMessage::try_parse(&rx_buf).unwrap() {
            rx_buf.drain(..consumed);
            handle_from_host(&mut stream, msg).await;
        }
    }
}

async fn handle_from_host(stream: &mut TcpStream, msg: WireMessage) {
    match (msg.msg_type, msg.action_type) {
        (MsgType::Action, ActionType::Settings) => {
            let _ = stream.write_all(&WireMessage::ack().serialize()).await;
        }
        (MsgType::Action, ActionType::StartReplay) => {
            let _ = stream.write_all(&WireMessage::ack().serialize()).await;

            // [interface:1][arb_id:4 BE][isotp payload...]
            let isotp_payload = &msg.data[5..];
            if isotp_payload[0] & 0xF0 != 0x00 {
                return; // only single-frame requests are simulated
            }
            let service = isotp_payload[1];

            let response_frame = match service {
                0x10 => {
                    let level = isotp_payload[2];
                    Some(vec![0x02, 0x50, level])
                }
                0x22 => {
                    let mut resp = vec![0x62, isotp_payload[2], isotp_payload[3]];
                    resp.extend_from_slice(b"ABC");
                    let mut frame = vec![resp.len() as u8];
                    frame.extend(resp);
                    Some(frame)
                }
                _ => None, // tester-present (0x3E) and anything else go unanswered
            };

            if let Some(frame_payload) = response_frame {
                let data = build_canframe_data(0x7E8, &frame_payload);
                let _ = stream.write_all(&WireMessage::new(MsgType::Data, ActionType::NoType, data).serialize()).await;
            }
        }
        (MsgType::Action, ActionType::Reset) => {}
        _ => {}
    }
}

#[tokio::test]
async fn session_round_trip_over_fake_device() {
    let udp = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let device_udp_port = udp.local_addr().unwrap().port();
    tokio::spawn(run_fake_device(udp));

    let handle = Arc::new(DeviceHandle::new(Ipv4Addr::LOCALHOST, device_udp_port));
    assert!(handle.connect(Duration::from_secs(5)).await, "handle failed to connect to the fake device");

    let mut settings = DeviceSettings::default();
    settings.id = "test".into();
    handle.configure(&settings).await.expect("settings push should succeed");

    let session = Session::new(handle.clone(), 0x7E0, Some(0x7E8), Some(0xAA));
    session.start(1, Duration::from_secs(2)).await.expect("session should start");

    let (ok, vin) = session.request_data_by_id(0xF190).await.expect("request_data_by_id should not error");
    assert!(ok);
    assert_eq!(vin, b"ABC");
}
