//! CANBadger diagnostic daemon: discover or connect to a device, push CAN
//! bus settings, and run a UDS session against it.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use canbadger_client::config::{DeviceConfig, SessionConfig};
use canbadger_client::{DeviceHandle, DeviceSettings, Session};

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder().with_max_level(Level::INFO).with_target(false).compact().init();

    println!("╔═══════════════════════════════════════════════════════╗");
    println!("║     CANBadger Diagnostic Daemon                        ║");
    println!("║     ISO-TP / UDS client over IP                        ║");
    println!("╚═══════════════════════════════════════════════════════╝");
    println!();

    let device_ip: Ipv4Addr = std::env::args()
        .nth(1)
        .context("usage: canbadger-daemon <device-ip> [udp-port]")?
        .parse()
        .context("device ip must be a valid IPv4 address")?;

    let device_config = DeviceConfig {
        device_ip,
        device_udp_port: std::env::args().nth(2).and_then(|p| p.parse().ok()).unwrap_or(DeviceConfig::default().device_udp_port),
        ..DeviceConfig::default()
    };
    let session_config = SessionConfig::default();

    info!(%device_ip, udp_port = device_config.device_udp_port, "connecting to device");
    let handle = Arc::new(DeviceHandle::new(device_config.device_ip, device_config.device_udp_port));

    if !handle.connect(Duration::from_secs(10)).await {
        anyhow::bail!("device did not connect back within the timeout");
    }
    info!("device connected");

    let mut settings = DeviceSettings::default();
    settings.id = "canbadger".into();
    handle.configure(&settings).await.context("failed to push device settings")?;
    info!("pushed default settings");

    let padding = session_config.use_padding.then_some(session_config.padding_byte);
    let session = Session::new(handle.clone(), session_config.tester_id, session_config.ecu_id, padding);

    session.start(1, Duration::from_secs(1)).await.context("failed to start diagnostic session")?;
    info!(state = ?session.state(), "diagnostic session established");

    match session.request_data_by_id(0xF190).await {
        Ok((true, vin)) => info!(vin = %hex_string(&vin), "read VIN"),
        Ok((false, _)) => info!("ECU declined the VIN read"),
        Err(e) => info!(error = %e, "VIN read failed"),
    }

    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join("")
}
