//! UDP beacon listener used to find devices on the local network.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout as tokio_timeout;
use tracing::warn;

pub const DISCOVERY_PORT: u16 = 13370;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub addr: SocketAddr,
}

/// Listen on `0.0.0.0:13370` for `wait_time`, collecting unique `{id, ip}`
/// beacons. A 1-second per-recv timeout keeps the loop able to observe the
/// overall deadline.
pub async fn discover_devices(wait_time: Duration) -> anyhow::Result<Vec<DiscoveredDevice>> {
    let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
    let mut discovered: Vec<DiscoveredDevice> = Vec::new();
    let deadline = tokio::time::Instant::now() + wait_time;
    let mut buf = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let poll = Duration::from_secs(1).min(remaining);
        match tokio_timeout(poll, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, addr))) => {
                if let Some(id) = parse_beacon(&buf[..n]) {
                    let entry = DiscoveredDevice { id, addr };
                    if !discovered.contains(&entry) {
                        discovered.push(entry);
                    }
                }
            }
            Ok(Err(e)) => warn!(error = %e, "discovery recv error"),
            Err(_) => continue,
        }
    }

    Ok(discovered)
}

fn parse_beacon(data: &[u8]) -> Option<String> {
    let fields: Vec<&[u8]> = data.split(|&b| b == b'|').collect();
    fields.get(1).map(|id_bytes| String::from_utf8_lossy(id_bytes).into_owned())
}
