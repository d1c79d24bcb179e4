//! Plain configuration structs with the spec's stated defaults, intended to
//! be filled in from CLI flags by the binary.

use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_ip: Ipv4Addr,
    pub device_udp_port: u16,
    pub discovery_port: u16,
    pub tcp_port_range: std::ops::RangeInclusive<u16>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_ip: Ipv4Addr::UNSPECIFIED,
            device_udp_port: 13371,
            discovery_port: 13370,
            tcp_port_range: 10_000..=13_369,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tester_id: u32,
    pub ecu_id: Option<u32>,
    pub use_padding: bool,
    pub padding_byte: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { tester_id: 0x7E0, ecu_id: None, use_padding: true, padding_byte: 0xAA }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_defaults_match_the_stated_ports() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.device_udp_port, 13371);
        assert_eq!(cfg.discovery_port, 13370);
        assert_eq!(cfg.tcp_port_range, 10_000..=13_369);
    }

    #[test]
    fn session_config_defaults_use_padding_0xaa() {
        let cfg = SessionConfig::default();
        assert!(cfg.use_padding);
        assert_eq!(cfg.padding_byte, 0xAA);
    }
}
