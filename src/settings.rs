//! Device settings payload: bit-exact (de)serialization and the status bitfield.

use crate::error::SettingsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusBit {
    SdEnabled = 0,
    UsbSerialEnabled = 1,
    EthernetEnabled = 2,
    OledEnabled = 3,
    KeyboardEnabled = 4,
    LedsEnabled = 5,
    Kline1IntEnabled = 6,
    Kline2IntEnabled = 7,
    Can1IntEnabled = 8,
    Can2IntEnabled = 9,
    KlineBridgeEnabled = 10,
    CanBridgeEnabled = 11,
    Can1Logging = 12,
    Can2Logging = 13,
    Kline1Logging = 14,
    Kline2Logging = 15,
    Can1Standard = 16,
    Can1Extended = 17,
    Can2Standard = 18,
    Can2Extended = 19,
    Can1ToCan2Bridge = 20,
    Can2ToCan1Bridge = 21,
    Kline1ToKline2Bridge = 22,
    Kline2ToKline1Bridge = 23,
    UdsCan1Enabled = 24,
    UdsCan2Enabled = 25,
    Can1UseFullframe = 26,
    Can2UseFullframe = 27,
    Can1Monitor = 28,
    Can2Monitor = 29,
}

const MAX_ID_LEN: usize = 18;
const MAX_IP_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub id: String,
    pub ip: String,
    pub status: u32,
    pub spi_speed: u32,
    pub can1_speed: u32,
    pub can2_speed: u32,
    pub kline1_speed: u32,
    pub kline2_speed: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            ip: String::new(),
            status: 0,
            spi_speed: 20_000_000,
            can1_speed: 500_000,
            can2_speed: 500_000,
            kline1_speed: 0,
            kline2_speed: 0,
        }
    }
}

impl DeviceSettings {
    pub fn set_bit(&mut self, bit: StatusBit) {
        self.status |= 1 << (bit as u32);
    }

    pub fn has_bit(&self, bit: StatusBit) -> bool {
        self.status & (1 << (bit as u32)) != 0
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.id.len() > MAX_ID_LEN {
            return Err(SettingsError::IdTooLong(self.id.len()));
        }
        if self.ip.len() > MAX_IP_LEN {
            return Err(SettingsError::IpTooLong(self.ip.len()));
        }
        if !self.ip.is_empty() && !is_dotted_quad(&self.ip) {
            return Err(SettingsError::InvalidIp(self.ip.clone()));
        }
        Ok(())
    }

    /// `[id_len][id][ip_len][ip][status][spi][can1][can2][kline1][kline2]`,
    /// the six trailing u32 fields little-endian.
    pub fn serialize(&self) -> Result<Vec<u8>, SettingsError> {
        self.validate()?;

        let mut payload = Vec::with_capacity(2 + self.id.len() + self.ip.len() + 24);
        payload.push(self.id.len() as u8);
        payload.extend_from_slice(self.id.as_bytes());
        payload.push(self.ip.len() as u8);
        payload.extend_from_slice(self.ip.as_bytes());

        for field in [
            self.status,
            self.spi_speed,
            self.can1_speed,
            self.can2_speed,
            self.kline1_speed,
            self.kline2_speed,
        ] {
            payload.extend_from_slice(&field.to_le_bytes());
        }

        Ok(payload)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SettingsError> {
        let mut cursor = 0usize;

        let id_len = *data.get(cursor).ok_or(SettingsError::TooShort { need: 1, got: data.len() })? as usize;
        if id_len > MAX_ID_LEN {
            return Err(SettingsError::IdTooLong(id_len));
        }
        cursor += 1;
        let id_bytes = data.get(cursor..cursor + id_len).ok_or(SettingsError::TooShort {
            need: cursor + id_len,
            got: data.len(),
        })?;
        let id = String::from_utf8_lossy(id_bytes).into_owned();
        cursor += id_len;

        let ip_len = *data.get(cursor).ok_or(SettingsError::TooShort { need: cursor + 1, got: data.len() })? as usize;
        if ip_len > MAX_IP_LEN {
            return Err(SettingsError::IpTooLong(ip_len));
        }
        cursor += 1;
        let ip_bytes = data.get(cursor..cursor + ip_len).ok_or(SettingsError::TooShort {
            need: cursor + ip_len,
            got: data.len(),
        })?;
        let ip = String::from_utf8_lossy(ip_bytes).into_owned();
        cursor += ip_len;

        if !ip.is_empty() && !is_dotted_quad(&ip) {
            return Err(SettingsError::InvalidIp(ip));
        }

        let remaining = &data[cursor..];
        if remaining.len() != 24 {
            return Err(SettingsError::TrailingBytes { expected: 24, got: remaining.len() });
        }

        let read_u32 = |offset: usize| -> u32 {
            u32::from_le_bytes([remaining[offset], remaining[offset + 1], remaining[offset + 2], remaining[offset + 3]])
        };

        Ok(Self {
            id,
            ip,
            status: read_u32(0),
            spi_speed: read_u32(4),
            can1_speed: read_u32(8),
            can2_speed: read_u32(12),
            kline1_speed: read_u32(16),
            kline2_speed: read_u32(20),
        })
    }
}

fn is_dotted_quad(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.parse::<u8>().is_ok())
}
