use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

/// 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    pub const fn new(raw: u64) -> Self {
        Self(raw & 0xFFFF_FFFF_FFFF)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid device address: {}", s));
        }
        let mut raw = 0u64;
        for part in parts {
            let byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid device address: {}", s))?;
            raw = (raw << 8) | byte as u64;
        }
        Ok(Self(raw))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Monitor family, inferred from the advertised model or the local name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceModel {
    Bp2,
    Bp2A,
    Bp2W,
    Unknown,
}

impl DeviceModel {
    pub fn infer(name: &str, advertised_model: Option<&str>) -> Self {
        let hint = advertised_model.unwrap_or(name).trim().to_ascii_uppercase();
        // longest prefixes first
        if hint.starts_with("BP2W") {
            Self::Bp2W
        } else if hint.starts_with("BP2A") {
            Self::Bp2A
        } else if hint.starts_with("BP2") {
            Self::Bp2
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoverySource {
    /// Vendor-protocol advertisement parsing.
    Vendor,
    /// Generic link-layer scan filtered by service UUID.
    LinkLayer,
}

/// A raw advertisement as reported by either discovery source.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub advertised_model: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub address: DeviceAddress,
    pub name: String,
    pub model: DeviceModel,
    pub rssi: Option<i16>,
    pub source: DiscoverySource,
    pub last_seen: SystemTime,
}

impl Device {
    pub fn from_advertisement(adv: &Advertisement, source: DiscoverySource) -> Self {
        let name = match adv.name.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => "Unknown".to_string(),
        };
        Self {
            model: DeviceModel::infer(&name, adv.advertised_model.as_deref()),
            address: adv.address,
            name,
            rssi: adv.rssi,
            source,
            last_seen: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Type discriminant of a real-time frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Pressure,
    BpResult,
    EcgSamples,
    EcgResult,
    DeviceStatus,
}

/// One notification payload, split into discriminant and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Run status reported by the monitor in its status frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Sleep,
    Memory,
    Charging,
    Ready,
    BpMeasuring,
    BpMeasureEnd,
    EcgMeasuring,
    EcgMeasureEnd,
    Unknown(u8),
}

impl From<u8> for DeviceStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Sleep,
            1 => Self::Memory,
            2 => Self::Charging,
            3 => Self::Ready,
            4 => Self::BpMeasuring,
            5 => Self::BpMeasureEnd,
            6 => Self::EcgMeasuring,
            7 => Self::EcgMeasureEnd,
            other => Self::Unknown(other),
        }
    }
}

/// Decoded blood-pressure result. Fields outside their plausible range are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpReading {
    pub systolic: Option<u16>,
    pub diastolic: Option<u16>,
    pub pulse: Option<u16>,
    pub map: Option<u16>,
}

impl BpReading {
    pub fn has_valid_field(&self) -> bool {
        self.systolic.is_some() || self.diastolic.is_some() || self.pulse.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BpState {
    Ready,
    Measuring,
    WaitingResult,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcgState {
    Idle,
    Measuring,
}

/// Where the final heart rate of an ECG session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartRateSource {
    ResultField,
    SampleHeuristic,
    LastLive,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    BloodPressure,
    Ecg,
    Other(u8),
}

impl From<u8> for FileKind {
    fn from(tag: u8) -> Self {
        match tag {
            1 => Self::BloodPressure,
            2 => Self::Ecg,
            other => Self::Other(other),
        }
    }
}

/// File entry as returned by the device, before index assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub type_tag: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFileEntry {
    pub name: String,
    pub kind: FileKind,
    pub index: u16,
}

/// How a stored file is addressed in a read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKey {
    Name(String),
    Index(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        let addr = DeviceAddress::new(0xAABBCCDDEEFF);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!("aa:bb:cc:dd:ee:ff".parse::<DeviceAddress>().unwrap(), addr);
        assert!("AA:BB:CC".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_address_serde_as_string() {
        let addr = DeviceAddress::new(0x0102030405);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"00:01:02:03:04:05\"");
        let back: DeviceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_model_inference() {
        assert_eq!(DeviceModel::infer("BP2 0412", None), DeviceModel::Bp2);
        assert_eq!(DeviceModel::infer("bp2w-77", None), DeviceModel::Bp2W);
        assert_eq!(DeviceModel::infer("Unknown", Some("BP2A")), DeviceModel::Bp2A);
        assert_eq!(DeviceModel::infer("Thermo", None), DeviceModel::Unknown);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(DeviceStatus::from(4), DeviceStatus::BpMeasuring);
        assert_eq!(DeviceStatus::from(7), DeviceStatus::EcgMeasureEnd);
        assert_eq!(DeviceStatus::from(42), DeviceStatus::Unknown(42));
    }
}
