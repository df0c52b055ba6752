//! Monitor Protocol
//!
//! Frame envelope, command encoding and the byte codec for the monitor's
//! real-time stream.
//!
//! The wire format is undocumented, so every field is read through an
//! ordered list of [`Candidate`] decoders. A candidate is accepted only if
//! its value lies in the field's plausible range; the first accepted
//! candidate wins and a field with no accepted candidate is absent.

use crate::domain::models::{BpReading, DeviceStatus, FrameKind, RawFrame};
use crate::error::{BridgeError, Result};
use std::ops::RangeInclusive;
use tracing::trace;
use uuid::Uuid;

/// Monitor BLE service UUID, used as the generic scan filter.
pub const SERVICE_UUID: &str = "14839ac4-7d7e-415c-9a42-167340cf2339";

/// Notify characteristic carrying the real-time stream.
pub const NOTIFY_CHAR_UUID: &str = "0734594a-a8e7-4b1a-a6b1-cd5243059a57";

/// Write characteristic for measurement commands.
pub const WRITE_CHAR_UUID: &str = "8b00ace7-eb0b-49b0-bbe9-9aee0a26e1a3";

/// Envelope discriminants (byte 0 of every notification)
pub mod discriminant {
    pub const PRESSURE: u8 = 0x01;
    pub const BP_RESULT: u8 = 0x02;
    pub const ECG_SAMPLES: u8 = 0x03;
    pub const ECG_RESULT: u8 = 0x04;
    pub const DEVICE_STATUS: u8 = 0x05;
}

/// Plausible ranges used to accept candidate values
pub mod range {
    use std::ops::RangeInclusive;

    pub const PRESSURE: RangeInclusive<u16> = 0..=400;
    pub const SYSTOLIC: RangeInclusive<u16> = 70..=250;
    pub const DIASTOLIC: RangeInclusive<u16> = 40..=150;
    pub const PULSE: RangeInclusive<u16> = 40..=180;
    pub const HEART_RATE: RangeInclusive<u16> = 30..=250;
    pub const BATTERY: RangeInclusive<u16> = 0..=100;
}

/// ECG sample rate of the real-time stream, in Hz.
pub const ECG_SAMPLE_RATE_HZ: u32 = 250;

/// Millivolts per raw ECG sample unit.
pub const ECG_SCALE_MV: f32 = 0.003098;

/// Byte the device uses to pad unset single-byte fields.
const FILL_BYTE: u8 = 0xFF;

/// Measurement commands written to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    StopMeasurement,
    StartBp,
    StartEcg,
}

impl MonitorCommand {
    /// Get the raw bytes for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::StopMeasurement => &[0x0A, 0x00],
            Self::StartBp => &[0x0A, 0x01],
            Self::StartEcg => &[0x0A, 0x02],
        }
    }
}

/// Splits a notification into discriminant and payload.
///
/// Returns `None` for empty notifications and unknown discriminants.
pub fn split_envelope(bytes: &[u8]) -> Option<RawFrame> {
    let (&tag, payload) = bytes.split_first()?;
    let kind = match tag {
        discriminant::PRESSURE => FrameKind::Pressure,
        discriminant::BP_RESULT => FrameKind::BpResult,
        discriminant::ECG_SAMPLES => FrameKind::EcgSamples,
        discriminant::ECG_RESULT => FrameKind::EcgResult,
        discriminant::DEVICE_STATUS => FrameKind::DeviceStatus,
        other => {
            trace!("Dropping frame with unknown discriminant {:#04X}", other);
            return None;
        }
    };
    Some(RawFrame {
        kind,
        payload: payload.to_vec(),
    })
}

/// Builds a notification envelope. Used by the simulated monitor and tests.
pub fn encode_envelope(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let tag = match kind {
        FrameKind::Pressure => discriminant::PRESSURE,
        FrameKind::BpResult => discriminant::BP_RESULT,
        FrameKind::EcgSamples => discriminant::ECG_SAMPLES,
        FrameKind::EcgResult => discriminant::ECG_RESULT,
        FrameKind::DeviceStatus => discriminant::DEVICE_STATUS,
    };
    let mut bytes = Vec::with_capacity(payload.len() + 1);
    bytes.push(tag);
    bytes.extend_from_slice(payload);
    bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    U16Be,
    U16Le,
    U8,
}

/// One byte-layout hypothesis for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub encoding: Encoding,
    pub offset: usize,
}

impl Candidate {
    pub const fn new(encoding: Encoding, offset: usize) -> Self {
        Self { encoding, offset }
    }

    /// Raw read without range validation. `None` if the payload is too short.
    pub fn read(&self, bytes: &[u8]) -> Option<u16> {
        let at = |i: usize| bytes.get(self.offset + i).copied();
        match self.encoding {
            Encoding::U16Be => Some(u16::from_be_bytes([at(0)?, at(1)?])),
            Encoding::U16Le => Some(u16::from_le_bytes([at(0)?, at(1)?])),
            Encoding::U8 => match at(0)? {
                FILL_BYTE => None,
                b => Some(b as u16),
            },
        }
    }
}

/// Runs candidates in order and returns the first value inside `range`.
pub fn first_plausible(
    bytes: &[u8],
    candidates: &[Candidate],
    range: &RangeInclusive<u16>,
) -> Option<(u16, Candidate)> {
    candidates
        .iter()
        .find_map(|c| c.read(bytes).filter(|v| range.contains(v)).map(|v| (v, *c)))
}

/// Declared frame shapes for one protocol revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub version: u8,
    pub pressure: &'static [Candidate],
    pub systolic: &'static [Candidate],
    pub diastolic: &'static [Candidate],
    pub pulse: &'static [Candidate],
    pub ecg_live_heart_rate: &'static [Candidate],
    pub ecg_samples_offset: usize,
    pub ecg_result_heart_rate: &'static [Candidate],
    /// Fallback layouts tried on the raw sample-frame bytes.
    pub ecg_heart_rate_heuristic: &'static [Candidate],
}

const ECG_LIVE_HR: &[Candidate] = &[Candidate::new(Encoding::U16Le, 0)];
const ECG_RESULT_HR: &[Candidate] = &[Candidate::new(Encoding::U16Le, 4)];
const ECG_HR_HEURISTIC: &[Candidate] = &[
    Candidate::new(Encoding::U16Be, 0),
    Candidate::new(Encoding::U8, 0),
    Candidate::new(Encoding::U8, 1),
];

/// Original firmware: bare pressure frames, single-byte pulse.
pub const LAYOUT_V1: FrameLayout = FrameLayout {
    version: 1,
    pressure: &[
        Candidate::new(Encoding::U16Be, 0),
        Candidate::new(Encoding::U16Le, 0),
        Candidate::new(Encoding::U8, 0),
    ],
    systolic: &[Candidate::new(Encoding::U16Le, 3)],
    diastolic: &[Candidate::new(Encoding::U16Le, 5)],
    pulse: &[Candidate::new(Encoding::U8, 9)],
    ecg_live_heart_rate: ECG_LIVE_HR,
    ecg_samples_offset: 2,
    ecg_result_heart_rate: ECG_RESULT_HR,
    ecg_heart_rate_heuristic: ECG_HR_HEURISTIC,
};

/// Later firmware: deflate flag before pressure, 16-bit pulse.
pub const LAYOUT_V2: FrameLayout = FrameLayout {
    version: 2,
    pressure: &[
        Candidate::new(Encoding::U16Be, 1),
        Candidate::new(Encoding::U16Le, 1),
        Candidate::new(Encoding::U8, 1),
    ],
    systolic: &[Candidate::new(Encoding::U16Le, 3)],
    diastolic: &[Candidate::new(Encoding::U16Le, 5)],
    pulse: &[
        Candidate::new(Encoding::U16Le, 9),
        Candidate::new(Encoding::U8, 9),
    ],
    ecg_live_heart_rate: ECG_LIVE_HR,
    ecg_samples_offset: 2,
    ecg_result_heart_rate: ECG_RESULT_HR,
    ecg_heart_rate_heuristic: ECG_HR_HEURISTIC,
};

const LAYOUTS: &[&FrameLayout] = &[&LAYOUT_V1, &LAYOUT_V2];

/// Selects the layout for the protocol version reported at handshake.
///
/// Unknown versions fall back to the newest known layout.
pub fn layout_for_version(version: u8) -> &'static FrameLayout {
    LAYOUTS
        .iter()
        .copied()
        .find(|l| l.version == version)
        .unwrap_or(LAYOUTS[LAYOUTS.len() - 1])
}

/// Decode the live cuff pressure from a pressure frame.
pub fn decode_pressure(payload: &[u8], layout: &FrameLayout) -> Result<u16> {
    first_plausible(payload, layout.pressure, &range::PRESSURE)
        .map(|(v, _)| v)
        .ok_or(BridgeError::DecodeAmbiguous { field: "pressure" })
}

/// Mean arterial pressure, `(2 * diastolic + systolic) / 3`.
pub fn mean_arterial_pressure(systolic: u16, diastolic: u16) -> u16 {
    ((2 * diastolic as u32 + systolic as u32) / 3) as u16
}

/// Decode a blood-pressure result frame.
///
/// # Result Payload (layout v1, 10 bytes)
///
/// ```text
/// [0]     : Flags
/// [1-2]   : Cuff pressure (u16 little-endian)
/// [3-4]   : Systolic (u16 little-endian)
/// [5-6]   : Diastolic (u16 little-endian)
/// [7-8]   : Device mean (u16 little-endian, unused)
/// [9]     : Pulse rate (u8; u16 little-endian at [9-10] in v2)
/// ```
pub fn decode_bp_result(payload: &[u8], layout: &FrameLayout) -> Result<BpReading> {
    let field = |candidates: &[Candidate], r: &RangeInclusive<u16>| {
        first_plausible(payload, candidates, r).map(|(v, _)| v)
    };

    let systolic = field(layout.systolic, &range::SYSTOLIC);
    let diastolic = field(layout.diastolic, &range::DIASTOLIC);
    let pulse = field(layout.pulse, &range::PULSE);
    let map = match (systolic, diastolic) {
        (Some(s), Some(d)) => Some(mean_arterial_pressure(s, d)),
        _ => None,
    };

    let reading = BpReading {
        systolic,
        diastolic,
        pulse,
        map,
    };
    if reading.has_valid_field() {
        Ok(reading)
    } else {
        Err(BridgeError::DecodeAmbiguous { field: "bp result" })
    }
}

/// Real-time ECG sample frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcgSampleFrame {
    pub live_heart_rate: Option<u16>,
    pub samples: Vec<i16>,
}

/// Decode an ECG sample frame: live heart rate then i16 LE samples.
///
/// A trailing odd byte is ignored.
pub fn decode_ecg_samples(payload: &[u8], layout: &FrameLayout) -> Result<EcgSampleFrame> {
    if payload.len() < layout.ecg_samples_offset {
        return Err(BridgeError::DecodeAmbiguous {
            field: "ecg samples",
        });
    }
    let live_heart_rate =
        first_plausible(payload, layout.ecg_live_heart_rate, &range::HEART_RATE).map(|(v, _)| v);
    let samples = payload[layout.ecg_samples_offset..]
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(EcgSampleFrame {
        live_heart_rate,
        samples,
    })
}

/// Terminal ECG analysis frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcgResultFrame {
    pub result_flags: u32,
    pub heart_rate: Option<u16>,
    pub qrs_ms: Option<u16>,
    pub pvc_count: Option<u16>,
    pub qtc_ms: Option<u16>,
}

/// Decode an ECG result frame.
///
/// ```text
/// [0-3]   : Result flags (u32 little-endian)
/// [4-5]   : Heart rate (u16 little-endian)
/// [6-7]   : QRS duration ms
/// [8-9]   : PVC count
/// [10-11] : QTc ms
/// ```
///
/// A frame too short for any field still counts as a result frame; its
/// fields are simply absent.
pub fn decode_ecg_result(payload: &[u8], layout: &FrameLayout) -> EcgResultFrame {
    let le = |offset: usize| Candidate::new(Encoding::U16Le, offset).read(payload);
    let result_flags = payload
        .get(0..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0);
    EcgResultFrame {
        result_flags,
        heart_rate: first_plausible(payload, layout.ecg_result_heart_rate, &range::HEART_RATE)
            .map(|(v, _)| v),
        qrs_ms: le(6),
        pvc_count: le(8),
        qtc_ms: le(10),
    }
}

/// Heart rate recovered from raw sample-frame bytes with alternate layouts.
pub fn heuristic_heart_rate(raw_sample_payload: &[u8], layout: &FrameLayout) -> Option<u16> {
    first_plausible(
        raw_sample_payload,
        layout.ecg_heart_rate_heuristic,
        &range::HEART_RATE,
    )
    .map(|(v, _)| v)
}

/// Device status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFrame {
    pub status: DeviceStatus,
    pub charging: bool,
    pub battery_percent: Option<u8>,
}

/// Decode a device status frame: run status, battery state, battery percent.
pub fn decode_status(payload: &[u8]) -> Result<StatusFrame> {
    let status = payload
        .first()
        .map(|&code| DeviceStatus::from(code))
        .ok_or(BridgeError::DecodeAmbiguous {
            field: "device status",
        })?;
    // battery state: 0 normal, 1 charging, 2 full, 3 low
    let charging = payload.get(1).map(|&s| s == 1 || s == 2).unwrap_or(false);
    let battery_percent = first_plausible(
        payload,
        &[Candidate::new(Encoding::U8, 2)],
        &range::BATTERY,
    )
    .map(|(v, _)| v as u8);
    Ok(StatusFrame {
        status,
        charging,
        battery_percent,
    })
}

/// Validates a configured UUID string.
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(uuid_str).map_err(|e| anyhow::anyhow!("Invalid UUID format: {}", e))
}
