//! Stored File Transfer
//!
//! Lists and reads recordings kept on the monitor. Older firmware cannot
//! look files up by name, so reads fall back to the index assigned by the
//! most recent listing.

use crate::domain::models::{DeviceAddress, FileKey, FileKind, StoredFileEntry};
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::protocol::ECG_SAMPLE_RATE_HZ;
use crate::infrastructure::bluetooth::transport::SharedTransport;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Sample rates a stored ECG recording may have been captured at.
const CANDIDATE_RATES_HZ: [u32; 4] = [125, 250, 500, 1000];
/// Recording lengths the monitor can produce, in seconds.
const PLAUSIBLE_DURATION_S: std::ops::RangeInclusive<f32> = 10.0..=300.0;
const RECORDING_HEADER_LEN: usize = 5;

pub struct FileTransfer {
    transport: SharedTransport,
    /// name -> index from the last listing
    last_listing: HashMap<String, u16>,
}

impl FileTransfer {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            last_listing: HashMap::new(),
        }
    }

    /// Lists stored files, assigning indexes in arrival order.
    pub async fn list_files(&mut self, address: DeviceAddress) -> Result<Vec<StoredFileEntry>> {
        let files = self.transport.request_file_list(address).await?;
        let entries: Vec<StoredFileEntry> = files
            .into_iter()
            .enumerate()
            .map(|(i, f)| StoredFileEntry {
                name: f.name,
                kind: FileKind::from(f.type_tag),
                index: i as u16,
            })
            .collect();

        self.last_listing = entries
            .iter()
            .map(|e| (e.name.clone(), e.index))
            .collect();
        info!("Listed {} stored files on {}", entries.len(), address);
        Ok(entries)
    }

    /// Reads a file by name, retrying by index when the name is not found.
    pub async fn read_file(&mut self, address: DeviceAddress, name: &str) -> Result<Vec<u8>> {
        match self
            .transport
            .request_file_read(address, FileKey::Name(name.to_string()))
            .await
        {
            Err(BridgeError::FileNotFound(_)) => {}
            other => return other,
        }

        let Some(&index) = self.last_listing.get(name) else {
            warn!("File {} not found and not in the last listing", name);
            return Err(BridgeError::FileNotFound(name.to_string()));
        };

        debug!("Name lookup for {} failed, retrying with index {}", name, index);
        match self
            .transport
            .request_file_read(address, FileKey::Index(index))
            .await
        {
            Err(BridgeError::FileNotFound(_)) => Err(BridgeError::FileNotFound(name.to_string())),
            other => other,
        }
    }
}

/// Sample rate of a stored recording, with every plausible alternative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleRateEstimate {
    pub best: u32,
    pub candidates: Vec<u32>,
    pub ambiguous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcgRecording {
    pub version: u8,
    pub declared_duration_s: Option<u32>,
    pub samples: Vec<i16>,
    pub sample_rate: SampleRateEstimate,
}

/// Decode a stored ECG file.
///
/// ```text
/// [0]    : File version
/// [1-4]  : Declared duration in seconds (u32 little-endian, 0 = absent)
/// [5-..] : Samples (i16 little-endian)
/// ```
pub fn decode_ecg_recording(bytes: &[u8]) -> Result<EcgRecording> {
    if bytes.len() < RECORDING_HEADER_LEN {
        return Err(BridgeError::DecodeAmbiguous {
            field: "ecg recording header",
        });
    }
    let version = bytes[0];
    let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let declared_duration_s = (declared > 0).then_some(declared);
    let samples: Vec<i16> = bytes[RECORDING_HEADER_LEN..]
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    let sample_rate = match declared_duration_s {
        Some(secs) => {
            let rate = (samples.len() as f32 / secs as f32).round() as u32;
            SampleRateEstimate {
                best: rate,
                candidates: vec![rate],
                ambiguous: false,
            }
        }
        None => estimate_sample_rate(samples.len()),
    };

    Ok(EcgRecording {
        version,
        declared_duration_s,
        samples,
        sample_rate,
    })
}

/// Estimate the rate of a recording without a declared duration.
///
/// A rate is plausible if it implies a recording length the monitor can
/// produce. The live-stream rate wins among plausible rates.
pub fn estimate_sample_rate(sample_count: usize) -> SampleRateEstimate {
    let candidates: Vec<u32> = CANDIDATE_RATES_HZ
        .iter()
        .copied()
        .filter(|&rate| PLAUSIBLE_DURATION_S.contains(&(sample_count as f32 / rate as f32)))
        .collect();

    let best = if candidates.contains(&ECG_SAMPLE_RATE_HZ) || candidates.is_empty() {
        ECG_SAMPLE_RATE_HZ
    } else {
        candidates[0]
    };
    SampleRateEstimate {
        best,
        ambiguous: candidates.len() != 1,
        candidates,
    }
}
