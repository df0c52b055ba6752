//! Simulated monitor
//!
//! In-memory [`MonitorTransport`] used by tests and the demo binary.
//! Devices, files and link state are scripted through the inherent methods;
//! with `auto_respond` enabled, measurement commands play back a recorded
//! measurement on the notification stream.

use crate::domain::models::{
    Advertisement, DeviceAddress, FileKey, FrameKind, RemoteFile,
};
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::protocol::{self, MonitorCommand};
use crate::infrastructure::bluetooth::transport::MonitorTransport;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

const SCRIPT_STEP: Duration = Duration::from_millis(100);

#[derive(Default)]
struct SimState {
    radio_enabled: bool,
    protocol_version: u8,
    link_ads: Vec<Advertisement>,
    vendor_ads: Vec<Advertisement>,
    reachable: HashSet<DeviceAddress>,
    connected: HashSet<DeviceAddress>,
    scan_senders: Vec<mpsc::Sender<Advertisement>>,
    notify_sender: Option<mpsc::Sender<Vec<u8>>>,
    files: Vec<(RemoteFile, Vec<u8>)>,
    name_lookup: bool,
    auto_respond: bool,
    link_scan_failing: bool,
    written: Vec<Vec<u8>>,
    connect_calls: usize,
}

pub struct SimulatedTransport {
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                radio_enabled: true,
                protocol_version: 1,
                name_lookup: true,
                ..Default::default()
            }),
        }
    }

    /// A transport with one reachable monitor and a few stored recordings.
    pub fn demo() -> Self {
        let sim = Self::new();
        let address = DeviceAddress::new(0xD4_36_39_12_0A_7C);
        let ad = Advertisement {
            address,
            name: Some("BP2 0A7C".to_string()),
            advertised_model: Some("BP2".to_string()),
            service_uuids: vec![service_uuid()],
            rssi: Some(-58),
        };
        sim.add_link_advertisement(ad.clone());
        sim.add_vendor_advertisement(ad);
        sim.add_reachable(address);
        sim.add_file("20261018083000", 1, vec![0x01, 0x82, 0x00, 0x55, 0x00, 0x48]);
        sim.add_file(
            "20261018091500",
            2,
            demo_ecg_recording(),
        );
        sim.set_auto_respond(true);
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_radio(&self, enabled: bool) {
        self.state().radio_enabled = enabled;
    }

    pub fn set_protocol_version(&self, version: u8) {
        self.state().protocol_version = version;
    }

    pub fn set_name_lookup(&self, supported: bool) {
        self.state().name_lookup = supported;
    }

    pub fn set_auto_respond(&self, enabled: bool) {
        self.state().auto_respond = enabled;
    }

    /// Makes the link-layer scan fail while vendor discovery still works.
    pub fn set_link_scan_failing(&self, failing: bool) {
        self.state().link_scan_failing = failing;
    }

    pub fn add_link_advertisement(&self, ad: Advertisement) {
        let mut state = self.state();
        for tx in &state.scan_senders {
            let _ = tx.try_send(ad.clone());
        }
        state.link_ads.push(ad);
    }

    pub fn add_vendor_advertisement(&self, ad: Advertisement) {
        let mut state = self.state();
        for tx in &state.scan_senders {
            let _ = tx.try_send(ad.clone());
        }
        state.vendor_ads.push(ad);
    }

    pub fn add_reachable(&self, address: DeviceAddress) {
        self.state().reachable.insert(address);
    }

    pub fn add_file(&self, name: &str, type_tag: u8, contents: Vec<u8>) {
        self.state().files.push((
            RemoteFile {
                name: name.to_string(),
                type_tag,
            },
            contents,
        ));
    }

    /// Simulates the link dropping underneath the bridge.
    pub fn drop_link(&self, address: DeviceAddress) {
        let mut state = self.state();
        state.connected.remove(&address);
        state.notify_sender = None;
    }

    /// Simulates a connection established by the platform on its own.
    pub fn adopt_link(&self, address: DeviceAddress) {
        self.state().connected.insert(address);
    }

    pub fn written_commands(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.state().connect_calls
    }

    pub fn open_scans(&self) -> usize {
        self.state().scan_senders.len()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state().notify_sender.is_some()
    }

    /// Delivers one notification. Returns false if nobody is subscribed.
    pub async fn push_notification(&self, bytes: Vec<u8>) -> bool {
        let sender = self.state().notify_sender.clone();
        match sender {
            Some(tx) => tx.send(bytes).await.is_ok(),
            None => false,
        }
    }

    pub async fn push_frame(&self, kind: FrameKind, payload: &[u8]) -> bool {
        self.push_notification(protocol::encode_envelope(kind, payload))
            .await
    }

    fn ensure_radio(state: &SimState) -> Result<()> {
        if state.radio_enabled {
            Ok(())
        } else {
            Err(BridgeError::RadioUnavailable)
        }
    }

    fn play(&self, frames: Vec<Vec<u8>>) {
        let Some(tx) = self.state().notify_sender.clone() else {
            return;
        };
        tokio::spawn(async move {
            for frame in frames {
                tokio::time::sleep(SCRIPT_STEP).await;
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn service_uuid() -> Uuid {
    Uuid::parse_str(protocol::SERVICE_UUID).unwrap_or_default()
}

fn status(code: u8) -> Vec<u8> {
    protocol::encode_envelope(FrameKind::DeviceStatus, &[code, 0, 76])
}

/// Frames of one cuff inflation ending at 128/90, pulse 70.
pub fn bp_measurement_script() -> Vec<Vec<u8>> {
    let mut frames = vec![status(4)];
    for pressure in (20u16..=180).step_by(40).chain((60u16..=140).rev().step_by(40)) {
        frames.push(protocol::encode_envelope(
            FrameKind::Pressure,
            &pressure.to_be_bytes(),
        ));
    }
    frames.push(status(5));
    frames.push(protocol::encode_envelope(
        FrameKind::BpResult,
        &[0x01, 0x00, 0x00, 0x80, 0x00, 0x5A, 0x00, 0x6C, 0x00, 0x46],
    ));
    frames
}

/// Frames of a short ECG recording ending with a result frame.
pub fn ecg_measurement_script() -> Vec<Vec<u8>> {
    let mut frames = vec![status(6)];
    for block in 0..10i16 {
        let mut payload = 72u16.to_le_bytes().to_vec();
        for i in 0..25i16 {
            let sample = ((block * 25 + i) % 50 - 25) * 8;
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        frames.push(protocol::encode_envelope(FrameKind::EcgSamples, &payload));
    }
    frames.push(protocol::encode_envelope(
        FrameKind::EcgResult,
        &[0, 0, 0, 0, 0x48, 0x00, 0x5C, 0x00, 0x00, 0x00, 0x9E, 0x01],
    ));
    frames.push(status(3));
    frames
}

fn demo_ecg_recording() -> Vec<u8> {
    let mut bytes = vec![1u8];
    bytes.extend_from_slice(&0u32.to_le_bytes());
    for i in 0..7500i32 {
        let sample = ((i % 250) - 125) as i16;
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[async_trait]
impl MonitorTransport for SimulatedTransport {
    async fn radio_enabled(&self) -> bool {
        self.state().radio_enabled
    }

    async fn scan(&self, _service_filter: Uuid) -> Result<mpsc::Receiver<Advertisement>> {
        let mut state = self.state();
        Self::ensure_radio(&state)?;
        if state.link_scan_failing {
            return Err(BridgeError::Transport("link-layer scan refused".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        for ad in &state.link_ads {
            let _ = tx.try_send(ad.clone());
        }
        state.scan_senders.push(tx);
        Ok(rx)
    }

    async fn vendor_discovery(&self) -> Result<mpsc::Receiver<Advertisement>> {
        let mut state = self.state();
        Self::ensure_radio(&state)?;
        let (tx, rx) = mpsc::channel(64);
        for ad in &state.vendor_ads {
            let _ = tx.try_send(ad.clone());
        }
        state.scan_senders.push(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state().scan_senders.clear();
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<()> {
        let mut state = self.state();
        Self::ensure_radio(&state)?;
        state.connect_calls += 1;
        if !state.reachable.contains(&address) {
            return Err(BridgeError::Transport(format!(
                "device {} not reachable",
                address
            )));
        }
        state.connected.insert(address);
        info!("Simulated link up: {}", address);
        Ok(())
    }

    async fn disconnect(&self, address: DeviceAddress) -> Result<()> {
        let mut state = self.state();
        state.connected.remove(&address);
        state.notify_sender = None;
        Ok(())
    }

    async fn connected_addresses(&self) -> Result<Vec<DeviceAddress>> {
        let mut addresses: Vec<_> = self.state().connected.iter().copied().collect();
        addresses.sort();
        Ok(addresses)
    }

    async fn protocol_version(&self, address: DeviceAddress) -> Result<u8> {
        let state = self.state();
        if !state.connected.contains(&address) {
            return Err(BridgeError::NotConnected);
        }
        Ok(state.protocol_version)
    }

    async fn subscribe_notifications(
        &self,
        address: DeviceAddress,
        _characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut state = self.state();
        if !state.connected.contains(&address) {
            return Err(BridgeError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(256);
        state.notify_sender = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe_notifications(&self, _address: DeviceAddress) -> Result<()> {
        self.state().notify_sender = None;
        Ok(())
    }

    async fn write_command(
        &self,
        address: DeviceAddress,
        _characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<()> {
        let auto_respond = {
            let mut state = self.state();
            if !state.connected.contains(&address) {
                return Err(BridgeError::NotConnected);
            }
            state.written.push(bytes.to_vec());
            state.auto_respond
        };
        debug!("Simulated command written: {:02X?}", bytes);

        if auto_respond {
            if bytes == MonitorCommand::StartBp.as_bytes() {
                self.play(bp_measurement_script());
            } else if bytes == MonitorCommand::StartEcg.as_bytes() {
                self.play(ecg_measurement_script());
            }
        }
        Ok(())
    }

    async fn request_file_list(&self, address: DeviceAddress) -> Result<Vec<RemoteFile>> {
        let state = self.state();
        if !state.connected.contains(&address) {
            return Err(BridgeError::NotConnected);
        }
        Ok(state.files.iter().map(|(f, _)| f.clone()).collect())
    }

    async fn request_file_read(&self, address: DeviceAddress, key: FileKey) -> Result<Vec<u8>> {
        let state = self.state();
        if !state.connected.contains(&address) {
            return Err(BridgeError::NotConnected);
        }
        match key {
            FileKey::Name(name) => {
                if !state.name_lookup {
                    return Err(BridgeError::FileNotFound(name));
                }
                state
                    .files
                    .iter()
                    .find(|(f, _)| f.name == name)
                    .map(|(_, data)| data.clone())
                    .ok_or(BridgeError::FileNotFound(name))
            }
            FileKey::Index(index) => state
                .files
                .get(index as usize)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| BridgeError::FileNotFound(format!("#{}", index))),
        }
    }
}
