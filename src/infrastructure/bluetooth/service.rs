//! Monitor Service Module
//!
//! Main service that coordinates scanning, connection, streaming and file
//! transfer for the monitor. Hosts drive it with [`BridgeCommand`]s and
//! observe it through the [`EventBus`].

use crate::domain::events::{DeviceEvent, EventBus};
use crate::domain::models::{DeviceAddress, StoredFileEntry};
use crate::domain::settings::{Settings, SettingsService};
use crate::domain::waveform::BatcherConfig;
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::{
    connection::{spawn_link_observer, ConnectionManager, LinkEdge, LinkOutcome},
    file_transfer::FileTransfer,
    protocol::{self, MonitorCommand},
    scanner::BleScanner,
    stream::{StreamConfig, StreamControl, StreamHandle},
    transport::SharedTransport,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Commands accepted by [`MonitorService::run`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", content = "arg")]
pub enum BridgeCommand {
    StartScan,
    StopScan,
    Connect(DeviceAddress),
    Disconnect,
    StartBpMeasurement,
    StartEcgMeasurement,
    StopMeasurement,
    StartStream,
    StopStream,
    ListFiles,
    ReadFile(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "output", content = "value")]
pub enum CommandOutput {
    Done,
    Files(Vec<StoredFileEntry>),
    FileData(Vec<u8>),
}

/// A command plus an optional channel for its result.
pub struct BridgeRequest {
    pub command: BridgeCommand,
    pub reply: Option<oneshot::Sender<Result<CommandOutput>>>,
}

impl BridgeRequest {
    pub fn new(command: BridgeCommand) -> (Self, oneshot::Receiver<Result<CommandOutput>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// A request whose result is only logged.
    pub fn fire_and_forget(command: BridgeCommand) -> Self {
        Self {
            command,
            reply: None,
        }
    }
}

/// Main service coordinating all monitor operations
pub struct MonitorService {
    transport: SharedTransport,
    settings: Arc<Mutex<SettingsService>>,
    bus: EventBus,
    scanner: BleScanner,
    scan_forwarder: Option<JoinHandle<()>>,
    connection: ConnectionManager,
    files: FileTransfer,
    stream: Option<StreamHandle>,
    /// Streams report here when a BP result ends them
    stream_done_tx: mpsc::UnboundedSender<DeviceAddress>,
    stream_done_rx: Option<mpsc::UnboundedReceiver<DeviceAddress>>,
    observer: Option<JoinHandle<()>>,
    notify_char: Uuid,
    write_char: Uuid,
}

impl MonitorService {
    /// Create a new monitor service
    ///
    /// Fails with [`BridgeError::Settings`] if a configured UUID is invalid.
    pub fn new(
        transport: SharedTransport,
        settings: Arc<Mutex<SettingsService>>,
        bus: EventBus,
    ) -> Result<Self> {
        let (service_uuid, notify_char, write_char) = {
            let s = lock_settings(&settings);
            let s = s.get();
            (
                parse_configured_uuid("service_uuid", &s.service_uuid)?,
                parse_configured_uuid("notify_char_uuid", &s.notify_char_uuid)?,
                parse_configured_uuid("write_char_uuid", &s.write_char_uuid)?,
            )
        };
        let (stream_done_tx, stream_done_rx) = mpsc::unbounded_channel();

        Ok(Self {
            scanner: BleScanner::new(transport.clone(), service_uuid),
            scan_forwarder: None,
            connection: ConnectionManager::new(transport.clone(), settings.clone(), bus.clone()),
            files: FileTransfer::new(transport.clone()),
            stream: None,
            stream_done_tx,
            stream_done_rx: Some(stream_done_rx),
            observer: None,
            transport,
            settings,
            bus,
            notify_char,
            write_char,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_running()).unwrap_or(false)
    }

    /// Processes requests, link edges and stream completions until the
    /// command channel closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BridgeRequest>) {
        let (edge_tx, mut edge_rx) = mpsc::unbounded_channel();
        let period = self.settings_snapshot().link_poll_interval();
        self.observer = Some(spawn_link_observer(self.transport.clone(), period, edge_tx));
        let mut stream_done = match self.stream_done_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.stream_done_tx = tx;
                rx
            }
        };

        self.startup().await;

        loop {
            tokio::select! {
                request = commands.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(edge) = edge_rx.recv() => self.handle_edge(edge).await,
                Some(address) = stream_done.recv() => self.handle_stream_completed(address).await,
            }
        }

        info!("Command channel closed, shutting down");
        self.shutdown().await;
    }

    /// One-shot reconnect to the last known monitor.
    pub async fn startup(&mut self) {
        if self.connection.reconnect_last().await.is_some() {
            self.auto_start_stream().await;
        }
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop_scan().await {
            debug!("Stopping scan on shutdown failed: {}", e);
        }
        self.disconnect().await;
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
    }

    async fn handle_request(&mut self, request: BridgeRequest) {
        let command = request.command.clone();
        let result = self.execute(request.command).await;
        if let Err(e) = &result {
            error!("Command {:?} failed: {}", command, e);
        }
        if let Some(reply) = request.reply {
            let _ = reply.send(result);
        }
    }

    pub async fn execute(&mut self, command: BridgeCommand) -> Result<CommandOutput> {
        debug!("Executing {:?}", command);
        match command {
            BridgeCommand::StartScan => self.start_scan().await?,
            BridgeCommand::StopScan => self.stop_scan().await?,
            BridgeCommand::Connect(address) => self.connect(address).await?,
            BridgeCommand::Disconnect => self.disconnect().await,
            BridgeCommand::StartBpMeasurement => {
                self.measurement_command(MonitorCommand::StartBp, StreamControl::StartBp)
                    .await?
            }
            BridgeCommand::StartEcgMeasurement => {
                self.measurement_command(MonitorCommand::StartEcg, StreamControl::StartEcg)
                    .await?
            }
            BridgeCommand::StopMeasurement => self.stop_measurement().await?,
            BridgeCommand::StartStream => self.start_stream().await?,
            BridgeCommand::StopStream => self.stop_stream().await,
            BridgeCommand::ListFiles => {
                let address = self.require_connected()?;
                return Ok(CommandOutput::Files(self.files.list_files(address).await?));
            }
            BridgeCommand::ReadFile(name) => {
                let address = self.require_connected()?;
                return Ok(CommandOutput::FileData(
                    self.files.read_file(address, &name).await?,
                ));
            }
        }
        Ok(CommandOutput::Done)
    }

    /// Start scanning for monitors
    pub async fn start_scan(&mut self) -> Result<()> {
        if let Some(forwarder) = self.scan_forwarder.take() {
            forwarder.abort();
        }
        let mut found = self.scanner.start().await?;
        let bus = self.bus.clone();
        self.scan_forwarder = Some(tokio::spawn(async move {
            while let Some(device) = found.recv().await {
                bus.emit_device(DeviceEvent::Found(device));
            }
        }));
        Ok(())
    }

    /// Stop scanning
    pub async fn stop_scan(&mut self) -> Result<()> {
        if let Some(forwarder) = self.scan_forwarder.take() {
            forwarder.abort();
        }
        self.scanner.stop().await
    }

    /// Connect to a monitor by address
    pub async fn connect(&mut self, address: DeviceAddress) -> Result<()> {
        self.connection.connect(address).await?;
        self.auto_start_stream().await;
        Ok(())
    }

    /// Disconnect from the current monitor
    pub async fn disconnect(&mut self) {
        self.stop_stream().await;
        self.connection.disconnect().await;
    }

    pub async fn start_stream(&mut self) -> Result<()> {
        let address = self.require_connected()?;
        if let Some(stream) = &self.stream {
            if stream.is_running() && stream.address() == address {
                return Ok(());
            }
        }
        self.stop_stream().await;

        let config = self.stream_config();
        let handle = StreamHandle::start(
            self.transport.clone(),
            address,
            self.bus.clone(),
            config,
            self.stream_done_tx.clone(),
        )
        .await?;
        self.stream = Some(handle);
        Ok(())
    }

    pub async fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop().await;
        }
    }

    /// Re-arms the stream after a BP result ended it, so measurements the
    /// device starts on its own are still observed.
    pub async fn handle_stream_completed(&mut self, address: DeviceAddress) {
        if self.connection.connected() != Some(address) || self.is_streaming() {
            debug!("Ignoring stale stream completion for {}", address);
            return;
        }
        debug!("Stream for {} completed, re-arming", address);
        self.auto_start_stream().await;
    }

    /// Applies a link-layer edge from the observer.
    pub async fn handle_edge(&mut self, edge: LinkEdge) {
        match edge {
            // tear the stream down before the disconnect event goes out
            LinkEdge::Down(address) => {
                if self.connection.active_address() == Some(address) {
                    self.stop_stream().await;
                }
            }
            // edges are queued, so the link may be gone by now
            LinkEdge::Up(address) if self.connection.active_address().is_none() => {
                match self.transport.connected_addresses().await {
                    Ok(linked) if linked.contains(&address) => {}
                    Ok(_) => {
                        debug!("Ignoring stale link-up for {}", address);
                        return;
                    }
                    Err(e) => {
                        debug!("Cannot confirm link-up for {}: {}", address, e);
                        return;
                    }
                }
            }
            _ => {}
        }

        if let LinkOutcome::Adopted(_) = self.connection.handle_edge(edge) {
            self.auto_start_stream().await;
        }
    }

    async fn measurement_command(
        &mut self,
        command: MonitorCommand,
        control: StreamControl,
    ) -> Result<()> {
        let address = self.require_connected()?;
        self.start_stream().await?;
        if let Some(stream) = &self.stream {
            if !stream.send(control) {
                warn!("Stream ended before {:?} was delivered", control);
            }
        }
        self.write_command(address, command).await
    }

    async fn stop_measurement(&mut self) -> Result<()> {
        let address = self.require_connected()?;
        if let Some(stream) = &self.stream {
            stream.send(StreamControl::Stop);
        }
        self.write_command(address, MonitorCommand::StopMeasurement)
            .await
    }

    async fn write_command(&self, address: DeviceAddress, command: MonitorCommand) -> Result<()> {
        info!("Sending {:?} to {}", command, address);
        self.transport
            .write_command(address, self.write_char, command.as_bytes())
            .await
    }

    async fn auto_start_stream(&mut self) {
        if !self.settings_snapshot().auto_start_stream {
            return;
        }
        if let Err(e) = self.start_stream().await {
            warn!("Failed to start stream: {}", e);
        }
    }

    fn require_connected(&self) -> Result<DeviceAddress> {
        self.connection.connected().ok_or(BridgeError::NotConnected)
    }

    fn settings_snapshot(&self) -> Settings {
        lock_settings(&self.settings).get().clone()
    }

    fn stream_config(&self) -> StreamConfig {
        let s = self.settings_snapshot();
        let window = s.waveform_flush_interval();
        StreamConfig {
            notify_char: self.notify_char,
            flush_interval: window / 2,
            batcher: BatcherConfig {
                window,
                max_batch: s.waveform_max_batch,
                sample_rate: protocol::ECG_SAMPLE_RATE_HZ,
                scale_factor: protocol::ECG_SCALE_MV,
            },
        }
    }
}

fn lock_settings(settings: &Arc<Mutex<SettingsService>>) -> std::sync::MutexGuard<'_, SettingsService> {
    settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_configured_uuid(field: &str, value: &str) -> Result<Uuid> {
    protocol::parse_uuid(value).map_err(|e| BridgeError::Settings(format!("{}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{
        drain, BpEvent, BpLifecycle, DisconnectReason, EcgEvent, EcgLifecycle,
    };
    use crate::domain::models::FrameKind;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;
    use crate::infrastructure::bluetooth::transport::MonitorTransport;
    use std::time::Duration;

    const DEMO: DeviceAddress = DeviceAddress::new(0xD4_36_39_12_0A_7C);

    fn service_with(sim: Arc<SimulatedTransport>, settings: Settings) -> MonitorService {
        let settings = Arc::new(Mutex::new(SettingsService::in_memory(settings)));
        MonitorService::new(sim, settings, EventBus::new()).unwrap()
    }

    fn demo_service() -> (Arc<SimulatedTransport>, MonitorService) {
        let sim = Arc::new(SimulatedTransport::demo());
        let service = service_with(sim.clone(), Settings::default());
        (sim, service)
    }

    #[tokio::test]
    async fn test_invalid_uuid_rejected() {
        let settings = Settings {
            write_char_uuid: "nope".into(),
            ..Default::default()
        };
        let settings = Arc::new(Mutex::new(SettingsService::in_memory(settings)));
        let result = MonitorService::new(
            Arc::new(SimulatedTransport::new()),
            settings,
            EventBus::new(),
        );
        assert!(matches!(result, Err(BridgeError::Settings(_))));
    }

    #[tokio::test]
    async fn test_scan_publishes_found() {
        let (_sim, mut service) = demo_service();
        let mut rx = service.bus().subscribe_device();
        service.execute(BridgeCommand::StartScan).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DeviceEvent::Found(device) => assert_eq!(device.address, DEMO),
            other => panic!("unexpected event {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut rx).is_empty());
        service.execute(BridgeCommand::StopScan).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_starts_stream() {
        let (sim, mut service) = demo_service();
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        assert!(service.is_streaming());
        assert!(sim.is_subscribed());

        service.execute(BridgeCommand::Disconnect).await.unwrap();
        assert!(!service.is_streaming());
        assert!(!sim.is_subscribed());
    }

    #[tokio::test]
    async fn test_commands_need_connection() {
        let (_sim, mut service) = demo_service();
        for command in [
            BridgeCommand::ListFiles,
            BridgeCommand::ReadFile("x".into()),
            BridgeCommand::StartBpMeasurement,
            BridgeCommand::StartStream,
        ] {
            assert_eq!(
                service.execute(command).await,
                Err(BridgeError::NotConnected)
            );
        }
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let (sim, mut service) = demo_service();
        let other = DeviceAddress::new(0x01);
        sim.add_reachable(other);
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        assert_eq!(
            service.execute(BridgeCommand::Connect(other)).await,
            Err(BridgeError::AlreadyConnected { active: DEMO })
        );
        assert_eq!(service.connection().connected(), Some(DEMO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bp_measurement_end_to_end() {
        let (sim, mut service) = demo_service();
        let mut rx = service.bus().subscribe_bp();
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        service
            .execute(BridgeCommand::StartBpMeasurement)
            .await
            .unwrap();
        assert_eq!(sim.written_commands(), vec![vec![0x0A, 0x01]]);

        let mut events = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            let done = event == BpEvent::Lifecycle(BpLifecycle::Complete);
            events.push(event);
            if done {
                break;
            }
        }

        assert_eq!(events.first(), Some(&BpEvent::Lifecycle(BpLifecycle::Measuring)));
        let measurements: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BpEvent::Measurement(r) => Some(*r),
                _ => None,
            })
            .collect();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].systolic, Some(128));
        assert_eq!(measurements[0].map, Some(102));

        // outside the run loop nothing re-arms the stream after a result
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!service.is_streaming());
        service
            .execute(BridgeCommand::StartBpMeasurement)
            .await
            .unwrap();
        assert!(service.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ecg_measurement_end_to_end() {
        let (_sim, mut service) = demo_service();
        let mut rx = service.bus().subscribe_ecg();
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        service
            .execute(BridgeCommand::StartEcgMeasurement)
            .await
            .unwrap();

        let mut samples = 0;
        let mut stops = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            match event {
                EcgEvent::Data { samples: s, .. } => samples += s.len(),
                EcgEvent::Lifecycle(EcgLifecycle::Stopped {
                    final_heart_rate, ..
                }) => stops.push(final_heart_rate),
                EcgEvent::Lifecycle(EcgLifecycle::Started) => {}
            }
        }

        assert_eq!(samples, 250);
        assert_eq!(stops, vec![72]);
    }

    #[tokio::test]
    async fn test_stop_measurement_cancels_bp() {
        let sim = Arc::new(SimulatedTransport::demo());
        sim.set_auto_respond(false);
        let mut service = service_with(sim.clone(), Settings::default());
        let mut rx = service.bus().subscribe_bp();
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        service
            .execute(BridgeCommand::StartBpMeasurement)
            .await
            .unwrap();
        service
            .execute(BridgeCommand::StopMeasurement)
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(Ok(e)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![
                BpEvent::Lifecycle(BpLifecycle::Measuring),
                BpEvent::Lifecycle(BpLifecycle::Cancelled),
            ]
        );
        assert_eq!(
            sim.written_commands(),
            vec![vec![0x0A, 0x01], vec![0x0A, 0x00]]
        );
    }

    #[tokio::test]
    async fn test_link_loss_discards_sessions() {
        let sim = Arc::new(SimulatedTransport::demo());
        sim.set_auto_respond(false);
        let mut service = service_with(sim.clone(), Settings::default());
        let mut ecg = service.bus().subscribe_ecg();
        let mut device = service.bus().subscribe_device();
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        service
            .execute(BridgeCommand::StartEcgMeasurement)
            .await
            .unwrap();
        let started = tokio::time::timeout(Duration::from_secs(1), ecg.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started, EcgEvent::Lifecycle(EcgLifecycle::Started));

        sim.drop_link(DEMO);
        service.handle_edge(LinkEdge::Down(DEMO)).await;

        assert!(!service.is_streaming());
        assert!(drain(&mut ecg).is_empty());
        assert_eq!(
            drain(&mut device).last(),
            Some(&DeviceEvent::Disconnected {
                address: DEMO,
                reason: DisconnectReason::LinkLost
            })
        );
    }

    #[tokio::test]
    async fn test_platform_reconnect_adopted() {
        let sim = Arc::new(SimulatedTransport::demo());
        let settings = Settings {
            known_addresses: vec![DEMO],
            ..Default::default()
        };
        let mut service = service_with(sim.clone(), settings);
        let mut device = service.bus().subscribe_device();
        sim.adopt_link(DEMO);
        service.handle_edge(LinkEdge::Up(DEMO)).await;

        assert_eq!(drain(&mut device), vec![DeviceEvent::Connected(DEMO)]);
        assert!(service.is_streaming());
    }

    #[tokio::test]
    async fn test_stale_link_up_after_disconnect_ignored() {
        let (sim, mut service) = demo_service();
        let mut device = service.bus().subscribe_device();
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        service.execute(BridgeCommand::Disconnect).await.unwrap();
        drain(&mut device);

        // queued by the observer while the link was still up
        service.handle_edge(LinkEdge::Up(DEMO)).await;

        assert!(drain(&mut device).is_empty());
        assert_eq!(service.connection().connected(), None);
        assert!(!service.is_streaming());
        assert!(sim.connected_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_completion_rearms_stream() {
        let sim = Arc::new(SimulatedTransport::demo());
        sim.set_auto_respond(false);
        let mut service = service_with(sim.clone(), Settings::default());
        service.execute(BridgeCommand::Connect(DEMO)).await.unwrap();
        for bytes in crate::infrastructure::bluetooth::simulated::bp_measurement_script() {
            assert!(sim.push_notification(bytes).await);
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while service.is_streaming() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        service.handle_stream_completed(DEMO).await;
        assert!(service.is_streaming());
        assert!(sim.is_subscribed());

        // nothing to re-arm once the user disconnected
        service.execute(BridgeCommand::Disconnect).await.unwrap();
        service.handle_stream_completed(DEMO).await;
        assert!(!service.is_streaming());
    }

    #[tokio::test]
    async fn test_device_started_measurement_after_result_is_observed() {
        let sim = Arc::new(SimulatedTransport::demo());
        sim.set_auto_respond(false);
        let service = service_with(sim.clone(), Settings::default());
        let mut rx = service.bus().subscribe_bp();
        let (tx, commands) = mpsc::unbounded_channel();
        let task = tokio::spawn(service.run(commands));

        let (request, reply) = BridgeRequest::new(BridgeCommand::Connect(DEMO));
        tx.send(request).unwrap();
        assert_eq!(reply.await.unwrap(), Ok(CommandOutput::Done));

        for bytes in crate::infrastructure::bluetooth::simulated::bp_measurement_script() {
            assert!(sim.push_notification(bytes).await);
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while let Ok(event) = rx.recv().await {
                if event == BpEvent::Lifecycle(BpLifecycle::Complete) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        // the device inflates again on its own; repeat until the new stream
        // is subscribed and picks the status up
        let mut second = Vec::new();
        for _ in 0..100 {
            sim.push_frame(FrameKind::DeviceStatus, &[4, 0, 70]).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            second.extend(drain(&mut rx));
            if !second.is_empty() {
                break;
            }
        }
        assert_eq!(second, vec![BpEvent::Lifecycle(BpLifecycle::Measuring)]);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_radio_edge_published() {
        let (_sim, mut service) = demo_service();
        let mut device = service.bus().subscribe_device();
        service.handle_edge(LinkEdge::Radio(false)).await;
        assert_eq!(
            drain(&mut device),
            vec![DeviceEvent::RadioStatusChanged(false)]
        );
    }

    #[tokio::test]
    async fn test_run_loop_reconnects_and_serves_requests() {
        let sim = Arc::new(SimulatedTransport::demo());
        let settings = Settings {
            last_connected_address: Some(DEMO),
            ..Default::default()
        };
        let service = service_with(sim.clone(), settings);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(service.run(rx));

        let (request, reply) = BridgeRequest::new(BridgeCommand::ListFiles);
        tx.send(request).unwrap();
        match reply.await.unwrap().unwrap() {
            CommandOutput::Files(files) => assert_eq!(files.len(), 2),
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(sim.connect_calls(), 1);

        drop(tx);
        task.await.unwrap();
        assert!(!sim.is_subscribed());
    }

    #[test]
    fn test_command_json() {
        let command: BridgeCommand =
            serde_json::from_str(r#"{"command":"Connect","arg":"D4:36:39:12:0A:7C"}"#).unwrap();
        assert_eq!(command, BridgeCommand::Connect(DEMO));
        let command: BridgeCommand = serde_json::from_str(r#"{"command":"ListFiles"}"#).unwrap();
        assert_eq!(command, BridgeCommand::ListFiles);
    }
}
