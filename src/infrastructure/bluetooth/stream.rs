//! Real-Time Stream Module
//!
//! Turns notification bytes into lifecycle transitions. [`StreamDecoder`] is
//! the synchronous per-frame engine; [`StreamHandle`] runs it on a task fed
//! by the transport's notification channel and the service's control
//! channel.

use crate::domain::events::EventBus;
use crate::domain::lifecycle::MeasurementLifecycle;
use crate::domain::models::{DeviceAddress, FrameKind, RawFrame};
use crate::domain::waveform::{self, BatcherConfig, SharedBatcher, WaveformBatcher};
use crate::error::Result;
use crate::infrastructure::bluetooth::protocol::{self, FrameLayout};
use crate::infrastructure::bluetooth::transport::SharedTransport;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Commands forwarded from the service to the stream task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    StartBp,
    StartEcg,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirective {
    Continue,
    /// A BP result completed its session; the stream ends.
    Stop,
}

pub struct StreamDecoder {
    layout: &'static FrameLayout,
    lifecycle: MeasurementLifecycle,
}

impl StreamDecoder {
    pub fn new(layout: &'static FrameLayout, lifecycle: MeasurementLifecycle) -> Self {
        Self { layout, lifecycle }
    }

    pub fn lifecycle(&self) -> &MeasurementLifecycle {
        &self.lifecycle
    }

    pub fn handle_notification(&mut self, bytes: &[u8]) -> StreamDirective {
        match protocol::split_envelope(bytes) {
            Some(frame) => self.handle_frame(&frame),
            None => {
                trace!("Dropping notification: {:02X?}", bytes);
                StreamDirective::Continue
            }
        }
    }

    pub fn handle_frame(&mut self, frame: &RawFrame) -> StreamDirective {
        let payload = frame.payload.as_slice();
        match frame.kind {
            FrameKind::Pressure => match protocol::decode_pressure(payload, self.layout) {
                Ok(pressure) => self.lifecycle.on_pressure(pressure),
                Err(e) => trace!("Dropping pressure frame {:02X?}: {}", payload, e),
            },
            FrameKind::BpResult => match protocol::decode_bp_result(payload, self.layout) {
                Ok(reading) => {
                    if self.lifecycle.on_bp_result(reading) {
                        return StreamDirective::Stop;
                    }
                }
                Err(e) => trace!("Dropping BP result {:02X?}: {}", payload, e),
            },
            FrameKind::EcgSamples => match protocol::decode_ecg_samples(payload, self.layout) {
                Ok(frame) => {
                    let heuristic = protocol::heuristic_heart_rate(payload, self.layout);
                    self.lifecycle
                        .on_ecg_samples(&frame.samples, frame.live_heart_rate, heuristic);
                }
                Err(e) => trace!("Dropping ECG samples: {}", e),
            },
            FrameKind::EcgResult => {
                let result = protocol::decode_ecg_result(payload, self.layout);
                debug!(
                    "ECG result: flags={:#010X} hr={:?} qrs={:?} pvc={:?} qtc={:?}",
                    result.result_flags,
                    result.heart_rate,
                    result.qrs_ms,
                    result.pvc_count,
                    result.qtc_ms
                );
                self.lifecycle.on_ecg_result(result.heart_rate);
            }
            FrameKind::DeviceStatus => match protocol::decode_status(payload) {
                Ok(status) => {
                    self.lifecycle.on_device_status(status.status);
                    if let Some(percent) = status.battery_percent {
                        self.lifecycle.on_battery(percent, status.charging);
                    }
                }
                Err(e) => trace!("Dropping status frame: {}", e),
            },
        }
        StreamDirective::Continue
    }

    pub fn handle_control(&mut self, control: StreamControl) {
        match control {
            StreamControl::StartBp => self.lifecycle.start_bp(),
            StreamControl::StartEcg => self.lifecycle.start_ecg(),
            StreamControl::Stop => self.lifecycle.stop(),
        }
    }

    pub fn discard(&mut self) {
        self.lifecycle.discard();
    }
}

/// Parameters for one stream run.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub notify_char: Uuid,
    pub flush_interval: Duration,
    pub batcher: BatcherConfig,
}

/// Aborts the wrapped task when dropped, including when the owning task
/// is itself aborted.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Handle to a running stream task
pub struct StreamHandle {
    address: DeviceAddress,
    transport: SharedTransport,
    batcher: SharedBatcher,
    control: mpsc::UnboundedSender<StreamControl>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Negotiates the frame layout, subscribes and spawns the stream task.
    ///
    /// When a BP result ends the task, `completed` receives the address so
    /// the owner can start a fresh stream.
    pub async fn start(
        transport: SharedTransport,
        address: DeviceAddress,
        bus: EventBus,
        config: StreamConfig,
        completed: mpsc::UnboundedSender<DeviceAddress>,
    ) -> Result<Self> {
        let version = match transport.protocol_version(address).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Protocol version handshake failed ({}), assuming 1", e);
                1
            }
        };
        let layout = protocol::layout_for_version(version);
        info!("Starting stream for {} with protocol v{}", address, version);

        let notifications = transport
            .subscribe_notifications(address, config.notify_char)
            .await?;

        let batcher = WaveformBatcher::shared(config.batcher, bus.clone());
        let decoder = StreamDecoder::new(layout, MeasurementLifecycle::new(bus, batcher.clone()));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_stream(
            decoder,
            batcher.clone(),
            config.flush_interval,
            notifications,
            control_rx,
            transport.clone(),
            address,
            completed,
        ));

        Ok(Self {
            address,
            transport,
            batcher,
            control: control_tx,
            task,
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Forwards a control command. Returns false if the task has ended.
    pub fn send(&self, control: StreamControl) -> bool {
        self.is_running() && self.control.send(control).is_ok()
    }

    /// Aborts the task; open sessions end without terminal events.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        // the flush ticker may outlive the task briefly
        waveform::lock(&self.batcher).discard_session();
        if let Err(e) = self.transport.unsubscribe_notifications(self.address).await {
            debug!("Unsubscribe after stop failed: {}", e);
        }
        info!("Stream for {} stopped", self.address);
    }
}

async fn run_stream(
    mut decoder: StreamDecoder,
    batcher: SharedBatcher,
    flush_interval: Duration,
    mut notifications: mpsc::Receiver<Vec<u8>>,
    mut control: mpsc::UnboundedReceiver<StreamControl>,
    transport: SharedTransport,
    address: DeviceAddress,
    completed: mpsc::UnboundedSender<DeviceAddress>,
) {
    let _ticker = AbortOnDrop(tokio::spawn(waveform::run_flush_ticker(
        batcher,
        flush_interval,
    )));

    let mut finished = false;
    loop {
        tokio::select! {
            bytes = notifications.recv() => match bytes {
                Some(bytes) => {
                    if decoder.handle_notification(&bytes) == StreamDirective::Stop {
                        info!("BP result received, ending stream");
                        finished = true;
                        break;
                    }
                }
                None => {
                    debug!("Notification channel closed");
                    decoder.discard();
                    break;
                }
            },
            cmd = control.recv() => match cmd {
                Some(cmd) => decoder.handle_control(cmd),
                None => {
                    decoder.discard();
                    break;
                }
            },
        }
    }

    if let Err(e) = transport.unsubscribe_notifications(address).await {
        debug!("Unsubscribe failed: {}", e);
    }
    if finished && completed.send(address).is_err() {
        debug!("Nobody is waiting for stream completion");
    }
}
