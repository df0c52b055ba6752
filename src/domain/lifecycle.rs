//! Measurement Lifecycle
//!
//! Blood-pressure and ECG session state machines. Every transition emits
//! exactly one event; triggers that do not cause a transition emit nothing.
//!
//! ```text
//! BP : Ready -> Measuring -> WaitingResult -> Complete -> (Ready)
//!                  \___________ Cancelled ___________/
//! BP : WaitingResult -> Measuring   (device starts a new inflation)
//! ECG: Idle  -> Measuring -> Idle
//! ```
//!
//! The device may start a measurement on its own, so status frames and app
//! commands are both start triggers and are indistinguishable once applied.

use crate::domain::events::{
    BatteryEvent, BpEvent, BpLifecycle, EcgEvent, EcgLifecycle, EventBus,
};
use crate::domain::models::{BpReading, BpState, DeviceStatus, EcgState, HeartRateSource};
use crate::domain::waveform::{self, SharedBatcher};
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
pub struct BpSession {
    state: BpState,
    last_pressure: Option<u16>,
    last_reading: Option<BpReading>,
}

impl BpSession {
    fn new() -> Self {
        Self {
            state: BpState::Ready,
            last_pressure: None,
            last_reading: None,
        }
    }

    pub fn state(&self) -> BpState {
        self.state
    }

    pub fn last_pressure(&self) -> Option<u16> {
        self.last_pressure
    }

    pub fn last_reading(&self) -> Option<BpReading> {
        self.last_reading
    }

    fn begin(&mut self, bus: &EventBus) {
        match self.state {
            BpState::Ready => {}
            // the previous inflation ended without a result
            BpState::WaitingResult => self.discard(),
            BpState::Measuring | BpState::Complete => return,
        }
        self.state = BpState::Measuring;
        self.last_pressure = None;
        info!("BP session started");
        bus.emit_bp(BpEvent::Lifecycle(BpLifecycle::Measuring));
    }

    fn measure_end(&mut self, bus: &EventBus) {
        if self.state != BpState::Measuring {
            return;
        }
        self.state = BpState::WaitingResult;
        bus.emit_bp(BpEvent::Lifecycle(BpLifecycle::WaitingResult));
    }

    fn progress(&mut self, pressure: u16, bus: &EventBus) {
        if self.state != BpState::Measuring {
            trace!("Ignoring cuff pressure {} outside a BP session", pressure);
            return;
        }
        self.last_pressure = Some(pressure);
        bus.emit_bp(BpEvent::Progress { pressure });
    }

    /// Returns true if this result completed the session.
    fn result(&mut self, reading: BpReading, bus: &EventBus) -> bool {
        match self.state {
            BpState::Ready | BpState::Complete => {
                debug!("Ignoring BP result outside a session: {:?}", reading);
                return false;
            }
            BpState::Measuring => {
                // measure-end status never arrived
                self.measure_end(bus);
            }
            BpState::WaitingResult => {}
        }

        self.state = BpState::Complete;
        self.last_reading = Some(reading);
        info!(
            "BP result: sys={:?} dia={:?} pulse={:?} map={:?}",
            reading.systolic, reading.diastolic, reading.pulse, reading.map
        );
        bus.emit_bp(BpEvent::Measurement(reading));
        bus.emit_bp(BpEvent::Lifecycle(BpLifecycle::Complete));
        self.state = BpState::Ready;
        true
    }

    fn cancel(&mut self, bus: &EventBus) {
        if !matches!(self.state, BpState::Measuring | BpState::WaitingResult) {
            return;
        }
        self.state = BpState::Ready;
        info!("BP session cancelled");
        bus.emit_bp(BpEvent::Lifecycle(BpLifecycle::Cancelled));
    }

    fn discard(&mut self) {
        if self.state != BpState::Ready {
            debug!("Discarding BP session in state {:?}", self.state);
        }
        self.state = BpState::Ready;
    }
}

#[derive(Debug)]
pub struct EcgSession {
    state: EcgState,
    last_live_heart_rate: Option<u16>,
    /// Heart rate recovered from the latest raw sample frame
    heuristic_heart_rate: Option<u16>,
}

impl EcgSession {
    fn new() -> Self {
        Self {
            state: EcgState::Idle,
            last_live_heart_rate: None,
            heuristic_heart_rate: None,
        }
    }

    pub fn state(&self) -> EcgState {
        self.state
    }

    pub fn last_live_heart_rate(&self) -> Option<u16> {
        self.last_live_heart_rate
    }

    fn begin(&mut self, bus: &EventBus, batcher: &SharedBatcher) {
        if self.state != EcgState::Idle {
            return;
        }
        self.state = EcgState::Measuring;
        self.last_live_heart_rate = None;
        self.heuristic_heart_rate = None;
        waveform::lock(batcher).begin_session();
        info!("ECG session started");
        bus.emit_ecg(EcgEvent::Lifecycle(EcgLifecycle::Started));
    }

    fn samples(
        &mut self,
        samples: &[i16],
        live_heart_rate: Option<u16>,
        heuristic_heart_rate: Option<u16>,
        batcher: &SharedBatcher,
    ) {
        if self.state != EcgState::Measuring {
            trace!("Ignoring ECG frame outside a session");
            return;
        }
        if live_heart_rate.is_some() {
            self.last_live_heart_rate = live_heart_rate;
        }
        if heuristic_heart_rate.is_some() {
            self.heuristic_heart_rate = heuristic_heart_rate;
        }
        waveform::lock(batcher).push(samples);
    }

    fn stop(&mut self, result_heart_rate: Option<u16>, bus: &EventBus, batcher: &SharedBatcher) {
        if self.state != EcgState::Measuring {
            return;
        }
        self.state = EcgState::Idle;

        let (final_heart_rate, source) = resolve_final_heart_rate(
            result_heart_rate,
            self.heuristic_heart_rate,
            self.last_live_heart_rate,
        );
        if source == HeartRateSource::Unavailable {
            warn!("ECG session stopped without any heart rate observation");
        }
        info!("ECG session stopped: hr={} ({:?})", final_heart_rate, source);

        // hold the buffer lock so no batch can be published after the stop
        let mut batcher = waveform::lock(batcher);
        batcher.end_session();
        bus.emit_ecg(EcgEvent::Lifecycle(EcgLifecycle::Stopped {
            final_heart_rate,
            source,
        }));
    }

    fn discard(&mut self, batcher: &SharedBatcher) {
        if self.state != EcgState::Idle {
            debug!("Discarding ECG session");
        }
        self.state = EcgState::Idle;
        waveform::lock(batcher).discard_session();
    }
}

/// Picks the final heart rate by priority: result field, heuristic parse of
/// the raw sample bytes, last live value. Falls back to `0` so a stop event
/// always carries a value.
pub fn resolve_final_heart_rate(
    result_field: Option<u16>,
    heuristic: Option<u16>,
    last_live: Option<u16>,
) -> (u16, HeartRateSource) {
    if let Some(hr) = result_field {
        (hr, HeartRateSource::ResultField)
    } else if let Some(hr) = heuristic {
        (hr, HeartRateSource::SampleHeuristic)
    } else if let Some(hr) = last_live {
        (hr, HeartRateSource::LastLive)
    } else {
        (0, HeartRateSource::Unavailable)
    }
}

/// Both session machines plus device-status and battery edge tracking.
///
/// Owned by the stream task, which is its only writer.
pub struct MeasurementLifecycle {
    bp: BpSession,
    ecg: EcgSession,
    last_status: Option<DeviceStatus>,
    last_battery: Option<BatteryEvent>,
    bus: EventBus,
    batcher: SharedBatcher,
}

impl MeasurementLifecycle {
    pub fn new(bus: EventBus, batcher: SharedBatcher) -> Self {
        Self {
            bp: BpSession::new(),
            ecg: EcgSession::new(),
            last_status: None,
            last_battery: None,
            bus,
            batcher,
        }
    }

    pub fn bp(&self) -> &BpSession {
        &self.bp
    }

    pub fn ecg(&self) -> &EcgSession {
        &self.ecg
    }

    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.last_status
    }

    /// Applies a device run status. Only changes act; the device repeats
    /// its status every frame.
    pub fn on_device_status(&mut self, status: DeviceStatus) {
        if self.last_status == Some(status) {
            return;
        }
        debug!("Device status {:?} -> {:?}", self.last_status, status);
        self.last_status = Some(status);

        match status {
            DeviceStatus::BpMeasuring => self.bp.begin(&self.bus),
            DeviceStatus::BpMeasureEnd => self.bp.measure_end(&self.bus),
            DeviceStatus::EcgMeasuring => self.ecg.begin(&self.bus, &self.batcher),
            DeviceStatus::EcgMeasureEnd => self.ecg.stop(None, &self.bus, &self.batcher),
            _ => {}
        }
    }

    pub fn on_battery(&mut self, percent: u8, charging: bool) {
        let event = BatteryEvent { percent, charging };
        if self.last_battery == Some(event) {
            return;
        }
        self.last_battery = Some(event);
        self.bus.emit_battery(event);
    }

    pub fn on_pressure(&mut self, pressure: u16) {
        self.bp.progress(pressure, &self.bus);
    }

    /// Returns true if the result completed a BP session.
    pub fn on_bp_result(&mut self, reading: BpReading) -> bool {
        self.bp.result(reading, &self.bus)
    }

    pub fn on_ecg_samples(
        &mut self,
        samples: &[i16],
        live_heart_rate: Option<u16>,
        heuristic_heart_rate: Option<u16>,
    ) {
        self.ecg
            .samples(samples, live_heart_rate, heuristic_heart_rate, &self.batcher);
    }

    pub fn on_ecg_result(&mut self, heart_rate: Option<u16>) {
        self.ecg.stop(heart_rate, &self.bus, &self.batcher);
    }

    pub fn start_bp(&mut self) {
        self.bp.begin(&self.bus);
    }

    pub fn start_ecg(&mut self) {
        self.ecg.begin(&self.bus, &self.batcher);
    }

    /// Explicit stop: cancels a running BP session and stops a running ECG
    /// session. A no-op when nothing is running.
    pub fn stop(&mut self) {
        self.bp.cancel(&self.bus);
        self.ecg.stop(None, &self.bus, &self.batcher);
    }

    /// Drops any open session without terminal events.
    pub fn discard(&mut self) {
        self.bp.discard();
        self.ecg.discard(&self.batcher);
    }
}
