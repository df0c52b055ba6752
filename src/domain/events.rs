//! Outbound events, one broadcast channel per category.
//!
//! Delivery is fire-and-forget: sends never wait and a send with no
//! subscribers is not an error. Events of one session share a channel and a
//! writer, so subscribers observe them in emission order.

use crate::domain::models::{BpReading, Device, DeviceAddress, HeartRateSource};
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    Requested,
    LinkLost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceEvent {
    Found(Device),
    Connected(DeviceAddress),
    Disconnected {
        address: DeviceAddress,
        reason: DisconnectReason,
    },
    RadioStatusChanged(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BpLifecycle {
    Measuring,
    WaitingResult,
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BpEvent {
    Progress { pressure: u16 },
    Measurement(BpReading),
    Lifecycle(BpLifecycle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EcgLifecycle {
    Started,
    Stopped {
        final_heart_rate: u16,
        source: HeartRateSource,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EcgEvent {
    Lifecycle(EcgLifecycle),
    Data {
        samples: Vec<i16>,
        sample_rate: u32,
        scale_factor: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryEvent {
    pub percent: u8,
    pub charging: bool,
}

/// Tagged union used by hosts that want one merged feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", content = "event")]
pub enum AppEvent {
    Device(DeviceEvent),
    Bp(BpEvent),
    Ecg(EcgEvent),
    Battery(BatteryEvent),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    device: broadcast::Sender<DeviceEvent>,
    bp: broadcast::Sender<BpEvent>,
    ecg: broadcast::Sender<EcgEvent>,
    battery: broadcast::Sender<BatteryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            device: broadcast::channel(CHANNEL_CAPACITY).0,
            bp: broadcast::channel(CHANNEL_CAPACITY).0,
            ecg: broadcast::channel(CHANNEL_CAPACITY).0,
            battery: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn emit_device(&self, event: DeviceEvent) {
        let _ = self.device.send(event);
    }

    pub fn emit_bp(&self, event: BpEvent) {
        let _ = self.bp.send(event);
    }

    pub fn emit_ecg(&self, event: EcgEvent) {
        let _ = self.ecg.send(event);
    }

    pub fn emit_battery(&self, event: BatteryEvent) {
        let _ = self.battery.send(event);
    }

    pub fn subscribe_device(&self) -> broadcast::Receiver<DeviceEvent> {
        self.device.subscribe()
    }

    pub fn subscribe_bp(&self) -> broadcast::Receiver<BpEvent> {
        self.bp.subscribe()
    }

    pub fn subscribe_ecg(&self) -> broadcast::Receiver<EcgEvent> {
        self.ecg.subscribe()
    }

    pub fn subscribe_battery(&self) -> broadcast::Receiver<BatteryEvent> {
        self.battery.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains everything currently queued on a receiver. Test and host helper.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit_bp(BpEvent::Progress { pressure: 10 });
        bus.emit_battery(BatteryEvent {
            percent: 50,
            charging: false,
        });
    }

    #[test]
    fn test_categories_are_independent() {
        let bus = EventBus::new();
        let mut bp = bus.subscribe_bp();
        let mut ecg = bus.subscribe_ecg();

        bus.emit_bp(BpEvent::Progress { pressure: 80 });
        bus.emit_bp(BpEvent::Lifecycle(BpLifecycle::Complete));

        assert_eq!(
            drain(&mut bp),
            vec![
                BpEvent::Progress { pressure: 80 },
                BpEvent::Lifecycle(BpLifecycle::Complete)
            ]
        );
        assert!(drain(&mut ecg).is_empty());
    }

    #[test]
    fn test_app_event_json_shape() {
        let json = serde_json::to_value(AppEvent::Bp(BpEvent::Progress { pressure: 125 })).unwrap();
        assert_eq!(json["category"], "Bp");
        assert_eq!(json["event"]["Progress"]["pressure"], 125);
    }
}
