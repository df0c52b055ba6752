//! BLE Connection Module
//!
//! Owns the single active monitor connection and watches the link layer for
//! changes the bridge did not initiate.

use crate::domain::events::{DeviceEvent, DisconnectReason, EventBus};
use crate::domain::models::{ConnectionState, DeviceAddress};
use crate::domain::settings::SettingsService;
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::transport::SharedTransport;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Link-layer change reported by [`LinkObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEdge {
    Up(DeviceAddress),
    Down(DeviceAddress),
    Radio(bool),
}

/// What the caller must do after [`ConnectionManager::handle_edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Unchanged,
    /// The active link dropped; sessions must be torn down.
    Lost(DeviceAddress),
    /// A link established outside the bridge was taken over.
    Adopted(DeviceAddress),
}

/// Connection manager enforcing one active device at a time
pub struct ConnectionManager {
    transport: SharedTransport,
    settings: Arc<Mutex<SettingsService>>,
    bus: EventBus,
    state: ConnectionState,
    active: Option<DeviceAddress>,
}

impl ConnectionManager {
    pub fn new(
        transport: SharedTransport,
        settings: Arc<Mutex<SettingsService>>,
        bus: EventBus,
    ) -> Self {
        Self {
            transport,
            settings,
            bus,
            state: ConnectionState::Disconnected,
            active: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Address of the connected (or connecting) device.
    pub fn active_address(&self) -> Option<DeviceAddress> {
        self.active
    }

    /// Address of the device only once the link is fully up.
    pub fn connected(&self) -> Option<DeviceAddress> {
        match self.state {
            ConnectionState::Connected => self.active,
            _ => None,
        }
    }

    /// Connect to a device by address
    ///
    /// Connecting to the already active address is a no-op. Any other
    /// address is rejected with [`BridgeError::AlreadyConnected`] without
    /// touching the transport.
    pub async fn connect(&mut self, address: DeviceAddress) -> Result<()> {
        if let Some(active) = self.active {
            if active == address {
                debug!("Connect to {} ignored: already active", address);
                return Ok(());
            }
            warn!("Connect to {} rejected: {} is active", address, active);
            return Err(BridgeError::AlreadyConnected { active });
        }

        if !self.transport.radio_enabled().await {
            warn!("Cannot connect: radio disabled");
            return Err(BridgeError::RadioUnavailable);
        }

        info!("Connecting to monitor: {}", address);
        self.state = ConnectionState::Connecting;
        self.active = Some(address);

        match self.transport.connect(address).await {
            Ok(()) => {
                self.mark_connected(address);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", address, e);
                self.state = ConnectionState::Disconnected;
                self.active = None;
                Err(e)
            }
        }
    }

    /// Disconnect from the current device. Safe to call in any state.
    pub async fn disconnect(&mut self) -> Option<DeviceAddress> {
        let address = self.active.take()?;
        self.state = ConnectionState::Disconnected;

        info!("Disconnecting from {}", address);
        if let Err(e) = self.transport.disconnect(address).await {
            warn!("Transport disconnect for {} failed: {}", address, e);
        }
        self.bus.emit_device(DeviceEvent::Disconnected {
            address,
            reason: DisconnectReason::Requested,
        });
        Some(address)
    }

    /// Applies one observed link edge to the connection state.
    pub fn handle_edge(&mut self, edge: LinkEdge) -> LinkOutcome {
        match edge {
            LinkEdge::Radio(enabled) => {
                info!("Radio {}", if enabled { "enabled" } else { "disabled" });
                self.bus.emit_device(DeviceEvent::RadioStatusChanged(enabled));
                LinkOutcome::Unchanged
            }
            LinkEdge::Down(address) if self.active == Some(address) => {
                warn!("{}", BridgeError::LinkLost(address));
                self.active = None;
                self.state = ConnectionState::Disconnected;
                self.bus.emit_device(DeviceEvent::Disconnected {
                    address,
                    reason: DisconnectReason::LinkLost,
                });
                LinkOutcome::Lost(address)
            }
            LinkEdge::Down(address) => {
                debug!("Ignoring link down for inactive {}", address);
                LinkOutcome::Unchanged
            }
            LinkEdge::Up(address) => match self.active {
                None if !self.is_known(address) => {
                    debug!("Ignoring link to unknown peripheral {}", address);
                    LinkOutcome::Unchanged
                }
                None => {
                    info!("Adopting link to {} established by the platform", address);
                    self.mark_connected(address);
                    LinkOutcome::Adopted(address)
                }
                Some(active) if active == address => LinkOutcome::Unchanged,
                Some(active) => {
                    warn!("Ignoring link to {} while {} is active", address, active);
                    LinkOutcome::Unchanged
                }
            },
        }
    }

    /// One-shot reconnect to the last persisted address.
    ///
    /// Failures are logged and otherwise swallowed.
    pub async fn reconnect_last(&mut self) -> Option<DeviceAddress> {
        let last = {
            let settings = match self.settings.lock() {
                Ok(s) => s,
                Err(_) => {
                    error!("Settings lock poisoned");
                    return None;
                }
            };
            let s = settings.get();
            if !s.auto_reconnect {
                return None;
            }
            s.last_connected_address
        }?;

        info!("Attempting reconnect to last monitor {}", last);
        match self.connect(last).await {
            Ok(()) => Some(last),
            Err(e) => {
                warn!("Reconnect to {} failed: {}", last, e);
                None
            }
        }
    }

    /// Whether the address was ever connected through the bridge.
    fn is_known(&self, address: DeviceAddress) -> bool {
        let settings = match self.settings.lock() {
            Ok(s) => s,
            Err(_) => {
                error!("Settings lock poisoned");
                return false;
            }
        };
        let s = settings.get();
        s.last_connected_address == Some(address) || s.known_addresses.contains(&address)
    }

    fn mark_connected(&mut self, address: DeviceAddress) {
        self.state = ConnectionState::Connected;
        self.active = Some(address);
        self.persist(address);
        info!("Connected to monitor {}", address);
        self.bus.emit_device(DeviceEvent::Connected(address));
    }

    fn persist(&self, address: DeviceAddress) {
        match self.settings.lock() {
            Ok(mut settings) => {
                if let Err(e) = settings.remember_connection(address) {
                    warn!("Failed to persist last connected address: {}", e);
                }
            }
            Err(_) => error!("Settings lock poisoned"),
        }
    }
}

/// Edge detector over successive link-layer snapshots.
#[derive(Debug, Default)]
pub struct LinkObserver {
    connected: HashSet<DeviceAddress>,
    radio: Option<bool>,
}

impl LinkObserver {
    /// Compares a snapshot with the previous one. The first radio reading
    /// counts as a transition from unknown.
    pub fn observe(&mut self, radio: bool, connected: &[DeviceAddress]) -> Vec<LinkEdge> {
        let mut edges = Vec::new();
        if self.radio != Some(radio) {
            self.radio = Some(radio);
            edges.push(LinkEdge::Radio(radio));
        }

        let now: HashSet<DeviceAddress> = connected.iter().copied().collect();
        let mut downs: Vec<_> = self.connected.difference(&now).copied().collect();
        let mut ups: Vec<_> = now.difference(&self.connected).copied().collect();
        downs.sort();
        ups.sort();
        edges.extend(downs.into_iter().map(LinkEdge::Down));
        edges.extend(ups.into_iter().map(LinkEdge::Up));

        self.connected = now;
        edges
    }
}

/// Polls the transport and forwards link edges until the receiver closes.
pub fn spawn_link_observer(
    transport: SharedTransport,
    period: Duration,
    edges: mpsc::UnboundedSender<LinkEdge>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut observer = LinkObserver::default();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let radio = transport.radio_enabled().await;
            let connected = match transport.connected_addresses().await {
                Ok(list) => list,
                Err(e) => {
                    debug!("Link poll failed: {}", e);
                    continue;
                }
            };
            for edge in observer.observe(radio, &connected) {
                if edges.send(edge).is_err() {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::drain;
    use crate::domain::settings::Settings;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;
    use crate::infrastructure::bluetooth::transport::MonitorTransport;

    const A: DeviceAddress = DeviceAddress::new(0xA1);
    const B: DeviceAddress = DeviceAddress::new(0xB2);

    fn setup() -> (Arc<SimulatedTransport>, ConnectionManager, EventBus) {
        let sim = Arc::new(SimulatedTransport::new());
        sim.add_reachable(A);
        sim.add_reachable(B);
        let settings = Arc::new(Mutex::new(SettingsService::in_memory(Settings::default())));
        let bus = EventBus::new();
        let manager = ConnectionManager::new(sim.clone(), settings, bus.clone());
        (sim, manager, bus)
    }

    #[tokio::test]
    async fn test_connect_emits_once_and_persists() {
        let (_sim, mut manager, bus) = setup();
        let mut rx = bus.subscribe_device();

        manager.connect(A).await.unwrap();
        manager.connect(A).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(drain(&mut rx), vec![DeviceEvent::Connected(A)]);
        let settings = manager.settings.lock().unwrap();
        assert_eq!(settings.get().last_connected_address, Some(A));
    }

    #[tokio::test]
    async fn test_second_device_rejected_without_side_effects() {
        let (sim, mut manager, bus) = setup();
        manager.connect(A).await.unwrap();
        let mut rx = bus.subscribe_device();
        let calls = sim.connect_calls();

        let err = manager.connect(B).await.unwrap_err();
        assert_eq!(err, BridgeError::AlreadyConnected { active: A });
        assert_eq!(sim.connect_calls(), calls);
        assert_eq!(manager.connected(), Some(A));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_radio_off_rejects_connect() {
        let (sim, mut manager, _bus) = setup();
        sim.set_radio(false);
        assert_eq!(manager.connect(A).await, Err(BridgeError::RadioUnavailable));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(sim.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let (_sim, mut manager, _bus) = setup();
        let unreachable = DeviceAddress::new(0xC3);
        assert!(matches!(
            manager.connect(unreachable).await,
            Err(BridgeError::Transport(_))
        ));
        assert_eq!(manager.active_address(), None);
        manager.connect(A).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_safe_when_idle() {
        let (_sim, mut manager, bus) = setup();
        let mut rx = bus.subscribe_device();
        assert_eq!(manager.disconnect().await, None);
        assert!(drain(&mut rx).is_empty());

        manager.connect(A).await.unwrap();
        assert_eq!(manager.disconnect().await, Some(A));
        assert_eq!(
            drain(&mut rx).last(),
            Some(&DeviceEvent::Disconnected {
                address: A,
                reason: DisconnectReason::Requested
            })
        );
    }

    #[tokio::test]
    async fn test_link_down_on_active_reports_lost() {
        let (_sim, mut manager, bus) = setup();
        manager.connect(A).await.unwrap();
        let mut rx = bus.subscribe_device();

        assert_eq!(manager.handle_edge(LinkEdge::Down(B)), LinkOutcome::Unchanged);
        assert_eq!(manager.handle_edge(LinkEdge::Down(A)), LinkOutcome::Lost(A));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            drain(&mut rx),
            vec![DeviceEvent::Disconnected {
                address: A,
                reason: DisconnectReason::LinkLost
            }]
        );
    }

    #[tokio::test]
    async fn test_unexpected_link_up_is_adopted() {
        let (_sim, mut manager, bus) = setup();
        let mut rx = bus.subscribe_device();
        manager.settings.lock().unwrap().get_mut().known_addresses = vec![A, B];

        assert_eq!(manager.handle_edge(LinkEdge::Up(B)), LinkOutcome::Adopted(B));
        assert_eq!(manager.handle_edge(LinkEdge::Up(A)), LinkOutcome::Unchanged);
        assert_eq!(manager.connected(), Some(B));
        assert_eq!(drain(&mut rx), vec![DeviceEvent::Connected(B)]);
    }

    #[tokio::test]
    async fn test_link_up_from_unknown_peripheral_ignored() {
        let (_sim, mut manager, bus) = setup();
        let mut rx = bus.subscribe_device();
        manager
            .settings
            .lock()
            .unwrap()
            .get_mut()
            .last_connected_address = Some(A);

        assert_eq!(manager.handle_edge(LinkEdge::Up(B)), LinkOutcome::Unchanged);
        assert_eq!(manager.connected(), None);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(manager.handle_edge(LinkEdge::Up(A)), LinkOutcome::Adopted(A));
        assert_eq!(drain(&mut rx), vec![DeviceEvent::Connected(A)]);
    }

    #[tokio::test]
    async fn test_reconnect_last_once() {
        let (sim, mut manager, _bus) = setup();
        manager
            .settings
            .lock()
            .unwrap()
            .get_mut()
            .last_connected_address = Some(A);

        assert_eq!(manager.reconnect_last().await, Some(A));
        assert_eq!(sim.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_swallowed() {
        let (sim, mut manager, _bus) = setup();
        sim.set_radio(false);
        manager
            .settings
            .lock()
            .unwrap()
            .get_mut()
            .last_connected_address = Some(A);

        assert_eq!(manager.reconnect_last().await, None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_observer_edges() {
        let mut observer = LinkObserver::default();
        assert_eq!(observer.observe(true, &[]), vec![LinkEdge::Radio(true)]);
        assert!(observer.observe(true, &[]).is_empty());
        assert_eq!(observer.observe(true, &[A]), vec![LinkEdge::Up(A)]);
        assert!(observer.observe(true, &[A]).is_empty());
        assert_eq!(
            observer.observe(false, &[]),
            vec![LinkEdge::Radio(false), LinkEdge::Down(A)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_task_reports_drop() {
        let sim = Arc::new(SimulatedTransport::new());
        sim.add_reachable(A);
        sim.connect(A).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_link_observer(sim.clone(), Duration::from_millis(1500), tx);

        assert_eq!(rx.recv().await, Some(LinkEdge::Radio(true)));
        assert_eq!(rx.recv().await, Some(LinkEdge::Up(A)));

        sim.drop_link(A);
        assert_eq!(rx.recv().await, Some(LinkEdge::Down(A)));
        assert!(rx.try_recv().is_err());
        task.abort();
    }
}
