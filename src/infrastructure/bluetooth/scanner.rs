//! BLE Scanner Module
//!
//! Handles monitor discovery. Two sources run concurrently, vendor-protocol
//! discovery and a generic link-layer scan filtered by service UUID, and
//! are merged into one stream deduplicated by address.

use crate::domain::models::{Advertisement, Device, DeviceAddress, DiscoverySource};
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::transport::SharedTransport;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Discovery manager for the monitor
pub struct BleScanner {
    transport: SharedTransport,
    service_uuid: Uuid,
    merge_task: Option<JoinHandle<()>>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(transport: SharedTransport, service_uuid: Uuid) -> Self {
        Self {
            transport,
            service_uuid,
            merge_task: None,
        }
    }

    /// Start scanning with both sources
    ///
    /// Fails fast with [`BridgeError::RadioUnavailable`] if the radio is
    /// off. Each address is forwarded once per scan.
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Device>> {
        // Stop any existing scan
        self.stop().await?;

        if !self.transport.radio_enabled().await {
            warn!("Cannot scan: radio disabled");
            return Err(BridgeError::RadioUnavailable);
        }

        info!("Starting BLE scan for service UUID: {}", self.service_uuid);
        let vendor = self.transport.vendor_discovery().await?;
        let link = match self.transport.scan(self.service_uuid).await {
            Ok(rx) => rx,
            Err(e) => {
                if let Err(cleanup) = self.transport.stop_scan().await {
                    debug!("Stopping vendor discovery after failed scan failed: {}", cleanup);
                }
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.merge_task = Some(tokio::spawn(merge_sources(
            vendor,
            link,
            self.service_uuid,
            tx,
        )));
        Ok(rx)
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.merge_task.take() {
            info!("Stopping BLE scan...");
            task.abort();
            self.transport.stop_scan().await?;
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.merge_task
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(task) = self.merge_task.take() {
            task.abort();
        }
    }
}

async fn merge_sources(
    mut vendor: mpsc::Receiver<Advertisement>,
    mut link: mpsc::Receiver<Advertisement>,
    service_uuid: Uuid,
    out: mpsc::UnboundedSender<Device>,
) {
    let mut dedup = Deduplicator::default();
    let mut vendor_open = true;
    let mut link_open = true;

    while vendor_open || link_open {
        let (ad, source) = tokio::select! {
            ad = vendor.recv(), if vendor_open => match ad {
                Some(ad) => (ad, DiscoverySource::Vendor),
                None => { vendor_open = false; continue; }
            },
            ad = link.recv(), if link_open => match ad {
                Some(ad) => (ad, DiscoverySource::LinkLayer),
                None => { link_open = false; continue; }
            },
        };

        if source == DiscoverySource::LinkLayer && !ad.service_uuids.contains(&service_uuid) {
            continue;
        }
        if let Some(device) = dedup.admit(&ad, source) {
            debug!("Found {} ({}) via {:?}", device.name, device.address, source);
            if out.send(device).is_err() {
                break;
            }
        }
    }
    debug!("Discovery sources closed");
}

/// First-sighting filter for one scan.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<DeviceAddress>,
}

impl Deduplicator {
    pub fn admit(&mut self, ad: &Advertisement, source: DiscoverySource) -> Option<Device> {
        if self.seen.insert(ad.address) {
            Some(Device::from_advertisement(ad, source))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;
    use std::sync::Arc;
    use std::time::Duration;

    fn service() -> Uuid {
        protocol::parse_uuid(protocol::SERVICE_UUID).unwrap()
    }

    fn ad(raw: u64, uuids: Vec<Uuid>) -> Advertisement {
        Advertisement {
            address: DeviceAddress::new(raw),
            name: Some(format!("BP2 {:04X}", raw)),
            advertised_model: None,
            service_uuids: uuids,
            rssi: Some(-60),
        }
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<Device>) -> Vec<Device> {
        let mut out = Vec::new();
        while let Ok(Some(d)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            out.push(d);
        }
        out
    }

    #[test]
    fn test_deduplicator() {
        let mut dedup = Deduplicator::default();
        let a = ad(1, vec![]);
        assert!(dedup.admit(&a, DiscoverySource::Vendor).is_some());
        assert!(dedup.admit(&a, DiscoverySource::LinkLayer).is_none());
        assert!(dedup.admit(&ad(2, vec![]), DiscoverySource::LinkLayer).is_some());
    }

    #[tokio::test]
    async fn test_same_address_from_both_sources_found_once() {
        let sim = Arc::new(SimulatedTransport::new());
        sim.add_vendor_advertisement(ad(0xAA, vec![]));
        sim.add_link_advertisement(ad(0xAA, vec![service()]));

        let mut scanner = BleScanner::new(sim.clone(), service());
        let mut rx = scanner.start().await.unwrap();
        let found = collect(&mut rx).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, DeviceAddress::new(0xAA));
        assert!(scanner.is_scanning());
        scanner.stop().await.unwrap();
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_link_layer_results_filtered_by_service() {
        let sim = Arc::new(SimulatedTransport::new());
        sim.add_link_advertisement(ad(1, vec![Uuid::nil()]));
        sim.add_link_advertisement(ad(2, vec![service()]));

        let mut scanner = BleScanner::new(sim.clone(), service());
        let mut rx = scanner.start().await.unwrap();
        let found = collect(&mut rx).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, DeviceAddress::new(2));
        assert_eq!(found[0].source, DiscoverySource::LinkLayer);
    }

    #[tokio::test]
    async fn test_live_sightings_after_start() {
        let sim = Arc::new(SimulatedTransport::new());
        let mut scanner = BleScanner::new(sim.clone(), service());
        let mut rx = scanner.start().await.unwrap();

        sim.add_vendor_advertisement(ad(7, vec![]));
        sim.add_vendor_advertisement(ad(7, vec![]));
        let found = collect(&mut rx).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_radio_off_fails_fast() {
        let sim = Arc::new(SimulatedTransport::new());
        sim.set_radio(false);
        let mut scanner = BleScanner::new(sim.clone(), service());
        assert_eq!(scanner.start().await.err(), Some(BridgeError::RadioUnavailable));
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_failed_link_scan_closes_vendor_discovery() {
        let sim = Arc::new(SimulatedTransport::new());
        sim.set_link_scan_failing(true);
        let mut scanner = BleScanner::new(sim.clone(), service());

        assert!(matches!(
            scanner.start().await,
            Err(BridgeError::Transport(_))
        ));
        assert!(!scanner.is_scanning());
        assert_eq!(sim.open_scans(), 0);
    }

    #[tokio::test]
    async fn test_restart_resets_dedup() {
        let sim = Arc::new(SimulatedTransport::new());
        sim.add_vendor_advertisement(ad(3, vec![]));
        let mut scanner = BleScanner::new(sim.clone(), service());

        let mut rx = scanner.start().await.unwrap();
        assert_eq!(collect(&mut rx).await.len(), 1);
        let mut rx = scanner.start().await.unwrap();
        assert_eq!(collect(&mut rx).await.len(), 1);
    }
}
