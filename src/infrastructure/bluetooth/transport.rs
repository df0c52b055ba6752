//! Transport capability
//!
//! The vendor SDK and the platform Bluetooth stack are reached only through
//! [`MonitorTransport`]. Streams are handed out as channel receivers; a
//! closed receiver means the source ended.

use crate::domain::models::{Advertisement, DeviceAddress, FileKey, RemoteFile};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type SharedTransport = Arc<dyn MonitorTransport>;

#[async_trait]
pub trait MonitorTransport: Send + Sync {
    async fn radio_enabled(&self) -> bool;

    /// Generic link-layer scan. Implementations may report devices that do
    /// not advertise `service_filter`; callers filter again.
    async fn scan(&self, service_filter: Uuid) -> Result<mpsc::Receiver<Advertisement>>;

    /// Vendor-protocol discovery notifications.
    async fn vendor_discovery(&self) -> Result<mpsc::Receiver<Advertisement>>;

    /// Stops both discovery sources.
    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, address: DeviceAddress) -> Result<()>;

    async fn disconnect(&self, address: DeviceAddress) -> Result<()>;

    /// Addresses the link layer currently reports as connected.
    async fn connected_addresses(&self) -> Result<Vec<DeviceAddress>>;

    /// Capability handshake: the frame layout revision the device speaks.
    async fn protocol_version(&self, address: DeviceAddress) -> Result<u8>;

    async fn subscribe_notifications(
        &self,
        address: DeviceAddress,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>>;

    async fn unsubscribe_notifications(&self, address: DeviceAddress) -> Result<()>;

    async fn write_command(
        &self,
        address: DeviceAddress,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<()>;

    async fn request_file_list(&self, address: DeviceAddress) -> Result<Vec<RemoteFile>>;

    async fn request_file_read(&self, address: DeviceAddress, key: FileKey) -> Result<Vec<u8>>;
}
