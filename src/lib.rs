//! Bridge between BP/ECG monitors and a host application.
//!
//! The [`MonitorService`] owns discovery, the single active connection, the
//! real-time stream and stored-file access. Hosts send [`BridgeCommand`]s
//! and subscribe to the per-category channels of the [`EventBus`].

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::events::{AppEvent, EventBus};
pub use error::{BridgeError, Result};
pub use infrastructure::bluetooth::{BridgeCommand, BridgeRequest, CommandOutput, MonitorService};
