//! Bluetooth Module
//!
//! Provides BLE communication with BP/ECG monitors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    MonitorService                        │
//! │  (Main coordinator - command loop and link edges)        │
//! └──────┬─────────────┬──────────────┬─────────────┬───────┘
//!        │             │              │             │
//!        ▼             ▼              ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌──────────────┐
//! │  Scanner  │  │ Connection │  │  Stream  │  │ FileTransfer │
//! │           │  │            │  │          │  │              │
//! │ - vendor +│  │ - one link │  │ - decode │  │ - listing    │
//! │   generic │  │ - observer │  │ - control│  │ - index      │
//! │   dedup   │  │ - persist  │  │          │  │   fallback   │
//! └─────┬─────┘  └─────┬──────┘  └────┬─────┘  └──────┬───────┘
//!       └──────────────┴──────┬───────┴───────────────┘
//!                             ▼
//!                   ┌───────────────────┐
//!                   │ MonitorTransport  │
//!                   │ (platform / sim)  │
//!                   └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, commands, frame layouts and decoding
//! - [`transport`] - Capability trait over the vendor SDK and BLE stack
//! - [`scanner`] - Two-source device discovery
//! - [`connection`] - Single active connection and link observation
//! - [`stream`] - Real-time notification decoding
//! - [`file_transfer`] - Stored recordings
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-memory monitor for tests and the demo binary

pub mod connection;
pub mod file_transfer;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod stream;
pub mod transport;

// Re-export main service for convenience
pub use service::{BridgeCommand, BridgeRequest, CommandOutput, MonitorService};
pub use transport::{MonitorTransport, SharedTransport};
