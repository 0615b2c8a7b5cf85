//! `lifeline` - Offline-resilient emergency alert coordination
//!
//! This library detects probable crashes from acceleration data, runs a
//! cancellable confirmation countdown, watches user-armed safety checks, and
//! delivers emergency alerts through every available channel. Alerts are
//! persisted before any delivery attempt and retried until they are delivered
//! or every channel is exhausted.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod channels;
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod event;
pub mod host;
pub mod logging;
pub mod queue;
pub mod safety;
pub mod service;
pub mod storage;

pub use channels::{ChannelOutcome, DispatchChannel};
pub use config::Config;
pub use connectivity::{ConnectivityHandle, ConnectivityMonitor, ConnectivityStatus};
pub use coordinator::{
    CoordinatorHandle, CoordinatorSnapshot, CoordinatorUpdate, EmergencyCoordinator, EventHandle,
    Signal,
};
pub use detector::{AccelerationSample, CrashSuspected, SensorAnomalyDetector};
pub use error::{Error, Result};
pub use event::{
    ChannelKind, ChannelResult, ChannelState, DiagnosticSnapshot, EmergencyEvent, EventId,
    EventSource, EventStatus, Location,
};
pub use host::HostServices;
pub use logging::init_logging;
pub use queue::{AlertQueue, DeliveryUpdate, FlushReport};
pub use safety::{DeadMansSwitchTimer, SwitchHandle, SwitchStatus};
pub use service::Lifeline;
pub use storage::{Storage, StorageStats};
