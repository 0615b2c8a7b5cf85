//! Capabilities supplied by the host platform.
//!
//! Lifeline never talks to hardware directly. The embedding application
//! implements these traits (location, telephony, network, satellite modem,
//! notifications, battery) and hands them over in a [`HostServices`] bundle.
//! Every capability is optional; a missing one disables the feature that
//! needs it without stopping anything else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Location;

/// Failure reported by a host capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The capability does not exist on this device.
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    /// The capability exists but this call failed.
    #[error("{0}")]
    Failed(String),
}

/// Error returned by [`NetworkClient::post`].
pub type NetworkError = HostError;

/// Best-effort position source.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current position, or `None` if it cannot be determined within `timeout`.
    async fn get_location(&self, timeout: Duration) -> Option<Location>;
}

/// Emergency voice calling.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Place a call to `number`. Returns once the call is handed to the radio.
    async fn dial(&self, number: &str) -> Result<(), HostError>;
}

/// Data network access.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// POST a JSON document to `endpoint`.
    async fn post(&self, endpoint: &str, payload: &serde_json::Value) -> Result<(), NetworkError>;
}

/// Satellite messaging hardware.
#[async_trait]
pub trait SatelliteModem: Send + Sync {
    /// Whether the device has a satellite radio at all.
    fn is_present(&self) -> bool;

    /// Whether the radio currently has a usable link.
    fn is_ready(&self) -> bool;

    /// Transmit a short text message.
    async fn transmit(&self, message: &str) -> Result<(), HostError>;
}

/// User-facing notifications.
pub trait Notifier: Send + Sync {
    /// Show a notification. Failures are logged and otherwise ignored.
    fn notify(&self, title: &str, body: &str) -> Result<(), HostError>;
}

/// Battery level source.
pub trait BatteryGauge: Send + Sync {
    /// Battery percentage, if known.
    fn battery_level(&self) -> Option<u8>;
}

/// The set of capabilities the host makes available.
#[derive(Clone, Default)]
pub struct HostServices {
    /// Position source.
    pub location: Option<Arc<dyn LocationProvider>>,
    /// Voice calling.
    pub dialer: Option<Arc<dyn Dialer>>,
    /// Data network.
    pub network: Option<Arc<dyn NetworkClient>>,
    /// Satellite modem.
    pub satellite: Option<Arc<dyn SatelliteModem>>,
    /// Notifications.
    pub notifier: Option<Arc<dyn Notifier>>,
    /// Battery gauge.
    pub battery: Option<Arc<dyn BatteryGauge>>,
}

impl HostServices {
    /// An empty bundle: no capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the position source.
    #[must_use]
    pub fn with_location(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(provider);
        self
    }

    /// Set the voice dialer.
    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Set the network client.
    #[must_use]
    pub fn with_network(mut self, client: Arc<dyn NetworkClient>) -> Self {
        self.network = Some(client);
        self
    }

    /// Set the satellite modem.
    #[must_use]
    pub fn with_satellite(mut self, modem: Arc<dyn SatelliteModem>) -> Self {
        self.satellite = Some(modem);
        self
    }

    /// Set the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the battery gauge.
    #[must_use]
    pub fn with_battery(mut self, gauge: Arc<dyn BatteryGauge>) -> Self {
        self.battery = Some(gauge);
        self
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("location", &self.location.is_some())
            .field("dialer", &self.dialer.is_some())
            .field("network", &self.network.is_some())
            .field("satellite", &self.satellite.is_some())
            .field("notifier", &self.notifier.is_some())
            .field("battery", &self.battery.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBattery(u8);

    impl BatteryGauge for FixedBattery {
        fn battery_level(&self) -> Option<u8> {
            Some(self.0)
        }
    }

    #[test]
    fn test_empty_services() {
        let services = HostServices::new();
        assert!(services.location.is_none());
        assert!(services.dialer.is_none());
        assert!(format!("{services:?}").contains("dialer: false"));
    }

    #[test]
    fn test_builder_sets_capability() {
        let services = HostServices::new().with_battery(Arc::new(FixedBattery(42)));
        let level = services.battery.as_ref().and_then(|b| b.battery_level());
        assert_eq!(level, Some(42));
    }

    #[test]
    fn test_host_error_display() {
        assert_eq!(
            HostError::Unavailable("no modem".to_string()).to_string(),
            "capability unavailable: no modem"
        );
        assert_eq!(HostError::Failed("busy".to_string()).to_string(), "busy");
    }
}
