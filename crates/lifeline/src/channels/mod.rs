//! Delivery channels.
//!
//! Each channel wraps one host capability and reports what happened as a
//! [`ChannelOutcome`]. Channels never touch event status or queue state; the
//! queue decides what an outcome means for the event.

mod data_push;
mod satellite;
mod voice;

pub use data_push::DataPushChannel;
pub use satellite::SatelliteChannel;
pub use voice::VoiceChannel;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::warn;

use crate::config::ChannelsConfig;
use crate::connectivity::ConnectivityStatus;
use crate::event::{ChannelKind, ChannelResult, EmergencyEvent};
use crate::host::{HostError, HostServices};

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// The alert left the device.
    Sent,
    /// The attempt failed and may be retried.
    Failed(String),
    /// The channel can never deliver this event.
    Unsupported,
}

impl ChannelOutcome {
    /// Map a host capability error onto an outcome.
    #[must_use]
    pub fn from_host_error(err: HostError) -> Self {
        match err {
            HostError::Unavailable(_) => Self::Unsupported,
            HostError::Failed(reason) => Self::Failed(reason),
        }
    }
}

impl From<ChannelOutcome> for ChannelResult {
    fn from(outcome: ChannelOutcome) -> Self {
        match outcome {
            ChannelOutcome::Sent => Self::Sent,
            ChannelOutcome::Failed(reason) => Self::Failed(reason),
            ChannelOutcome::Unsupported => Self::Unsupported,
        }
    }
}

/// A delivery mechanism with its own availability rules.
#[async_trait]
pub trait DispatchChannel: Send + Sync {
    /// Which channel this is.
    fn kind(&self) -> ChannelKind;

    /// Whether the device can ever use this channel.
    ///
    /// An unsupported channel is marked `Unsupported` on every event and
    /// never attempted again.
    fn is_supported(&self) -> bool {
        true
    }

    /// Whether an attempt makes sense right now.
    ///
    /// A false precondition skips the channel for this flush pass without
    /// counting an attempt.
    fn precondition(&self) -> bool;

    /// Attempt delivery.
    async fn send(&self, event: &EmergencyEvent) -> ChannelOutcome;
}

/// Build the enabled channels for which the host has the needed capability.
#[must_use]
pub fn from_config(
    config: &ChannelsConfig,
    host: &HostServices,
    connectivity: &ConnectivityStatus,
) -> Vec<Arc<dyn DispatchChannel>> {
    let mut channels: Vec<Arc<dyn DispatchChannel>> = Vec::new();

    if config.voice.enabled {
        match &host.dialer {
            Some(dialer) => channels.push(Arc::new(VoiceChannel::new(
                Arc::clone(dialer),
                config.voice.emergency_numbers.clone(),
                config.voice.requires_connectivity,
                connectivity.clone(),
            ))),
            None => warn!("Voice channel enabled but host provides no dialer"),
        }
    }

    if config.data_push.enabled {
        match (&host.network, &config.data_push.endpoint) {
            (Some(client), Some(endpoint)) => channels.push(Arc::new(DataPushChannel::new(
                Arc::clone(client),
                endpoint.clone(),
                connectivity.clone(),
            ))),
            (None, _) => warn!("Data push channel enabled but host provides no network client"),
            (_, None) => warn!("Data push channel enabled but no endpoint is configured"),
        }
    }

    if config.satellite.enabled {
        if let Some(modem) = &host.satellite {
            channels.push(Arc::new(SatelliteChannel::new(
                Arc::clone(modem),
                config.satellite.only_when_offline,
                connectivity.clone(),
            )));
        }
    }

    channels
}

/// JSON document pushed to the alert endpoint.
///
/// Retries after the first attempt carry `delayed: true` and the time of the
/// retry so the receiver can tell a late alert from a fresh one.
#[must_use]
pub fn alert_payload(event: &EmergencyEvent, now: DateTime<Utc>) -> serde_json::Value {
    let delayed = event.channel(ChannelKind::DataPush).attempts > 0;
    let snapshot = event.snapshot();
    let mut payload = json!({
        "type": "EMERGENCY_SOS",
        "incident_id": event.id,
        "source": event.source,
        "timestamp": event.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "location": event.location,
        "battery_level": snapshot.battery_level,
        "device_id": snapshot.device_id,
        "agent_version": snapshot.agent_version,
        "snapshot_digest": event.snapshot_digest(),
        "merged_signals": event.merged_signals,
        "delayed": delayed,
    });
    if delayed {
        payload["synced_at"] = json!(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    payload
}

/// Maximum satellite message size in bytes.
pub const SATELLITE_MESSAGE_LIMIT: usize = 160;

/// Short plain-text form of an event for the satellite relay.
///
/// Always fits in [`SATELLITE_MESSAGE_LIMIT`] bytes.
#[must_use]
pub fn compact_message(event: &EmergencyEvent) -> String {
    let location = event
        .location
        .map_or_else(|| "NOLOC".to_string(), |l| l.to_string());
    let short_id: String = event.id.as_str().chars().take(8).collect();
    let message = format!(
        "SOS ROAD EMERGENCY assistance required {} {} {} id:{}",
        event.source,
        location,
        event.created_at.format("%Y-%m-%dT%H:%MZ"),
        short_id
    );
    truncate_bytes(message, SATELLITE_MESSAGE_LIMIT)
}

fn truncate_bytes(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text
}
