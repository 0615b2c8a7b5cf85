//! Core emergency event types.
//!
//! An [`EmergencyEvent`] is the record of one real-world incident from the
//! first qualifying signal until it is delivered, cancelled, or abandoned.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detector::AccelerationSample;
use crate::error::{Error, Result};

/// Opaque, stable identifier of an emergency event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What raised the emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// The acceleration detector saw a sustained impact.
    CrashDetected,
    /// The dead-man's switch expired without being disarmed.
    SafetyTimeout,
    /// The user pressed SOS.
    UserInitiated,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CrashDetected => write!(f, "crash_detected"),
            Self::SafetyTimeout => write!(f, "safety_timeout"),
            Self::UserInitiated => write!(f, "user_initiated"),
        }
    }
}

impl FromStr for EventSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crash_detected" => Ok(Self::CrashDetected),
            "safety_timeout" => Ok(Self::SafetyTimeout),
            "user_initiated" => Ok(Self::UserInitiated),
            other => Err(Error::invalid_request(format!("unknown event source: {other}"))),
        }
    }
}

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Created, not yet confirming or dispatching.
    Pending,
    /// Countdown running; the user may still cancel.
    Confirming,
    /// Handed to the alert queue; channels are being attempted.
    Dispatching,
    /// At least one channel reported `Sent`.
    Delivered,
    /// The user cancelled during the countdown.
    Cancelled,
    /// Every channel is exhausted without a single success.
    Abandoned,
}

impl EventStatus {
    /// Whether the event occupies the single active slot in this status.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirming | Self::Dispatching)
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether `self -> next` is an allowed transition.
    ///
    /// Transitions only move forward; `Confirming -> Cancelled` is the only
    /// way out of the countdown other than dispatching.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirming | Self::Dispatching)
                | (Self::Confirming, Self::Dispatching | Self::Cancelled)
                | (Self::Dispatching, Self::Delivered | Self::Abandoned)
        )
    }

    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Confirming,
        Self::Dispatching,
        Self::Delivered,
        Self::Cancelled,
        Self::Abandoned,
    ];
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirming => write!(f, "confirming"),
            Self::Dispatching => write!(f, "dispatching"),
            Self::Delivered => write!(f, "delivered"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| Error::invalid_request(format!("unknown event status: {s}")))
    }
}

/// Delivery mechanisms an event can be sent through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Emergency voice call.
    Voice,
    /// Alert pushed over the data network.
    DataPush,
    /// Best-effort satellite relay.
    Satellite,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Voice => write!(f, "voice"),
            Self::DataPush => write!(f, "data_push"),
            Self::Satellite => write!(f, "satellite"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "voice" => Ok(Self::Voice),
            "data_push" => Ok(Self::DataPush),
            "satellite" => Ok(Self::Satellite),
            other => Err(Error::invalid_request(format!("unknown channel: {other}"))),
        }
    }
}

/// Last known outcome of a channel for one event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum ChannelResult {
    /// Never attempted.
    #[default]
    NotAttempted,
    /// Delivered. Never regresses.
    Sent,
    /// Last attempt failed; may be retried.
    Failed(String),
    /// Permanently skipped for this event.
    Unsupported,
}

impl ChannelResult {
    /// Short label used in storage and listings.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotAttempted => "not_attempted",
            Self::Sent => "sent",
            Self::Failed(_) => "failed",
            Self::Unsupported => "unsupported",
        }
    }

    /// Rebuild a result from its storage label and optional reason.
    #[must_use]
    pub fn from_parts(label: &str, reason: Option<String>) -> Self {
        match label {
            "sent" => Self::Sent,
            "failed" => Self::Failed(reason.unwrap_or_default()),
            "unsupported" => Self::Unsupported,
            _ => Self::NotAttempted,
        }
    }

    /// Whether the channel needs no further attempts.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Sent | Self::Unsupported)
    }
}

impl std::fmt::Display for ChannelResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Per-channel delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelState {
    /// Latest outcome.
    pub result: ChannelResult,
    /// Attempts made so far. Only ever increases.
    pub attempts: u32,
    /// Earliest time the next retry may run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the last attempt finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl Location {
    /// Create a location, rejecting out-of-range or NaN coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for coordinates outside the globe.
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(Error::invalid_request(format!(
                "coordinates out of range: {lat}, {lng}"
            )));
        }
        Ok(Self { lat, lng })
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lng)
    }
}

/// Device state captured when the event is created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    /// Most recent acceleration samples (empty unless crash-sourced).
    pub recent_samples: Vec<AccelerationSample>,
    /// Battery percentage, if a gauge is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    /// Device identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Version of this crate that produced the snapshot.
    pub agent_version: String,
}

impl DiagnosticSnapshot {
    /// Create a snapshot stamped with the current crate version.
    ///
    /// Samples with a non-finite axis are dropped; JSON cannot carry them.
    #[must_use]
    pub fn new(
        recent_samples: Vec<AccelerationSample>,
        battery_level: Option<u8>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            recent_samples: recent_samples
                .into_iter()
                .filter(AccelerationSample::is_finite)
                .collect(),
            battery_level,
            device_id,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Compute the BLAKE3 digest that seals this snapshot.
    #[must_use]
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// One incident, from detection through delivery or abandonment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyEvent {
    /// Stable identifier, used to de-duplicate replays.
    pub id: EventId,
    /// What raised the event.
    pub source: EventSource,
    /// When the triggering signal arrived.
    pub created_at: DateTime<Utc>,
    /// Best-effort coordinates; `None` never blocks delivery.
    pub location: Option<Location>,
    snapshot: DiagnosticSnapshot,
    snapshot_digest: String,
    /// Current lifecycle status.
    pub status: EventStatus,
    /// Delivery bookkeeping, keyed by channel.
    pub channels: BTreeMap<ChannelKind, ChannelState>,
    /// Number of later signals folded into this event.
    pub merged_signals: u32,
}

impl EmergencyEvent {
    /// Create a new `Pending` event with a sealed snapshot.
    #[must_use]
    pub fn new(source: EventSource, mut snapshot: DiagnosticSnapshot) -> Self {
        snapshot.recent_samples.retain(AccelerationSample::is_finite);
        let snapshot_digest = snapshot.digest();
        Self {
            id: EventId::generate(),
            source,
            created_at: Utc::now(),
            location: None,
            snapshot,
            snapshot_digest,
            status: EventStatus::Pending,
            channels: BTreeMap::new(),
            merged_signals: 0,
        }
    }

    /// Rebuild an event from persisted parts.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: EventId,
        source: EventSource,
        created_at: DateTime<Utc>,
        location: Option<Location>,
        snapshot: DiagnosticSnapshot,
        snapshot_digest: String,
        status: EventStatus,
        merged_signals: u32,
    ) -> Self {
        Self {
            id,
            source,
            created_at,
            location,
            snapshot,
            snapshot_digest,
            status,
            channels: BTreeMap::new(),
            merged_signals,
        }
    }

    /// The diagnostic snapshot. Immutable once attached.
    #[must_use]
    pub fn snapshot(&self) -> &DiagnosticSnapshot {
        &self.snapshot
    }

    /// The digest recorded when the snapshot was attached.
    #[must_use]
    pub fn snapshot_digest(&self) -> &str {
        &self.snapshot_digest
    }

    /// Check that the snapshot still matches its recorded digest.
    #[must_use]
    pub fn snapshot_intact(&self) -> bool {
        self.snapshot.digest() == self.snapshot_digest
    }

    /// Move to `next`, enforcing the forward-only transition table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the move is not allowed.
    pub fn transition(&mut self, next: EventStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                event_id: self.id.to_string(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Bookkeeping for `kind`, or the default if never touched.
    #[must_use]
    pub fn channel(&self, kind: ChannelKind) -> ChannelState {
        self.channels.get(&kind).cloned().unwrap_or_default()
    }

    /// Apply an attempt outcome. A `Sent` result is never overwritten.
    ///
    /// Returns `false` if the update was refused because the channel had
    /// already been sent.
    pub fn record_result(&mut self, kind: ChannelKind, result: ChannelResult) -> bool {
        let state = self.channels.entry(kind).or_default();
        if state.result == ChannelResult::Sent {
            return false;
        }
        state.result = result;
        true
    }

    /// Whether any channel has delivered this event.
    #[must_use]
    pub fn any_sent(&self) -> bool {
        self.channels
            .values()
            .any(|state| state.result == ChannelResult::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> EmergencyEvent {
        EmergencyEvent::new(EventSource::UserInitiated, DiagnosticSnapshot::default())
    }

    #[test]
    fn test_event_new_is_pending_and_sealed() {
        let event = event();
        assert_eq!(event.status, EventStatus::Pending);
        assert!(event.location.is_none());
        assert!(event.channels.is_empty());
        assert!(event.snapshot_intact());
        assert!(!event.snapshot_digest().is_empty());
    }

    #[test]
    fn test_event_ids_are_unique() {
        assert_ne!(event().id, event().id);
    }

    #[test]
    fn test_forward_transitions() {
        let mut event = event();
        event.transition(EventStatus::Confirming).unwrap();
        event.transition(EventStatus::Dispatching).unwrap();
        event.transition(EventStatus::Delivered).unwrap();
        assert_eq!(event.status, EventStatus::Delivered);
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let mut event = event();
        event.transition(EventStatus::Confirming).unwrap();
        event.transition(EventStatus::Cancelled).unwrap();
        let err = event.transition(EventStatus::Dispatching).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(event.status, EventStatus::Cancelled);
    }

    #[test]
    fn test_cannot_cancel_while_dispatching() {
        let mut event = event();
        event.transition(EventStatus::Dispatching).unwrap();
        assert!(event.transition(EventStatus::Cancelled).is_err());
    }

    #[test]
    fn test_no_backwards_transition() {
        assert!(!EventStatus::Dispatching.can_transition_to(EventStatus::Confirming));
        assert!(!EventStatus::Delivered.can_transition_to(EventStatus::Dispatching));
        assert!(!EventStatus::Abandoned.can_transition_to(EventStatus::Delivered));
    }

    #[test]
    fn test_sent_never_regresses() {
        let mut event = event();
        assert!(event.record_result(ChannelKind::Voice, ChannelResult::Sent));
        assert!(!event.record_result(
            ChannelKind::Voice,
            ChannelResult::Failed("late failure".to_string())
        ));
        assert_eq!(event.channel(ChannelKind::Voice).result, ChannelResult::Sent);
        assert!(event.any_sent());
    }

    #[test]
    fn test_channel_default_state() {
        let event = event();
        let state = event.channel(ChannelKind::Satellite);
        assert_eq!(state.result, ChannelResult::NotAttempted);
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in EventStatus::ALL {
            assert_eq!(status.to_string().parse::<EventStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<EventStatus>().is_err());
    }

    #[test]
    fn test_channel_result_from_parts() {
        assert_eq!(ChannelResult::from_parts("sent", None), ChannelResult::Sent);
        assert_eq!(
            ChannelResult::from_parts("failed", Some("timeout".to_string())),
            ChannelResult::Failed("timeout".to_string())
        );
        assert_eq!(
            ChannelResult::from_parts("garbage", None),
            ChannelResult::NotAttempted
        );
    }

    #[test]
    fn test_location_validation() {
        assert!(Location::new(19.43, -99.13).is_ok());
        assert!(Location::new(91.0, 0.0).is_err());
        assert!(Location::new(0.0, f64::NAN).is_err());
        assert_eq!(Location::new(1.5, 2.25).unwrap().to_string(), "1.500000,2.250000");
    }

    #[test]
    fn test_snapshot_digest_changes_with_content() {
        let a = DiagnosticSnapshot::new(Vec::new(), Some(80), None);
        let b = DiagnosticSnapshot::new(Vec::new(), Some(79), None);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }

    #[test]
    fn test_snapshot_drops_non_finite_samples() {
        let samples = vec![
            AccelerationSample::new(0.0, 0.0, 9.8),
            AccelerationSample::new(f64::INFINITY, 0.0, 0.0),
            AccelerationSample::new(f64::NAN, 0.0, 9.8),
        ];
        let snapshot = DiagnosticSnapshot::new(samples.clone(), None, None);
        assert_eq!(snapshot.recent_samples.len(), 1);

        let raw = DiagnosticSnapshot {
            recent_samples: samples,
            ..DiagnosticSnapshot::default()
        };
        let event = EmergencyEvent::new(EventSource::CrashDetected, raw);
        assert_eq!(event.snapshot().recent_samples.len(), 1);
        let json = serde_json::to_string(event.snapshot()).unwrap();
        let back: DiagnosticSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recent_samples.len(), 1);
        assert!(event.snapshot_intact());
    }

    #[test]
    fn test_event_serialization() {
        let event = event();
        let json = serde_json::to_string(&event).unwrap();
        let back: EmergencyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert!(back.snapshot_intact());
    }
}
