//! Dead-man's switch.
//!
//! A single countdown that raises a safety timeout unless it is disarmed in
//! time. The deadline is persisted under [`SWITCH_KEY`] so that a restart
//! neither forgets an armed switch nor swallows one that expired while the
//! process was down. The record of an expired switch is kept until the
//! coordinator acknowledges that it turned the timeout into an event.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{self, SharedStorage, Storage};

/// Key of the persisted switch record.
pub const SWITCH_KEY: &str = "safety_switch.active";

/// Longest time a switch may stay armed, measured from now.
pub const MAX_SWITCH_DURATION: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Identifies one arming of the switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchHandle(String);

impl SwitchHandle {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The handle id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SwitchHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SwitchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signals sent to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchSignal {
    /// The deadline is inside the warning window.
    Warning {
        /// The armed switch.
        handle: SwitchHandle,
        /// Why it was armed.
        reason: String,
        /// Time left before expiry.
        remaining: Duration,
    },
    /// The deadline passed without a disarm.
    Timeout {
        /// The expired switch.
        handle: SwitchHandle,
        /// Why it was armed.
        reason: String,
    },
}

/// Public view of the armed switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchStatus {
    /// The armed switch.
    pub handle: SwitchHandle,
    /// Why it was armed.
    pub reason: String,
    /// When it was armed.
    pub armed_at: DateTime<Utc>,
    /// When it expires.
    pub deadline_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SwitchRecord {
    id: SwitchHandle,
    reason: String,
    armed_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
}

impl From<SwitchRecord> for SwitchStatus {
    fn from(record: SwitchRecord) -> Self {
        Self {
            handle: record.id,
            reason: record.reason,
            armed_at: record.armed_at,
            deadline_at: record.deadline_at,
        }
    }
}

/// Read the persisted switch record without starting a countdown.
///
/// # Errors
///
/// Returns an error if the record cannot be read or parsed.
pub fn stored_switch(storage: &Storage) -> Result<Option<SwitchStatus>> {
    let Some(raw) = storage.kv_get(SWITCH_KEY)? else {
        return Ok(None);
    };
    let record: SwitchRecord = serde_json::from_str(&raw)?;
    Ok(Some(record.into()))
}

#[derive(Debug)]
struct Armed {
    record: SwitchRecord,
    deadline: Instant,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct TimerState {
    armed: Option<Armed>,
    last_expired: Option<SwitchHandle>,
    generation: u64,
}

#[derive(Debug)]
struct TimerInner {
    storage: SharedStorage,
    warning_window: Duration,
    signals: mpsc::Sender<SwitchSignal>,
    state: Mutex<TimerState>,
}

/// The dead-man's switch. Cheap to clone; clones share one countdown.
#[derive(Debug, Clone)]
pub struct DeadMansSwitchTimer {
    inner: Arc<TimerInner>,
}

impl DeadMansSwitchTimer {
    /// Create a disarmed timer that reports to `signals`.
    #[must_use]
    pub fn new(
        storage: SharedStorage,
        warning_window: Duration,
        signals: mpsc::Sender<SwitchSignal>,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                storage,
                warning_window,
                signals,
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    /// Arm the switch for `duration_secs`, replacing any armed switch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a zero duration or one longer
    /// than [`MAX_SWITCH_DURATION`], or a storage error if the deadline cannot
    /// be persisted. In every case the previous switch, if any, stays armed.
    pub fn arm(&self, reason: &str, duration_secs: u64) -> Result<SwitchHandle> {
        if duration_secs == 0 {
            return Err(Error::invalid_request("safety check duration must be positive"));
        }
        let duration = Duration::from_secs(duration_secs);
        let armed_at = Utc::now();
        let (deadline_at, deadline) = push_deadline(armed_at, Instant::now(), duration, duration)?;
        let record = SwitchRecord {
            id: SwitchHandle::generate(),
            reason: reason.to_string(),
            armed_at,
            deadline_at,
        };

        self.persist(&record)?;

        let mut state = self.lock_state()?;
        if let Some(previous) = state.armed.take() {
            previous.task.abort();
            info!(handle = %previous.record.id, "Safety check replaced");
        }
        let handle = record.id.clone();
        self.schedule(&mut state, record, deadline);
        info!(handle = %handle, reason, duration_secs, "Safety check armed");
        Ok(handle)
    }

    /// Disarm the switch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExpired`] if this switch already fired, and
    /// [`Error::NotArmed`] if it is unknown or was replaced.
    pub fn disarm(&self, handle: &SwitchHandle) -> Result<()> {
        let mut state = self.lock_state()?;
        match &state.armed {
            Some(armed) if armed.record.id == *handle => {}
            _ if state.last_expired.as_ref() == Some(handle) => {
                return Err(Error::AlreadyExpired {
                    handle: handle.to_string(),
                });
            }
            _ => {
                return Err(Error::NotArmed {
                    handle: handle.to_string(),
                });
            }
        }

        if let Some(armed) = state.armed.take() {
            armed.task.abort();
        }
        state.generation += 1;
        drop(state);

        let storage = storage::lock(&self.inner.storage)?;
        storage.kv_delete(SWITCH_KEY)?;
        info!(handle = %handle, "Safety check disarmed");
        Ok(())
    }

    /// Push the deadline of the armed switch back by `extra_secs`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotArmed`] unless `handle` is the armed switch,
    /// [`Error::InvalidRequest`] if the new deadline would be further away
    /// than [`MAX_SWITCH_DURATION`], or a storage error if the new deadline
    /// cannot be persisted.
    pub fn extend(&self, handle: &SwitchHandle, extra_secs: u64) -> Result<()> {
        let mut state = self.lock_state()?;
        let Some(armed) = state.armed.as_ref().filter(|a| a.record.id == *handle) else {
            return Err(Error::NotArmed {
                handle: handle.to_string(),
            });
        };

        let extra = Duration::from_secs(extra_secs);
        let remaining = armed
            .deadline
            .saturating_duration_since(Instant::now())
            .saturating_add(extra);
        let (deadline_at, deadline) =
            push_deadline(armed.record.deadline_at, armed.deadline, extra, remaining)?;
        let mut record = armed.record.clone();
        record.deadline_at = deadline_at;

        self.persist(&record)?;

        if let Some(armed) = state.armed.take() {
            armed.task.abort();
        }
        self.schedule(&mut state, record, deadline);
        info!(handle = %handle, extra_secs, "Safety check extended");
        Ok(())
    }

    /// The armed switch, if any.
    #[must_use]
    pub fn status(&self) -> Option<SwitchStatus> {
        let state = self.inner.state.lock().ok()?;
        state
            .armed
            .as_ref()
            .map(|armed| SwitchStatus::from(armed.record.clone()))
    }

    /// Resume from the persisted record after a restart.
    ///
    /// A deadline that passed while the process was down fires at once.
    /// Returns the handle of the restored switch, if there was one.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn restore(&self) -> Result<Option<SwitchHandle>> {
        let raw = storage::lock(&self.inner.storage)?.kv_get(SWITCH_KEY)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: SwitchRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "Discarding unreadable safety check record");
                storage::lock(&self.inner.storage)?.kv_delete(SWITCH_KEY)?;
                return Ok(None);
            }
        };

        let handle = record.id.clone();
        let remaining = (record.deadline_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_SWITCH_DURATION);
        if remaining.is_zero() {
            warn!(handle = %handle, deadline = %record.deadline_at, "Safety check expired while stopped");
        } else {
            info!(handle = %handle, remaining_secs = remaining.as_secs(), "Safety check restored");
        }

        let now = Instant::now();
        let deadline = now.checked_add(remaining).unwrap_or(now);

        let mut state = self.lock_state()?;
        if let Some(previous) = state.armed.take() {
            previous.task.abort();
        }
        self.schedule(&mut state, record, deadline);
        Ok(Some(handle))
    }

    /// Forget the persisted record of an expired switch.
    ///
    /// Called once its timeout has been turned into an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or deleted.
    pub fn acknowledge(&self, handle: &SwitchHandle) -> Result<()> {
        let state = self.lock_state()?;
        if state.armed.as_ref().is_some_and(|a| a.record.id == *handle) {
            return Ok(());
        }
        drop(state);

        let storage = storage::lock(&self.inner.storage)?;
        let stored = storage
            .kv_get(SWITCH_KEY)?
            .and_then(|raw| serde_json::from_str::<SwitchRecord>(&raw).ok());
        if stored.is_some_and(|r| r.id == *handle) {
            storage.kv_delete(SWITCH_KEY)?;
            debug!(handle = %handle, "Expired safety check acknowledged");
        }
        Ok(())
    }

    /// Stop the countdown task without touching the persisted record.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if let Some(armed) = state.armed.take() {
                armed.task.abort();
            }
            state.generation += 1;
        }
    }

    fn persist(&self, record: &SwitchRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        storage::lock(&self.inner.storage)?.kv_put(SWITCH_KEY, &json)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, TimerState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| Error::internal("safety timer lock poisoned"))
    }

    fn schedule(&self, state: &mut TimerState, record: SwitchRecord, deadline: Instant) {
        state.generation += 1;
        let generation = state.generation;
        let task = tokio::spawn(countdown(
            Arc::clone(&self.inner),
            generation,
            record.id.clone(),
            record.reason.clone(),
            deadline,
        ));
        state.armed = Some(Armed {
            record,
            deadline,
            task,
        });
    }
}

async fn countdown(
    inner: Arc<TimerInner>,
    generation: u64,
    handle: SwitchHandle,
    reason: String,
    deadline: Instant,
) {
    if !inner.warning_window.is_zero() {
        let warn_at = deadline
            .checked_sub(inner.warning_window)
            .unwrap_or(deadline);
        sleep_until(warn_at).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            debug!(handle = %handle, remaining_secs = remaining.as_secs(), "Safety check warning");
            let _ = inner
                .signals
                .send(SwitchSignal::Warning {
                    handle: handle.clone(),
                    reason: reason.clone(),
                    remaining,
                })
                .await;
        }
    }

    sleep_until(deadline).await;

    {
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        if state.generation != generation {
            return;
        }
        state.armed = None;
        state.last_expired = Some(handle.clone());
    }

    warn!(handle = %handle, reason = %reason, "Safety check expired");
    if inner
        .signals
        .send(SwitchSignal::Timeout { handle, reason })
        .await
        .is_err()
    {
        error!("Safety timeout raised but nobody is listening");
    }
}

/// Move both clocks of a deadline forward by `by`.
///
/// `horizon` is how far from now the result lands; past
/// [`MAX_SWITCH_DURATION`], or on clock overflow, the request is refused.
fn push_deadline(
    wall: DateTime<Utc>,
    monotonic: Instant,
    by: Duration,
    horizon: Duration,
) -> Result<(DateTime<Utc>, Instant)> {
    let too_far = || {
        Error::invalid_request(format!(
            "safety check deadline more than {}s away",
            MAX_SWITCH_DURATION.as_secs()
        ))
    };
    if horizon > MAX_SWITCH_DURATION {
        return Err(too_far());
    }
    let wall = chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| wall.checked_add_signed(by))
        .ok_or_else(too_far)?;
    let monotonic = monotonic.checked_add(by).ok_or_else(too_far)?;
    Ok((wall, monotonic))
}
