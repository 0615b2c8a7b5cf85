//! Durable store-and-forward queue for emergency events.
//!
//! An event is a queue member while its persisted status is `dispatching`.
//! Each flush pass attempts every channel that is neither settled nor
//! exhausted, persisting each outcome the moment it arrives. A channel that
//! reported `sent` is never attempted again, including after a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channels::{ChannelOutcome, DispatchChannel};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::event::{ChannelKind, ChannelResult, ChannelState, EmergencyEvent, EventId, EventStatus, Location};
use crate::storage::{self, LogLevel, SharedStorage, Storage};

const UPDATE_CAPACITY: usize = 64;

/// Acknowledgement of an [`AlertQueue::enqueue`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// `false` if the id was already queued; `record` is then the stored copy.
    pub newly_queued: bool,
    /// The event as persisted.
    pub record: EmergencyEvent,
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Events examined.
    pub events: usize,
    /// Channel sends started.
    pub attempted: usize,
    /// Sends that reported `Sent`.
    pub sent: usize,
    /// Sends that failed and may be retried.
    pub failed: usize,
    /// Channels marked unsupported.
    pub unsupported: usize,
    /// Channels skipped because their precondition did not hold.
    pub skipped: usize,
    /// Channels still waiting out their backoff.
    pub deferred: usize,
    /// Events that reached `Delivered` in this pass.
    pub delivered: Vec<EventId>,
    /// Events that reached `Abandoned` in this pass.
    pub abandoned: Vec<EventId>,
}

/// Progress reported to subscribers as flushes run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryUpdate {
    /// A channel attempt finished or the channel was ruled out.
    ChannelReported {
        /// The event.
        id: EventId,
        /// The channel.
        channel: ChannelKind,
        /// Its new result.
        result: ChannelResult,
    },
    /// First successful channel; the event left the queue.
    Delivered {
        /// The event.
        id: EventId,
    },
    /// Every channel is exhausted; the event left the queue undelivered.
    Abandoned {
        /// The event.
        id: EventId,
    },
}

struct Inner {
    storage: SharedStorage,
    channels: Vec<Arc<dyn DispatchChannel>>,
    config: QueueConfig,
    flush_guard: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<DeliveryUpdate>,
    flush_passes: AtomicU64,
}

/// Store-and-forward queue. Cheap to clone.
#[derive(Clone)]
pub struct AlertQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AlertQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<ChannelKind> = self.inner.channels.iter().map(|c| c.kind()).collect();
        f.debug_struct("AlertQueue")
            .field("channels", &kinds)
            .field("config", &self.inner.config)
            .field("flush_passes", &self.flush_passes())
            .finish_non_exhaustive()
    }
}

impl AlertQueue {
    /// Create a queue over `storage` delivering through `channels`.
    #[must_use]
    pub fn new(
        storage: SharedStorage,
        channels: Vec<Arc<dyn DispatchChannel>>,
        config: QueueConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                storage,
                channels,
                config,
                flush_guard: tokio::sync::Mutex::new(()),
                updates,
                flush_passes: AtomicU64::new(0),
            }),
        }
    }

    /// Channels this queue delivers through.
    #[must_use]
    pub fn channel_kinds(&self) -> Vec<ChannelKind> {
        self.inner.channels.iter().map(|c| c.kind()).collect()
    }

    /// Receive delivery progress.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.inner.updates.subscribe()
    }

    /// Number of flush passes started so far.
    #[must_use]
    pub fn flush_passes(&self) -> u64 {
        self.inner.flush_passes.load(Ordering::SeqCst)
    }

    /// Persist a dispatching event.
    ///
    /// Idempotent by id: if the event is already stored nothing is written
    /// and the stored record is returned. The call returns only after the
    /// record is durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for events that are not dispatching,
    /// and [`Error::QueuePersistence`] if the write fails.
    pub fn enqueue(&self, mut event: EmergencyEvent) -> Result<Ack> {
        if event.status != EventStatus::Dispatching {
            return Err(Error::invalid_request(format!(
                "event {} is {}, only dispatching events can be queued",
                event.id, event.status
            )));
        }
        for channel in &self.inner.channels {
            event.channels.entry(channel.kind()).or_default();
        }

        let id = event.id.clone();
        let inserted = self
            .with_storage(|s| s.insert_event_if_absent(&event))
            .map_err(|e| Error::persistence(id.as_str(), "enqueue", e))?;

        if inserted {
            info!(event_id = %id, source = %event.source, "Event queued for dispatch");
            self.audit(&id, LogLevel::Info, "enqueued", &format!("queued from {}", event.source));
            return Ok(Ack {
                newly_queued: true,
                record: event,
            });
        }

        let existing = self
            .with_storage(|s| s.get_event(&id))
            .map_err(|e| Error::persistence(id.as_str(), "enqueue", e))?
            .ok_or_else(|| Error::internal(format!("event {id} vanished during enqueue")))?;
        debug!(event_id = %id, "Event already queued");
        Ok(Ack {
            newly_queued: false,
            record: existing,
        })
    }

    /// Attach coordinates to a queued event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueuePersistence`] if the write fails.
    pub fn set_location(&self, id: &EventId, location: Location) -> Result<()> {
        self.with_storage(|s| s.set_location(id, location))
            .map_err(|e| Error::persistence(id.as_str(), "set location", e))?;
        self.audit(id, LogLevel::Info, "location", &format!("located at {location}"));
        Ok(())
    }

    /// Persist the merged-signal counter of a queued event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueuePersistence`] if the write fails.
    pub fn set_merged_signals(&self, id: &EventId, merged: u32) -> Result<()> {
        self.with_storage(|s| s.set_merged_signals(id, merged))
            .map_err(|e| Error::persistence(id.as_str(), "merge signal", e))?;
        self.audit(id, LogLevel::Info, "merged", &format!("{merged} later signal(s) merged"));
        Ok(())
    }

    /// Get an event by id, queued or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn get(&self, id: &EventId) -> Result<Option<EmergencyEvent>> {
        self.with_storage(|s| s.get_event(id))
    }

    /// Whether `id` is currently a queue member.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn contains(&self, id: &EventId) -> Result<bool> {
        Ok(self
            .get(id)?
            .is_some_and(|e| e.status == EventStatus::Dispatching))
    }

    /// Events still waiting for delivery, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn pending(&self) -> Result<Vec<EmergencyEvent>> {
        self.with_storage(|s| s.events_by_status(EventStatus::Dispatching))
    }

    /// Run one flush pass now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueuePersistence`] if an outcome cannot be persisted.
    pub async fn flush(&self) -> Result<FlushReport> {
        self.flush_at(Utc::now()).await
    }

    /// Run one flush pass as of `now`.
    ///
    /// Passes are serialized; a call made while another pass runs waits for
    /// it and then runs its own. Records that cannot be decoded are logged by
    /// storage and left out of the pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueuePersistence`] if an outcome cannot be persisted.
    pub async fn flush_at(&self, now: DateTime<Utc>) -> Result<FlushReport> {
        let _pass = self.inner.flush_guard.lock().await;
        let pass = self.inner.flush_passes.fetch_add(1, Ordering::SeqCst) + 1;

        let pending = self
            .pending()
            .map_err(|e| Error::persistence("*", "load pending", e))?;
        debug!(pass, pending = pending.len(), "Flush pass started");

        let mut report = FlushReport::default();
        for event in pending {
            report.events += 1;
            self.flush_event(event, now, &mut report).await?;
        }

        if report.attempted > 0 || !report.delivered.is_empty() || !report.abandoned.is_empty() {
            info!(
                pass,
                events = report.events,
                attempted = report.attempted,
                sent = report.sent,
                failed = report.failed,
                delivered = report.delivered.len(),
                abandoned = report.abandoned.len(),
                "Flush pass finished"
            );
        }
        Ok(report)
    }

    async fn flush_event(
        &self,
        mut event: EmergencyEvent,
        now: DateTime<Utc>,
        report: &mut FlushReport,
    ) -> Result<()> {
        // Sent before a crash but not yet finalized.
        if event.any_sent() {
            return self.finish(&mut event, EventStatus::Delivered, report);
        }

        let max_attempts = self.inner.config.max_attempts;
        let send_timeout = self.inner.config.send_timeout();
        let mut in_flight = JoinSet::new();

        for channel in &self.inner.channels {
            let kind = channel.kind();
            let state = event.channel(kind);
            if state.result.is_settled() || state.attempts >= max_attempts {
                continue;
            }
            if !channel.is_supported() {
                self.apply(&mut event, kind, ChannelOutcome::Unsupported, false, now, report)?;
                continue;
            }
            if state.next_attempt_at.is_some_and(|at| at > now) {
                report.deferred += 1;
                continue;
            }
            if !channel.precondition() {
                debug!(event_id = %event.id, channel = %kind, "Precondition not met, skipping");
                report.skipped += 1;
                continue;
            }

            let channel = Arc::clone(channel);
            let copy = event.clone();
            in_flight.spawn(async move {
                let outcome = match tokio::time::timeout(send_timeout, channel.send(&copy)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ChannelOutcome::Failed(format!(
                        "timed out after {}s",
                        send_timeout.as_secs()
                    )),
                };
                (kind, outcome)
            });
            report.attempted += 1;
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((kind, outcome)) => self.apply(&mut event, kind, outcome, true, now, report)?,
                Err(err) => warn!(event_id = %event.id, error = %err, "Channel task failed"),
            }
        }

        if event.status == EventStatus::Dispatching && self.exhausted(&event) {
            self.finish(&mut event, EventStatus::Abandoned, report)?;
        }
        Ok(())
    }

    /// Persist one channel outcome, then finalize the event on first success.
    fn apply(
        &self,
        event: &mut EmergencyEvent,
        kind: ChannelKind,
        outcome: ChannelOutcome,
        counted: bool,
        now: DateTime<Utc>,
        report: &mut FlushReport,
    ) -> Result<()> {
        let previous = event.channel(kind);
        let attempts = if counted {
            previous.attempts.saturating_add(1)
        } else {
            previous.attempts
        };
        let result = ChannelResult::from(outcome);
        let next_attempt_at = match &result {
            ChannelResult::Failed(_) if attempts < self.inner.config.max_attempts => {
                let delay = self.inner.config.backoff_delay(attempts);
                let delay =
                    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
                Some(now + delay)
            }
            _ => None,
        };
        let state = ChannelState {
            result: result.clone(),
            attempts,
            next_attempt_at,
            last_attempt_at: if counted {
                Some(now)
            } else {
                previous.last_attempt_at
            },
        };

        self.with_storage(|s| s.record_attempt(&event.id, kind, &state))
            .map_err(|e| Error::persistence(event.id.as_str(), "record attempt", e))?;
        event.channels.insert(kind, state);

        match &result {
            ChannelResult::Sent => {
                report.sent += 1;
                self.audit(&event.id, LogLevel::Info, "attempt", &format!("{kind} sent"));
            }
            ChannelResult::Failed(reason) => {
                report.failed += 1;
                let level = if attempts >= self.inner.config.max_attempts {
                    LogLevel::Error
                } else {
                    LogLevel::Warn
                };
                self.audit(
                    &event.id,
                    level,
                    "attempt",
                    &format!("{kind} failed (attempt {attempts}): {reason}"),
                );
            }
            ChannelResult::Unsupported => {
                report.unsupported += 1;
                self.audit(&event.id, LogLevel::Warn, "attempt", &format!("{kind} unsupported"));
            }
            ChannelResult::NotAttempted => {}
        }

        let _ = self.inner.updates.send(DeliveryUpdate::ChannelReported {
            id: event.id.clone(),
            channel: kind,
            result: result.clone(),
        });

        if result == ChannelResult::Sent && event.status == EventStatus::Dispatching {
            self.finish(event, EventStatus::Delivered, report)?;
        }
        Ok(())
    }

    /// Whether no registered channel can make further progress.
    fn exhausted(&self, event: &EmergencyEvent) -> bool {
        let max_attempts = self.inner.config.max_attempts;
        self.inner.channels.iter().all(|channel| {
            let state = event.channel(channel.kind());
            state.result.is_settled() || state.attempts >= max_attempts
        })
    }

    fn finish(
        &self,
        event: &mut EmergencyEvent,
        status: EventStatus,
        report: &mut FlushReport,
    ) -> Result<()> {
        event.transition(status)?;
        self.with_storage(|s| s.set_status(&event.id, status))
            .map_err(|e| Error::persistence(event.id.as_str(), "finalize", e))?;

        let update = match status {
            EventStatus::Delivered => {
                info!(event_id = %event.id, "Event delivered");
                self.audit(&event.id, LogLevel::Info, "delivered", "delivered through at least one channel");
                report.delivered.push(event.id.clone());
                DeliveryUpdate::Delivered {
                    id: event.id.clone(),
                }
            }
            _ => {
                warn!(event_id = %event.id, "Event abandoned, every channel exhausted");
                self.audit(
                    &event.id,
                    LogLevel::Error,
                    "abandoned",
                    "could not be confirmed delivered; contact emergency services directly",
                );
                report.abandoned.push(event.id.clone());
                DeliveryUpdate::Abandoned {
                    id: event.id.clone(),
                }
            }
        };
        let _ = self.inner.updates.send(update);
        Ok(())
    }

    fn with_storage<T>(&self, f: impl FnOnce(&Storage) -> Result<T>) -> Result<T> {
        let guard = storage::lock(&self.inner.storage)?;
        f(&guard)
    }

    /// Append to the audit trail. The trail is diagnostic; failures are logged.
    fn audit(&self, id: &EventId, level: LogLevel, action: &str, message: &str) {
        if let Err(err) = self.with_storage(|s| s.append_log(id, level, action, message)) {
            warn!(event_id = %id, error = %err, "Failed to write event log");
        }
    }
}
