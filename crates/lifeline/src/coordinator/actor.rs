//! The coordinator actor: the one place the active event is mutated.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::{Command, CoordinatorSnapshot, CoordinatorUpdate, EventHandle, Signal};
use crate::config::{CoordinatorConfig, DetectorConfig, RepeatCrashPolicy, MAX_COUNTDOWN};
use crate::detector::{CrashSuspected, SensorAnomalyDetector};
use crate::error::{Error, Result};
use crate::event::{DiagnosticSnapshot, EmergencyEvent, EventId, EventSource, EventStatus, Location};
use crate::host::HostServices;
use crate::queue::{AlertQueue, DeliveryUpdate};
use crate::safety::{DeadMansSwitchTimer, SwitchHandle, SwitchSignal};

const INTERNAL_CAPACITY: usize = 32;

/// Delay before retrying an enqueue that failed to persist.
const PERSIST_RETRY: Duration = Duration::from_secs(2);

/// Messages the actor sends itself from helper tasks.
#[derive(Debug)]
pub(super) enum Internal {
    CountdownTick { generation: u64, remaining_secs: u64 },
    CountdownExpired { generation: u64 },
    Located { id: EventId, location: Option<Location> },
    RetryPersist { id: EventId },
}

#[derive(Debug)]
struct Countdown {
    generation: u64,
    total: Duration,
    deadline: Instant,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct ActiveEvent {
    event: EmergencyEvent,
    countdown: Option<Countdown>,
    /// Whether the queue holds the event.
    durable: bool,
    location_pending: bool,
    /// Expired switches to acknowledge once the event is durable.
    pending_acks: Vec<SwitchHandle>,
}

impl ActiveEvent {
    fn new(event: EmergencyEvent) -> Self {
        Self {
            event,
            countdown: None,
            durable: false,
            location_pending: false,
            pending_acks: Vec::new(),
        }
    }

    fn handle(&self, merged: bool) -> EventHandle {
        EventHandle {
            id: self.event.id.clone(),
            status: self.event.status,
            merged,
        }
    }
}

#[derive(Debug)]
pub(super) struct Actor {
    config: CoordinatorConfig,
    detector: SensorAnomalyDetector,
    device_id: Option<String>,
    queue: AlertQueue,
    host: HostServices,
    timer: DeadMansSwitchTimer,
    updates: broadcast::Sender<CoordinatorUpdate>,
    internal: mpsc::Sender<Internal>,
    active: Option<ActiveEvent>,
    generation: u64,
}

impl Actor {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: CoordinatorConfig,
        detector: DetectorConfig,
        device_id: Option<String>,
        queue: AlertQueue,
        host: HostServices,
        timer: DeadMansSwitchTimer,
        updates: broadcast::Sender<CoordinatorUpdate>,
    ) -> (Self, mpsc::Receiver<Internal>) {
        let (internal, internal_rx) = mpsc::channel(INTERNAL_CAPACITY);
        let actor = Self {
            config,
            detector: SensorAnomalyDetector::new(detector),
            device_id,
            queue,
            host,
            timer,
            updates,
            internal,
            active: None,
            generation: 0,
        };
        (actor, internal_rx)
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
        mut switch_signals: mpsc::Receiver<SwitchSignal>,
    ) {
        let mut deliveries = self.queue.subscribe();
        self.adopt_pending();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(message) = internal.recv() => self.on_internal(message),
                Some(signal) = switch_signals.recv() => self.on_switch(signal),
                update = deliveries.recv() => match update {
                    Ok(update) => self.on_delivery(update),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Delivery updates lagged, resyncing");
                        self.resync();
                    }
                    Err(RecvError::Closed) => {
                        error!("Alert queue closed its update stream");
                        break;
                    }
                },
            }
        }

        if let Some(countdown) = self.active.as_mut().and_then(|a| a.countdown.take()) {
            countdown.task.abort();
        }
        self.timer.shutdown();
        info!("Emergency coordinator stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Signal { signal, reply } => {
                let result = match signal {
                    Signal::Crash(crash) => self.on_signal(EventSource::CrashDetected, Some(crash), None),
                    Signal::Manual => self.on_signal(EventSource::UserInitiated, None, None),
                };
                let _ = reply.send(result);
            }
            Command::Sample { sample, reply } => {
                let handle = self.detector.ingest(sample).and_then(|crash| {
                    self.on_signal(EventSource::CrashDetected, Some(crash), None)
                        .map_err(|err| error!(error = %err, "Failed to raise crash event"))
                        .ok()
                });
                let _ = reply.send(handle);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel());
            }
            Command::Confirm { reply } => {
                let _ = reply.send(self.confirm());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::CountdownTick {
                generation,
                remaining_secs,
            } => {
                if self.countdown_generation() == Some(generation) {
                    if let Some(id) = self.active_id() {
                        self.publish(CoordinatorUpdate::CountdownTick { id, remaining_secs });
                    }
                }
            }
            Internal::CountdownExpired { generation } => {
                if self.countdown_generation() == Some(generation) {
                    debug!("Countdown expired");
                    self.dispatch();
                } else {
                    debug!(generation, "Ignoring stale countdown");
                }
            }
            Internal::Located { id, location } => self.on_located(&id, location),
            Internal::RetryPersist { id } => {
                if self
                    .active
                    .as_ref()
                    .is_some_and(|a| a.event.id == id && !a.durable)
                {
                    self.persist_active();
                }
            }
        }
    }

    fn on_switch(&mut self, signal: SwitchSignal) {
        match signal {
            SwitchSignal::Warning {
                handle,
                reason,
                remaining,
            } => {
                let remaining_secs = remaining.as_secs();
                self.notify(
                    "Safety check expiring",
                    &format!("{reason}: check in within {remaining_secs}s or an alert is sent"),
                );
                self.publish(CoordinatorUpdate::SafetyWarning {
                    handle,
                    reason,
                    remaining_secs,
                });
            }
            SwitchSignal::Timeout { handle, reason } => {
                info!(handle = %handle, reason = %reason, "Safety check expired, raising emergency");
                if let Err(err) = self.on_signal(EventSource::SafetyTimeout, None, Some(handle)) {
                    error!(error = %err, "Failed to raise safety timeout event");
                }
            }
        }
    }

    fn on_signal(
        &mut self,
        source: EventSource,
        crash: Option<CrashSuspected>,
        switch: Option<SwitchHandle>,
    ) -> Result<EventHandle> {
        let Some(active) = self.active.as_mut() else {
            return self.open_event(source, crash, switch);
        };
        let status = active.event.status;
        active.pending_acks.extend(switch);

        self.merge(source);
        match (status, source) {
            (EventStatus::Confirming, EventSource::SafetyTimeout) => {
                info!("Safety timeout during countdown, dispatching now");
                self.dispatch();
            }
            (EventStatus::Confirming, EventSource::CrashDetected) => self.repeat_crash(),
            _ => {}
        }
        self.settle_acks();

        self.active
            .as_ref()
            .map(|a| a.handle(true))
            .ok_or(Error::NoActiveEvent)
    }

    fn open_event(
        &mut self,
        source: EventSource,
        crash: Option<CrashSuspected>,
        switch: Option<SwitchHandle>,
    ) -> Result<EventHandle> {
        let samples = crash.map(|c| c.recent_samples).unwrap_or_default();
        let battery = self.host.battery.as_ref().and_then(|gauge| gauge.battery_level());
        let snapshot = DiagnosticSnapshot::new(samples, battery, self.device_id.clone());
        let event = EmergencyEvent::new(source, snapshot);
        let countdown = self.config.countdown_for(source);
        info!(
            event_id = %event.id,
            %source,
            countdown_secs = countdown.as_secs(),
            "Emergency event created"
        );

        let mut active = ActiveEvent::new(event);
        active.pending_acks.extend(switch);
        let id = active.event.id.clone();

        if source == EventSource::SafetyTimeout || countdown.is_zero() {
            self.active = Some(active);
            self.dispatch();
        } else {
            // Pending -> Confirming is always allowed.
            let _ = active.event.transition(EventStatus::Confirming);
            self.active = Some(active);
            self.start_countdown(countdown);
            self.publish(CoordinatorUpdate::CountdownStarted {
                id,
                source,
                seconds: countdown.as_secs(),
            });
            self.notify(
                "Emergency detected",
                &format!("Alerting emergency services in {}s unless cancelled", countdown.as_secs()),
            );
        }

        self.active
            .as_ref()
            .map(|a| a.handle(false))
            .ok_or_else(|| Error::internal("active slot empty after opening an event"))
    }

    fn merge(&mut self, source: EventSource) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.event.merged_signals = active.event.merged_signals.saturating_add(1);
        let id = active.event.id.clone();
        let merged = active.event.merged_signals;
        let durable = active.durable;

        info!(event_id = %id, %source, merged, "Signal merged into active event");
        if durable {
            if let Err(err) = self.queue.set_merged_signals(&id, merged) {
                warn!(event_id = %id, error = %err, "Failed to persist merged signal count");
            }
        }
        self.publish(CoordinatorUpdate::SignalMerged {
            id,
            source,
            merged_signals: merged,
        });
    }

    fn repeat_crash(&mut self) {
        match self.config.repeat_crash_policy {
            RepeatCrashPolicy::Ignore => debug!("Repeated crash ignored by policy"),
            RepeatCrashPolicy::Reset => {
                let current = self
                    .active
                    .as_ref()
                    .and_then(|a| a.countdown.as_ref())
                    .map_or(Duration::ZERO, |c| c.total);
                let total = current.max(self.config.countdown_for(EventSource::CrashDetected));
                self.start_countdown(total);
                if let Some(id) = self.active_id() {
                    info!(event_id = %id, seconds = total.as_secs(), "Countdown reset by repeated crash");
                    self.publish(CoordinatorUpdate::CountdownReset {
                        id,
                        seconds: total.as_secs(),
                    });
                }
            }
        }
    }

    fn start_countdown(&mut self, total: Duration) {
        let total = total.min(MAX_COUNTDOWN);
        let now = Instant::now();
        let deadline = now.checked_add(total).unwrap_or(now);
        self.generation += 1;
        let generation = self.generation;
        let task = tokio::spawn(run_countdown(
            generation,
            total.as_secs(),
            self.internal.clone(),
        ));
        let countdown = Countdown {
            generation,
            total,
            deadline,
            task,
        };
        match self.active.as_mut() {
            Some(active) => {
                if let Some(previous) = active.countdown.replace(countdown) {
                    previous.task.abort();
                }
            }
            None => countdown.task.abort(),
        }
    }

    fn cancel(&mut self) -> Result<()> {
        if !self.is_confirming() {
            return Err(Error::NoActiveEvent);
        }
        let Some(mut active) = self.active.take() else {
            return Err(Error::NoActiveEvent);
        };
        if let Some(countdown) = active.countdown.take() {
            countdown.task.abort();
        }
        active.event.transition(EventStatus::Cancelled)?;
        self.generation += 1;
        self.detector.reset();

        // The user responded, so an expired switch behind this event is settled.
        for handle in &active.pending_acks {
            if let Err(err) = self.timer.acknowledge(handle) {
                warn!(handle = %handle, error = %err, "Failed to clear expired safety check");
            }
        }

        let id = active.event.id;
        info!(event_id = %id, "Emergency cancelled by user");
        self.notify("Emergency cancelled", "No alert was sent");
        self.publish(CoordinatorUpdate::Cancelled { id });
        self.publish(CoordinatorUpdate::Idle);
        Ok(())
    }

    fn confirm(&mut self) -> Result<EventHandle> {
        if !self.is_confirming() {
            return Err(Error::NoActiveEvent);
        }
        info!("Countdown skipped by user");
        self.dispatch();
        self.active
            .as_ref()
            .map(|a| a.handle(false))
            .ok_or(Error::NoActiveEvent)
    }

    /// Move the active event to `Dispatching` and hand it to the queue.
    fn dispatch(&mut self) {
        let wants_location = self.host.location.is_some();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(countdown) = active.countdown.take() {
            countdown.task.abort();
        }
        if let Err(err) = active.event.transition(EventStatus::Dispatching) {
            error!(error = %err, "Refusing to dispatch");
            return;
        }
        active.location_pending = wants_location;
        let id = active.event.id.clone();
        let source = active.event.source;

        info!(event_id = %id, %source, "Dispatching emergency event");
        self.publish(CoordinatorUpdate::Dispatching {
            id: id.clone(),
            source,
        });
        self.notify("Sending emergency alert", "Contacting emergency services");

        self.persist_active();
        if wants_location {
            self.fetch_location(id);
        }
    }

    /// Enqueue the active event. On failure the event stays in the slot and
    /// the enqueue is retried.
    fn persist_active(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let id = active.event.id.clone();

        match self.queue.enqueue(active.event.clone()) {
            Ok(ack) => {
                active.durable = true;
                active.event.channels = ack.record.channels;
                if !ack.newly_queued {
                    if let Some(location) = active.event.location {
                        if let Err(err) = self.queue.set_location(&id, location) {
                            warn!(event_id = %id, error = %err, "Failed to persist location");
                        }
                    }
                }
                let flush_now = !active.location_pending;
                self.settle_acks();
                if flush_now {
                    self.spawn_flush();
                }
            }
            Err(err) => {
                error!(event_id = %id, error = %err, "Emergency event not persisted, retrying");
                self.publish(CoordinatorUpdate::PersistenceFailed {
                    id: id.clone(),
                    error: err.to_string(),
                });
                self.notify(
                    "Emergency alert not saved",
                    "Retrying. If you are in danger, call emergency services directly",
                );
                let internal = self.internal.clone();
                tokio::spawn(async move {
                    sleep(PERSIST_RETRY).await;
                    let _ = internal.send(Internal::RetryPersist { id }).await;
                });
            }
        }
    }

    fn fetch_location(&self, id: EventId) {
        let Some(provider) = self.host.location.clone() else {
            return;
        };
        let timeout = self.config.location_timeout();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let location = tokio::time::timeout(timeout, provider.get_location(timeout))
                .await
                .ok()
                .flatten();
            if location.is_none() {
                warn!(event_id = %id, "Location unavailable, dispatching without coordinates");
            }
            let _ = internal.send(Internal::Located { id, location }).await;
        });
    }

    fn on_located(&mut self, id: &EventId, location: Option<Location>) {
        let Some(active) = self.active.as_mut().filter(|a| a.event.id == *id) else {
            return;
        };
        active.location_pending = false;
        active.event.location = location;
        let durable = active.durable;

        self.publish(CoordinatorUpdate::Located {
            id: id.clone(),
            location,
        });
        // Not durable yet: the location rides along with the next enqueue.
        if !durable {
            return;
        }
        if let Some(location) = location {
            if let Err(err) = self.queue.set_location(id, location) {
                warn!(event_id = %id, error = %err, "Failed to persist location");
            }
        }
        self.spawn_flush();
    }

    fn on_delivery(&mut self, update: DeliveryUpdate) {
        match update {
            DeliveryUpdate::ChannelReported {
                id,
                channel,
                result,
            } => {
                if let Some(active) = self.active.as_mut().filter(|a| a.event.id == id) {
                    active.event.record_result(channel, result.clone());
                }
                self.publish(CoordinatorUpdate::ChannelReported {
                    id,
                    channel,
                    result,
                });
            }
            DeliveryUpdate::Delivered { id } => self.finish(id, EventStatus::Delivered),
            DeliveryUpdate::Abandoned { id } => self.finish(id, EventStatus::Abandoned),
        }
    }

    fn finish(&mut self, id: EventId, status: EventStatus) {
        if status == EventStatus::Delivered {
            self.notify("Emergency alert delivered", "Help has been notified");
            self.publish(CoordinatorUpdate::Delivered { id: id.clone() });
        } else {
            self.notify(
                "Emergency alert could not be delivered",
                "Call emergency services directly",
            );
            self.publish(CoordinatorUpdate::Abandoned { id: id.clone() });
        }

        if self.active.as_ref().is_some_and(|a| a.event.id == id) {
            self.active = None;
            self.detector.reset();
            debug!(event_id = %id, %status, "Active slot cleared");
            self.publish(CoordinatorUpdate::Idle);
        }
    }

    /// Reconcile the slot with the queue after missed updates.
    fn resync(&mut self) {
        let Some(id) = self
            .active
            .as_ref()
            .filter(|a| a.durable)
            .map(|a| a.event.id.clone())
        else {
            return;
        };
        match self.queue.get(&id) {
            Ok(Some(stored)) if stored.status.is_terminal() => self.finish(id, stored.status),
            Ok(_) => {}
            Err(err) => warn!(event_id = %id, error = %err, "Resync failed"),
        }
    }

    /// Adopt an event left dispatching by a previous run, then flush.
    fn adopt_pending(&mut self) {
        match self.queue.pending() {
            Ok(pending) => {
                if let Some(event) = pending.into_iter().last() {
                    info!(event_id = %event.id, "Adopted in-flight emergency event");
                    let id = event.id.clone();
                    let source = event.source;
                    let mut active = ActiveEvent::new(event);
                    active.durable = true;
                    self.active = Some(active);
                    self.publish(CoordinatorUpdate::Dispatching { id, source });
                }
            }
            Err(err) => error!(error = %err, "Failed to load in-flight events"),
        }
        self.spawn_flush();
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        let Some(active) = &self.active else {
            return CoordinatorSnapshot {
                active: None,
                countdown_remaining: None,
                durable: false,
                safety: None,
            };
        };
        let mut event = active.event.clone();
        if active.durable {
            if let Ok(Some(stored)) = self.queue.get(&event.id) {
                event.channels = stored.channels;
            }
        }
        CoordinatorSnapshot {
            active: Some(event),
            countdown_remaining: active
                .countdown
                .as_ref()
                .map(|c| c.deadline.saturating_duration_since(Instant::now())),
            durable: active.durable,
            safety: None,
        }
    }

    fn settle_acks(&mut self) {
        let handles = match self.active.as_mut() {
            Some(active) if active.durable => std::mem::take(&mut active.pending_acks),
            _ => return,
        };
        for handle in handles {
            if let Err(err) = self.timer.acknowledge(&handle) {
                warn!(handle = %handle, error = %err, "Failed to clear expired safety check");
            }
        }
    }

    fn spawn_flush(&self) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(err) = queue.flush().await {
                error!(error = %err, "Flush failed");
            }
        });
    }

    fn is_confirming(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.event.status == EventStatus::Confirming)
    }

    fn active_id(&self) -> Option<EventId> {
        self.active.as_ref().map(|a| a.event.id.clone())
    }

    fn countdown_generation(&self) -> Option<u64> {
        self.active
            .as_ref()
            .and_then(|a| a.countdown.as_ref())
            .map(|c| c.generation)
    }

    fn notify(&self, title: &str, body: &str) {
        if let Some(notifier) = &self.host.notifier {
            if let Err(err) = notifier.notify(title, body) {
                warn!(error = %err, "Notification failed");
            }
        }
    }

    fn publish(&self, update: CoordinatorUpdate) {
        let _ = self.updates.send(update);
    }
}

/// Tick once a second, then report expiry.
async fn run_countdown(generation: u64, seconds: u64, internal: mpsc::Sender<Internal>) {
    for remaining_secs in (0..seconds).rev() {
        sleep(Duration::from_secs(1)).await;
        let message = if remaining_secs == 0 {
            Internal::CountdownExpired { generation }
        } else {
            Internal::CountdownTick {
                generation,
                remaining_secs,
            }
        };
        if internal.send(message).await.is_err() {
            return;
        }
    }
}
