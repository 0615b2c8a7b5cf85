//! The emergency coordinator.
//!
//! All signal sources (samples, external crash reports, the dead-man's switch,
//! the SOS button, and queue progress) are funnelled into one actor task that
//! owns the single active [`EmergencyEvent`]. Callers talk to it through a
//! cloneable [`CoordinatorHandle`]; state changes are published as
//! [`CoordinatorUpdate`]s.

mod actor;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, CoordinatorConfig, DetectorConfig};
use crate::detector::{AccelerationSample, CrashSuspected};
use crate::error::{Error, Result};
use crate::event::{ChannelKind, ChannelResult, EmergencyEvent, EventId, EventSource, EventStatus, Location};
use crate::host::HostServices;
use crate::queue::AlertQueue;
use crate::safety::{DeadMansSwitchTimer, SwitchHandle, SwitchSignal, SwitchStatus};
use crate::storage::SharedStorage;

use actor::Actor;

const COMMAND_CAPACITY: usize = 64;
const UPDATE_CAPACITY: usize = 128;
const SWITCH_CAPACITY: usize = 16;

/// A signal raised outside the built-in detector.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A crash reported by the host's own detection.
    Crash(CrashSuspected),
    /// The user pressed SOS.
    Manual,
}

/// State changes published for UI rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorUpdate {
    /// No active event.
    Idle,
    /// A new event entered its confirmation countdown.
    CountdownStarted {
        /// The event.
        id: EventId,
        /// What raised it.
        source: EventSource,
        /// Countdown length.
        seconds: u64,
    },
    /// One second of the countdown elapsed.
    CountdownTick {
        /// The event.
        id: EventId,
        /// Seconds left.
        remaining_secs: u64,
    },
    /// A repeated signal restarted the countdown.
    CountdownReset {
        /// The event.
        id: EventId,
        /// New countdown length.
        seconds: u64,
    },
    /// The event was handed to the alert queue.
    Dispatching {
        /// The event.
        id: EventId,
        /// What raised it.
        source: EventSource,
    },
    /// The location fetch finished.
    Located {
        /// The event.
        id: EventId,
        /// Coordinates, or `None` if unavailable in time.
        location: Option<Location>,
    },
    /// A channel reported an outcome.
    ChannelReported {
        /// The event.
        id: EventId,
        /// The channel.
        channel: ChannelKind,
        /// Its outcome.
        result: ChannelResult,
    },
    /// At least one channel delivered the event.
    Delivered {
        /// The event.
        id: EventId,
    },
    /// The user cancelled during the countdown.
    Cancelled {
        /// The event.
        id: EventId,
    },
    /// Every channel is exhausted. The user should call for help directly.
    Abandoned {
        /// The event.
        id: EventId,
    },
    /// A later signal was folded into the active event.
    SignalMerged {
        /// The event.
        id: EventId,
        /// What the later signal was.
        source: EventSource,
        /// Signals merged so far.
        merged_signals: u32,
    },
    /// The dead-man's switch is about to expire.
    SafetyWarning {
        /// The armed switch.
        handle: SwitchHandle,
        /// Why it was armed.
        reason: String,
        /// Seconds left.
        remaining_secs: u64,
    },
    /// The event could not be made durable; it will be retried.
    PersistenceFailed {
        /// The event.
        id: EventId,
        /// What went wrong.
        error: String,
    },
}

/// Reference to the event a signal landed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHandle {
    /// The event.
    pub id: EventId,
    /// Its status once the signal was applied.
    pub status: EventStatus,
    /// `true` if the signal was merged into an existing event.
    pub merged: bool,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    /// The active event, if any.
    pub active: Option<EmergencyEvent>,
    /// Time left on the confirmation countdown.
    pub countdown_remaining: Option<Duration>,
    /// Whether the active event is durable in the queue.
    pub durable: bool,
    /// The armed dead-man's switch.
    pub safety: Option<SwitchStatus>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Signal {
        signal: Signal,
        reply: oneshot::Sender<Result<EventHandle>>,
    },
    Sample {
        sample: AccelerationSample,
        reply: oneshot::Sender<Option<EventHandle>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    Confirm {
        reply: oneshot::Sender<Result<EventHandle>>,
    },
    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
    Shutdown,
}

/// The coordinator, before its actor is started.
#[derive(Debug)]
pub struct EmergencyCoordinator {
    config: CoordinatorConfig,
    detector: DetectorConfig,
    device_id: Option<String>,
    queue: AlertQueue,
    host: HostServices,
    timer: DeadMansSwitchTimer,
    switch_signals: mpsc::Receiver<SwitchSignal>,
}

impl EmergencyCoordinator {
    /// Create a coordinator that dispatches through `queue`.
    #[must_use]
    pub fn new(config: &Config, storage: SharedStorage, queue: AlertQueue, host: HostServices) -> Self {
        let (switch_tx, switch_signals) = mpsc::channel(SWITCH_CAPACITY);
        let timer = DeadMansSwitchTimer::new(storage, config.warning_window(), switch_tx);
        Self {
            config: config.coordinator.clone(),
            detector: config.detector.clone(),
            device_id: config.device.device_id.clone(),
            queue,
            host,
            timer,
            switch_signals,
        }
    }

    /// Spawn the actor and resume any persisted dead-man's switch.
    ///
    /// A persisted `dispatching` event is adopted as the active event and a
    /// flush pass is started.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted switch cannot be read.
    pub fn start(self) -> Result<CoordinatorHandle> {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let timer = self.timer.clone();

        let (actor, internal) = Actor::new(
            self.config,
            self.detector,
            self.device_id,
            self.queue,
            self.host,
            self.timer,
            updates.clone(),
        );
        let task = tokio::spawn(actor.run(command_rx, internal, self.switch_signals));

        let handle = CoordinatorHandle {
            commands,
            updates,
            timer,
            task: Arc::new(Mutex::new(Some(task))),
        };

        if let Some(restored) = handle.timer.restore()? {
            info!(handle = %restored, "Resumed safety check");
        }
        info!("Emergency coordinator started");
        Ok(handle)
    }
}

/// Handle to a running coordinator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<CoordinatorUpdate>,
    timer: DeadMansSwitchTimer,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CoordinatorHandle {
    /// User-initiated SOS.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoordinatorStopped`] if the actor is gone.
    pub async fn trigger_manual_sos(&self) -> Result<EventHandle> {
        self.signal(Signal::Manual).await
    }

    /// Raise a signal from outside the built-in detector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoordinatorStopped`] if the actor is gone.
    pub async fn signal(&self, signal: Signal) -> Result<EventHandle> {
        self.request(|reply| Command::Signal { signal, reply }).await?
    }

    /// Feed one accelerometer reading to the crash detector.
    ///
    /// Returns the event the reading raised or was merged into, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoordinatorStopped`] if the actor is gone.
    pub async fn ingest_sample(&self, sample: AccelerationSample) -> Result<Option<EventHandle>> {
        self.request(|reply| Command::Sample { sample, reply }).await
    }

    /// Cancel the event in its confirmation countdown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveEvent`] unless an event is confirming.
    pub async fn cancel_active_event(&self) -> Result<()> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    /// Skip the rest of the countdown and dispatch now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveEvent`] unless an event is confirming.
    pub async fn confirm_active_event(&self) -> Result<EventHandle> {
        self.request(|reply| Command::Confirm { reply }).await?
    }

    /// Arm the dead-man's switch.
    ///
    /// # Errors
    ///
    /// See [`DeadMansSwitchTimer::arm`].
    pub fn arm_safety_check(&self, reason: &str, duration_secs: u64) -> Result<SwitchHandle> {
        self.timer.arm(reason, duration_secs)
    }

    /// Disarm the dead-man's switch.
    ///
    /// # Errors
    ///
    /// See [`DeadMansSwitchTimer::disarm`].
    pub fn disarm_safety_check(&self, handle: &SwitchHandle) -> Result<()> {
        self.timer.disarm(handle)
    }

    /// Extend the dead-man's switch.
    ///
    /// # Errors
    ///
    /// See [`DeadMansSwitchTimer::extend`].
    pub fn extend_safety_check(&self, handle: &SwitchHandle, extra_secs: u64) -> Result<()> {
        self.timer.extend(handle, extra_secs)
    }

    /// Receive state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorUpdate> {
        self.updates.subscribe()
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoordinatorStopped`] if the actor is gone.
    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        let mut snapshot = self.request(|reply| Command::Snapshot { reply }).await?;
        snapshot.safety = self.timer.status();
        Ok(snapshot)
    }

    /// Stop the actor and wait for it to exit.
    ///
    /// An armed dead-man's switch stays persisted and resumes on next start.
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            warn!("Coordinator already stopped");
        }
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::CoordinatorStopped)?;
        rx.await.map_err(|_| Error::CoordinatorStopped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::channels::testing::FakeChannel;
    use crate::channels::{ChannelOutcome, DispatchChannel};
    use crate::config::RepeatCrashPolicy;
    use crate::host::{HostError, LocationProvider, Notifier};
    use crate::safety::SWITCH_KEY;
    use crate::storage::{self, shared, Storage};

    struct Harness {
        handle: CoordinatorHandle,
        queue: AlertQueue,
        storage: SharedStorage,
        updates: broadcast::Receiver<CoordinatorUpdate>,
    }

    fn start_with(
        storage: SharedStorage,
        channels: Vec<Arc<FakeChannel>>,
        host: HostServices,
        config: &Config,
    ) -> Harness {
        let channels = channels
            .into_iter()
            .map(|c| c as Arc<dyn DispatchChannel>)
            .collect();
        let queue = AlertQueue::new(Arc::clone(&storage), channels, config.queue.clone());
        let handle = EmergencyCoordinator::new(config, Arc::clone(&storage), queue.clone(), host)
            .start()
            .unwrap();
        let updates = handle.subscribe();
        Harness {
            handle,
            queue,
            storage,
            updates,
        }
    }

    fn start(channels: Vec<Arc<FakeChannel>>) -> Harness {
        start_with(
            shared(Storage::open_in_memory().unwrap()),
            channels,
            HostServices::new(),
            &Config::default(),
        )
    }

    fn sending() -> Arc<FakeChannel> {
        Arc::new(FakeChannel::new(ChannelKind::Voice, ChannelOutcome::Sent))
    }

    fn failing() -> Arc<FakeChannel> {
        Arc::new(FakeChannel::new(
            ChannelKind::Voice,
            ChannelOutcome::Failed("no signal".to_string()),
        ))
    }

    fn crash() -> Signal {
        Signal::Crash(CrashSuspected {
            detected_at: Utc::now(),
            peak_magnitude: 42.0,
            rolling_average: 21.0,
            recent_samples: Vec::new(),
        })
    }

    async fn wait_for(
        updates: &mut broadcast::Receiver<CoordinatorUpdate>,
        matches: impl Fn(&CoordinatorUpdate) -> bool,
    ) -> CoordinatorUpdate {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let update = updates.recv().await.unwrap();
                if matches(&update) {
                    return update;
                }
            }
        })
        .await
        .expect("expected update was not published")
    }

    async fn active(handle: &CoordinatorHandle) -> Option<EmergencyEvent> {
        handle.snapshot().await.unwrap().active
    }

    struct NeverLocates;

    #[async_trait]
    impl LocationProvider for NeverLocates {
        async fn get_location(&self, _timeout: Duration) -> Option<Location> {
            std::future::pending().await
        }
    }

    struct FixedLocation(Location);

    #[async_trait]
    impl LocationProvider for FixedLocation {
        async fn get_location(&self, _timeout: Duration) -> Option<Location> {
            Some(self.0)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        titles: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, _body: &str) -> std::result::Result<(), HostError> {
            self.titles.lock().unwrap().push(title.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sos_counts_down_then_delivers() {
        let voice = sending();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut h = start_with(
            shared(Storage::open_in_memory().unwrap()),
            vec![Arc::clone(&voice)],
            HostServices::new().with_notifier(notifier.clone()),
            &Config::default(),
        );

        let event = h.handle.trigger_manual_sos().await.unwrap();
        assert_eq!(event.status, EventStatus::Confirming);
        assert!(!event.merged);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.active.unwrap().status, EventStatus::Confirming);
        assert!(snapshot.countdown_remaining.unwrap() <= Duration::from_secs(1));
        assert_eq!(voice.send_count(), 0);

        wait_for(&mut h.updates, |u| *u == CoordinatorUpdate::Delivered { id: event.id.clone() }).await;
        wait_for(&mut h.updates, |u| *u == CoordinatorUpdate::Idle).await;

        let stored = h.queue.get(&event.id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Delivered);
        assert_eq!(stored.source, EventSource::UserInitiated);
        assert!(active(&h.handle).await.is_none());

        let titles = notifier.titles.lock().unwrap().clone();
        assert_eq!(titles.first().map(String::as_str), Some("Emergency detected"));
        assert!(titles.iter().any(|t| t == "Emergency alert delivered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_expiry_never_queues() {
        let voice = sending();
        let mut h = start(vec![Arc::clone(&voice)]);
        let event = h.handle.trigger_manual_sos().await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.handle.cancel_active_event().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(h.queue.get(&event.id).unwrap().is_none());
        assert_eq!(storage::lock(&h.storage).unwrap().count().unwrap(), 0);
        assert_eq!(voice.send_count(), 0);

        let mut seen = Vec::new();
        while let Ok(update) = h.updates.try_recv() {
            seen.push(update);
        }
        assert!(seen.contains(&CoordinatorUpdate::Cancelled { id: event.id.clone() }));
        assert!(!seen
            .iter()
            .any(|u| matches!(u, CoordinatorUpdate::Dispatching { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_expiry_reports_no_active_event() {
        let mut h = start(vec![failing()]);
        h.handle.trigger_manual_sos().await.unwrap();
        wait_for(&mut h.updates, |u| matches!(u, CoordinatorUpdate::Dispatching { .. })).await;

        let err = h.handle.cancel_active_event().await.unwrap_err();
        assert!(err.is_no_active_event());
        assert_eq!(active(&h.handle).await.unwrap().status, EventStatus::Dispatching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_event() {
        let h = start(vec![]);
        assert!(h.handle.cancel_active_event().await.unwrap_err().is_no_active_event());
        assert!(h.handle.confirm_active_event().await.unwrap_err().is_no_active_event());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_skips_countdown() {
        let h = start(vec![failing()]);
        h.handle.signal(crash()).await.unwrap();

        let confirmed = h.handle.confirm_active_event().await.unwrap();
        assert_eq!(confirmed.status, EventStatus::Dispatching);
        assert!(h.queue.contains(&confirmed.id).unwrap());
        assert!(h.handle.confirm_active_event().await.unwrap_err().is_no_active_event());
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_timeout_during_countdown_dispatches_now() {
        let h = start(vec![failing()]);
        let event = h.handle.signal(crash()).await.unwrap();
        assert_eq!(event.status, EventStatus::Confirming);

        h.handle.arm_safety_check("night shift", 1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let current = active(&h.handle).await.unwrap();
        assert_eq!(current.id, event.id);
        assert_eq!(current.status, EventStatus::Dispatching);
        assert_eq!(current.merged_signals, 1);
        assert!(h.queue.contains(&event.id).unwrap());
        assert!(storage::lock(&h.storage)
            .unwrap()
            .kv_get(SWITCH_KEY)
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_crash_resets_countdown() {
        let mut h = start(vec![failing()]);
        let event = h.handle.signal(crash()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let again = h.handle.signal(crash()).await.unwrap();
        assert!(again.merged);
        assert_eq!(again.id, event.id);
        wait_for(&mut h.updates, |u| {
            *u == CoordinatorUpdate::CountdownReset {
                id: event.id.clone(),
                seconds: 10,
            }
        })
        .await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(active(&h.handle).await.unwrap().status, EventStatus::Confirming);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(active(&h.handle).await.unwrap().status, EventStatus::Dispatching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_crash_ignored_by_policy() {
        let mut config = Config::default();
        config.coordinator.repeat_crash_policy = RepeatCrashPolicy::Ignore;
        let h = start_with(
            shared(Storage::open_in_memory().unwrap()),
            vec![failing()],
            HostServices::new(),
            &config,
        );
        h.handle.signal(crash()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(h.handle.signal(crash()).await.unwrap().merged);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let current = active(&h.handle).await.unwrap();
        assert_eq!(current.status, EventStatus::Dispatching);
        assert_eq!(current.merged_signals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_during_dispatch_is_merged_and_persisted() {
        let h = start(vec![failing()]);
        h.handle.trigger_manual_sos().await.unwrap();
        let event = h.handle.confirm_active_event().await.unwrap();

        let second = h.handle.trigger_manual_sos().await.unwrap();
        assert!(second.merged);
        assert_eq!(second.id, event.id);
        assert_eq!(second.status, EventStatus::Dispatching);

        let stored = h.queue.get(&event.id).unwrap().unwrap();
        assert_eq!(stored.merged_signals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_timeout_does_not_block_dispatch() {
        let mut h = start_with(
            shared(Storage::open_in_memory().unwrap()),
            vec![sending()],
            HostServices::new().with_location(Arc::new(NeverLocates)),
            &Config::default(),
        );
        h.handle.trigger_manual_sos().await.unwrap();
        let event = h.handle.confirm_active_event().await.unwrap();
        assert_eq!(event.status, EventStatus::Dispatching);

        wait_for(&mut h.updates, |u| *u == CoordinatorUpdate::Located { id: event.id.clone(), location: None }).await;
        wait_for(&mut h.updates, |u| *u == CoordinatorUpdate::Delivered { id: event.id.clone() }).await;
        assert!(h.queue.get(&event.id).unwrap().unwrap().location.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_attached_when_available() {
        let here = Location::new(52.3676, 4.9041).unwrap();
        let mut h = start_with(
            shared(Storage::open_in_memory().unwrap()),
            vec![sending()],
            HostServices::new().with_location(Arc::new(FixedLocation(here))),
            &Config::default(),
        );
        h.handle.trigger_manual_sos().await.unwrap();
        let event = h.handle.confirm_active_event().await.unwrap();

        wait_for(&mut h.updates, |u| *u == CoordinatorUpdate::Delivered { id: event.id.clone() }).await;
        assert_eq!(h.queue.get(&event.id).unwrap().unwrap().location, Some(here));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_is_reported_and_retried() {
        let mut h = start(vec![sending()]);
        storage::lock(&h.storage).unwrap().set_query_only(true).unwrap();

        h.handle.trigger_manual_sos().await.unwrap();
        let event = h.handle.confirm_active_event().await.unwrap();
        wait_for(&mut h.updates, |u| matches!(u, CoordinatorUpdate::PersistenceFailed { .. })).await;

        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(!snapshot.durable);
        assert_eq!(snapshot.active.unwrap().id, event.id);

        storage::lock(&h.storage).unwrap().set_query_only(false).unwrap();
        wait_for(&mut h.updates, |u| *u == CoordinatorUpdate::Delivered { id: event.id.clone() }).await;
        assert_eq!(
            h.queue.get(&event.id).unwrap().unwrap().status,
            EventStatus::Delivered
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopts_dispatching_event_on_start() {
        let storage = shared(Storage::open_in_memory().unwrap());
        let voice = failing();
        let earlier = AlertQueue::new(
            Arc::clone(&storage),
            vec![Arc::clone(&voice) as Arc<dyn DispatchChannel>],
            Config::default().queue,
        );
        let mut event = EmergencyEvent::new(EventSource::CrashDetected, crate::event::DiagnosticSnapshot::default());
        event.transition(EventStatus::Dispatching).unwrap();
        earlier.enqueue(event.clone()).unwrap();

        let h = start_with(storage, vec![voice], HostServices::new(), &Config::default());
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.durable);
        assert_eq!(snapshot.active.unwrap().id, event.id);

        let merged = h.handle.trigger_manual_sos().await.unwrap();
        assert!(merged.merged);
        assert_eq!(merged.id, event.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_samples_raise_crash_event() {
        let h = start(vec![failing()]);
        let impact = || AccelerationSample::new(30.0, 0.0, 0.0);

        for _ in 0..4 {
            assert!(h.handle.ingest_sample(impact()).await.unwrap().is_none());
        }
        let raised = h.handle.ingest_sample(impact()).await.unwrap().unwrap();
        assert_eq!(raised.status, EventStatus::Confirming);
        assert!(h.handle.ingest_sample(impact()).await.unwrap().is_none());
        assert_eq!(active(&h.handle).await.unwrap().source, EventSource::CrashDetected);

        h.handle.cancel_active_event().await.unwrap();
        let again = h.handle.ingest_sample(impact()).await.unwrap().unwrap();
        assert_ne!(again.id, raised.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_timeout_without_disarm_dispatches() {
        let h = start(vec![failing()]);
        h.handle.arm_safety_check("solo hike", 60).unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(active(&h.handle).await.is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let event = active(&h.handle).await.unwrap();
        assert_eq!(event.source, EventSource::SafetyTimeout);
        assert_eq!(event.status, EventStatus::Dispatching);
        assert!(h.queue.contains(&event.id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_timeout_skips_countdown_whatever_the_config() {
        let mut config = Config::default();
        config.coordinator.crash_countdown_secs = 30;
        config.coordinator.manual_countdown_secs = 30;
        let h = start_with(
            shared(Storage::open_in_memory().unwrap()),
            vec![failing()],
            HostServices::new(),
            &config,
        );
        h.handle.arm_safety_check("night ride", 10).unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let snapshot = h.handle.snapshot().await.unwrap();
        let event = snapshot.active.unwrap();
        assert_eq!(event.source, EventSource::SafetyTimeout);
        assert_eq!(event.status, EventStatus::Dispatching);
        assert!(snapshot.countdown_remaining.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_countdown_is_capped() {
        let mut config = Config::default();
        config.coordinator.manual_countdown_secs = u64::MAX;
        let h = start_with(
            shared(Storage::open_in_memory().unwrap()),
            vec![sending()],
            HostServices::new(),
            &config,
        );

        let event = h.handle.trigger_manual_sos().await.unwrap();
        assert_eq!(event.status, EventStatus::Confirming);
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(snapshot.countdown_remaining.unwrap() <= crate::config::MAX_COUNTDOWN);

        h.handle.cancel_active_event().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_safety_check_creates_no_event() {
        let h = start(vec![failing()]);
        let handle = h.handle.arm_safety_check("solo hike", 60).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.handle.disarm_safety_check(&handle).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(active(&h.handle).await.is_none());
        assert_eq!(storage::lock(&h.storage).unwrap().count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_everywhere_is_abandoned() {
        let voice = failing();
        voice.supported.store(false, Ordering::SeqCst);
        let mut h = start(vec![voice]);
        h.handle.trigger_manual_sos().await.unwrap();
        let event = h.handle.confirm_active_event().await.unwrap();

        wait_for(&mut h.updates, |u| *u == CoordinatorUpdate::Abandoned { id: event.id.clone() }).await;
        assert_eq!(
            h.queue.get(&event.id).unwrap().unwrap().status,
            EventStatus::Abandoned
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_coordinator() {
        let h = start(vec![]);
        h.handle.shutdown().await;
        let err = h.handle.trigger_manual_sos().await.unwrap_err();
        assert!(matches!(err, Error::CoordinatorStopped));
    }
}
