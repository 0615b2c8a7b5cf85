//! Connectivity tracking and flush triggering.
//!
//! The host reports online/offline as it observes it. Each transition to
//! online triggers exactly one queue flush; a low-frequency tick flushes as
//! well, for transports whose online signal cannot be trusted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::ConnectivityConfig;
use crate::queue::AlertQueue;

const COMMAND_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 16;

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// The data network became reachable.
    Online,
    /// The data network was lost.
    Offline,
}

/// Why a flush was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Connectivity came back.
    Reconnected,
    /// The periodic tick fired.
    Periodic,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconnected => write!(f, "reconnected"),
            Self::Periodic => write!(f, "periodic"),
        }
    }
}

#[derive(Debug)]
enum MonitorCommand {
    Flush(FlushReason),
    Stop,
}

/// Read-only view of the current connectivity, handed to channels.
#[derive(Debug, Clone)]
pub struct ConnectivityStatus {
    rx: watch::Receiver<bool>,
}

impl ConnectivityStatus {
    /// A status that never changes.
    #[must_use]
    pub fn fixed(online: bool) -> Self {
        let (_tx, rx) = watch::channel(online);
        Self { rx }
    }

    /// Whether the data network is currently reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Connectivity state, before the flush loop is started.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Create a monitor with an initial state.
    #[must_use]
    pub fn new(config: ConnectivityConfig, initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// A view of the state for channel preconditions.
    #[must_use]
    pub fn status(&self) -> ConnectivityStatus {
        ConnectivityStatus {
            rx: self.state.subscribe(),
        }
    }

    /// Start the flush loop over `queue`.
    #[must_use]
    pub fn start(self, queue: AlertQueue) -> ConnectivityHandle {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let period = Duration::from_secs(self.config.flush_interval_secs.max(1));

        let task = tokio::spawn(run_loop(queue, rx, period));
        info!(
            online = *self.state.borrow(),
            interval_secs = period.as_secs(),
            "Connectivity monitor started"
        );

        ConnectivityHandle {
            state: self.state,
            commands,
            events,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Control handle for a running monitor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    state: Arc<watch::Sender<bool>>,
    commands: mpsc::Sender<MonitorCommand>,
    events: broadcast::Sender<ConnectivityEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectivityHandle {
    /// Report the connectivity the host currently observes.
    ///
    /// Repeating the current state is a no-op. A change to online triggers a
    /// flush.
    pub fn report_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        let event = if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        };
        info!(?event, "Connectivity changed");
        let _ = self.events.send(event);

        if online {
            if let Err(err) = self
                .commands
                .try_send(MonitorCommand::Flush(FlushReason::Reconnected))
            {
                // Full means flushes are already queued behind a slow pass.
                debug!(error = %err, "Reconnect flush not queued");
            }
        }
    }

    /// Whether the data network is currently reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// A view of the state for channel preconditions.
    #[must_use]
    pub fn status(&self) -> ConnectivityStatus {
        ConnectivityStatus {
            rx: self.state.subscribe(),
        }
    }

    /// Receive online/offline transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Stop the flush loop and wait for it to exit.
    pub async fn stop(&self) {
        let _ = self.commands.send(MonitorCommand::Stop).await;
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run_loop(queue: AlertQueue, mut commands: mpsc::Receiver<MonitorCommand>, period: Duration) {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let reason = tokio::select! {
            command = commands.recv() => match command {
                Some(MonitorCommand::Flush(reason)) => reason,
                Some(MonitorCommand::Stop) | None => break,
            },
            _ = tick.tick() => FlushReason::Periodic,
        };

        debug!(%reason, "Flushing alert queue");
        match queue.flush().await {
            Ok(report) if report.attempted > 0 => {
                info!(%reason, attempted = report.attempted, sent = report.sent, "Flush finished");
            }
            Ok(_) => {}
            Err(err) => error!(%reason, error = %err, "Flush failed"),
        }
    }

    debug!("Connectivity monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::FakeChannel;
    use crate::channels::{ChannelOutcome, DispatchChannel};
    use crate::config::QueueConfig;
    use crate::event::{ChannelKind, DiagnosticSnapshot, EmergencyEvent, EventSource, EventStatus};
    use crate::storage::{shared, Storage};

    fn queue() -> AlertQueue {
        let channel: Arc<dyn DispatchChannel> = Arc::new(FakeChannel::new(
            ChannelKind::DataPush,
            ChannelOutcome::Failed("down".to_string()),
        ));
        AlertQueue::new(
            shared(Storage::open_in_memory().unwrap()),
            vec![channel],
            QueueConfig::default(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_fixed_status() {
        assert!(ConnectivityStatus::fixed(true).is_online());
        assert!(!ConnectivityStatus::fixed(false).is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_follows_reports() {
        let monitor = ConnectivityMonitor::new(ConnectivityConfig::default(), false);
        let status = monitor.status();
        let handle = monitor.start(queue());
        assert!(!status.is_online());

        handle.report_online(true);
        assert!(status.is_online());
        assert!(handle.is_online());

        handle.report_online(false);
        assert!(!status.is_online());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_reports_emit_one_transition() {
        let monitor = ConnectivityMonitor::new(ConnectivityConfig::default(), true);
        let handle = monitor.start(queue());
        let mut events = handle.subscribe();

        handle.report_online(false);
        handle.report_online(false);
        handle.report_online(true);
        handle.report_online(true);

        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::Offline);
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::Online);
        assert!(events.try_recv().is_err());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_exactly_one_flush() {
        let queue = queue();
        let mut event = EmergencyEvent::new(EventSource::CrashDetected, DiagnosticSnapshot::default());
        event.transition(EventStatus::Dispatching).unwrap();
        queue.enqueue(event).unwrap();

        let monitor = ConnectivityMonitor::new(ConnectivityConfig::default(), true);
        let handle = monitor.start(queue.clone());

        handle.report_online(false);
        settle().await;
        assert_eq!(queue.flush_passes(), 0);

        handle.report_online(true);
        settle().await;
        assert_eq!(queue.flush_passes(), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tick_flushes() {
        let queue = queue();
        let monitor = ConnectivityMonitor::new(ConnectivityConfig::default(), false);
        let handle = monitor.start(queue.clone());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(queue.flush_passes(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.flush_passes(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(queue.flush_passes(), 2);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_flushing() {
        let queue = queue();
        let monitor = ConnectivityMonitor::new(ConnectivityConfig::default(), false);
        let handle = monitor.start(queue.clone());

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(queue.flush_passes(), 0);
    }
}
