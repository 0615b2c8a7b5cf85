//! Service wiring.
//!
//! [`Lifeline`] opens storage, builds the dispatch channels the host can
//! support, and starts the coordinator and the connectivity monitor over one
//! shared queue.

use std::sync::Arc;

use tracing::{info, warn};

use crate::channels;
use crate::config::Config;
use crate::connectivity::{ConnectivityHandle, ConnectivityMonitor};
use crate::coordinator::{CoordinatorHandle, EmergencyCoordinator};
use crate::error::Result;
use crate::host::HostServices;
use crate::queue::AlertQueue;
use crate::storage::{self, shared, SharedStorage, Storage};

/// A running lifeline instance.
#[derive(Debug)]
pub struct Lifeline {
    storage: SharedStorage,
    queue: AlertQueue,
    coordinator: CoordinatorHandle,
    connectivity: ConnectivityHandle,
}

impl Lifeline {
    /// Validate `config`, open the configured database, and start.
    ///
    /// Connectivity starts out as offline until the host reports otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the database cannot
    /// be opened, or persisted state cannot be read.
    pub fn start(config: &Config, host: HostServices) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(config.database_path())?;
        Self::start_with_storage(config, storage, host)
    }

    /// Start over an already opened database.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read.
    pub fn start_with_storage(config: &Config, storage: Storage, host: HostServices) -> Result<Self> {
        let storage = shared(storage);
        prune_expired(config, &storage);

        let monitor = ConnectivityMonitor::new(config.connectivity.clone(), false);
        let channels = channels::from_config(&config.channels, &host, &monitor.status());
        if channels.is_empty() {
            warn!("No dispatch channel available, emergencies can only be recorded");
        }

        let queue = AlertQueue::new(Arc::clone(&storage), channels, config.queue.clone());
        info!(channels = ?queue.channel_kinds(), "Alert queue ready");

        let coordinator =
            EmergencyCoordinator::new(config, Arc::clone(&storage), queue.clone(), host).start()?;
        let connectivity = monitor.start(queue.clone());

        Ok(Self {
            storage,
            queue,
            coordinator,
            connectivity,
        })
    }

    /// The coordinator: SOS, cancellation, safety checks, samples.
    #[must_use]
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Connectivity reporting.
    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityHandle {
        &self.connectivity
    }

    /// The alert queue.
    #[must_use]
    pub fn queue(&self) -> &AlertQueue {
        &self.queue
    }

    /// The shared database.
    #[must_use]
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Stop the connectivity monitor and the coordinator.
    pub async fn shutdown(&self) {
        self.connectivity.stop().await;
        self.coordinator.shutdown().await;
        info!("Lifeline stopped");
    }
}

fn prune_expired(config: &Config, storage: &SharedStorage) {
    let Some(retention) = config.retention() else {
        return;
    };
    let Ok(max_age) = chrono::Duration::from_std(retention) else {
        return;
    };
    match storage::lock(storage).and_then(|s| s.prune_older_than(max_age)) {
        Ok(0) => {}
        Ok(pruned) => info!(pruned, "Pruned finished events past retention"),
        Err(err) => warn!(error = %err, "Failed to prune old events"),
    }
}
