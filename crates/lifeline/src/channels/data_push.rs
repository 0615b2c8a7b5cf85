//! Alert push over the data network.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{alert_payload, ChannelOutcome, DispatchChannel};
use crate::connectivity::ConnectivityStatus;
use crate::event::{ChannelKind, EmergencyEvent};
use crate::host::NetworkClient;

/// POSTs the alert payload to a fixed endpoint. Requires connectivity.
pub struct DataPushChannel {
    client: Arc<dyn NetworkClient>,
    endpoint: String,
    connectivity: ConnectivityStatus,
}

impl DataPushChannel {
    /// Create a channel posting to `endpoint`.
    #[must_use]
    pub fn new(
        client: Arc<dyn NetworkClient>,
        endpoint: String,
        connectivity: ConnectivityStatus,
    ) -> Self {
        Self {
            client,
            endpoint,
            connectivity,
        }
    }
}

impl std::fmt::Debug for DataPushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPushChannel")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DispatchChannel for DataPushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::DataPush
    }

    fn precondition(&self) -> bool {
        self.connectivity.is_online()
    }

    async fn send(&self, event: &EmergencyEvent) -> ChannelOutcome {
        let payload = alert_payload(event, Utc::now());
        debug!(event_id = %event.id, endpoint = %self.endpoint, "Pushing alert");

        match self.client.post(&self.endpoint, &payload).await {
            Ok(()) => {
                info!(event_id = %event.id, "Alert pushed");
                ChannelOutcome::Sent
            }
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Alert push failed");
                ChannelOutcome::from_host_error(err)
            }
        }
    }
}
