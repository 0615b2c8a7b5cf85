//! Emergency voice call.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{ChannelOutcome, DispatchChannel};
use crate::connectivity::ConnectivityStatus;
use crate::event::{ChannelKind, EmergencyEvent};
use crate::host::Dialer;

/// Dials the first configured emergency number.
///
/// Emergency calls are routed by any carrier in range, so by default the
/// channel is attempted even while general connectivity is down. Set
/// `requires_connectivity` where that does not hold.
pub struct VoiceChannel {
    dialer: Arc<dyn Dialer>,
    numbers: Vec<String>,
    requires_connectivity: bool,
    connectivity: ConnectivityStatus,
}

impl VoiceChannel {
    /// Create a voice channel dialing `numbers[0]`.
    #[must_use]
    pub fn new(
        dialer: Arc<dyn Dialer>,
        numbers: Vec<String>,
        requires_connectivity: bool,
        connectivity: ConnectivityStatus,
    ) -> Self {
        Self {
            dialer,
            numbers,
            requires_connectivity,
            connectivity,
        }
    }
}

impl std::fmt::Debug for VoiceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceChannel")
            .field("numbers", &self.numbers)
            .field("requires_connectivity", &self.requires_connectivity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DispatchChannel for VoiceChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Voice
    }

    fn is_supported(&self) -> bool {
        !self.numbers.is_empty()
    }

    fn precondition(&self) -> bool {
        !self.requires_connectivity || self.connectivity.is_online()
    }

    async fn send(&self, event: &EmergencyEvent) -> ChannelOutcome {
        let Some(number) = self.numbers.first() else {
            return ChannelOutcome::Unsupported;
        };

        match self.dialer.dial(number).await {
            Ok(()) => {
                info!(event_id = %event.id, number = %number, "Emergency call placed");
                ChannelOutcome::Sent
            }
            Err(err) => {
                warn!(event_id = %event.id, number = %number, error = %err, "Emergency call failed");
                ChannelOutcome::from_host_error(err)
            }
        }
    }
}
