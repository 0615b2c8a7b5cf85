//! Best-effort satellite relay.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{compact_message, ChannelOutcome, DispatchChannel};
use crate::connectivity::ConnectivityStatus;
use crate::event::{ChannelKind, EmergencyEvent};
use crate::host::SatelliteModem;

/// Relays a compact text alert through satellite hardware.
///
/// Devices without a modem report the channel as unsupported. With
/// `only_when_offline` set the relay stays quiet while the data network is
/// reachable.
pub struct SatelliteChannel {
    modem: Arc<dyn SatelliteModem>,
    only_when_offline: bool,
    connectivity: ConnectivityStatus,
}

impl SatelliteChannel {
    /// Create a satellite channel.
    #[must_use]
    pub fn new(
        modem: Arc<dyn SatelliteModem>,
        only_when_offline: bool,
        connectivity: ConnectivityStatus,
    ) -> Self {
        Self {
            modem,
            only_when_offline,
            connectivity,
        }
    }
}

impl std::fmt::Debug for SatelliteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SatelliteChannel")
            .field("only_when_offline", &self.only_when_offline)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DispatchChannel for SatelliteChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Satellite
    }

    fn is_supported(&self) -> bool {
        self.modem.is_present()
    }

    fn precondition(&self) -> bool {
        self.modem.is_ready() && !(self.only_when_offline && self.connectivity.is_online())
    }

    async fn send(&self, event: &EmergencyEvent) -> ChannelOutcome {
        if !self.modem.is_present() {
            return ChannelOutcome::Unsupported;
        }

        let message = compact_message(event);
        match self.modem.transmit(&message).await {
            Ok(()) => {
                info!(event_id = %event.id, bytes = message.len(), "Satellite alert relayed");
                ChannelOutcome::Sent
            }
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Satellite relay failed");
                ChannelOutcome::from_host_error(err)
            }
        }
    }
}
