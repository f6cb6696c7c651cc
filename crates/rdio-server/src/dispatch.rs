//! Fan-out of released calls to relays and live sessions

use crate::clients::Clients;
use crate::credentials::Credentials;
use crate::downstream::CallRelay;
use crate::registry::Registry;
use rdio_core::{Call, CallPayload, Command, Message};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Receives calls whose release time has come
pub trait Dispatch: Send + Sync {
    /// Hand `call` to every eligible target without waiting for delivery
    fn dispatch(&self, call: Call);
}

/// Dispatcher spawning one task per relay and one per admitted session
pub struct Dispatcher {
    clients: Arc<Clients>,
    credentials: Arc<Credentials>,
    registry: Arc<Registry>,
    relay: Arc<dyn CallRelay>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// New dispatcher over shared state
    #[must_use]
    pub fn new(
        clients: Arc<Clients>,
        credentials: Arc<Credentials>,
        registry: Arc<Registry>,
        relay: Arc<dyn CallRelay>,
    ) -> Self {
        Self {
            clients,
            credentials,
            registry,
            relay,
        }
    }
}

impl Dispatch for Dispatcher {
    fn dispatch(&self, call: Call) {
        let (Some(system_ref), Some(talkgroup_ref)) = (call.system_ref(), call.talkgroup_ref())
        else {
            warn!(call_id = ?call.id, "Unresolved call not dispatched");
            return;
        };

        let labels = Arc::new(self.registry.labels(&call));
        let call = Arc::new(call);

        for downstream in self.credentials.downstreams(system_ref, talkgroup_ref) {
            let relay = Arc::clone(&self.relay);
            let call = Arc::clone(&call);
            let labels = Arc::clone(&labels);
            tokio::spawn(async move {
                if let Err(e) = relay.send(&call, &labels, &downstream).await {
                    error!(
                        downstream = %downstream.url,
                        call_id = ?call.id,
                        system = system_ref,
                        talkgroup = talkgroup_ref,
                        "{}", e
                    );
                }
            });
        }

        let restricted = self.credentials.is_restricted();
        let targets: Vec<_> = self
            .clients
            .snapshot()
            .into_iter()
            .filter(|client| client.admits(&call, restricted))
            .collect();
        if targets.is_empty() {
            return;
        }

        let message = match serde_json::to_value(CallPayload::from(call.as_ref())) {
            Ok(payload) => Message::new(Command::Call).with_payload(payload),
            Err(e) => {
                error!(call_id = ?call.id, "Failed to encode call: {}", e);
                return;
            }
        };

        debug!(call_id = ?call.id, sessions = targets.len(), "Dispatching call");
        for client in targets {
            let message = message.clone();
            tokio::spawn(async move {
                if !client.send(message).await {
                    debug!(client_id = %client.id(), "Session closed before delivery");
                }
            });
        }
    }
}
