//! Admission gateway implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use super::client::ClientId;
use crate::error::AdmissionError;
use crate::ratelimit::{AdmissionId, LimiterRegistry, Permit};

/// Outcome of submitting a message to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Admitted on arrival; the message is already on the dispatch channel.
    Admitted,
    /// Waiting for the principal's limiter; dispatched when its turn comes
    /// unless the client is removed first.
    Queued(AdmissionId),
    /// Refused; the caller replies to the sender with the error.
    Rejected(AdmissionError),
}

impl Admission {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected(_))
    }
}

/// An admitted message, ready for normal dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch<M> {
    pub client: ClientId,
    pub principal: String,
    pub message: M,
}

/// Entry point for client messages and client lifecycle events.
///
/// All decisions are taken under one lock, so a capacity check and the
/// enqueue that follows it cannot interleave with another admission or with
/// a lifecycle change. Queued messages are released by the limiter under its
/// own lock, which removal also takes to cancel them, so a message is either
/// dispatched before `on_client_removed` returns or never.
pub struct AdmissionGateway<M> {
    registry: Arc<LimiterRegistry>,
    /// Principal of every live client
    clients: Mutex<HashMap<ClientId, String>>,
    dispatch: mpsc::UnboundedSender<Dispatch<M>>,
}

impl<M: Send + 'static> AdmissionGateway<M> {
    /// Create a gateway and the receiving end of its dispatch channel.
    pub fn new(registry: Arc<LimiterRegistry>) -> (Self, mpsc::UnboundedReceiver<Dispatch<M>>) {
        let (dispatch, receiver) = mpsc::unbounded_channel();
        let gateway = Self {
            registry,
            clients: Mutex::new(HashMap::new()),
            dispatch,
        };
        (gateway, receiver)
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Principal of a live client.
    pub fn principal_of(&self, client: &ClientId) -> Option<String> {
        self.clients.lock().get(client).cloned()
    }

    /// Number of live clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Record that `client` registered under `principal`.
    ///
    /// Registering an already-known client under the same principal (a
    /// failed-over scheduler taking over its framework) keeps the existing
    /// counters and limiter. Registering it under a different principal moves
    /// it, cancelling whatever it still had queued.
    #[instrument(skip(self, client), fields(client = %client))]
    pub fn on_client_registered(&self, client: ClientId, principal: &str) {
        let mut clients = self.clients.lock();

        if let Some(existing) = clients.get(&client) {
            if existing == principal {
                info!(principal = %principal, "Client re-registered");
                return;
            }

            let previous = existing.clone();
            info!(from = %previous, to = %principal, "Client changed principal");
            self.cancel_queued(&client, &previous);
            self.registry.release(&previous);
        }

        clients.insert(client, principal.to_string());
        let references = self.registry.acquire(principal);
        info!(principal = %principal, references = references, "Client registered");
    }

    /// Record that `client` is gone.
    ///
    /// Messages it still has queued are cancelled and will never be
    /// dispatched. Returns `false` if the client was not registered.
    #[instrument(skip(self, client), fields(client = %client))]
    pub fn on_client_removed(&self, client: &ClientId) -> bool {
        let mut clients = self.clients.lock();

        let Some(principal) = clients.remove(client) else {
            debug!("Removal of unknown client ignored");
            return false;
        };

        let cancelled = self.cancel_queued(client, &principal);
        let references = self.registry.release(&principal);
        info!(
            principal = %principal,
            cancelled = cancelled,
            references = references,
            "Client removed"
        );
        true
    }

    /// Submit a message from `client`.
    ///
    /// The message is counted as received, then either admitted, queued
    /// behind the principal's limiter or rejected because the queue is full.
    pub fn admit(&self, client: &ClientId, message: M) -> Admission {
        let clients = self.clients.lock();

        let Some(principal) = clients.get(client) else {
            warn!(client = %client, "Dropping message from unregistered client");
            return Admission::Rejected(AdmissionError::UnknownPrincipal {
                client: client.clone(),
            });
        };

        let accounting = self.registry.accounting();
        accounting.record_received(principal);

        let limiter = self.registry.resolve(principal);
        if !limiter.has_capacity() {
            let capacity = limiter.capacity().unwrap_or_default();
            warn!(
                client = %client,
                principal = %principal,
                limiter = %limiter.key(),
                capacity = capacity,
                "Rate limiter capacity exceeded, rejecting message"
            );
            return Admission::Rejected(AdmissionError::CapacityExceeded {
                principal: principal.clone(),
                capacity,
            });
        }

        let registry = Arc::clone(&self.registry);
        let dispatch = self.dispatch.clone();
        let envelope = Dispatch {
            client: client.clone(),
            principal: principal.clone(),
            message,
        };

        let on_admit = move || {
            registry.accounting().record_processed(&envelope.principal);
            let client = envelope.client.clone();
            if dispatch.send(envelope).is_err() {
                debug!(client = %client, "Dispatch channel closed, admitted message dropped");
            }
        };

        match limiter.admit(client.as_str(), on_admit) {
            Permit::Ready => {
                trace!(client = %client, principal = %principal, "Message admitted");
                Admission::Admitted
            }
            Permit::Queued(id) => {
                trace!(
                    client = %client,
                    principal = %principal,
                    admission = %id,
                    "Message throttled"
                );
                Admission::Queued(id)
            }
        }
    }

    /// Cancel one queued message of `client`.
    ///
    /// Returns `false` if it was already dispatched or cancelled, or if it
    /// was submitted by another client.
    pub fn cancel(&self, client: &ClientId, id: AdmissionId) -> bool {
        let clients = self.clients.lock();
        let Some(principal) = clients.get(client) else {
            return false;
        };

        self.registry
            .lookup(principal)
            .map(|limiter| limiter.cancel_for(client.as_str(), id))
            .unwrap_or(false)
    }

    /// Named message counters for every principal with live clients.
    pub fn metrics(&self) -> BTreeMap<String, u64> {
        self.registry.accounting().snapshot()
    }

    /// The counters as a JSON object, as served to metrics scrapers.
    pub fn metrics_json(&self) -> serde_json::Value {
        self.registry.accounting().snapshot_json()
    }

    /// Remove every client and drop everything still queued.
    pub fn shutdown(&self) {
        let clients: Vec<ClientId> = self.clients.lock().keys().cloned().collect();
        for client in &clients {
            self.on_client_removed(client);
        }

        let cancelled = self.registry.cancel_all();
        info!(
            clients = clients.len(),
            cancelled = cancelled,
            "Admission gateway shut down"
        );
    }

    fn cancel_queued(&self, client: &ClientId, principal: &str) -> usize {
        self.registry
            .lookup(principal)
            .map(|limiter| limiter.cancel_owner(client.as_str()))
            .unwrap_or(0)
    }
}
