//! Live sessions and the set of registered sessions

use dashmap::DashMap;
use parking_lot::RwLock;
use rdio_core::{Access, Call, LiveFeedMatrix, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

/// One live listener session
#[derive(Debug)]
pub struct Client {
    id: Uuid,
    sender: mpsc::Sender<Message>,
    access: RwLock<Option<Arc<Access>>>,
    auth_attempts: AtomicU32,
    livefeed: RwLock<LiveFeedMatrix>,
}

impl Client {
    /// New session with an outbound queue of `queue_size` messages.
    /// The receiver is drained by the session's writer.
    #[must_use]
    pub fn new(queue_size: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let client = Arc::new(Self {
            id: Uuid::new_v4(),
            sender,
            access: RwLock::new(None),
            auth_attempts: AtomicU32::new(0),
            livefeed: RwLock::new(LiveFeedMatrix::default()),
        });
        (client, receiver)
    }

    /// Session id
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a message for the writer. Returns `false` once the writer is gone.
    pub async fn send(&self, message: Message) -> bool {
        self.sender.send(message).await.is_ok()
    }

    /// Current grant
    #[must_use]
    pub fn access(&self) -> Option<Arc<Access>> {
        self.access.read().clone()
    }

    /// Replace the grant
    pub fn set_access(&self, access: Option<Arc<Access>>) {
        *self.access.write() = access;
    }

    /// Ident of the current grant
    #[must_use]
    pub fn ident(&self) -> Option<String> {
        self.access.read().as_ref().map(|a| a.ident.clone())
    }

    /// Count one authentication attempt, returning the attempts so far
    /// including this one
    pub fn count_attempt(&self) -> u32 {
        self.auth_attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// Forget previous authentication attempts
    pub fn reset_attempts(&self) {
        self.auth_attempts.store(0, Ordering::SeqCst);
    }

    /// Replace the live feed matrix, returning whether anything is enabled
    pub fn set_livefeed(&self, matrix: LiveFeedMatrix) -> bool {
        let active = matrix.is_active();
        *self.livefeed.write() = matrix;
        active
    }

    /// Whether a released call should be pushed to this session
    #[must_use]
    pub fn admits(&self, call: &Call, restricted: bool) -> bool {
        let (Some(system_ref), Some(talkgroup_ref)) = (call.system_ref(), call.talkgroup_ref())
        else {
            return false;
        };

        if restricted
            && !self
                .access
                .read()
                .as_ref()
                .is_some_and(|a| a.has_access(system_ref, talkgroup_ref))
        {
            return false;
        }

        self.livefeed
            .read()
            .admits(system_ref, talkgroup_ref, &call.patches)
    }
}

/// Registered sessions
#[derive(Debug, Default)]
pub struct Clients {
    map: DashMap<Uuid, Arc<Client>>,
}

impl Clients {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session
    pub fn add(&self, client: Arc<Client>) {
        self.map.insert(client.id(), client);
    }

    /// Unregister a session, returning whether it was registered
    pub fn remove(&self, id: Uuid) -> bool {
        self.map.remove(&id).is_some()
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no session is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Registered sessions at this instant
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.map.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Registered sessions granted under `ident`, not counting `except`
    #[must_use]
    pub fn count_ident(&self, ident: &str, except: Uuid) -> usize {
        self.map
            .iter()
            .filter(|entry| {
                *entry.key() != except && entry.value().ident().as_deref() == Some(ident)
            })
            .count()
    }
}
