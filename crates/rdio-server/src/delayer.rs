//! Delayed release of calls
//!
//! Every armed timer has a persisted [`DelayedEntry`] and every persisted entry
//! has an armed timer. Entries are written before their timer is armed and
//! removed before the call is dispatched, under one async lock shared with
//! crash recovery, so a delayed call is dispatched once even across restarts.

use crate::dispatch::Dispatch;
use crate::registry::Registry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rdio_core::{Call, CallId, DelayedEntry, Error, Result};
use rdio_database::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Release delay for a call in minutes: the talkgroup's if set, else the system's
#[must_use]
pub fn delay_minutes(call: &Call) -> u32 {
    call.talkgroup
        .as_ref()
        .map(|t| t.delay)
        .filter(|&d| d > 0)
        .or_else(|| call.system.as_ref().map(|s| s.delay))
        .unwrap_or(0)
}

/// Instant a call becomes visible, `None` past the end of the calendar
#[must_use]
pub fn release_time(call: &Call) -> Option<DateTime<Utc>> {
    call.timestamp
        .checked_add_signed(ChronoDuration::minutes(i64::from(delay_minutes(call))))
}

/// Holds calls until their release time
pub struct Delayer {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn Dispatch>,
    registry: Arc<Registry>,
    timers: Mutex<HashMap<CallId, JoinHandle<()>>>,
    lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Delayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delayer")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Delayer {
    /// New delayer with no armed timers
    #[must_use]
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn Dispatch>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            dispatcher,
            registry,
            timers: Mutex::new(HashMap::new()),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether `call` is still before its release time at `now`
    #[must_use]
    pub fn can_delay_at(call: &Call, now: DateTime<Utc>) -> bool {
        delay_minutes(call) > 0 && release_time(call).is_some_and(|release| now < release)
    }

    /// Whether `call` should be held rather than dispatched now
    #[must_use]
    pub fn can_delay(call: &Call) -> bool {
        Self::can_delay_at(call, Utc::now())
    }

    /// Persist a release entry for `call`, then arm its timer
    ///
    /// # Errors
    ///
    /// Returns an error if the call has no id or the entry cannot be stored;
    /// no timer is armed in that case.
    pub async fn delay(self: &Arc<Self>, call: Call) -> Result<()> {
        let call_id = call
            .id
            .ok_or_else(|| Error::validation("id", "call is not persisted"))?;
        let release = release_time(&call)
            .ok_or_else(|| Error::validation("dateTime", "timestamp out of range"))?;
        let entry = DelayedEntry { call_id, release };

        let _guard = self.lock.lock().await;
        self.store.push_delayed(&entry).await?;
        debug!(call_id, release = %entry.release, "Call delayed");
        self.arm(entry, call);
        Ok(())
    }

    /// Caller holds `lock`
    fn arm(self: &Arc<Self>, entry: DelayedEntry, call: Call) {
        let remaining = (entry.release - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            this.release(entry.call_id, call).await;
        });

        if let Some(previous) = self.timers.lock().insert(entry.call_id, handle) {
            previous.abort();
        }
    }

    async fn release(&self, call_id: CallId, call: Call) {
        {
            let _guard = self.lock.lock().await;
            if let Err(e) = self.store.pop_delayed(call_id).await {
                error!(call_id, "Failed to remove delayed entry: {}", e);
            }
            self.timers.lock().remove(&call_id);
        }
        debug!(call_id, "Delayed call released");
        self.dispatcher.dispatch(call);
    }

    /// Recover persisted entries after a restart
    ///
    /// Past-due calls are dispatched immediately; the rest are persisted again
    /// and re-armed for their remaining time. Entries whose call no longer
    /// exists are dropped. Returns the number of re-armed timers.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry table cannot be read or cleared.
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let entries = self.store.load_delayed().await?;
        self.store.clear_delayed().await?;

        let now = Utc::now();
        let mut armed = 0;
        for entry in entries {
            let mut call = match self.store.get_call(entry.call_id).await {
                Ok(Some(call)) => call,
                Ok(None) => {
                    debug!(call_id = entry.call_id, "Delayed call no longer exists");
                    continue;
                }
                Err(e) => {
                    error!(call_id = entry.call_id, "Failed to load delayed call: {}", e);
                    continue;
                }
            };
            if !self.registry.resolve(&mut call) {
                warn!(call_id = entry.call_id, "Delayed call no longer resolves");
            }

            if entry.release <= now {
                self.dispatcher.dispatch(call);
            } else if let Err(e) = self.store.push_delayed(&entry).await {
                error!(call_id = entry.call_id, "Failed to restore delayed entry: {}", e);
            } else {
                self.arm(entry, call);
                armed += 1;
            }
        }

        info!(armed, "Delayer started");
        Ok(armed)
    }

    /// Abort every armed timer; persisted entries are kept for the next start
    pub fn stop(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }

    /// Number of armed timers
    #[must_use]
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}
