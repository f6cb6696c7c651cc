//! Access codes, upload keys and downstream relays held in memory

use parking_lot::RwLock;
use rdio_core::{Access, Accesses, Apikey, Apikeys, Downstream, Downstreams, Result};
use rdio_database::Store;
use std::sync::Arc;
use tracing::info;

/// Credential tables reloaded from storage on startup and on every change
#[derive(Debug, Default)]
pub struct Credentials {
    accesses: RwLock<Accesses>,
    apikeys: RwLock<Apikeys>,
    downstreams: RwLock<Downstreams>,
}

impl Credentials {
    /// Empty tables: open listening, no upload keys, no relays
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every table from `store`
    ///
    /// # Errors
    ///
    /// Returns an error if any table cannot be loaded; the previous tables are kept.
    pub async fn reload(&self, store: &dyn Store) -> Result<()> {
        let accesses = Accesses::new(store.load_accesses().await?);
        let apikeys = Apikeys::new(store.load_apikeys().await?);
        let downstreams = Downstreams::new(store.load_downstreams().await?);

        info!(
            accesses = accesses.len(),
            apikeys = apikeys.len(),
            downstreams = downstreams.len(),
            "Credentials loaded"
        );

        *self.accesses.write() = accesses;
        *self.apikeys.write() = apikeys;
        *self.downstreams.write() = downstreams;
        Ok(())
    }

    /// Whether listeners must authenticate
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.accesses.read().is_restricted()
    }

    /// Access record for `code`
    #[must_use]
    pub fn access(&self, code: &str) -> Option<Arc<Access>> {
        self.accesses.read().get(code)
    }

    /// Enabled upload key record for `key`
    #[must_use]
    pub fn apikey(&self, key: &str) -> Option<Apikey> {
        self.apikeys.read().get(key).cloned()
    }

    /// Relays that should receive a call for the pair
    #[must_use]
    pub fn downstreams(&self, system_ref: u32, talkgroup_ref: u32) -> Vec<Arc<Downstream>> {
        self.downstreams.read().matching(system_ref, talkgroup_ref)
    }
}
