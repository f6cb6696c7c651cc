//! Listener access codes, upload keys and downstream relays

use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A listener credential unlocked with a PIN code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    /// Database id
    #[serde(default)]
    pub id: Option<i64>,
    /// Secret code
    pub code: String,
    /// Display identity, shared by sessions counted against `limit`
    pub ident: String,
    /// Instant after which the code is refused
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    /// Maximum concurrent sessions for this ident
    #[serde(default)]
    pub limit: Option<u32>,
    /// Display order
    #[serde(default)]
    pub order: u32,
    /// Covered systems and talkgroups
    pub scope: Scope,
}

impl Access {
    /// The grant given to every session while no access codes exist
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            id: None,
            code: String::new(),
            ident: String::new(),
            expiration: None,
            limit: None,
            order: 0,
            scope: Scope::Wildcard,
        }
    }

    /// Whether the code is expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }

    /// Whether this grant covers `talkgroup_ref` within `system_ref`
    #[must_use]
    pub fn has_access(&self, system_ref: u32, talkgroup_ref: u32) -> bool {
        self.scope.has_access(system_ref, talkgroup_ref)
    }
}

/// All access codes. A non-empty table puts live sessions in restricted mode.
#[derive(Debug, Clone, Default)]
pub struct Accesses {
    list: Vec<Arc<Access>>,
}

impl Accesses {
    /// Build from loaded records; later records with a repeated code win
    #[must_use]
    pub fn new(records: impl IntoIterator<Item = Access>) -> Self {
        let mut accesses = Self::default();
        for access in records {
            accesses.add(access);
        }
        accesses
    }

    /// Add a code, or update the existing record with the same code in place.
    /// Returns `true` when a new record was added.
    pub fn add(&mut self, access: Access) -> bool {
        if let Some(existing) = self.list.iter_mut().find(|a| a.code == access.code) {
            *existing = Arc::new(access);
            false
        } else {
            self.list.push(Arc::new(access));
            true
        }
    }

    /// Access record for `code`
    #[must_use]
    pub fn get(&self, code: &str) -> Option<Arc<Access>> {
        self.list.iter().find(|a| a.code == code).cloned()
    }

    /// Whether listeners must authenticate
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.list.is_empty()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether there are no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// An upload credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Apikey {
    /// Database id
    #[serde(default)]
    pub id: Option<i64>,
    /// Secret key
    pub key: String,
    /// Display identity
    #[serde(default)]
    pub ident: String,
    /// Disabled keys are never returned by lookups
    #[serde(default)]
    pub disabled: bool,
    /// Display order
    #[serde(default)]
    pub order: u32,
    /// Systems and talkgroups this key may upload to
    pub scope: Scope,
}

impl Apikey {
    /// Whether this key may upload calls for `talkgroup_ref` within `system_ref`
    #[must_use]
    pub fn has_access(&self, system_ref: u32, talkgroup_ref: u32) -> bool {
        self.scope.has_access(system_ref, talkgroup_ref)
    }
}

/// All upload keys
#[derive(Debug, Clone, Default)]
pub struct Apikeys {
    list: Vec<Apikey>,
}

impl Apikeys {
    /// Build from loaded records
    #[must_use]
    pub fn new(records: impl IntoIterator<Item = Apikey>) -> Self {
        Self {
            list: records.into_iter().collect(),
        }
    }

    /// Enabled key record for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Apikey> {
        self.list.iter().find(|a| !a.disabled && a.key == key)
    }

    /// Number of records, disabled ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether there are no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// A relay server calls are forwarded to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downstream {
    /// Database id
    #[serde(default)]
    pub id: Option<i64>,
    /// Base URL of the relay
    pub url: String,
    /// Key presented to the relay
    pub apikey: String,
    /// Disabled relays receive nothing
    #[serde(default)]
    pub disabled: bool,
    /// Display order
    #[serde(default)]
    pub order: u32,
    /// Systems and talkgroups forwarded
    pub scope: Scope,
}

impl Downstream {
    /// Whether calls for `talkgroup_ref` within `system_ref` go to this relay
    #[must_use]
    pub fn has_access(&self, system_ref: u32, talkgroup_ref: u32) -> bool {
        !self.disabled && self.scope.has_access(system_ref, talkgroup_ref)
    }
}

/// All downstream relays
#[derive(Debug, Clone, Default)]
pub struct Downstreams {
    list: Vec<Arc<Downstream>>,
}

impl Downstreams {
    /// Build from loaded records, ordered by `order`
    #[must_use]
    pub fn new(records: impl IntoIterator<Item = Downstream>) -> Self {
        let mut list: Vec<Arc<Downstream>> = records.into_iter().map(Arc::new).collect();
        list.sort_by_key(|d| d.order);
        Self { list }
    }

    /// Relays that should receive a call for `talkgroup_ref` within `system_ref`
    #[must_use]
    pub fn matching(&self, system_ref: u32, talkgroup_ref: u32) -> Vec<Arc<Downstream>> {
        self.list
            .iter()
            .filter(|d| d.has_access(system_ref, talkgroup_ref))
            .cloned()
            .collect()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether there are no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
