//! Storage contract consumed by the ingestion pipeline

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdio_core::{
    Access, Apikey, Call, CallId, DelayedEntry, Downstream, Error, Group, Result, Scope, System,
    Tag, Talkgroup, Unit,
};
use serde::Serialize;
use std::time::Duration;

/// Largest page a call search may return
pub const MAX_SEARCH_LIMIT: u32 = 500;

/// Page size when a search names none
pub const DEFAULT_SEARCH_LIMIT: u32 = 200;

/// Inclusive bounds of the duplicate window around `timestamp`
///
/// # Errors
///
/// Returns a validation error when the window does not fit in a timestamp.
pub fn duplicate_bounds(
    timestamp: DateTime<Utc>,
    window: Duration,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let out_of_range = || Error::validation("dateTime", "timestamp out of range");
    let window = chrono::Duration::from_std(window).map_err(|_| out_of_range())?;
    let from = timestamp.checked_sub_signed(window).ok_or_else(out_of_range)?;
    let to = timestamp.checked_add_signed(window).ok_or_else(out_of_range)?;
    Ok((from, to))
}

/// Normalized call search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSearch {
    /// Only this system
    pub system: Option<u32>,
    /// Only this talkgroup
    pub talkgroup: Option<u32>,
    /// Only these (system, talkgroup) pairs, from group or tag filters
    pub pairs: Option<Vec<(u32, u32)>>,
    /// Anchor date: calls at or before it (descending) or at or after it (ascending)
    pub date: Option<DateTime<Utc>>,
    /// Oldest first
    pub ascending: bool,
    /// Page size
    pub limit: u32,
    /// Page offset
    pub offset: u32,
}

impl CallSearch {
    /// Clamp the page size into `1..=MAX_SEARCH_LIMIT`
    #[must_use]
    pub fn clamped_limit(&self) -> u32 {
        match self.limit {
            0 => DEFAULT_SEARCH_LIMIT,
            limit => limit.min(MAX_SEARCH_LIMIT),
        }
    }

    /// Whether a stored call with these refs and timestamp matches every filter
    /// except the anchor date
    #[must_use]
    pub fn matches(&self, scope: &Scope, system_ref: u32, talkgroup_ref: u32) -> bool {
        scope.has_access(system_ref, talkgroup_ref)
            && self.system.is_none_or(|s| s == system_ref)
            && self.talkgroup.is_none_or(|t| t == talkgroup_ref)
            && self
                .pairs
                .as_ref()
                .is_none_or(|pairs| pairs.contains(&(system_ref, talkgroup_ref)))
    }
}

/// One row of a search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    /// Call id
    pub id: CallId,
    /// Capture timestamp
    pub date_time: DateTime<Utc>,
    /// System reference
    pub system: u32,
    /// Talkgroup reference
    pub talkgroup: u32,
}

/// Result page of a call search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSearchResults {
    /// Matching calls across all pages
    pub count: u64,
    /// Oldest matching call
    pub date_start: Option<DateTime<Utc>>,
    /// Newest matching call
    pub date_stop: Option<DateTime<Utc>>,
    /// This page
    pub results: Vec<CallSummary>,
}

/// Persistence for calls, credentials, reference data and pending releases
#[async_trait]
pub trait Store: Send + Sync {
    /// All systems with their talkgroups and units
    async fn load_systems(&self) -> Result<Vec<System>>;

    /// All talkgroup groups
    async fn load_groups(&self) -> Result<Vec<Group>>;

    /// All talkgroup tags
    async fn load_tags(&self) -> Result<Vec<Tag>>;

    /// Create a system, returning its id. Created systems auto-populate.
    async fn create_system(&self, system_ref: u32, label: &str) -> Result<i64>;

    /// Create a group, returning its id
    async fn create_group(&self, label: &str) -> Result<i64>;

    /// Create a tag, returning its id
    async fn create_tag(&self, label: &str) -> Result<i64>;

    /// Create a talkgroup under `system_id`, returning its id
    async fn create_talkgroup(&self, system_id: i64, talkgroup: &Talkgroup) -> Result<i64>;

    /// Create a unit under `system_id`, or replace the label of the unit with the same ref
    async fn upsert_unit(&self, system_id: i64, unit: &Unit) -> Result<()>;

    /// All access codes
    async fn load_accesses(&self) -> Result<Vec<Access>>;

    /// All upload keys
    async fn load_apikeys(&self) -> Result<Vec<Apikey>>;

    /// All downstream relays
    async fn load_downstreams(&self) -> Result<Vec<Downstream>>;

    /// Persist a call with its frequency, unit and patch detail, returning its id
    async fn insert_call(&self, call: &Call) -> Result<CallId>;

    /// Load a call. The result carries refs in its metadata and is not resolved.
    async fn get_call(&self, id: CallId) -> Result<Option<Call>>;

    /// Number of persisted calls
    async fn count_calls(&self) -> Result<u64>;

    /// Whether a call exists for the pair within `window` either side of `timestamp`
    async fn find_duplicate(
        &self,
        system_ref: u32,
        talkgroup_ref: u32,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Result<bool>;

    /// Search calls within `scope`
    async fn search_calls(&self, search: &CallSearch, scope: &Scope) -> Result<CallSearchResults>;

    /// Record a pending release
    async fn push_delayed(&self, entry: &DelayedEntry) -> Result<()>;

    /// Remove the pending release for `call_id`
    async fn pop_delayed(&self, call_id: CallId) -> Result<()>;

    /// All pending releases
    async fn load_delayed(&self) -> Result<Vec<DelayedEntry>>;

    /// Remove every pending release
    async fn clear_delayed(&self) -> Result<()>;

    /// Check the backing store is reachable
    async fn health_check(&self) -> Result<()>;
}
