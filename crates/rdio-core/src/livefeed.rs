//! Per-session live feed subscriptions

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Sparse map of system reference to talkgroup reference to enabled flag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LiveFeedMatrix(BTreeMap<u32, BTreeMap<u32, bool>>);

impl LiveFeedMatrix {
    /// Decode a client `LFM` payload; anything unparseable disables everything
    #[must_use]
    pub fn from_value(value: Option<&Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether `talkgroup_ref` is enabled within `system_ref`
    #[must_use]
    pub fn is_enabled(&self, system_ref: u32, talkgroup_ref: u32) -> bool {
        self.0
            .get(&system_ref)
            .and_then(|talkgroups| talkgroups.get(&talkgroup_ref))
            .copied()
            .unwrap_or(false)
    }

    /// Whether a call on `talkgroup_ref` patched with `patches` should play
    #[must_use]
    pub fn admits(&self, system_ref: u32, talkgroup_ref: u32, patches: &[u32]) -> bool {
        self.is_enabled(system_ref, talkgroup_ref)
            || patches.iter().any(|&patch| self.is_enabled(system_ref, patch))
    }

    /// Whether any talkgroup is enabled
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.0.values().any(|talkgroups| talkgroups.values().any(|&on| on))
    }
}
