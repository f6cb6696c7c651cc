//! Domain types for calls and radio reference data

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Persisted call identity
pub type CallId = i64;

/// Audio payloads at or below this size are WAV headers with no samples
pub const MIN_AUDIO_BYTES: usize = 44;

/// Latest accepted call timestamp in Unix seconds (2100-01-01T00:00:00Z)
pub const MAX_CALL_TIMESTAMP: i64 = 4_102_444_800;

/// One frequency observation recorded while the call was captured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frequency {
    /// Frequency in Hz
    #[serde(alias = "frequency")]
    pub freq: u64,

    /// Position within the audio in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<f64>,

    /// Duration on this frequency in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<f64>,

    /// Decode error count
    #[serde(default, rename = "errorCount", alias = "errors", skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,

    /// Spike count
    #[serde(default, rename = "spikeCount", alias = "spikes", skip_serializing_if = "Option::is_none")]
    pub spikes: Option<u32>,

    /// Signal strength in dBm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbm: Option<i32>,
}

/// One transmitting radio observed in the call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallUnit {
    /// Unit reference (radio id)
    #[serde(rename = "src")]
    pub unit_ref: u32,

    /// Offset within the audio in seconds
    #[serde(default, rename = "pos")]
    pub offset: f64,

    /// Alias reported by the recorder
    #[serde(default, rename = "tag", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Identification hints carried by an inbound call until it is resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMeta {
    /// System database id
    pub system_id: Option<i64>,
    /// System reference
    pub system_ref: Option<u32>,
    /// System label
    pub system_label: Option<String>,
    /// Talkgroup database id
    pub talkgroup_id: Option<i64>,
    /// Talkgroup reference
    pub talkgroup_ref: Option<u32>,
    /// Talkgroup label
    pub talkgroup_label: Option<String>,
    /// Talkgroup long name
    pub talkgroup_name: Option<String>,
    /// Group label
    pub talkgroup_group: Option<String>,
    /// Tag label
    pub talkgroup_tag: Option<String>,
}

/// One radio transmission
#[derive(Debug, Clone, Default)]
pub struct Call {
    /// Identity, assigned on persist
    pub id: Option<CallId>,
    /// Audio bytes
    pub audio: Vec<u8>,
    /// Audio filename
    pub audio_name: String,
    /// Audio MIME type
    pub audio_mime: String,
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Site reference
    pub site_ref: Option<String>,
    /// Primary frequency in Hz
    pub frequency: Option<u64>,
    /// Frequency observations
    pub frequencies: Vec<Frequency>,
    /// Unit observations
    pub units: Vec<CallUnit>,
    /// Patched talkgroup references
    pub patches: Vec<u32>,
    /// Resolved system
    pub system: Option<Arc<System>>,
    /// Resolved talkgroup
    pub talkgroup: Option<Talkgroup>,
    /// Resolution hints
    pub meta: CallMeta,
}

impl Call {
    /// System reference of the resolved system, or the hinted one
    #[must_use]
    pub fn system_ref(&self) -> Option<u32> {
        self.system
            .as_ref()
            .map(|system| system.system_ref)
            .or(self.meta.system_ref)
    }

    /// Talkgroup reference of the resolved talkgroup, or the hinted one
    #[must_use]
    pub fn talkgroup_ref(&self) -> Option<u32> {
        self.talkgroup
            .as_ref()
            .map(|talkgroup| talkgroup.talkgroup_ref)
            .or(self.meta.talkgroup_ref)
    }

    /// Both system and talkgroup are resolved
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.system.is_some() && self.talkgroup.is_some()
    }

    fn has_system_identity(&self) -> bool {
        self.system.is_some()
            || self.meta.system_id.is_some()
            || self.meta.system_ref.is_some()
            || self.meta.system_label.as_deref().is_some_and(|l| !l.is_empty())
    }

    fn has_talkgroup_identity(&self) -> bool {
        self.talkgroup.is_some()
            || self.meta.talkgroup_id.is_some()
            || self.meta.talkgroup_ref.is_some()
            || self.meta.talkgroup_label.as_deref().is_some_and(|l| !l.is_empty())
    }

    /// Reject calls that cannot enter the pipeline
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.len() <= MIN_AUDIO_BYTES {
            return Err(Error::validation("audio", "no audio"));
        }
        if self.timestamp.timestamp_millis() == 0 {
            return Err(Error::validation("dateTime", "no timestamp"));
        }
        if !(0..MAX_CALL_TIMESTAMP).contains(&self.timestamp.timestamp()) {
            return Err(Error::validation("dateTime", "timestamp out of range"));
        }
        if !self.has_system_identity() {
            return Err(Error::validation("system", "no system"));
        }
        if !self.has_talkgroup_identity() {
            return Err(Error::validation("talkgroup", "no talkgroup"));
        }
        Ok(())
    }
}

/// A radio system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    /// Database id
    pub id: i64,
    /// System reference
    pub system_ref: u32,
    /// Display label
    pub label: String,
    /// Create talkgroups and units for this system on sight
    pub auto_populate: bool,
    /// Talkgroup references whose calls are dropped
    pub blacklists: BTreeSet<u32>,
    /// Release delay in minutes
    pub delay: u32,
    /// Display order
    pub order: u32,
    /// Talkgroups
    pub talkgroups: Vec<Talkgroup>,
    /// Units
    pub units: Vec<Unit>,
}

impl System {
    /// Talkgroup by database id
    #[must_use]
    pub fn talkgroup_by_id(&self, id: i64) -> Option<&Talkgroup> {
        self.talkgroups.iter().find(|t| t.id == id)
    }

    /// Talkgroup by reference
    #[must_use]
    pub fn talkgroup_by_ref(&self, talkgroup_ref: u32) -> Option<&Talkgroup> {
        self.talkgroups.iter().find(|t| t.talkgroup_ref == talkgroup_ref)
    }

    /// Talkgroup by label
    #[must_use]
    pub fn talkgroup_by_label(&self, label: &str) -> Option<&Talkgroup> {
        self.talkgroups.iter().find(|t| t.label == label)
    }

    /// Unit by reference
    #[must_use]
    pub fn unit_by_ref(&self, unit_ref: u32) -> Option<&Unit> {
        self.units.iter().find(|u| u.unit_ref == unit_ref)
    }

    /// Whether calls for `talkgroup_ref` are dropped
    #[must_use]
    pub fn is_blacklisted(&self, talkgroup_ref: u32) -> bool {
        self.blacklists.contains(&talkgroup_ref)
    }

    /// Lowest talkgroup reference above every existing one
    #[must_use]
    pub fn next_talkgroup_ref(&self) -> u32 {
        self.talkgroups
            .iter()
            .map(|t| t.talkgroup_ref)
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }
}

/// A talkgroup within a system
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Talkgroup {
    /// Database id
    pub id: i64,
    /// Talkgroup reference
    pub talkgroup_ref: u32,
    /// Short label
    pub label: String,
    /// Long name
    pub name: String,
    /// Group id
    pub group_id: Option<i64>,
    /// Tag id
    pub tag_id: Option<i64>,
    /// Release delay in minutes, zero defers to the system
    pub delay: u32,
    /// Nominal frequency in Hz
    pub frequency: Option<u64>,
    /// LED colour hint for clients
    pub led: Option<String>,
    /// Display order
    pub order: u32,
}

/// A radio unit within a system
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Database id
    pub id: i64,
    /// Unit reference
    pub unit_ref: u32,
    /// Display label
    pub label: String,
    /// Display order
    pub order: u32,
}

/// Talkgroup group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Database id
    pub id: i64,
    /// Label
    pub label: String,
}

/// Talkgroup tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Database id
    pub id: i64,
    /// Label
    pub label: String,
}

/// A call whose release is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedEntry {
    /// Held call
    pub call_id: CallId,
    /// Instant the call becomes visible
    pub release: DateTime<Utc>,
}
