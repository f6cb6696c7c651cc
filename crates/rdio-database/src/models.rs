//! Database rows and their conversion into domain types

use chrono::{DateTime, Utc};
use rdio_core::{
    Access, Apikey, CallUnit, DelayedEntry, Downstream, Error, Frequency, Group, Result, Scope,
    System, Tag, Talkgroup, Unit,
};
use sqlx::FromRow;
use sqlx::types::Json;
use std::collections::BTreeSet;

/// Narrow a stored `BIGINT` into a reference or counter
pub(crate) fn narrow(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Database(format!("{column} out of range: {value}")))
}

/// Widen a reference into a `BIGINT` bind
pub(crate) fn widen(value: u32) -> i64 {
    i64::from(value)
}

/// Row of `rdio_systems`
#[derive(Debug, Clone, FromRow)]
pub struct SystemRow {
    /// Id
    pub id: i64,
    /// System reference
    pub system_ref: i64,
    /// Label
    pub label: String,
    /// Auto-populate flag
    pub auto_populate: bool,
    /// Blacklisted talkgroup references
    pub blacklists: Json<Vec<u32>>,
    /// Delay in minutes
    pub delay_minutes: i64,
    /// Display order
    pub sort_order: i64,
}

impl TryFrom<SystemRow> for System {
    type Error = Error;

    fn try_from(row: SystemRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            system_ref: narrow(row.system_ref, "system_ref")?,
            label: row.label,
            auto_populate: row.auto_populate,
            blacklists: row.blacklists.0.into_iter().collect::<BTreeSet<u32>>(),
            delay: narrow(row.delay_minutes, "delay_minutes")?,
            order: narrow(row.sort_order, "sort_order")?,
            talkgroups: Vec::new(),
            units: Vec::new(),
        })
    }
}

/// Row of `rdio_talkgroups`
#[derive(Debug, Clone, FromRow)]
pub struct TalkgroupRow {
    /// Id
    pub id: i64,
    /// Owning system
    pub system_id: i64,
    /// Talkgroup reference
    pub talkgroup_ref: i64,
    /// Label
    pub label: String,
    /// Name
    pub name: String,
    /// Group
    pub group_id: Option<i64>,
    /// Tag
    pub tag_id: Option<i64>,
    /// Delay in minutes
    pub delay_minutes: i64,
    /// Frequency in Hz
    pub frequency: Option<i64>,
    /// LED colour
    pub led: Option<String>,
    /// Display order
    pub sort_order: i64,
}

impl TryFrom<TalkgroupRow> for Talkgroup {
    type Error = Error;

    fn try_from(row: TalkgroupRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            talkgroup_ref: narrow(row.talkgroup_ref, "talkgroup_ref")?,
            label: row.label,
            name: row.name,
            group_id: row.group_id,
            tag_id: row.tag_id,
            delay: narrow(row.delay_minutes, "delay_minutes")?,
            frequency: row.frequency.and_then(|f| u64::try_from(f).ok()),
            led: row.led,
            order: narrow(row.sort_order, "sort_order")?,
        })
    }
}

/// Row of `rdio_units`
#[derive(Debug, Clone, FromRow)]
pub struct UnitRow {
    /// Id
    pub id: i64,
    /// Owning system
    pub system_id: i64,
    /// Unit reference
    pub unit_ref: i64,
    /// Label
    pub label: String,
    /// Display order
    pub sort_order: i64,
}

impl TryFrom<UnitRow> for Unit {
    type Error = Error;

    fn try_from(row: UnitRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            unit_ref: narrow(row.unit_ref, "unit_ref")?,
            label: row.label,
            order: narrow(row.sort_order, "sort_order")?,
        })
    }
}

/// Row of `rdio_groups` or `rdio_tags`
#[derive(Debug, Clone, FromRow)]
pub struct LabelRow {
    /// Id
    pub id: i64,
    /// Label
    pub label: String,
}

impl From<LabelRow> for Group {
    fn from(row: LabelRow) -> Self {
        Self {
            id: row.id,
            label: row.label,
        }
    }
}

impl From<LabelRow> for Tag {
    fn from(row: LabelRow) -> Self {
        Self {
            id: row.id,
            label: row.label,
        }
    }
}

/// Row of `rdio_accesses`
#[derive(Debug, Clone, FromRow)]
pub struct AccessRow {
    /// Id
    pub id: i64,
    /// Code
    pub code: String,
    /// Ident
    pub ident: String,
    /// Expiration
    pub expiration: Option<DateTime<Utc>>,
    /// Concurrent session limit
    pub session_limit: Option<i64>,
    /// Display order
    pub sort_order: i64,
    /// Scope in wire form
    pub scope: Json<Scope>,
}

impl TryFrom<AccessRow> for Access {
    type Error = Error;

    fn try_from(row: AccessRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            code: row.code,
            ident: row.ident,
            expiration: row.expiration,
            limit: row
                .session_limit
                .map(|limit| narrow(limit, "session_limit"))
                .transpose()?,
            order: narrow(row.sort_order, "sort_order")?,
            scope: row.scope.0,
        })
    }
}

/// Row of `rdio_apikeys`
#[derive(Debug, Clone, FromRow)]
pub struct ApikeyRow {
    /// Id
    pub id: i64,
    /// Key
    pub api_key: String,
    /// Ident
    pub ident: String,
    /// Disabled flag
    pub disabled: bool,
    /// Display order
    pub sort_order: i64,
    /// Scope in wire form
    pub scope: Json<Scope>,
}

impl TryFrom<ApikeyRow> for Apikey {
    type Error = Error;

    fn try_from(row: ApikeyRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            key: row.api_key,
            ident: row.ident,
            disabled: row.disabled,
            order: narrow(row.sort_order, "sort_order")?,
            scope: row.scope.0,
        })
    }
}

/// Row of `rdio_downstreams`
#[derive(Debug, Clone, FromRow)]
pub struct DownstreamRow {
    /// Id
    pub id: i64,
    /// URL
    pub url: String,
    /// Key presented to the relay
    pub api_key: String,
    /// Disabled flag
    pub disabled: bool,
    /// Display order
    pub sort_order: i64,
    /// Scope in wire form
    pub scope: Json<Scope>,
}

impl TryFrom<DownstreamRow> for Downstream {
    type Error = Error;

    fn try_from(row: DownstreamRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            url: row.url,
            apikey: row.api_key,
            disabled: row.disabled,
            order: narrow(row.sort_order, "sort_order")?,
            scope: row.scope.0,
        })
    }
}

/// Row of `rdio_calls`
#[derive(Debug, Clone, FromRow)]
pub struct CallRow {
    /// Id
    pub id: i64,
    /// Audio bytes
    pub audio: Vec<u8>,
    /// Audio filename
    pub audio_name: String,
    /// Audio MIME type
    pub audio_type: String,
    /// Capture timestamp
    pub date_time: DateTime<Utc>,
    /// Frequency in Hz
    pub frequency: Option<i64>,
    /// Site
    pub site: Option<String>,
    /// System reference
    pub system_ref: i64,
    /// Talkgroup reference
    pub talkgroup_ref: i64,
}

/// Row of `rdio_call_frequencies`
#[derive(Debug, Clone, FromRow)]
pub struct CallFrequencyRow {
    /// Frequency in Hz
    pub frequency: i64,
    /// Position in seconds
    pub position: Option<f64>,
    /// Length in seconds
    pub length: Option<f64>,
    /// Error count
    pub errors: Option<i64>,
    /// Spike count
    pub spikes: Option<i64>,
    /// Signal strength
    pub dbm: Option<i64>,
}

impl From<CallFrequencyRow> for Frequency {
    fn from(row: CallFrequencyRow) -> Self {
        Self {
            freq: u64::try_from(row.frequency).unwrap_or_default(),
            pos: row.position,
            len: row.length,
            errors: row.errors.and_then(|e| u32::try_from(e).ok()),
            spikes: row.spikes.and_then(|s| u32::try_from(s).ok()),
            dbm: row.dbm.and_then(|d| i32::try_from(d).ok()),
        }
    }
}

/// Row of `rdio_call_units`
#[derive(Debug, Clone, FromRow)]
pub struct CallUnitRow {
    /// Unit reference
    pub unit_ref: i64,
    /// Offset in seconds
    pub position: f64,
    /// Reported alias
    pub label: Option<String>,
}

impl TryFrom<CallUnitRow> for CallUnit {
    type Error = Error;

    fn try_from(row: CallUnitRow) -> Result<Self> {
        Ok(Self {
            unit_ref: narrow(row.unit_ref, "unit_ref")?,
            offset: row.position,
            label: row.label,
        })
    }
}

/// Row of `rdio_delayed`
#[derive(Debug, Clone, FromRow)]
pub struct DelayedRow {
    /// Held call
    pub call_id: i64,
    /// Release instant
    pub release_at: DateTime<Utc>,
}

impl From<DelayedRow> for DelayedEntry {
    fn from(row: DelayedRow) -> Self {
        Self {
            call_id: row.call_id,
            release: row.release_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_narrow_rejects_out_of_range() {
        assert_eq!(narrow(42, "system_ref").unwrap(), 42);
        assert!(narrow(-1, "system_ref").is_err());
        assert!(narrow(i64::from(u32::MAX) + 1, "system_ref").is_err());
        assert_eq!(widen(u32::MAX), 4_294_967_295);
    }

    #[test]
    fn test_system_row_conversion() {
        let row = SystemRow {
            id: 3,
            system_ref: 11,
            label: "County".to_string(),
            auto_populate: true,
            blacklists: Json(vec![5, 5, 9]),
            delay_minutes: 5,
            sort_order: 1,
        };
        let system = System::try_from(row).unwrap();

        assert_eq!(system.system_ref, 11);
        assert_eq!(system.blacklists, BTreeSet::from([5, 9]));
        assert_eq!(system.delay, 5);
        assert!(system.talkgroups.is_empty());
    }

    #[test]
    fn test_access_row_conversion() {
        let row = AccessRow {
            id: 1,
            code: "1234".to_string(),
            ident: "dispatch".to_string(),
            expiration: None,
            session_limit: Some(2),
            sort_order: 0,
            scope: Json(Scope::Wildcard),
        };
        let access = Access::try_from(row).unwrap();

        assert_eq!(access.id, Some(1));
        assert_eq!(access.limit, Some(2));
        assert!(access.has_access(99, 99));
    }
}
