//! Client call list queries

use crate::registry::Registry;
use chrono::{DateTime, Utc};
use rdio_database::CallSearch;
use serde::{Deserialize, Serialize};

/// Search options sent by a client with `LCL`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallQuery {
    /// Anchor date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// Group label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Page size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Page offset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    /// Positive for oldest first, otherwise newest first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<i32>,
    /// System reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<u32>,
    /// Tag label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Talkgroup reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talkgroup: Option<u32>,
}

impl CallQuery {
    /// Translate into a store search, expanding group and tag labels into
    /// the (system, talkgroup) pairs that carry them
    #[must_use]
    pub fn to_search(&self, registry: &Registry) -> CallSearch {
        let group_id = self
            .group
            .as_deref()
            .map(|label| registry.group_by_label(label).map(|g| g.id));
        let tag_id = self
            .tag
            .as_deref()
            .map(|label| registry.tag_by_label(label).map(|t| t.id));

        let pairs = (group_id.is_some() || tag_id.is_some()).then(|| {
            registry
                .systems()
                .iter()
                .flat_map(|system| {
                    system
                        .talkgroups
                        .iter()
                        .filter(|t| group_id.is_none_or(|g| g.is_some() && t.group_id == g))
                        .filter(|t| tag_id.is_none_or(|g| g.is_some() && t.tag_id == g))
                        .map(|t| (system.system_ref, t.talkgroup_ref))
                        .collect::<Vec<_>>()
                })
                .collect()
        });

        CallSearch {
            system: self.system,
            talkgroup: self.talkgroup,
            pairs,
            date: self.date,
            ascending: self.sort.is_some_and(|s| s > 0),
            limit: self.limit.unwrap_or(0),
            offset: self.offset.unwrap_or(0),
        }
    }
}
