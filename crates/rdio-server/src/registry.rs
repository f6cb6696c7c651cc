//! Shared reference tables for systems, groups and tags

use parking_lot::RwLock;
use rdio_core::{Call, Group, System, Tag};
use std::sync::Arc;

/// Lock-guarded reference tables, one lock per table
#[derive(Debug, Default)]
pub struct Registry {
    systems: RwLock<Vec<Arc<System>>>,
    groups: RwLock<Vec<Group>>,
    tags: RwLock<Vec<Tag>>,
}

/// Labels resolved for a call, forwarded to downstream relays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLabels {
    /// System label
    pub system: Option<String>,
    /// Talkgroup label
    pub talkgroup: Option<String>,
    /// Talkgroup long name
    pub talkgroup_name: Option<String>,
    /// Group label
    pub group: Option<String>,
    /// Tag label
    pub tag: Option<String>,
}

impl Registry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every table wholesale
    pub fn replace(&self, systems: Vec<System>, groups: Vec<Group>, tags: Vec<Tag>) {
        *self.systems.write() = systems.into_iter().map(Arc::new).collect();
        *self.groups.write() = groups;
        *self.tags.write() = tags;
    }

    /// Snapshot of the systems table
    #[must_use]
    pub fn systems(&self) -> Vec<Arc<System>> {
        self.systems.read().clone()
    }

    /// System by reference
    #[must_use]
    pub fn system_by_ref(&self, system_ref: u32) -> Option<Arc<System>> {
        self.systems
            .read()
            .iter()
            .find(|s| s.system_ref == system_ref)
            .cloned()
    }

    /// Lowest system reference above every existing one
    #[must_use]
    pub fn next_system_ref(&self) -> u32 {
        self.systems
            .read()
            .iter()
            .map(|s| s.system_ref)
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    /// Group by label
    #[must_use]
    pub fn group_by_label(&self, label: &str) -> Option<Group> {
        self.groups.read().iter().find(|g| g.label == label).cloned()
    }

    /// Tag by label
    #[must_use]
    pub fn tag_by_label(&self, label: &str) -> Option<Tag> {
        self.tags.read().iter().find(|t| t.label == label).cloned()
    }

    /// Label of group `id`
    #[must_use]
    pub fn group_label(&self, id: i64) -> Option<String> {
        self.groups
            .read()
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.label.clone())
    }

    /// Label of tag `id`
    #[must_use]
    pub fn tag_label(&self, id: i64) -> Option<String> {
        self.tags
            .read()
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.label.clone())
    }

    /// Release delay in minutes for calls on the pair
    #[must_use]
    pub fn delay_for(&self, system_ref: u32, talkgroup_ref: u32) -> u32 {
        self.system_by_ref(system_ref).map_or(0, |system| {
            system
                .talkgroup_by_ref(talkgroup_ref)
                .map(|t| t.delay)
                .filter(|&d| d > 0)
                .unwrap_or(system.delay)
        })
    }

    /// Attach the system and talkgroup a call refers to
    ///
    /// Systems are matched by id, then ref, then label; talkgroups the same way
    /// within the matched system. Already attached objects are replaced with
    /// their current table entries so stale pointers never survive a reload.
    /// Returns whether both were found.
    pub fn resolve(&self, call: &mut Call) -> bool {
        let system = {
            let systems = self.systems.read();
            let meta = &call.meta;
            let current = call.system.as_ref().map(|s| s.id);
            current
                .or(meta.system_id)
                .and_then(|id| systems.iter().find(|s| s.id == id))
                .or_else(|| {
                    meta.system_ref
                        .and_then(|r| systems.iter().find(|s| s.system_ref == r))
                })
                .or_else(|| {
                    meta.system_label
                        .as_deref()
                        .filter(|l| !l.is_empty())
                        .and_then(|l| systems.iter().find(|s| s.label == l))
                })
                .cloned()
        };

        let Some(system) = system else {
            call.system = None;
            call.talkgroup = None;
            return false;
        };

        let meta = &call.meta;
        let talkgroup = call
            .talkgroup
            .as_ref()
            .map(|t| t.id)
            .or(meta.talkgroup_id)
            .and_then(|id| system.talkgroup_by_id(id))
            .or_else(|| {
                meta.talkgroup_ref
                    .and_then(|r| system.talkgroup_by_ref(r))
            })
            .or_else(|| {
                meta.talkgroup_label
                    .as_deref()
                    .filter(|l| !l.is_empty())
                    .and_then(|l| system.talkgroup_by_label(l))
            })
            .cloned();

        call.meta.system_id = Some(system.id);
        call.meta.system_ref = Some(system.system_ref);
        if let Some(talkgroup) = &talkgroup {
            call.meta.talkgroup_id = Some(talkgroup.id);
            call.meta.talkgroup_ref = Some(talkgroup.talkgroup_ref);
        }
        call.system = Some(system);
        call.talkgroup = talkgroup;
        call.is_resolved()
    }

    /// Labels for a resolved call
    #[must_use]
    pub fn labels(&self, call: &Call) -> CallLabels {
        let talkgroup = call.talkgroup.as_ref();
        CallLabels {
            system: call.system.as_ref().map(|s| s.label.clone()),
            talkgroup: talkgroup.map(|t| t.label.clone()),
            talkgroup_name: talkgroup.map(|t| t.name.clone()),
            group: talkgroup
                .and_then(|t| t.group_id)
                .and_then(|id| self.group_label(id)),
            tag: talkgroup
                .and_then(|t| t.tag_id)
                .and_then(|id| self.tag_label(id)),
        }
    }
}
