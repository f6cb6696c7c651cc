//! In-process store for tests and storage-less runs

use crate::store::{CallSearch, CallSearchResults, CallSummary, Store, duplicate_bounds};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rdio_core::{
    Access, Apikey, Call, CallId, DelayedEntry, Downstream, Error, Group, Result, Scope, System,
    Tag, Talkgroup, Unit,
};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    systems: Vec<System>,
    groups: Vec<Group>,
    tags: Vec<Tag>,
    accesses: Vec<Access>,
    apikeys: Vec<Apikey>,
    downstreams: Vec<Downstream>,
    calls: BTreeMap<CallId, Call>,
    delayed: BTreeMap<CallId, DelayedEntry>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn system_mut(&mut self, system_id: i64) -> Result<&mut System> {
        self.systems
            .iter_mut()
            .find(|s| s.id == system_id)
            .ok_or_else(|| Error::NotFound {
                resource: format!("system {system_id}"),
            })
    }
}

/// Store that keeps everything in memory behind a single lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a system; ids of zero are assigned
    pub fn add_system(&self, mut system: System) -> i64 {
        let mut inner = self.inner.write();
        if system.id == 0 {
            system.id = inner.next_id();
        }
        for talkgroup in &mut system.talkgroups {
            if talkgroup.id == 0 {
                talkgroup.id = inner.next_id();
            }
        }
        for unit in &mut system.units {
            if unit.id == 0 {
                unit.id = inner.next_id();
            }
        }
        let id = system.id;
        inner.systems.push(system);
        id
    }

    /// Seed an access code
    pub fn add_access(&self, access: Access) {
        self.inner.write().accesses.push(access);
    }

    /// Seed an upload key
    pub fn add_apikey(&self, apikey: Apikey) {
        self.inner.write().apikeys.push(apikey);
    }

    /// Seed a downstream relay
    pub fn add_downstream(&self, downstream: Downstream) {
        self.inner.write().downstreams.push(downstream);
    }

    /// Remove a call, leaving any pending release in place
    pub fn remove_call(&self, id: CallId) -> Option<Call> {
        self.inner.write().calls.remove(&id)
    }
}

fn stored_copy(call: &Call, id: CallId) -> Call {
    let mut stored = call.clone();
    stored.id = Some(id);
    stored.meta.system_ref = call.system_ref();
    stored.meta.talkgroup_ref = call.talkgroup_ref();
    stored.system = None;
    stored.talkgroup = None;
    stored
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_systems(&self) -> Result<Vec<System>> {
        let mut systems = self.inner.read().systems.clone();
        systems.sort_by_key(|s| (s.order, s.system_ref));
        Ok(systems)
    }

    async fn load_groups(&self) -> Result<Vec<Group>> {
        Ok(self.inner.read().groups.clone())
    }

    async fn load_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.inner.read().tags.clone())
    }

    async fn create_system(&self, system_ref: u32, label: &str) -> Result<i64> {
        let mut inner = self.inner.write();
        if inner.systems.iter().any(|s| s.system_ref == system_ref) {
            return Err(Error::Database(format!("system {system_ref} already exists")));
        }
        let id = inner.next_id();
        inner.systems.push(System {
            id,
            system_ref,
            label: label.to_string(),
            auto_populate: true,
            ..System::default()
        });
        Ok(id)
    }

    async fn create_group(&self, label: &str) -> Result<i64> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        inner.groups.push(Group {
            id,
            label: label.to_string(),
        });
        Ok(id)
    }

    async fn create_tag(&self, label: &str) -> Result<i64> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        inner.tags.push(Tag {
            id,
            label: label.to_string(),
        });
        Ok(id)
    }

    async fn create_talkgroup(&self, system_id: i64, talkgroup: &Talkgroup) -> Result<i64> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        let system = inner.system_mut(system_id)?;
        if system.talkgroup_by_ref(talkgroup.talkgroup_ref).is_some() {
            return Err(Error::Database(format!(
                "talkgroup {} already exists in system {}",
                talkgroup.talkgroup_ref, system.system_ref
            )));
        }
        system.talkgroups.push(Talkgroup {
            id,
            ..talkgroup.clone()
        });
        Ok(id)
    }

    async fn upsert_unit(&self, system_id: i64, unit: &Unit) -> Result<()> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        let system = inner.system_mut(system_id)?;
        match system.units.iter_mut().find(|u| u.unit_ref == unit.unit_ref) {
            Some(existing) => existing.label.clone_from(&unit.label),
            None => system.units.push(Unit { id, ..unit.clone() }),
        }
        Ok(())
    }

    async fn load_accesses(&self) -> Result<Vec<Access>> {
        Ok(self.inner.read().accesses.clone())
    }

    async fn load_apikeys(&self) -> Result<Vec<Apikey>> {
        Ok(self.inner.read().apikeys.clone())
    }

    async fn load_downstreams(&self) -> Result<Vec<Downstream>> {
        Ok(self.inner.read().downstreams.clone())
    }

    async fn insert_call(&self, call: &Call) -> Result<CallId> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        inner.calls.insert(id, stored_copy(call, id));
        Ok(id)
    }

    async fn get_call(&self, id: CallId) -> Result<Option<Call>> {
        Ok(self.inner.read().calls.get(&id).cloned())
    }

    async fn count_calls(&self) -> Result<u64> {
        Ok(self.inner.read().calls.len() as u64)
    }

    async fn find_duplicate(
        &self,
        system_ref: u32,
        talkgroup_ref: u32,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Result<bool> {
        let (from, to) = duplicate_bounds(timestamp, window)?;

        Ok(self.inner.read().calls.values().any(|call| {
            call.meta.system_ref == Some(system_ref)
                && call.meta.talkgroup_ref == Some(talkgroup_ref)
                && call.timestamp >= from
                && call.timestamp <= to
        }))
    }

    async fn search_calls(&self, search: &CallSearch, scope: &Scope) -> Result<CallSearchResults> {
        let inner = self.inner.read();
        let mut matching: Vec<CallSummary> = inner
            .calls
            .values()
            .filter_map(|call| {
                let (system, talkgroup) = (call.meta.system_ref?, call.meta.talkgroup_ref?);
                search
                    .matches(scope, system, talkgroup)
                    .then(|| CallSummary {
                        id: call.id.unwrap_or_default(),
                        date_time: call.timestamp,
                        system,
                        talkgroup,
                    })
            })
            .collect();

        let date_start = matching.iter().map(|c| c.date_time).min();
        let date_stop = matching.iter().map(|c| c.date_time).max();

        if let Some(date) = search.date {
            matching.retain(|c| {
                if search.ascending {
                    c.date_time >= date
                } else {
                    c.date_time <= date
                }
            });
        }
        if search.ascending {
            matching.sort_by_key(|c| (c.date_time, c.id));
        } else {
            matching.sort_by_key(|c| std::cmp::Reverse((c.date_time, c.id)));
        }

        let count = matching.len() as u64;
        let results = matching
            .into_iter()
            .skip(search.offset as usize)
            .take(search.clamped_limit() as usize)
            .collect();

        Ok(CallSearchResults {
            count,
            date_start,
            date_stop,
            results,
        })
    }

    async fn push_delayed(&self, entry: &DelayedEntry) -> Result<()> {
        self.inner.write().delayed.insert(entry.call_id, *entry);
        Ok(())
    }

    async fn pop_delayed(&self, call_id: CallId) -> Result<()> {
        self.inner.write().delayed.remove(&call_id);
        Ok(())
    }

    async fn load_delayed(&self) -> Result<Vec<DelayedEntry>> {
        Ok(self.inner.read().delayed.values().copied().collect())
    }

    async fn clear_delayed(&self) -> Result<()> {
        self.inner.write().delayed.clear();
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rdio_core::CallMeta;
    use serde_json::json;

    fn call_at(system: u32, talkgroup: u32, timestamp: DateTime<Utc>) -> Call {
        Call {
            audio: vec![0u8; 64],
            audio_name: "call.m4a".to_string(),
            audio_mime: "audio/mp4".to_string(),
            timestamp,
            meta: CallMeta {
                system_ref: Some(system),
                talkgroup_ref: Some(talkgroup),
                ..CallMeta::default()
            },
            ..Call::default()
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_strips_resolution() {
        let store = MemoryStore::new();
        let id = store.insert_call(&call_at(1, 10, at(0))).await.unwrap();
        let stored = store.get_call(id).await.unwrap().unwrap();

        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.meta.system_ref, Some(1));
        assert!(stored.system.is_none());
        assert_eq!(store.count_calls().await.unwrap(), 1);
        assert!(store.get_call(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_window() {
        let store = MemoryStore::new();
        store.insert_call(&call_at(1, 10, at(0))).await.unwrap();
        let window = Duration::from_millis(500);

        let near = at(0) + chrono::Duration::milliseconds(400);
        let far = at(0) + chrono::Duration::milliseconds(600);
        assert!(store.find_duplicate(1, 10, near, window).await.unwrap());
        assert!(!store.find_duplicate(1, 10, far, window).await.unwrap());
        assert!(!store.find_duplicate(1, 11, near, window).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_window_at_range_edges_is_an_error() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(500);

        for edge in [DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC] {
            let result = store.find_duplicate(1, 10, edge, window).await;
            assert!(matches!(result, Err(Error::Validation { .. })));
        }
    }

    #[tokio::test]
    async fn test_search_scope_sort_and_paging() {
        let store = MemoryStore::new();
        for (i, (system, talkgroup)) in [(1, 10), (1, 20), (2, 10), (1, 10)].into_iter().enumerate() {
            store
                .insert_call(&call_at(system, talkgroup, at(i64::try_from(i).unwrap() * 60)))
                .await
                .unwrap();
        }
        let scope = Scope::from_value(&json!([{"id": 1, "talkgroups": "*"}]));

        let results = store
            .search_calls(&CallSearch::default(), &scope)
            .await
            .unwrap();
        assert_eq!(results.count, 3);
        assert_eq!(results.date_start, Some(at(0)));
        assert_eq!(results.date_stop, Some(at(180)));
        let order: Vec<DateTime<Utc>> = results.results.iter().map(|c| c.date_time).collect();
        assert_eq!(order, vec![at(180), at(60), at(0)]);

        let search = CallSearch {
            talkgroup: Some(10),
            ascending: true,
            limit: 1,
            offset: 1,
            ..CallSearch::default()
        };
        let results = store.search_calls(&search, &scope).await.unwrap();
        assert_eq!(results.count, 2);
        assert_eq!(results.results.len(), 1);
        assert_eq!(results.results[0].date_time, at(180));

        let search = CallSearch {
            date: Some(at(60)),
            ..CallSearch::default()
        };
        let results = store.search_calls(&search, &Scope::Wildcard).await.unwrap();
        assert_eq!(results.count, 2);
    }

    #[tokio::test]
    async fn test_delayed_entries() {
        let store = MemoryStore::new();
        let entry = DelayedEntry {
            call_id: 7,
            release: at(300),
        };
        store.push_delayed(&entry).await.unwrap();
        store.push_delayed(&entry).await.unwrap();
        assert_eq!(store.load_delayed().await.unwrap(), vec![entry]);

        store.pop_delayed(7).await.unwrap();
        assert!(store.load_delayed().await.unwrap().is_empty());

        store.push_delayed(&entry).await.unwrap();
        store.clear_delayed().await.unwrap();
        assert!(store.load_delayed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reference_data_creation() {
        let store = MemoryStore::new();
        let system_id = store.create_system(5, "System 5").await.unwrap();
        assert!(store.create_system(5, "again").await.is_err());

        let talkgroup = Talkgroup {
            talkgroup_ref: 500,
            label: "500".to_string(),
            ..Talkgroup::default()
        };
        store.create_talkgroup(system_id, &talkgroup).await.unwrap();
        assert!(store.create_talkgroup(system_id, &talkgroup).await.is_err());
        assert!(store.create_talkgroup(system_id + 100, &talkgroup).await.is_err());

        let unit = Unit {
            unit_ref: 42,
            ..Unit::default()
        };
        store.upsert_unit(system_id, &unit).await.unwrap();
        store
            .upsert_unit(
                system_id,
                &Unit {
                    label: "Engine 4".to_string(),
                    ..unit
                },
            )
            .await
            .unwrap();

        let systems = store.load_systems().await.unwrap();
        assert_eq!(systems.len(), 1);
        assert!(systems[0].auto_populate);
        assert_eq!(systems[0].talkgroups.len(), 1);
        assert_eq!(systems[0].units.len(), 1);
        assert_eq!(systems[0].units[0].label, "Engine 4");
    }
}
