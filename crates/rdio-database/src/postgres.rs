//! PostgreSQL implementation of [`Store`]

use crate::models::{
    AccessRow, ApikeyRow, CallFrequencyRow, CallRow, CallUnitRow, DelayedRow, DownstreamRow,
    LabelRow, SystemRow, TalkgroupRow, UnitRow, narrow, widen,
};
use crate::store::{CallSearch, CallSearchResults, CallSummary, Store, duplicate_bounds};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdio_core::{
    Access, Apikey, Call, CallId, CallMeta, CallUnit, DelayedEntry, Downstream, Error, Group,
    Result, Scope, System, Tag, Talkgroup, TalkgroupScope, Unit,
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use std::time::Duration;

fn db_error(context: &str) -> impl FnOnce(sqlx::Error) -> Error + '_ {
    move |e| Error::Database(format!("{context}: {e}"))
}

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Append the scope and filter predicates shared by counting and paging queries
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, search: &CallSearch, scope: &Scope) {
    builder.push(" WHERE TRUE");

    if let Scope::List(systems) = scope {
        builder.push(" AND (FALSE");
        for entry in systems {
            builder
                .push(" OR (system_ref = ")
                .push_bind(widen(entry.system_ref));
            if let TalkgroupScope::List(refs) = &entry.talkgroups {
                let refs: Vec<i64> = refs.iter().copied().map(widen).collect();
                builder.push(" AND talkgroup_ref = ANY(").push_bind(refs).push(")");
            }
            builder.push(")");
        }
        builder.push(")");
    }

    if let Some(system) = search.system {
        builder.push(" AND system_ref = ").push_bind(widen(system));
    }
    if let Some(talkgroup) = search.talkgroup {
        builder.push(" AND talkgroup_ref = ").push_bind(widen(talkgroup));
    }
    if let Some(pairs) = &search.pairs {
        builder.push(" AND (FALSE");
        for &(system, talkgroup) in pairs {
            builder
                .push(" OR (system_ref = ")
                .push_bind(widen(system))
                .push(" AND talkgroup_ref = ")
                .push_bind(widen(talkgroup))
                .push(")");
        }
        builder.push(")");
    }
}

fn push_date(builder: &mut QueryBuilder<'_, Postgres>, search: &CallSearch) {
    if let Some(date) = search.date {
        builder
            .push(if search.ascending {
                " AND date_time >= "
            } else {
                " AND date_time <= "
            })
            .push_bind(date);
    }
}

#[async_trait]
impl Store for PgStore {
    async fn load_systems(&self) -> Result<Vec<System>> {
        let system_rows: Vec<SystemRow> =
            sqlx::query_as("SELECT * FROM rdio_systems ORDER BY sort_order, system_ref")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("load systems"))?;
        let talkgroup_rows: Vec<TalkgroupRow> =
            sqlx::query_as("SELECT * FROM rdio_talkgroups ORDER BY sort_order, talkgroup_ref")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("load talkgroups"))?;
        let unit_rows: Vec<UnitRow> =
            sqlx::query_as("SELECT * FROM rdio_units ORDER BY sort_order, unit_ref")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("load units"))?;

        let mut talkgroups: HashMap<i64, Vec<Talkgroup>> = HashMap::new();
        for row in talkgroup_rows {
            let system_id = row.system_id;
            talkgroups
                .entry(system_id)
                .or_default()
                .push(Talkgroup::try_from(row)?);
        }
        let mut units: HashMap<i64, Vec<Unit>> = HashMap::new();
        for row in unit_rows {
            let system_id = row.system_id;
            units.entry(system_id).or_default().push(Unit::try_from(row)?);
        }

        system_rows
            .into_iter()
            .map(|row| {
                let mut system = System::try_from(row)?;
                system.talkgroups = talkgroups.remove(&system.id).unwrap_or_default();
                system.units = units.remove(&system.id).unwrap_or_default();
                Ok(system)
            })
            .collect()
    }

    async fn load_groups(&self) -> Result<Vec<Group>> {
        let rows: Vec<LabelRow> = sqlx::query_as("SELECT id, label FROM rdio_groups ORDER BY label")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("load groups"))?;
        Ok(rows.into_iter().map(Group::from).collect())
    }

    async fn load_tags(&self) -> Result<Vec<Tag>> {
        let rows: Vec<LabelRow> = sqlx::query_as("SELECT id, label FROM rdio_tags ORDER BY label")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("load tags"))?;
        Ok(rows.into_iter().map(Tag::from).collect())
    }

    async fn create_system(&self, system_ref: u32, label: &str) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO rdio_systems (system_ref, label, auto_populate) VALUES ($1, $2, TRUE) RETURNING id",
        )
        .bind(widen(system_ref))
        .bind(label)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("create system"))
    }

    async fn create_group(&self, label: &str) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO rdio_groups (label) VALUES ($1)
             ON CONFLICT (label) DO UPDATE SET label = EXCLUDED.label
             RETURNING id",
        )
        .bind(label)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("create group"))
    }

    async fn create_tag(&self, label: &str) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO rdio_tags (label) VALUES ($1)
             ON CONFLICT (label) DO UPDATE SET label = EXCLUDED.label
             RETURNING id",
        )
        .bind(label)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("create tag"))
    }

    async fn create_talkgroup(&self, system_id: i64, talkgroup: &Talkgroup) -> Result<i64> {
        let frequency = talkgroup.frequency.and_then(|f| i64::try_from(f).ok());
        sqlx::query_scalar(
            r"
            INSERT INTO rdio_talkgroups (
                system_id, talkgroup_ref, label, name, group_id, tag_id,
                delay_minutes, frequency, led, sort_order
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
        ",
        )
        .bind(system_id)
        .bind(widen(talkgroup.talkgroup_ref))
        .bind(&talkgroup.label)
        .bind(&talkgroup.name)
        .bind(talkgroup.group_id)
        .bind(talkgroup.tag_id)
        .bind(widen(talkgroup.delay))
        .bind(frequency)
        .bind(&talkgroup.led)
        .bind(widen(talkgroup.order))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("create talkgroup"))
    }

    async fn upsert_unit(&self, system_id: i64, unit: &Unit) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO rdio_units (system_id, unit_ref, label, sort_order)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (system_id, unit_ref) DO UPDATE SET label = EXCLUDED.label
        ",
        )
        .bind(system_id)
        .bind(widen(unit.unit_ref))
        .bind(&unit.label)
        .bind(widen(unit.order))
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert unit"))?;
        Ok(())
    }

    async fn load_accesses(&self) -> Result<Vec<Access>> {
        let rows: Vec<AccessRow> =
            sqlx::query_as("SELECT * FROM rdio_accesses ORDER BY sort_order, id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("load accesses"))?;
        rows.into_iter().map(Access::try_from).collect()
    }

    async fn load_apikeys(&self) -> Result<Vec<Apikey>> {
        let rows: Vec<ApikeyRow> =
            sqlx::query_as("SELECT * FROM rdio_apikeys ORDER BY sort_order, id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("load apikeys"))?;
        rows.into_iter().map(Apikey::try_from).collect()
    }

    async fn load_downstreams(&self) -> Result<Vec<Downstream>> {
        let rows: Vec<DownstreamRow> =
            sqlx::query_as("SELECT * FROM rdio_downstreams ORDER BY sort_order, id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("load downstreams"))?;
        rows.into_iter().map(Downstream::try_from).collect()
    }

    async fn insert_call(&self, call: &Call) -> Result<CallId> {
        let (Some(system_ref), Some(talkgroup_ref)) = (call.system_ref(), call.talkgroup_ref())
        else {
            return Err(Error::validation("call", "unresolved system or talkgroup"));
        };

        let mut tx = self.pool.begin().await.map_err(db_error("begin"))?;

        let id: CallId = sqlx::query_scalar(
            r"
            INSERT INTO rdio_calls (
                audio, audio_name, audio_type, date_time, frequency, site,
                system_ref, talkgroup_ref
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
        ",
        )
        .bind(&call.audio)
        .bind(&call.audio_name)
        .bind(&call.audio_mime)
        .bind(call.timestamp)
        .bind(call.frequency.and_then(|f| i64::try_from(f).ok()))
        .bind(&call.site_ref)
        .bind(widen(system_ref))
        .bind(widen(talkgroup_ref))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("insert call"))?;

        for frequency in &call.frequencies {
            sqlx::query(
                r"
                INSERT INTO rdio_call_frequencies (call_id, frequency, position, length, errors, spikes, dbm)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
            )
            .bind(id)
            .bind(i64::try_from(frequency.freq).unwrap_or_default())
            .bind(frequency.pos)
            .bind(frequency.len)
            .bind(frequency.errors.map(i64::from))
            .bind(frequency.spikes.map(i64::from))
            .bind(frequency.dbm.map(i64::from))
            .execute(&mut *tx)
            .await
            .map_err(db_error("insert call frequency"))?;
        }

        for unit in &call.units {
            sqlx::query(
                "INSERT INTO rdio_call_units (call_id, unit_ref, position, label) VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(widen(unit.unit_ref))
            .bind(unit.offset)
            .bind(&unit.label)
            .execute(&mut *tx)
            .await
            .map_err(db_error("insert call unit"))?;
        }

        for &patch in &call.patches {
            sqlx::query("INSERT INTO rdio_call_patches (call_id, talkgroup_ref) VALUES ($1, $2)")
                .bind(id)
                .bind(widen(patch))
                .execute(&mut *tx)
                .await
                .map_err(db_error("insert call patch"))?;
        }

        tx.commit().await.map_err(db_error("commit call"))?;
        Ok(id)
    }

    async fn get_call(&self, id: CallId) -> Result<Option<Call>> {
        let Some(row) = sqlx::query_as::<_, CallRow>("SELECT * FROM rdio_calls WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get call"))?
        else {
            return Ok(None);
        };

        let frequencies: Vec<CallFrequencyRow> = sqlx::query_as(
            "SELECT frequency, position, length, errors, spikes, dbm FROM rdio_call_frequencies WHERE call_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("get call frequencies"))?;

        let units: Vec<CallUnitRow> = sqlx::query_as(
            "SELECT unit_ref, position, label FROM rdio_call_units WHERE call_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("get call units"))?;

        let patches: Vec<i64> = sqlx::query_scalar(
            "SELECT talkgroup_ref FROM rdio_call_patches WHERE call_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("get call patches"))?;

        Ok(Some(Call {
            id: Some(row.id),
            audio: row.audio,
            audio_name: row.audio_name,
            audio_mime: row.audio_type,
            timestamp: row.date_time,
            site_ref: row.site,
            frequency: row.frequency.and_then(|f| u64::try_from(f).ok()),
            frequencies: frequencies.into_iter().map(Into::into).collect(),
            units: units
                .into_iter()
                .map(CallUnit::try_from)
                .collect::<Result<_>>()?,
            patches: patches
                .into_iter()
                .map(|p| narrow(p, "talkgroup_ref"))
                .collect::<Result<_>>()?,
            system: None,
            talkgroup: None,
            meta: CallMeta {
                system_ref: Some(narrow(row.system_ref, "system_ref")?),
                talkgroup_ref: Some(narrow(row.talkgroup_ref, "talkgroup_ref")?),
                ..CallMeta::default()
            },
        }))
    }

    async fn count_calls(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rdio_calls")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("count calls"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn find_duplicate(
        &self,
        system_ref: u32,
        talkgroup_ref: u32,
        timestamp: DateTime<Utc>,
        window: Duration,
    ) -> Result<bool> {
        let (from, to) = duplicate_bounds(timestamp, window)?;

        sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM rdio_calls
                WHERE system_ref = $1 AND talkgroup_ref = $2
                  AND date_time BETWEEN $3 AND $4
            )
        ",
        )
        .bind(widen(system_ref))
        .bind(widen(talkgroup_ref))
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("find duplicate"))
    }

    async fn search_calls(&self, search: &CallSearch, scope: &Scope) -> Result<CallSearchResults> {
        let mut bounds = QueryBuilder::<Postgres>::new(
            "SELECT MIN(date_time) AS date_start, MAX(date_time) AS date_stop FROM rdio_calls",
        );
        push_filters(&mut bounds, search, scope);
        let row = bounds
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("search bounds"))?;
        let date_start: Option<DateTime<Utc>> = row.try_get("date_start").map_err(db_error("search bounds"))?;
        let date_stop: Option<DateTime<Utc>> = row.try_get("date_stop").map_err(db_error("search bounds"))?;

        let mut counting = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM rdio_calls");
        push_filters(&mut counting, search, scope);
        push_date(&mut counting, search);
        let count: i64 = counting
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("search count"))?;

        let mut paging = QueryBuilder::<Postgres>::new(
            "SELECT id, date_time, system_ref, talkgroup_ref FROM rdio_calls",
        );
        push_filters(&mut paging, search, scope);
        push_date(&mut paging, search);
        paging
            .push(if search.ascending {
                " ORDER BY date_time ASC, id ASC"
            } else {
                " ORDER BY date_time DESC, id DESC"
            })
            .push(" LIMIT ")
            .push_bind(i64::from(search.clamped_limit()))
            .push(" OFFSET ")
            .push_bind(i64::from(search.offset));

        let rows = paging
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("search calls"))?;

        let results = rows
            .iter()
            .map(|row| {
                Ok(CallSummary {
                    id: row.try_get("id").map_err(db_error("search row"))?,
                    date_time: row.try_get("date_time").map_err(db_error("search row"))?,
                    system: narrow(row.try_get("system_ref").map_err(db_error("search row"))?, "system_ref")?,
                    talkgroup: narrow(
                        row.try_get("talkgroup_ref").map_err(db_error("search row"))?,
                        "talkgroup_ref",
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CallSearchResults {
            count: u64::try_from(count).unwrap_or_default(),
            date_start,
            date_stop,
            results,
        })
    }

    async fn push_delayed(&self, entry: &DelayedEntry) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO rdio_delayed (call_id, release_at) VALUES ($1, $2)
            ON CONFLICT (call_id) DO UPDATE SET release_at = EXCLUDED.release_at
        ",
        )
        .bind(entry.call_id)
        .bind(entry.release)
        .execute(&self.pool)
        .await
        .map_err(db_error("push delayed"))?;
        Ok(())
    }

    async fn pop_delayed(&self, call_id: CallId) -> Result<()> {
        sqlx::query("DELETE FROM rdio_delayed WHERE call_id = $1")
            .bind(call_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("pop delayed"))?;
        Ok(())
    }

    async fn load_delayed(&self) -> Result<Vec<DelayedEntry>> {
        let rows: Vec<DelayedRow> =
            sqlx::query_as("SELECT call_id, release_at FROM rdio_delayed ORDER BY release_at")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("load delayed"))?;
        Ok(rows.into_iter().map(DelayedEntry::from).collect())
    }

    async fn clear_delayed(&self) -> Result<()> {
        sqlx::query("DELETE FROM rdio_delayed")
            .execute(&self.pool)
            .await
            .map_err(db_error("clear delayed"))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_filters_render_scope_and_pairs() {
        let scope = Scope::from_value(&json!([
            {"id": 1, "talkgroups": "*"},
            {"id": 2, "talkgroups": [20, 21]},
        ]));
        let search = CallSearch {
            pairs: Some(vec![(1, 10)]),
            date: Some(Utc::now()),
            ..CallSearch::default()
        };

        let mut builder = QueryBuilder::<Postgres>::new("SELECT id FROM rdio_calls");
        push_filters(&mut builder, &search, &scope);
        push_date(&mut builder, &search);

        assert_eq!(
            builder.sql(),
            "SELECT id FROM rdio_calls WHERE TRUE AND (FALSE OR (system_ref = $1) OR (system_ref = $2 AND talkgroup_ref = ANY($3))) AND (FALSE OR (system_ref = $4 AND talkgroup_ref = $5)) AND date_time <= $6"
        );
    }

    #[test]
    fn test_wildcard_scope_adds_no_predicate() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT id FROM rdio_calls");
        push_filters(&mut builder, &CallSearch::default(), &Scope::Wildcard);

        assert_eq!(builder.sql(), "SELECT id FROM rdio_calls WHERE TRUE");
    }
}
