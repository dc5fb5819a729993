//! Tenant-scoped event storage: append-only log, single-character tag index,
//! replaceable/addressable semantics and filter translation to SQL.

use anyhow::{Context, Result};
use ap_core::nostr::{self, RawEvent};
use nostr_sdk::prelude::Keys;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use tokio::sync::broadcast;

use crate::filters::Filter;
use crate::kinds::{APPLICATION_DATA, RELAY_MEMBERS};

/// Non-fatal save outcome: the event id is already present. Distinguished
/// from transport errors by downcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("duplicate: event already present")]
pub struct DuplicateEvent;

pub struct EventStore {
    pool: Pool<Postgres>,
    schema: String,
    keys: Keys,
    broadcast: broadcast::Sender<RawEvent>,
}

/// Reduce a configured schema name to something safe to splice into
/// identifiers: lowercase alphanumerics and underscores, never starting with
/// a digit.
pub fn schema_slug(input: &str) -> String {
    let mut slug: String = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if slug.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        slug.insert(0, 't');
    }
    slug
}

impl EventStore {
    pub fn new(
        pool: Pool<Postgres>,
        schema: &str,
        keys: Keys,
        broadcast: broadcast::Sender<RawEvent>,
    ) -> Self {
        Self {
            pool,
            schema: schema_slug(schema),
            keys,
            broadcast,
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}__{}", self.schema, name)
    }

    pub async fn init(&self) -> Result<()> {
        let events = self.table("events");
        let event_tags = self.table("event_tags");
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {events} (
                    id TEXT PRIMARY KEY,
                    created_at BIGINT NOT NULL,
                    kind INTEGER NOT NULL,
                    pubkey TEXT NOT NULL,
                    content TEXT NOT NULL,
                    tags TEXT NOT NULL,
                    sig TEXT NOT NULL,
                    ingress BIGSERIAL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {events}_idx_created_at ON {events}(created_at)"
            ),
            format!("CREATE INDEX IF NOT EXISTS {events}_idx_kind ON {events}(kind)"),
            format!("CREATE INDEX IF NOT EXISTS {events}_idx_pubkey ON {events}(pubkey)"),
            format!(
                "CREATE INDEX IF NOT EXISTS {events}_idx_kind_pubkey_created_at ON {events}(kind, pubkey, created_at DESC)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {event_tags} (
                    event_id TEXT NOT NULL REFERENCES {events}(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {event_tags}_idx_event_id ON {event_tags}(event_id)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {event_tags}_idx_key_value ON {event_tags}(key, value)"
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("schema init failed")?;
        }

        self.init_fts().await;
        Ok(())
    }

    /// Full-text artifacts are best-effort: a database without the plpgsql
    /// extension still serves everything except the search constraint.
    async fn init_fts(&self) {
        let events = self.table("events");
        let statements = [
            format!("ALTER TABLE {events} ADD COLUMN IF NOT EXISTS search_vector tsvector"),
            format!(
                "CREATE INDEX IF NOT EXISTS {events}_idx_search ON {events} USING GIN(search_vector)"
            ),
            format!(
                "CREATE OR REPLACE FUNCTION {events}_update_search_vector() RETURNS trigger AS $$
                BEGIN
                    NEW.search_vector := to_tsvector('english', COALESCE(NEW.content, ''));
                    RETURN NEW;
                END;
                $$ LANGUAGE plpgsql"
            ),
            format!("DROP TRIGGER IF EXISTS {events}_search_update ON {events}"),
            format!(
                "CREATE TRIGGER {events}_search_update
                    BEFORE INSERT OR UPDATE ON {events}
                    FOR EACH ROW EXECUTE FUNCTION {events}_update_search_vector()"
            ),
        ];

        for statement in &statements {
            if let Err(err) = sqlx::query(statement).execute(&self.pool).await {
                tracing::warn!(schema = %self.schema, error = %err, "fts init warning");
            }
        }
    }

    /// Insert if unseen. The single INSERT with conflict detection makes this
    /// race-safe under concurrent writers: exactly one caller wins, the rest
    /// get `DuplicateEvent`.
    pub async fn save(&self, event: &RawEvent) -> Result<()> {
        let tags_json = serde_json::to_string(&event.tags)?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (id, created_at, kind, pubkey, content, tags, sig)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
            self.table("events")
        ))
        .bind(&event.id)
        .bind(event.created_at)
        .bind(event.kind as i32)
        .bind(&event.pubkey)
        .bind(&event.content)
        .bind(&tags_json)
        .bind(&event.sig)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save event {}", event.id))?
        .rows_affected();

        if inserted == 0 {
            return Err(DuplicateEvent.into());
        }

        // Only single-character keys are queryable through the index.
        let indexed: Vec<(&str, &str)> = event
            .tags
            .iter()
            .filter(|tag| tag.len() >= 2 && tag[0].len() == 1)
            .map(|tag| (tag[0].as_str(), tag[1].as_str()))
            .collect();

        if !indexed.is_empty() {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} (event_id, key, value) ",
                self.table("event_tags")
            ));
            builder.push_values(indexed, |mut row, (key, value)| {
                row.push_bind(&event.id).push_bind(key).push_bind(value);
            });
            if let Err(err) = builder.build().execute(&self.pool).await {
                tracing::warn!(id = %event.id, error = %err, "tag index insert failed");
            }
        }

        Ok(())
    }

    /// Replace semantics for replaceable and addressable kinds: the new event
    /// is dropped when a strictly newer version exists, and superseded
    /// versions are deleted only after the insert is durable.
    pub async fn replace(&self, event: &RawEvent) -> Result<()> {
        let mut filter = Filter {
            kinds: Some(vec![event.kind]),
            authors: Some(vec![event.pubkey.clone()]),
            ..Default::default()
        };
        if nostr::is_addressable_kind(event.kind) {
            filter = filter.tag("d", vec![event.d_tag().unwrap_or_default()]);
        }

        let mut should_save = true;
        let mut should_delete = Vec::new();
        for previous in self.query(&filter, 0).await? {
            if previous.created_at <= event.created_at {
                should_delete.push(previous.id);
            } else {
                should_save = false;
            }
        }

        if should_save {
            if let Err(err) = self.save(event).await {
                if err.downcast_ref::<DuplicateEvent>().is_none() {
                    return Err(err.context("failed to save replacement"));
                }
            }
        }

        for id in should_delete {
            self.delete(&id).await?;
        }

        Ok(())
    }

    /// Remove the event; the tag index cascades through the foreign key.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table("events")))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Filtered retrieval in (created_at DESC, ingress DESC) order. The
    /// ingress counter is the documented tiebreaker for equal timestamps.
    pub async fn query(&self, filter: &Filter, max_limit: u64) -> Result<Vec<RawEvent>> {
        if filter.limit_zero {
            return Ok(Vec::new());
        }

        let mut limit = filter.limit;
        if max_limit > 0 && limit.map_or(false, |requested| requested > max_limit) {
            limit = Some(max_limit);
        }

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT id, created_at, kind, pubkey, content, tags, sig FROM {} WHERE TRUE",
            self.table("events")
        ));
        self.apply_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, ingress DESC");
        if let Some(limit) = limit {
            builder.push(" LIMIT ");
            builder.push(limit.to_string());
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_row(&row) {
                Ok(event) => events.push(event),
                Err(err) => tracing::warn!(error = %err, "skipping undecodable event row"),
            }
        }
        Ok(events)
    }

    /// Total matching rows, ignoring any limit carried by the filter.
    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE TRUE",
            self.table("events")
        ));
        self.apply_filter(&mut builder, filter);

        let row = builder.build().fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    fn apply_filter<'args>(
        &self,
        builder: &mut QueryBuilder<'args, Postgres>,
        filter: &'args Filter,
    ) {
        if let Some(search) = &filter.search {
            builder.push(" AND search_vector @@ plainto_tsquery('english', ");
            builder.push_bind(search);
            builder.push(")");
        }
        if let Some(ids) = &filter.ids {
            builder.push(" AND id = ANY(");
            builder.push_bind(ids);
            builder.push(")");
        }
        if let Some(authors) = &filter.authors {
            builder.push(" AND pubkey = ANY(");
            builder.push_bind(authors);
            builder.push(")");
        }
        if let Some(kinds) = &filter.kinds {
            let kinds: Vec<i32> = kinds.iter().map(|kind| *kind as i32).collect();
            builder.push(" AND kind = ANY(");
            builder.push_bind(kinds);
            builder.push(")");
        }
        if let Some(since) = filter.since {
            builder.push(" AND created_at >= ");
            builder.push_bind(since);
        }
        if let Some(until) = filter.until {
            builder.push(" AND created_at <= ");
            builder.push_bind(until);
        }
        for (key, values) in &filter.tags {
            if values.is_empty() {
                continue;
            }
            // Multi-character keys are stored but not indexed; the constraint
            // is dropped rather than matched against nothing.
            if key.len() != 1 {
                continue;
            }
            builder.push(format!(
                " AND id IN (SELECT event_id FROM {} WHERE key = ",
                self.table("event_tags")
            ));
            builder.push_bind(key);
            builder.push(" AND value = ANY(");
            builder.push_bind(values);
            builder.push("))");
        }
    }

    /// Route by kind class; duplicate saves are a quiet no-op. Returns false
    /// when the event was already present.
    pub async fn store_event(&self, event: &RawEvent) -> Result<bool> {
        if nostr::is_replaceable_kind(event.kind) || nostr::is_addressable_kind(event.kind) {
            self.replace(event).await?;
            return Ok(true);
        }

        match self.save(event).await {
            Ok(()) => Ok(true),
            Err(err) if err.downcast_ref::<DuplicateEvent>().is_some() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Sign with the tenant key, persist, and optionally publish to live
    /// subscribers.
    pub async fn sign_and_store(
        &self,
        kind: u16,
        created_at: i64,
        tags: Vec<Vec<String>>,
        content: String,
        broadcast: bool,
    ) -> Result<RawEvent> {
        let event = nostr::build_signed_event_at(&self.keys, kind, created_at, tags, content)?;
        self.store_event(&event).await?;
        if broadcast {
            let _ = self.broadcast.send(event.clone());
        }
        Ok(event)
    }

    /// Singleton application-data record addressed by d tag. Returns an
    /// unsigned template when none is persisted yet.
    pub async fn get_or_create_application_data(&self, d: &str) -> Result<RawEvent> {
        let filter = Filter {
            kinds: Some(vec![APPLICATION_DATA]),
            limit: Some(1),
            ..Default::default()
        }
        .tag("d", vec![d.to_string()]);

        if let Some(event) = self.query(&filter, 0).await?.into_iter().next() {
            return Ok(event);
        }

        Ok(RawEvent {
            id: String::new(),
            pubkey: String::new(),
            created_at: nostr::now(),
            kind: APPLICATION_DATA,
            tags: vec![vec!["d".to_string(), d.to_string()]],
            content: String::new(),
            sig: String::new(),
        })
    }

    /// The canonical relay members list: a single replaceable record carrying
    /// one `member` tag per pubkey and the relay-originated `-` marker.
    pub async fn get_or_create_relay_members_list(&self) -> Result<RawEvent> {
        let filter = Filter {
            kinds: Some(vec![RELAY_MEMBERS]),
            limit: Some(1),
            ..Default::default()
        };

        if let Some(event) = self.query(&filter, 0).await?.into_iter().next() {
            return Ok(event);
        }

        Ok(RawEvent {
            id: String::new(),
            pubkey: String::new(),
            created_at: nostr::now(),
            kind: RELAY_MEMBERS,
            tags: vec![vec!["-".to_string()]],
            content: String::new(),
            sig: String::new(),
        })
    }
}

fn decode_row(row: &PgRow) -> Result<RawEvent> {
    let kind: i32 = row.try_get("kind")?;
    let tags_json: String = row.try_get("tags")?;
    Ok(RawEvent {
        id: row.try_get("id")?,
        pubkey: row.try_get("pubkey")?,
        created_at: row.try_get("created_at")?,
        kind: kind as u16,
        tags: serde_json::from_str(&tags_json)?,
        content: row.try_get("content")?,
        sig: row.try_get("sig")?,
    })
}
