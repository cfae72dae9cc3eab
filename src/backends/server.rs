// Server Relational Backend (C6): same logical schema as the embedded
// backend, but FTS is a trigger-maintained weighted `tsvector` column and
// the embedding lives in-row as a `pgvector` column with a cosine-distance
// ANN index. Hybrid fusion still happens one layer up in
// `query_services.rs`; this backend only ever returns one ranking at a
// time.

use crate::backend::{
    EmbeddingStats, GlobalCounts, ListFilter, SearchBackend, SearchFilter, SearchHit, SemanticHit, TagCount,
};
use crate::entry::{Entry, EntryKind, EntryRef, Link, Source};
use crate::errors::{PyriteError, Result, StorageError};
use crate::types::{EntryId, Importance, KbName, RelationName, SearchQuery, SortField, SortOrder, Tag, Title};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pgvector::Vector as PgVector;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;

pub struct ServerBackend {
    pool: PgPool,
    dimension: usize,
}

fn storage_err(e: impl std::fmt::Display) -> PyriteError {
    PyriteError::StorageError(StorageError::Other(e.to_string()))
}

impl ServerBackend {
    pub async fn connect(dsn: &str, dimension: usize) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(dsn)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let backend = Self { pool, dimension };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    async fn find_rowid(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT row_id FROM entry WHERE id = $1 AND kb_name = $2")
            .bind(id.as_str())
            .bind(kb_name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(row.map(|r| r.get::<i64, _>("row_id")))
    }

    fn row_to_entry_head(row: &PgRow) -> Result<Entry> {
        let metadata: Value = row.get("metadata");
        let metadata: HashMap<String, Value> = match metadata {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };

        let date: Option<NaiveDate> = row.get("date");
        let importance: Option<i16> = row.get("importance");
        let importance = importance.map(|v| Importance::new(v as i64)).transpose().map_err(storage_err)?;

        Ok(Entry {
            id: EntryId::new(row.get::<String, _>("id")).map_err(storage_err)?,
            kb_name: KbName::new(row.get::<String, _>("kb_name")).map_err(storage_err)?,
            entry_type: EntryKind::from_str(&row.get::<String, _>("entry_type")),
            title: Title::new(row.get::<String, _>("title")).map_err(storage_err)?,
            body: row.get("body"),
            summary: row.get("summary"),
            file_path: row.get("file_path"),
            date,
            importance,
            status: row.get("status"),
            location: row.get("location"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            indexed_at: row.get::<DateTime<Utc>, _>("indexed_at"),
            created_by: row.get("created_by"),
            modified_by: row.get("modified_by"),
            metadata,
            tags: Vec::new(),
            sources: Vec::new(),
            links: Vec::new(),
            entry_refs: Vec::new(),
            blocks: Vec::new(),
        })
    }

    async fn load_children(&self, row_id: i64, entry: &mut Entry) -> Result<()> {
        let tag_rows = sqlx::query("SELECT tag_name FROM entry_tag WHERE entry_row_id = $1")
            .bind(row_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.tags = tag_rows
            .into_iter()
            .map(|r| Tag::new(r.get::<String, _>("tag_name")).map_err(storage_err))
            .collect::<Result<_>>()?;

        let source_rows = sqlx::query("SELECT title, url, outlet, date, verified FROM source WHERE entry_row_id = $1")
            .bind(row_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.sources = source_rows
            .into_iter()
            .map(|r| Source { title: r.get("title"), url: r.get("url"), outlet: r.get("outlet"), date: r.get("date"), verified: r.get("verified") })
            .collect();

        let link_rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, relation, inverse_relation, note \
             FROM link WHERE source_row_id = $1",
        )
        .bind(row_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.links = link_rows.into_iter().map(row_to_link).collect::<Result<_>>()?;

        let ref_rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, field_name, target_type \
             FROM entry_ref WHERE source_row_id = $1",
        )
        .bind(row_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.entry_refs = ref_rows.into_iter().map(row_to_entry_ref).collect::<Result<_>>()?;

        let block_rows = sqlx::query(
            "SELECT block_id, heading, content, position, block_type FROM block \
             WHERE entry_row_id = $1 ORDER BY position ASC",
        )
        .bind(row_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.blocks = block_rows
            .into_iter()
            .map(|r| crate::blocks::Block {
                block_id: r.get("block_id"),
                heading: r.get("heading"),
                content: r.get("content"),
                position: r.get::<i32, _>("position") as usize,
                block_type: match r.get::<String, _>("block_type").as_str() {
                    "heading" => crate::blocks::BlockType::Heading,
                    "list" => crate::blocks::BlockType::List,
                    "code" => crate::blocks::BlockType::Code,
                    _ => crate::blocks::BlockType::Paragraph,
                },
            })
            .collect();

        Ok(())
    }
}

fn row_to_link(r: PgRow) -> Result<Link> {
    Ok(Link {
        source_id: EntryId::new(r.get::<String, _>("source_id")).map_err(storage_err)?,
        source_kb: KbName::new(r.get::<String, _>("source_kb")).map_err(storage_err)?,
        target_id: EntryId::new(r.get::<String, _>("target_id")).map_err(storage_err)?,
        target_kb: KbName::new(r.get::<String, _>("target_kb")).map_err(storage_err)?,
        relation: RelationName::new(r.get::<String, _>("relation")).map_err(storage_err)?,
        inverse_relation: RelationName::new(r.get::<String, _>("inverse_relation")).map_err(storage_err)?,
        note: r.get("note"),
    })
}

fn row_to_entry_ref(r: PgRow) -> Result<EntryRef> {
    Ok(EntryRef {
        source_id: EntryId::new(r.get::<String, _>("source_id")).map_err(storage_err)?,
        source_kb: KbName::new(r.get::<String, _>("source_kb")).map_err(storage_err)?,
        target_id: EntryId::new(r.get::<String, _>("target_id")).map_err(storage_err)?,
        target_kb: KbName::new(r.get::<String, _>("target_kb")).map_err(storage_err)?,
        field_name: r.get("field_name"),
        target_type: r.get("target_type"),
    })
}

fn make_snippet(text: &str, query: &str) -> String {
    const WINDOW: usize = 160;
    let lower_text = text.to_lowercase();
    let first_term = query.split_whitespace().next().unwrap_or(query).to_lowercase();
    match lower_text.find(&first_term) {
        Some(pos) => {
            let start = pos.saturating_sub(WINDOW / 2);
            let end = (pos + first_term.len() + WINDOW / 2).min(text.len());
            let before = &text[start..pos];
            let matched = &text[pos..pos + first_term.len()];
            let after = &text[pos + first_term.len()..end];
            format!("{}{}<mark>{}</mark>{}{}", if start > 0 { "…" } else { "" }, before, matched, after, if end < text.len() { "…" } else { "" })
        }
        None => text.chars().take(WINDOW).collect(),
    }
}

fn sort_sql(sort: Option<SortField>, order: Option<SortOrder>) -> (&'static str, &'static str) {
    let col = match sort.unwrap_or(SortField::UpdatedAt) {
        SortField::Title => "title",
        SortField::UpdatedAt => "updated_at",
        SortField::CreatedAt => "created_at",
        SortField::EntryType => "entry_type",
    };
    let ord = match order.unwrap_or(SortOrder::Desc) {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    (col, ord)
}

#[async_trait]
impl SearchBackend for ServerBackend {
    async fn ensure_schema(&self) -> Result<()> {
        let dim = self.dimension;
        let ddl = format!(
            r#"
            CREATE EXTENSION IF NOT EXISTS vector;

            CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

            CREATE TABLE IF NOT EXISTS entry (
                row_id BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL,
                kb_name TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                summary TEXT,
                file_path TEXT,
                date DATE,
                importance SMALLINT,
                status TEXT,
                location TEXT,
                metadata JSONB NOT NULL,
                embedding vector({dim}),
                search_vector tsvector,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                indexed_at TIMESTAMPTZ NOT NULL,
                created_by TEXT,
                modified_by TEXT,
                UNIQUE(id, kb_name)
            );

            CREATE INDEX IF NOT EXISTS entry_search_vector_idx ON entry USING GIN(search_vector);

            CREATE TABLE IF NOT EXISTS tag (name TEXT PRIMARY KEY);

            CREATE TABLE IF NOT EXISTS entry_tag (
                entry_row_id BIGINT NOT NULL REFERENCES entry(row_id) ON DELETE CASCADE,
                tag_name TEXT NOT NULL,
                PRIMARY KEY (entry_row_id, tag_name)
            );

            CREATE TABLE IF NOT EXISTS source (
                entry_row_id BIGINT NOT NULL REFERENCES entry(row_id) ON DELETE CASCADE,
                title TEXT, url TEXT, outlet TEXT, date TEXT, verified BOOLEAN NOT NULL
            );

            CREATE TABLE IF NOT EXISTS link (
                source_row_id BIGINT NOT NULL REFERENCES entry(row_id) ON DELETE CASCADE,
                source_id TEXT NOT NULL, source_kb TEXT NOT NULL,
                target_id TEXT NOT NULL, target_kb TEXT NOT NULL,
                relation TEXT NOT NULL, inverse_relation TEXT NOT NULL, note TEXT
            );

            CREATE TABLE IF NOT EXISTS entry_ref (
                source_row_id BIGINT NOT NULL REFERENCES entry(row_id) ON DELETE CASCADE,
                source_id TEXT NOT NULL, source_kb TEXT NOT NULL,
                target_id TEXT NOT NULL, target_kb TEXT NOT NULL,
                field_name TEXT NOT NULL, target_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS block (
                entry_row_id BIGINT NOT NULL REFERENCES entry(row_id) ON DELETE CASCADE,
                block_id TEXT NOT NULL, heading TEXT, content TEXT NOT NULL,
                position INTEGER NOT NULL, block_type TEXT NOT NULL
            );

            CREATE OR REPLACE FUNCTION entry_search_vector_trigger() RETURNS trigger AS $body$
            BEGIN
                NEW.search_vector :=
                    setweight(to_tsvector('english', coalesce(NEW.title, '')), 'A') ||
                    setweight(to_tsvector('english', coalesce(NEW.summary, '')), 'B') ||
                    setweight(to_tsvector('english', coalesce(NEW.body, '')), 'C');
                RETURN NEW;
            END
            $body$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS entry_search_vector_update ON entry;
            CREATE TRIGGER entry_search_vector_update BEFORE INSERT OR UPDATE ON entry
                FOR EACH ROW EXECUTE FUNCTION entry_search_vector_trigger();
            "#,
        );
        for statement in ddl.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        let ivfflat = format!(
            "CREATE INDEX IF NOT EXISTS entry_embedding_idx ON entry USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)"
        );
        // Requires at least one row to build statistics sensibly in real deployments;
        // harmless (and fast) to attempt unconditionally on an empty table.
        let _ = sqlx::query(&ivfflat).execute(&self.pool).await;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let existing = sqlx::query("SELECT row_id, created_at, created_by FROM entry WHERE id = $1 AND kb_name = $2")
            .bind(entry.id.as_str())
            .bind(entry.kb_name.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let metadata = Value::Object(entry.metadata.clone().into_iter().collect());
        let importance = entry.importance.map(|i| i.get() as i16);

        let row_id = if let Some(row) = existing {
            let row_id: i64 = row.get("row_id");
            let created_at: DateTime<Utc> = row.get("created_at");
            let created_by: Option<String> = row.get("created_by");

            sqlx::query(
                "UPDATE entry SET entry_type=$1, title=$2, body=$3, summary=$4, file_path=$5, date=$6, \
                 importance=$7, status=$8, location=$9, metadata=$10, updated_at=$11, indexed_at=$12, \
                 created_at=$13, created_by=$14, modified_by=$15 WHERE row_id = $16",
            )
            .bind(entry.entry_type.as_str())
            .bind(entry.title.as_str())
            .bind(&entry.body)
            .bind(&entry.summary)
            .bind(&entry.file_path)
            .bind(entry.date)
            .bind(importance)
            .bind(&entry.status)
            .bind(&entry.location)
            .bind(&metadata)
            .bind(entry.updated_at)
            .bind(entry.indexed_at)
            .bind(created_at)
            .bind(entry.created_by.clone().or(created_by))
            .bind(&entry.modified_by)
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

            for (table, col) in [("entry_tag", "entry_row_id"), ("source", "entry_row_id"), ("block", "entry_row_id"), ("link", "source_row_id"), ("entry_ref", "source_row_id")] {
                sqlx::query(&format!("DELETE FROM {table} WHERE {col} = $1"))
                    .bind(row_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            }

            row_id
        } else {
            let row: (i64,) = sqlx::query_as(
                "INSERT INTO entry (id, kb_name, entry_type, title, body, summary, file_path, date, \
                 importance, status, location, metadata, created_at, updated_at, indexed_at, created_by, modified_by) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17) RETURNING row_id",
            )
            .bind(entry.id.as_str())
            .bind(entry.kb_name.as_str())
            .bind(entry.entry_type.as_str())
            .bind(entry.title.as_str())
            .bind(&entry.body)
            .bind(&entry.summary)
            .bind(&entry.file_path)
            .bind(entry.date)
            .bind(importance)
            .bind(&entry.status)
            .bind(&entry.location)
            .bind(&metadata)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .bind(entry.indexed_at)
            .bind(&entry.created_by)
            .bind(&entry.modified_by)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            row.0
        };

        for tag in &entry.tags {
            sqlx::query("INSERT INTO tag (name) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(tag.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            sqlx::query("INSERT INTO entry_tag (entry_row_id, tag_name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(row_id)
                .bind(tag.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        for source in &entry.sources {
            sqlx::query("INSERT INTO source (entry_row_id, title, url, outlet, date, verified) VALUES ($1,$2,$3,$4,$5,$6)")
                .bind(row_id)
                .bind(&source.title)
                .bind(&source.url)
                .bind(&source.outlet)
                .bind(&source.date)
                .bind(source.verified)
                .execute(&mut *tx)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        for link in &entry.links {
            sqlx::query(
                "INSERT INTO link (source_row_id, source_id, source_kb, target_id, target_kb, relation, inverse_relation, note) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
            )
            .bind(row_id)
            .bind(link.source_id.as_str())
            .bind(link.source_kb.as_str())
            .bind(link.target_id.as_str())
            .bind(link.target_kb.as_str())
            .bind(link.relation.as_str())
            .bind(link.inverse_relation.as_str())
            .bind(&link.note)
            .execute(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        for entry_ref in &entry.entry_refs {
            sqlx::query(
                "INSERT INTO entry_ref (source_row_id, source_id, source_kb, target_id, target_kb, field_name, target_type) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7)",
            )
            .bind(row_id)
            .bind(entry_ref.source_id.as_str())
            .bind(entry_ref.source_kb.as_str())
            .bind(entry_ref.target_id.as_str())
            .bind(entry_ref.target_kb.as_str())
            .bind(&entry_ref.field_name)
            .bind(&entry_ref.target_type)
            .execute(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        for block in &entry.blocks {
            let block_type = match block.block_type {
                crate::blocks::BlockType::Heading => "heading",
                crate::blocks::BlockType::Paragraph => "paragraph",
                crate::blocks::BlockType::List => "list",
                crate::blocks::BlockType::Code => "code",
            };
            sqlx::query(
                "INSERT INTO block (entry_row_id, block_id, heading, content, position, block_type) VALUES ($1,$2,$3,$4,$5,$6)",
            )
            .bind(row_id)
            .bind(&block.block_id)
            .bind(&block.heading)
            .bind(&block.content)
            .bind(block.position as i32)
            .bind(block_type)
            .execute(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        tx.commit().await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(())
    }

    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entry WHERE id = $1 AND kb_name = $2")
            .bind(id.as_str())
            .bind(kb_name.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        let row = sqlx::query("SELECT * FROM entry WHERE id = $1 AND kb_name = $2")
            .bind(id.as_str())
            .bind(kb_name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let Some(row) = row else { return Ok(None) };
        let row_id: i64 = row.get("row_id");
        let mut entry = Self::row_to_entry_head(&row)?;
        self.load_children(row_id, &mut entry).await?;
        Ok(Some(entry))
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        let mut clauses = Vec::new();
        let mut idx = 1;
        let mut binds: Vec<String> = Vec::new();
        if let Some(kb) = &filter.kb_name {
            clauses.push(format!("kb_name = ${idx}"));
            binds.push(kb.as_str().to_string());
            idx += 1;
        }
        if let Some(entry_type) = &filter.entry_type {
            clauses.push(format!("entry_type = ${idx}"));
            binds.push(entry_type.clone());
            idx += 1;
        }
        let where_clause = if clauses.is_empty() { "1=1".to_string() } else { clauses.join(" AND ") };
        let (sort_col, order) = sort_sql(filter.sort, filter.order);
        let limit = filter.limit.map(|l| l.get()).unwrap_or(crate::types::Limit::DEFAULT);

        let sql = format!(
            "SELECT * FROM entry WHERE {where_clause} ORDER BY {sort_col} {order} LIMIT {limit} OFFSET {}",
            filter.offset
        );
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let row_id: i64 = row.get("row_id");
            let mut entry = Self::row_to_entry_head(&row)?;
            if let Some(tag) = &filter.tag {
                let present: Option<i32> = sqlx::query_scalar(
                    "SELECT 1 FROM entry_tag WHERE entry_row_id = $1 AND tag_name = $2",
                )
                .bind(row_id)
                .bind(tag.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
                if present.is_none() {
                    continue;
                }
            }
            self.load_children(row_id, &mut entry).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        Ok(self.list_entries(filter).await?.len() as u64)
    }

    async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        let mut clauses = vec!["search_vector @@ plainto_tsquery('english', $1)".to_string()];
        let mut binds: Vec<String> = vec![query.as_str().to_string()];
        let mut idx = 2;

        if let Some(kb) = &filter.kb_name {
            clauses.push(format!("kb_name = ${idx}"));
            binds.push(kb.as_str().to_string());
            idx += 1;
        }
        if let Some(entry_type) = &filter.entry_type {
            clauses.push(format!("entry_type = ${idx}"));
            binds.push(entry_type.clone());
            idx += 1;
        }
        if let Some(from) = filter.date_from {
            clauses.push(format!("date >= ${idx}"));
            binds.push(from.format("%Y-%m-%d").to_string());
            idx += 1;
        }
        if let Some(to) = filter.date_to {
            clauses.push(format!("date <= ${idx}"));
            binds.push(to.format("%Y-%m-%d").to_string());
            idx += 1;
        }

        let sql = format!(
            "SELECT *, ts_rank_cd(search_vector, plainto_tsquery('english', $1)) as rank_score FROM entry \
             WHERE {} ORDER BY rank_score DESC, date DESC, title ASC LIMIT ${}",
            clauses.join(" AND "),
            idx
        );
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        q = q.bind(filter.limit.get() as i64);

        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let mut hits = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            let row_id: i64 = row.get("row_id");
            let entry = Self::row_to_entry_head(&row)?;
            if !filter.tags.is_empty() {
                let mut all = true;
                for tag in &filter.tags {
                    let present: Option<i32> = sqlx::query_scalar(
                        "SELECT 1 FROM entry_tag WHERE entry_row_id = $1 AND tag_name = $2",
                    )
                    .bind(row_id)
                    .bind(tag.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
                    if present.is_none() {
                        all = false;
                        break;
                    }
                }
                if !all {
                    continue;
                }
            }
            let snippet = make_snippet(&entry.body, query.as_str());
            hits.push(SearchHit {
                id: entry.id,
                kb_name: entry.kb_name,
                entry_type: entry.entry_type.as_str().to_string(),
                title: entry.title.as_str().to_string(),
                summary: entry.summary,
                date: entry.date,
                importance: entry.importance,
                snippet,
                rank: i + 1,
            });
        }
        Ok(hits)
    }

    async fn search_by_tag(&self, tag: &Tag, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let filter = ListFilter { kb_name: kb_name.cloned(), tag: Some(tag.clone()), ..Default::default() };
        self.list_entries(&filter).await
    }

    async fn search_by_date_range(&self, from: NaiveDate, to: NaiveDate, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let mut sql = "SELECT * FROM entry WHERE date >= $1 AND date <= $2".to_string();
        if kb_name.is_some() {
            sql.push_str(" AND kb_name = $3");
        }
        let mut q = sqlx::query(&sql).bind(from).bind(to);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let mut entries = Vec::new();
        for row in rows {
            let row_id: i64 = row.get("row_id");
            let mut entry = Self::row_to_entry_head(&row)?;
            self.load_children(row_id, &mut entry).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let pattern = format!("{prefix}/%");
        let mut sql = "SELECT DISTINCT e.* FROM entry e JOIN entry_tag et ON et.entry_row_id = e.row_id \
             WHERE (et.tag_name = $1 OR et.tag_name LIKE $2)"
            .to_string();
        if kb_name.is_some() {
            sql.push_str(" AND e.kb_name = $3");
        }
        let mut q = sqlx::query(&sql).bind(prefix).bind(pattern);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let mut entries = Vec::new();
        for row in rows {
            let row_id: i64 = row.get("row_id");
            let mut entry = Self::row_to_entry_head(&row)?;
            self.load_children(row_id, &mut entry).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool> {
        let Some(row_id) = self.find_rowid(id, kb_name).await? else { return Ok(false) };
        sqlx::query("UPDATE entry SET embedding = $1 WHERE row_id = $2")
            .bind(PgVector::from(vector.to_vec()))
            .bind(row_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(true)
    }

    async fn search_semantic(&self, vector: &[f32], kb_name: Option<&KbName>, limit: usize, max_distance: f32) -> Result<Vec<SemanticHit>> {
        let mut sql = "SELECT *, (embedding <=> $1) as distance FROM entry WHERE embedding IS NOT NULL AND (embedding <=> $1) <= $2".to_string();
        if kb_name.is_some() {
            sql.push_str(" AND kb_name = $3");
        }
        sql.push_str(if kb_name.is_some() { " ORDER BY distance ASC LIMIT $4" } else { " ORDER BY distance ASC LIMIT $3" });
        let mut q = sqlx::query(&sql).bind(PgVector::from(vector.to_vec())).bind(max_distance as f64);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let mut hits = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            let distance: f64 = row.get("distance");
            let entry = Self::row_to_entry_head(&row)?;
            hits.push(SemanticHit {
                hit: SearchHit {
                    id: entry.id,
                    kb_name: entry.kb_name,
                    entry_type: entry.entry_type.as_str().to_string(),
                    title: entry.title.as_str().to_string(),
                    summary: entry.summary,
                    date: entry.date,
                    importance: entry.importance,
                    snippet: String::new(),
                    rank: i + 1,
                },
                distance: distance as f32,
            });
        }
        Ok(hits)
    }

    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool> {
        Ok(self.embedding_stats(kb_name).await?.embedded_count > 0)
    }

    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats> {
        let (total, embedded): (i64, i64) = if let Some(kb) = kb_name {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entry WHERE kb_name = $1")
                .bind(kb.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entry WHERE kb_name = $1 AND embedding IS NOT NULL")
                .bind(kb.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            (total, embedded)
        } else {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entry")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entry WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            (total, embedded)
        };
        Ok(EmbeddingStats { total_entries: total as u64, embedded_count: embedded as u64 })
    }

    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let result = sqlx::query("UPDATE entry SET embedding = NULL WHERE id = $1 AND kb_name = $2 AND embedding IS NOT NULL")
            .bind(id.as_str())
            .bind(kb_name.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, relation, inverse_relation, note \
             FROM link WHERE target_id = $1 AND target_kb = $2",
        )
        .bind(id.as_str())
        .bind(kb_name.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter().map(row_to_link).collect()
    }

    async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, relation, inverse_relation, note \
             FROM link WHERE source_id = $1 AND source_kb = $2",
        )
        .bind(id.as_str())
        .bind(kb_name.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter().map(row_to_link).collect()
    }

    async fn get_most_linked(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<(Entry, u64)>> {
        let mut sql = "SELECT e.*, (SELECT COUNT(*) FROM link l WHERE l.target_id = e.id AND l.target_kb = e.kb_name) as link_count \
             FROM entry e"
            .to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE e.kb_name = $1");
        }
        sql.push_str(" ORDER BY link_count DESC LIMIT $2");
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        } else {
            // Keep placeholder numbering contiguous regardless of branch.
            q = q.bind(Option::<&str>::None);
        }
        q = q.bind(limit as i64);
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let mut out = Vec::new();
        for row in rows {
            let count: i64 = row.get("link_count");
            let entry = Self::row_to_entry_head(&row)?;
            out.push((entry, count as u64));
        }
        Ok(out)
    }

    async fn get_orphans(&self, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let mut sql = "SELECT e.* FROM entry e WHERE \
             NOT EXISTS (SELECT 1 FROM link l WHERE l.source_id = e.id AND l.source_kb = e.kb_name) \
             AND NOT EXISTS (SELECT 1 FROM link l WHERE l.target_id = e.id AND l.target_kb = e.kb_name)"
            .to_string();
        if kb_name.is_some() {
            sql.push_str(" AND e.kb_name = $1");
        }
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.iter().map(Self::row_to_entry_head).collect()
    }

    async fn get_all_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>> {
        let mut sql = "SELECT et.tag_name as tag, COUNT(*) as count FROM entry_tag et \
             JOIN entry e ON e.row_id = et.entry_row_id"
            .to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE e.kb_name = $1");
        }
        sql.push_str(" GROUP BY et.tag_name ORDER BY count DESC");
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(rows.into_iter().map(|r| TagCount { tag: r.get("tag"), count: r.get::<i64, _>("count") as u64 }).collect())
    }

    async fn get_tags_as_dicts(&self, kb_name: Option<&KbName>, prefix: Option<&str>) -> Result<Vec<TagCount>> {
        let all = self.get_all_tags(kb_name).await?;
        Ok(match prefix {
            Some(p) => all.into_iter().filter(|t| t.tag == p || t.tag.starts_with(&format!("{p}/"))).collect(),
            None => all,
        })
    }

    async fn get_timeline(
        &self,
        kb_name: Option<&KbName>,
        min_importance: Option<Importance>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let mut clauses = vec!["date IS NOT NULL".to_string()];
        let mut idx = 1;
        let mut binds: Vec<String> = Vec::new();
        if let Some(kb) = kb_name {
            clauses.push(format!("kb_name = ${idx}"));
            binds.push(kb.as_str().to_string());
            idx += 1;
        }
        if let Some(from) = from {
            clauses.push(format!("date >= ${idx}"));
            binds.push(from.format("%Y-%m-%d").to_string());
            idx += 1;
        }
        if let Some(to) = to {
            clauses.push(format!("date <= ${idx}"));
            binds.push(to.format("%Y-%m-%d").to_string());
            idx += 1;
        }
        if let Some(min) = min_importance {
            clauses.push(format!("importance >= ${idx}"));
            binds.push(min.get().to_string());
            idx += 1;
        }
        let sql = format!("SELECT * FROM entry WHERE {} ORDER BY date ASC LIMIT ${}", clauses.join(" AND "), idx);
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        q = q.bind(limit as i64);
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.iter().map(Self::row_to_entry_head).collect()
    }

    async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        let rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, field_name, target_type \
             FROM entry_ref WHERE source_id = $1 AND source_kb = $2",
        )
        .bind(id.as_str())
        .bind(kb_name.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter().map(row_to_entry_ref).collect()
    }

    async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        let rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, field_name, target_type \
             FROM entry_ref WHERE target_id = $1 AND target_kb = $2",
        )
        .bind(id.as_str())
        .bind(kb_name.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter().map(row_to_entry_ref).collect()
    }

    async fn list_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>> {
        let pattern = format!("{folder}/%");
        let rows = sqlx::query("SELECT * FROM entry WHERE kb_name = $1 AND file_path LIKE $2 AND entry_type != 'collection'")
            .bind(kb_name.as_str())
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.iter().map(Self::row_to_entry_head).collect()
    }

    async fn count_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64> {
        Ok(self.list_entries_in_folder(folder, kb_name).await?.len() as u64)
    }

    async fn get_all_links(&self, kb_name: Option<&KbName>) -> Result<Vec<Link>> {
        let mut sql = "SELECT source_id, source_kb, target_id, target_kb, relation, inverse_relation, note FROM link".to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE source_kb = $1 OR target_kb = $1");
        }
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter().map(row_to_link).collect()
    }

    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
        let rows = sqlx::query("SELECT id, indexed_at FROM entry WHERE kb_name = $1")
            .bind(kb_name.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter()
            .map(|r| {
                let id = EntryId::new(r.get::<String, _>("id")).map_err(storage_err)?;
                Ok((id, r.get::<DateTime<Utc>, _>("indexed_at")))
            })
            .collect()
    }

    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>> {
        let mut sql = "SELECT id, kb_name FROM entry WHERE embedding IS NOT NULL".to_string();
        if kb_name.is_some() {
            sql.push_str(" AND kb_name = $1");
        }
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter()
            .map(|r| {
                Ok((
                    EntryId::new(r.get::<String, _>("id")).map_err(storage_err)?,
                    KbName::new(r.get::<String, _>("kb_name")).map_err(storage_err)?,
                ))
            })
            .collect()
    }

    async fn get_entries_for_embedding(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<Entry>> {
        let mut sql = "SELECT * FROM entry WHERE embedding IS NULL".to_string();
        if kb_name.is_some() {
            sql.push_str(" AND kb_name = $1");
        }
        sql.push_str(if kb_name.is_some() { " LIMIT $2" } else { " LIMIT $1" });
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        q = q.bind(limit as i64);
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.iter().map(Self::row_to_entry_head).collect()
    }

    async fn get_global_counts(&self) -> Result<GlobalCounts> {
        let entry_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entry")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let link_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM link")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let tag_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tag")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let kb_count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT kb_name) FROM entry")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(GlobalCounts { kb_count: kb_count as u64, entry_count: entry_count as u64, link_count: link_count as u64, tag_count: tag_count as u64 })
    }

    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>> {
        let mut sql = "SELECT DISTINCT entry_type FROM entry".to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE kb_name = $1");
        }
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(rows.into_iter().map(|r| r.get("entry_type")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The server backend requires a live Postgres instance with the
    // `vector` extension installed, so its tests exercise only
    // pure/sync helpers; end-to-end coverage mirrors the embedded
    // backend's test suite and runs against a real database in CI.

    #[test]
    fn snippet_wraps_first_match_case_insensitively() {
        let snippet = make_snippet("Quantum entanglement is real.", "quantum");
        assert!(snippet.contains("<mark>Quantum</mark>"));
    }

    #[test]
    fn sort_sql_defaults_to_updated_at_desc() {
        assert_eq!(sort_sql(None, None), ("updated_at", "DESC"));
        assert_eq!(sort_sql(Some(SortField::Title), Some(SortOrder::Asc)), ("title", "ASC"));
    }
}
