// Relational+FTS Backend (C5): the embedded reference implementation.
// SQLite holds the relational schema; an FTS5 virtual table kept in sync
// via row-level triggers provides lexical search; vectors are packed
// float32 blobs searched by brute-force cosine distance, joined back to
// `entry` on the surrogate `rowid` (a performance choice, not a
// requirement, see §9 design notes).
//
// All queries use the runtime `sqlx::query`/`query_as` API rather than
// the `query!` compile-time macros, since this backend has no live
// database to check schemas against at compile time.

use crate::backend::{
    EmbeddingStats, GlobalCounts, ListFilter, SearchBackend, SearchFilter, SearchHit, SemanticHit, TagCount,
};
use crate::entry::{Entry, EntryKind, EntryRef, Link, Source};
use crate::errors::{PyriteError, Result, StorageError};
use crate::types::{EntryId, Importance, KbName, RelationName, SortField, SortOrder, Tag, Title};
use crate::vector_codec;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

pub struct EmbeddedBackend {
    pool: SqlitePool,
}

fn storage_err(e: impl std::fmt::Display) -> PyriteError {
    PyriteError::StorageError(StorageError::Other(e.to_string()))
}

impl EmbeddedBackend {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path == ":memory:" { "sqlite::memory:".to_string() } else { format!("sqlite://{path}") };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let backend = Self { pool };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    async fn find_rowid(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT rowid FROM entry WHERE id = ?1 AND kb_name = ?2")
            .bind(id.as_str())
            .bind(kb_name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(row.map(|r| r.get::<i64, _>("rowid")))
    }

    fn row_to_entry_head(row: &SqliteRow) -> Result<Entry> {
        let metadata_text: String = row.get("metadata");
        let metadata: HashMap<String, Value> =
            serde_json::from_str(&metadata_text).map_err(|e| storage_err(e))?;

        let date: Option<String> = row.get("date");
        let date = date
            .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
            .transpose()
            .map_err(storage_err)?;

        let importance: Option<i64> = row.get("importance");
        let importance = importance.map(Importance::new).transpose().map_err(storage_err)?;

        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let indexed_at: String = row.get("indexed_at");

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
            created_at: DateTime::parse_from_rfc3339(&created_at).map_err(storage_err)?.with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&updated_at).map_err(storage_err)?.with_timezone(&Utc),
            indexed_at: DateTime::parse_from_rfc3339(&indexed_at).map_err(storage_err)?.with_timezone(&Utc),
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

    async fn load_children(&self, rowid: i64, entry: &mut Entry) -> Result<()> {
        let tag_rows = sqlx::query("SELECT tag_name FROM entry_tag WHERE entry_rowid = ?1")
            .bind(rowid)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.tags = tag_rows
            .into_iter()
            .map(|r| Tag::new(r.get::<String, _>("tag_name")).map_err(storage_err))
            .collect::<Result<_>>()?;

        let source_rows = sqlx::query("SELECT title, url, outlet, date, verified FROM source WHERE entry_rowid = ?1")
            .bind(rowid)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.sources = source_rows
            .into_iter()
            .map(|r| Source {
                title: r.get("title"),
                url: r.get("url"),
                outlet: r.get("outlet"),
                date: r.get("date"),
                verified: r.get::<i64, _>("verified") != 0,
            })
            .collect();

        let link_rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, relation, inverse_relation, note \
             FROM link WHERE source_rowid = ?1",
        )
        .bind(rowid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.links = link_rows.into_iter().map(row_to_link).collect::<Result<_>>()?;

        let ref_rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, field_name, target_type \
             FROM entry_ref WHERE source_rowid = ?1",
        )
        .bind(rowid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.entry_refs = ref_rows.into_iter().map(row_to_entry_ref).collect::<Result<_>>()?;

        let block_rows = sqlx::query(
            "SELECT block_id, heading, content, position, block_type FROM block \
             WHERE entry_rowid = ?1 ORDER BY position ASC",
        )
        .bind(rowid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        entry.blocks = block_rows
            .into_iter()
            .map(|r| crate::blocks::Block {
                block_id: r.get("block_id"),
                heading: r.get("heading"),
                content: r.get("content"),
                position: r.get::<i64, _>("position") as usize,
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

    fn build_list_where(filter: &ListFilter, params: &mut Vec<String>) -> String {
        let mut clauses = Vec::new();
        if let Some(kb) = &filter.kb_name {
            clauses.push("kb_name = ?".to_string());
            params.push(kb.as_str().to_string());
        }
        if let Some(entry_type) = &filter.entry_type {
            clauses.push("entry_type = ?".to_string());
            params.push(entry_type.clone());
        }
        if clauses.is_empty() {
            "1=1".to_string()
        } else {
            clauses.join(" AND ")
        }
    }
}

fn row_to_link(r: SqliteRow) -> Result<Link> {
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

fn row_to_entry_ref(r: SqliteRow) -> Result<EntryRef> {
    Ok(EntryRef {
        source_id: EntryId::new(r.get::<String, _>("source_id")).map_err(storage_err)?,
        source_kb: KbName::new(r.get::<String, _>("source_kb")).map_err(storage_err)?,
        target_id: EntryId::new(r.get::<String, _>("target_id")).map_err(storage_err)?,
        target_kb: KbName::new(r.get::<String, _>("target_kb")).map_err(storage_err)?,
        field_name: r.get("field_name"),
        target_type: r.get("target_type"),
    })
}

/// Wraps the first case-insensitive occurrence of any query term in
/// `<mark>...</mark>`, truncated to a reasonable snippet window.
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

#[async_trait]
impl SearchBackend for EmbeddedBackend {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

            CREATE TABLE IF NOT EXISTS entry (
                rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                kb_name TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                summary TEXT,
                file_path TEXT,
                date TEXT,
                importance INTEGER,
                status TEXT,
                location TEXT,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                indexed_at TEXT NOT NULL,
                created_by TEXT,
                modified_by TEXT,
                UNIQUE(id, kb_name)
            );

            CREATE TABLE IF NOT EXISTS tag (name TEXT PRIMARY KEY);

            CREATE TABLE IF NOT EXISTS entry_tag (
                entry_rowid INTEGER NOT NULL REFERENCES entry(rowid) ON DELETE CASCADE,
                tag_name TEXT NOT NULL,
                PRIMARY KEY (entry_rowid, tag_name)
            );

            CREATE TABLE IF NOT EXISTS source (
                entry_rowid INTEGER NOT NULL REFERENCES entry(rowid) ON DELETE CASCADE,
                title TEXT, url TEXT, outlet TEXT, date TEXT, verified INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS link (
                source_rowid INTEGER NOT NULL REFERENCES entry(rowid) ON DELETE CASCADE,
                source_id TEXT NOT NULL, source_kb TEXT NOT NULL,
                target_id TEXT NOT NULL, target_kb TEXT NOT NULL,
                relation TEXT NOT NULL, inverse_relation TEXT NOT NULL, note TEXT
            );

            CREATE TABLE IF NOT EXISTS entry_ref (
                source_rowid INTEGER NOT NULL REFERENCES entry(rowid) ON DELETE CASCADE,
                source_id TEXT NOT NULL, source_kb TEXT NOT NULL,
                target_id TEXT NOT NULL, target_kb TEXT NOT NULL,
                field_name TEXT NOT NULL, target_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS block (
                entry_rowid INTEGER NOT NULL REFERENCES entry(rowid) ON DELETE CASCADE,
                block_id TEXT NOT NULL, heading TEXT, content TEXT NOT NULL,
                position INTEGER NOT NULL, block_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS embedding (
                entry_rowid INTEGER PRIMARY KEY REFERENCES entry(rowid) ON DELETE CASCADE,
                vector BLOB NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS entry_fts USING fts5(
                id UNINDEXED, kb_name UNINDEXED,
                title, body, summary, location,
                tokenize = 'porter'
            );

            CREATE TRIGGER IF NOT EXISTS entry_ai AFTER INSERT ON entry BEGIN
                INSERT INTO entry_fts(rowid, id, kb_name, title, body, summary, location)
                VALUES (new.rowid, new.id, new.kb_name, new.title, new.body, new.summary, new.location);
            END;

            CREATE TRIGGER IF NOT EXISTS entry_ad AFTER DELETE ON entry BEGIN
                INSERT INTO entry_fts(entry_fts, rowid, id, kb_name, title, body, summary, location)
                VALUES('delete', old.rowid, old.id, old.kb_name, old.title, old.body, old.summary, old.location);
            END;

            CREATE TRIGGER IF NOT EXISTS entry_au AFTER UPDATE ON entry BEGIN
                INSERT INTO entry_fts(entry_fts, rowid, id, kb_name, title, body, summary, location)
                VALUES('delete', old.rowid, old.id, old.kb_name, old.title, old.body, old.summary, old.location);
                INSERT INTO entry_fts(rowid, id, kb_name, title, body, summary, location)
                VALUES (new.rowid, new.id, new.kb_name, new.title, new.body, new.summary, new.location);
            END;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let existing = sqlx::query("SELECT rowid, created_at, created_by FROM entry WHERE id = ?1 AND kb_name = ?2")
            .bind(entry.id.as_str())
            .bind(entry.kb_name.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let metadata_text = serde_json::to_string(&entry.metadata).map_err(storage_err)?;
        let date_text = entry.date.map(|d| d.format("%Y-%m-%d").to_string());
        let importance = entry.importance.map(|i| i.get() as i64);

        let rowid = if let Some(row) = existing {
            let rowid: i64 = row.get("rowid");
            let created_at: String = row.get("created_at");
            let created_by: Option<String> = row.get("created_by");

            sqlx::query(
                "UPDATE entry SET entry_type=?1, title=?2, body=?3, summary=?4, file_path=?5, date=?6, \
                 importance=?7, status=?8, location=?9, metadata=?10, updated_at=?11, indexed_at=?12, \
                 created_at=?13, created_by=?14, modified_by=?15 WHERE rowid = ?16",
            )
            .bind(entry.entry_type.as_str())
            .bind(entry.title.as_str())
            .bind(&entry.body)
            .bind(&entry.summary)
            .bind(&entry.file_path)
            .bind(&date_text)
            .bind(importance)
            .bind(&entry.status)
            .bind(&entry.location)
            .bind(&metadata_text)
            .bind(entry.updated_at.to_rfc3339())
            .bind(entry.indexed_at.to_rfc3339())
            .bind(created_at)
            .bind(entry.created_by.clone().or(created_by))
            .bind(&entry.modified_by)
            .bind(rowid)
            .execute(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

            for table in ["entry_tag", "link", "entry_ref", "block", "source"] {
                let col = if table == "entry_tag" || table == "source" || table == "block" { "entry_rowid" } else { "source_rowid" };
                sqlx::query(&format!("DELETE FROM {table} WHERE {col} = ?1"))
                    .bind(rowid)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            }
            sqlx::query("DELETE FROM embedding WHERE entry_rowid = ?1")
                .bind(rowid)
                .execute(&mut *tx)
                .await
                .ok();

            rowid
        } else {
            let result = sqlx::query(
                "INSERT INTO entry (id, kb_name, entry_type, title, body, summary, file_path, date, \
                 importance, status, location, metadata, created_at, updated_at, indexed_at, created_by, modified_by) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            )
            .bind(entry.id.as_str())
            .bind(entry.kb_name.as_str())
            .bind(entry.entry_type.as_str())
            .bind(entry.title.as_str())
            .bind(&entry.body)
            .bind(&entry.summary)
            .bind(&entry.file_path)
            .bind(&date_text)
            .bind(importance)
            .bind(&entry.status)
            .bind(&entry.location)
            .bind(&metadata_text)
            .bind(entry.created_at.to_rfc3339())
            .bind(entry.updated_at.to_rfc3339())
            .bind(entry.indexed_at.to_rfc3339())
            .bind(&entry.created_by)
            .bind(&entry.modified_by)
            .execute(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            result.last_insert_rowid()
        };

        for tag in &entry.tags {
            sqlx::query("INSERT OR IGNORE INTO tag (name) VALUES (?1)")
                .bind(tag.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
            sqlx::query("INSERT OR IGNORE INTO entry_tag (entry_rowid, tag_name) VALUES (?1, ?2)")
                .bind(rowid)
                .bind(tag.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        for source in &entry.sources {
            sqlx::query("INSERT INTO source (entry_rowid, title, url, outlet, date, verified) VALUES (?1,?2,?3,?4,?5,?6)")
                .bind(rowid)
                .bind(&source.title)
                .bind(&source.url)
                .bind(&source.outlet)
                .bind(&source.date)
                .bind(source.verified as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        for link in &entry.links {
            sqlx::query(
                "INSERT INTO link (source_rowid, source_id, source_kb, target_id, target_kb, relation, inverse_relation, note) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )
            .bind(rowid)
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
                "INSERT INTO entry_ref (source_rowid, source_id, source_kb, target_id, target_kb, field_name, target_type) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
            )
            .bind(rowid)
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
                "INSERT INTO block (entry_rowid, block_id, heading, content, position, block_type) VALUES (?1,?2,?3,?4,?5,?6)",
            )
            .bind(rowid)
            .bind(&block.block_id)
            .bind(&block.heading)
            .bind(&block.content)
            .bind(block.position as i64)
            .bind(block_type)
            .execute(&mut *tx)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        }

        tx.commit().await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(())
    }

    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entry WHERE id = ?1 AND kb_name = ?2")
            .bind(id.as_str())
            .bind(kb_name.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        let row = sqlx::query("SELECT * FROM entry WHERE id = ?1 AND kb_name = ?2")
            .bind(id.as_str())
            .bind(kb_name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let Some(row) = row else { return Ok(None) };
        let rowid: i64 = row.get("rowid");
        let mut entry = Self::row_to_entry_head(&row)?;
        self.load_children(rowid, &mut entry).await?;
        Ok(Some(entry))
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        let mut params = Vec::new();
        let where_clause = Self::build_list_where(filter, &mut params);
        let (sort_col, order) = sort_sql(filter.sort, filter.order);
        let limit = filter.limit.map(|l| l.get()).unwrap_or(crate::types::Limit::DEFAULT);

        let sql = format!(
            "SELECT * FROM entry WHERE {where_clause} ORDER BY {sort_col} {order} LIMIT {limit} OFFSET {}",
            filter.offset
        );
        let mut query = sqlx::query(&sql);
        for p in &params {
            query = query.bind(p);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let rowid: i64 = row.get("rowid");
            let mut entry = Self::row_to_entry_head(&row)?;
            if let Some(tag) = &filter.tag {
                let has_tag: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM entry_tag WHERE entry_rowid = ?1 AND tag_name = ?2",
                )
                .bind(rowid)
                .bind(tag.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
                if has_tag.is_none() {
                    continue;
                }
            }
            self.load_children(rowid, &mut entry).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        Ok(self.list_entries(filter).await?.len() as u64)
    }

    async fn search(&self, query: &crate::types::SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        let mut clauses = vec!["entry_fts MATCH ?1".to_string()];
        let mut params: Vec<String> = vec![query.as_str().to_string()];
        let mut idx = 2;

        if let Some(kb) = &filter.kb_name {
            clauses.push(format!("e.kb_name = ?{idx}"));
            params.push(kb.as_str().to_string());
            idx += 1;
        }
        if let Some(entry_type) = &filter.entry_type {
            clauses.push(format!("e.entry_type = ?{idx}"));
            params.push(entry_type.clone());
            idx += 1;
        }
        if let Some(from) = filter.date_from {
            clauses.push(format!("e.date >= ?{idx}"));
            params.push(from.format("%Y-%m-%d").to_string());
            idx += 1;
        }
        if let Some(to) = filter.date_to {
            clauses.push(format!("e.date <= ?{idx}"));
            params.push(to.format("%Y-%m-%d").to_string());
            idx += 1;
        }
        let _ = idx;

        let sql = format!(
            "SELECT e.*, bm25(entry_fts) as rank_score FROM entry_fts \
             JOIN entry e ON e.rowid = entry_fts.rowid \
             WHERE {} ORDER BY rank_score ASC, e.date DESC, e.title ASC LIMIT ?{}",
            clauses.join(" AND "),
            idx
        );
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = q.bind(p);
        }
        q = q.bind(filter.limit.get() as i64);

        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let mut hits = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            let rowid: i64 = row.get("rowid");
            let entry = Self::row_to_entry_head(&row)?;
            if !filter.tags.is_empty() {
                let all = all_tags_present(&self.pool, rowid, &filter.tags).await?;
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
        let mut sql = "SELECT * FROM entry WHERE date >= ?1 AND date <= ?2".to_string();
        if kb_name.is_some() {
            sql.push_str(" AND kb_name = ?3");
        }
        let mut q = sqlx::query(&sql).bind(from.format("%Y-%m-%d").to_string()).bind(to.format("%Y-%m-%d").to_string());
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let mut entries = Vec::new();
        for row in rows {
            let rowid: i64 = row.get("rowid");
            let mut entry = Self::row_to_entry_head(&row)?;
            self.load_children(rowid, &mut entry).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let pattern = format!("{prefix}/%");
        let mut sql = "SELECT DISTINCT e.* FROM entry e JOIN entry_tag et ON et.entry_rowid = e.rowid \
             WHERE (et.tag_name = ?1 OR et.tag_name LIKE ?2)"
            .to_string();
        if kb_name.is_some() {
            sql.push_str(" AND e.kb_name = ?3");
        }
        let mut q = sqlx::query(&sql).bind(prefix).bind(pattern);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        let mut entries = Vec::new();
        for row in rows {
            let rowid: i64 = row.get("rowid");
            let mut entry = Self::row_to_entry_head(&row)?;
            self.load_children(rowid, &mut entry).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool> {
        let Some(rowid) = self.find_rowid(id, kb_name).await? else { return Ok(false) };
        let packed = vector_codec::pack(vector);
        sqlx::query("INSERT OR REPLACE INTO embedding (entry_rowid, vector) VALUES (?1, ?2)")
            .bind(rowid)
            .bind(packed)
            .execute(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(true)
    }

    async fn search_semantic(&self, vector: &[f32], kb_name: Option<&KbName>, limit: usize, max_distance: f32) -> Result<Vec<SemanticHit>> {
        let mut sql = "SELECT e.*, em.vector as vector FROM embedding em JOIN entry e ON e.rowid = em.entry_rowid".to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE e.kb_name = ?1");
        }
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let mut scored = Vec::new();
        for row in rows {
            let packed: Vec<u8> = row.get("vector");
            let stored = vector_codec::unpack(&packed);
            let distance = vector_codec::cosine_distance(vector, &stored);
            if distance > max_distance {
                continue;
            }
            let entry = Self::row_to_entry_head(&row)?;
            scored.push((distance, entry));
        }
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (distance, entry))| SemanticHit {
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
                distance,
            })
            .collect())
    }

    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool> {
        let stats = self.embedding_stats(kb_name).await?;
        Ok(stats.embedded_count > 0)
    }

    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats> {
        let total: i64 = if let Some(kb) = kb_name {
            sqlx::query_scalar("SELECT COUNT(*) FROM entry WHERE kb_name = ?1")
                .bind(kb.as_str())
                .fetch_one(&self.pool)
                .await
        } else {
            sqlx::query_scalar("SELECT COUNT(*) FROM entry").fetch_one(&self.pool).await
        }
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        let embedded: i64 = if let Some(kb) = kb_name {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM embedding em JOIN entry e ON e.rowid = em.entry_rowid WHERE e.kb_name = ?1",
            )
            .bind(kb.as_str())
            .fetch_one(&self.pool)
            .await
        } else {
            sqlx::query_scalar("SELECT COUNT(*) FROM embedding").fetch_one(&self.pool).await
        }
        .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;

        Ok(EmbeddingStats { total_entries: total as u64, embedded_count: embedded as u64 })
    }

    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let Some(rowid) = self.find_rowid(id, kb_name).await? else { return Ok(false) };
        let result = sqlx::query("DELETE FROM embedding WHERE entry_rowid = ?1")
            .bind(rowid)
            .execute(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT source_id, source_kb, target_id, target_kb, relation, inverse_relation, note \
             FROM link WHERE target_id = ?1 AND target_kb = ?2",
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
             FROM link WHERE source_id = ?1 AND source_kb = ?2",
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
            sql.push_str(" WHERE e.kb_name = ?");
        }
        sql.push_str(" ORDER BY link_count DESC LIMIT ?");
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
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
            sql.push_str(" AND e.kb_name = ?1");
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
             JOIN entry e ON e.rowid = et.entry_rowid"
            .to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE e.kb_name = ?1");
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
            Some(p) => all
                .into_iter()
                .filter(|t| t.tag == p || t.tag.starts_with(&format!("{p}/")))
                .collect(),
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
            clauses.push(format!("kb_name = ?{idx}"));
            binds.push(kb.as_str().to_string());
            idx += 1;
        }
        if let Some(from) = from {
            clauses.push(format!("date >= ?{idx}"));
            binds.push(from.format("%Y-%m-%d").to_string());
            idx += 1;
        }
        if let Some(to) = to {
            clauses.push(format!("date <= ?{idx}"));
            binds.push(to.format("%Y-%m-%d").to_string());
            idx += 1;
        }
        if let Some(min) = min_importance {
            clauses.push(format!("importance >= ?{idx}"));
            binds.push(min.get().to_string());
            idx += 1;
        }
        let sql = format!(
            "SELECT * FROM entry WHERE {} ORDER BY date ASC LIMIT ?{}",
            clauses.join(" AND "),
            idx
        );
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
             FROM entry_ref WHERE source_id = ?1 AND source_kb = ?2",
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
             FROM entry_ref WHERE target_id = ?1 AND target_kb = ?2",
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
        let rows = sqlx::query(
            "SELECT * FROM entry WHERE kb_name = ?1 AND file_path LIKE ?2 AND entry_type != 'collection'",
        )
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
            sql.push_str(" WHERE source_kb = ?1 OR target_kb = ?1");
        }
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter().map(row_to_link).collect()
    }

    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
        let rows = sqlx::query("SELECT id, indexed_at FROM entry WHERE kb_name = ?1")
            .bind(kb_name.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        rows.into_iter()
            .map(|r| {
                let id = EntryId::new(r.get::<String, _>("id")).map_err(storage_err)?;
                let indexed_at: String = r.get("indexed_at");
                let indexed_at = DateTime::parse_from_rfc3339(&indexed_at).map_err(storage_err)?.with_timezone(&Utc);
                Ok((id, indexed_at))
            })
            .collect()
    }

    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>> {
        let mut sql = "SELECT e.id, e.kb_name FROM embedding em JOIN entry e ON e.rowid = em.entry_rowid".to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE e.kb_name = ?1");
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
        let mut sql =
            "SELECT e.* FROM entry e LEFT JOIN embedding em ON em.entry_rowid = e.rowid WHERE em.entry_rowid IS NULL"
                .to_string();
        if kb_name.is_some() {
            sql.push_str(" AND e.kb_name = ?");
        }
        sql.push_str(" LIMIT ?");
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
        Ok(GlobalCounts {
            kb_count: kb_count as u64,
            entry_count: entry_count as u64,
            link_count: link_count as u64,
            tag_count: tag_count as u64,
        })
    }

    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>> {
        let mut sql = "SELECT DISTINCT entry_type FROM entry".to_string();
        if kb_name.is_some() {
            sql.push_str(" WHERE kb_name = ?1");
        }
        let mut q = sqlx::query(&sql);
        if let Some(kb) = kb_name {
            q = q.bind(kb.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        Ok(rows.into_iter().map(|r| r.get("entry_type")).collect())
    }
}

async fn all_tags_present(pool: &SqlitePool, rowid: i64, tags: &[Tag]) -> Result<bool> {
    for tag in tags {
        let present: Option<i64> = sqlx::query_scalar("SELECT 1 FROM entry_tag WHERE entry_rowid = ?1 AND tag_name = ?2")
            .bind(rowid)
            .bind(tag.as_str())
            .fetch_optional(pool)
            .await
            .map_err(|e| PyriteError::StorageError(StorageError::Sql(e)))?;
        if present.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::types::{EntryId, KbName, SearchQuery, Title};

    async fn backend() -> EmbeddedBackend {
        EmbeddedBackend::connect(":memory:").await.expect("in-memory sqlite should connect")
    }

    fn sample_entry(id: &str, title: &str, body: &str) -> Entry {
        Entry::new(
            EntryId::new(id).unwrap(),
            KbName::new("k").unwrap(),
            EntryKind::Note,
            Title::new(title).unwrap(),
            body.to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_s1() {
        let backend = backend().await;
        let mut entry = sample_entry("e1", "Quantum Computing", "Quantum entanglement.");
        entry.tags = vec![Tag::new("science").unwrap()];
        backend.upsert_entry(&entry).await.unwrap();

        let query = SearchQuery::new("Quantum").unwrap();
        let hits = backend.search(&query, &SearchFilter { kb_name: Some(KbName::new("k").unwrap()), limit: crate::types::Limit::new(10).unwrap(), ..Default::default() }).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "e1");

        let fetched = backend.get_entry(&EntryId::new("e1").unwrap(), &KbName::new("k").unwrap()).await.unwrap().unwrap();
        assert_eq!(fetched.tags.len(), 1);
        assert_eq!(fetched.tags[0].as_str(), "science");
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let backend = backend().await;
        let entry = sample_entry("e1", "Title", "Body");
        backend.upsert_entry(&entry).await.unwrap();
        backend.upsert_entry(&entry).await.unwrap();
        let fetched1 = backend.get_entry(&entry.id, &entry.kb_name).await.unwrap();
        backend.upsert_entry(&entry).await.unwrap();
        let fetched2 = backend.get_entry(&entry.id, &entry.kb_name).await.unwrap();
        assert_eq!(fetched1.unwrap().title.as_str(), fetched2.unwrap().title.as_str());
    }

    #[tokio::test]
    async fn sub_entity_replacement_drops_removed_tags() {
        let backend = backend().await;
        let mut entry = sample_entry("e1", "Title", "Body");
        entry.tags = vec![Tag::new("a").unwrap(), Tag::new("b").unwrap()];
        backend.upsert_entry(&entry).await.unwrap();

        entry.tags = vec![Tag::new("a").unwrap()];
        backend.upsert_entry(&entry).await.unwrap();

        let fetched = backend.get_entry(&entry.id, &entry.kb_name).await.unwrap().unwrap();
        assert_eq!(fetched.tags.len(), 1);
    }

    #[tokio::test]
    async fn cascade_delete_removes_owned_sub_entities() {
        let backend = backend().await;
        let mut entry = sample_entry("e1", "Title", "Body");
        entry.tags = vec![Tag::new("a").unwrap()];
        entry.sources = vec![Source { title: Some("s".into()), url: None, outlet: None, date: None, verified: false }];
        backend.upsert_entry(&entry).await.unwrap();
        backend.upsert_embedding(&entry.id, &entry.kb_name, &[1.0, 2.0]).await.unwrap();

        let removed = backend.delete_entry(&entry.id, &entry.kb_name).await.unwrap();
        assert!(removed);
        assert!(backend.get_entry(&entry.id, &entry.kb_name).await.unwrap().is_none());

        let all_tags = backend.get_all_tags(Some(&entry.kb_name)).await.unwrap();
        assert!(all_tags.is_empty());
    }

    #[tokio::test]
    async fn link_inverse_is_queryable_as_backlink_s2() {
        let backend = backend().await;
        let mut e1 = sample_entry("e1", "E1", "links to e2");
        e1.links = vec![Link {
            source_id: e1.id.clone(),
            source_kb: e1.kb_name.clone(),
            target_id: EntryId::new("e2").unwrap(),
            target_kb: e1.kb_name.clone(),
            relation: RelationName::new("mentions").unwrap(),
            inverse_relation: RelationName::new("mentioned_by").unwrap(),
            note: None,
        }];
        backend.upsert_entry(&e1).await.unwrap();
        let e2 = sample_entry("e2", "E2", "body");
        backend.upsert_entry(&e2).await.unwrap();

        let backlinks = backend.get_backlinks(&e2.id, &e2.kb_name).await.unwrap();
        assert_eq!(backlinks.len(), 1);
        assert_eq!(backlinks[0].relation.as_str(), "mentions");
        assert_eq!(backlinks[0].inverse_relation.as_str(), "mentioned_by");
    }

    #[tokio::test]
    async fn semantic_search_filters_by_max_distance() {
        let backend = backend().await;
        let entry = sample_entry("e1", "T", "b");
        backend.upsert_entry(&entry).await.unwrap();
        backend.upsert_embedding(&entry.id, &entry.kb_name, &[1.0, 0.0]).await.unwrap();

        let close = backend.search_semantic(&[1.0, 0.0], None, 10, 0.5).await.unwrap();
        assert_eq!(close.len(), 1);

        let far = backend.search_semantic(&[0.0, 1.0], None, 10, 0.1).await.unwrap();
        assert!(far.is_empty());
    }
}
