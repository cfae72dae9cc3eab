// Columnar Vector Backend (C7): a single denormalized `entries` Lance
// table (tags as an inline array column, embedding as an in-row fixed
// dimension vector column) plus four narrow Lance tables for links,
// sources, refs and blocks. FTS is served by an in-memory tantivy index
// rebuilt lazily whenever the entries table has been mutated since the
// last rebuild. Most multi-row operations fetch the full table and
// filter/sort in Rust rather than push predicates down into Lance, the
// same trade-off the original LanceDB-backed implementation made.

use crate::backend::{
    EmbeddingStats, GlobalCounts, ListFilter, SearchBackend, SearchFilter, SearchHit, SemanticHit, TagCount,
};
use crate::blocks::{Block, BlockType};
use crate::entry::{Entry, EntryKind, EntryRef, Link, Source};
use crate::errors::{PyriteError, Result, StorageError};
use crate::types::{EntryId, Importance, KbName, RelationName, SearchQuery, SortField, SortOrder, Tag, Title};
use crate::vector_codec::cosine_distance;
use arrow_array::builder::{BooleanBuilder, Float32Builder, Int32Builder, ListBuilder, StringBuilder};
use arrow_array::{Array, BooleanArray, FixedSizeListArray, Float32Array, Int32Array, ListArray, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, Table};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Schema as TantivySchema, TantivyDocument, TEXT, STORED};
use tantivy::{doc, Index, ReloadPolicy};
use tokio::sync::Mutex;

const EMBED_DIM: usize = 384;

fn storage_err(e: impl std::fmt::Display) -> PyriteError {
    PyriteError::StorageError(StorageError::Other(e.to_string()))
}

/// A decoded row from the `entries` Lance table, the Rust-side shape
/// everything else in this module operates on.
#[derive(Debug, Clone, Default)]
struct RawRow {
    id: String,
    kb_name: String,
    entry_type: String,
    title: String,
    body: String,
    summary: String,
    file_path: String,
    date: String,
    importance: i32,
    status: String,
    location: String,
    metadata: String,
    created_at: String,
    updated_at: String,
    indexed_at: String,
    created_by: String,
    modified_by: String,
    tags: Vec<String>,
    fts_text: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
struct LinkRow {
    source_id: String,
    source_kb: String,
    target_id: String,
    target_kb: String,
    relation: String,
    inverse_relation: String,
    note: String,
}

#[derive(Debug, Clone, Default)]
struct SourceRow {
    entry_id: String,
    kb_name: String,
    title: String,
    url: String,
    outlet: String,
    date: String,
    verified: bool,
}

#[derive(Debug, Clone, Default)]
struct RefRow {
    source_id: String,
    source_kb: String,
    target_id: String,
    target_kb: String,
    field_name: String,
    target_type: String,
}

#[derive(Debug, Clone, Default)]
struct BlockRow {
    entry_id: String,
    kb_name: String,
    block_id: String,
    heading: String,
    content: String,
    position: i32,
    block_type: String,
}

fn entries_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("kb_name", DataType::Utf8, false),
        Field::new("entry_type", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("body", DataType::Utf8, false),
        Field::new("summary", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("date", DataType::Utf8, false),
        Field::new("importance", DataType::Int32, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("location", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("created_at", DataType::Utf8, false),
        Field::new("updated_at", DataType::Utf8, false),
        Field::new("indexed_at", DataType::Utf8, false),
        Field::new("created_by", DataType::Utf8, false),
        Field::new("modified_by", DataType::Utf8, false),
        Field::new("tags", DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))), false),
        Field::new("_fts_text", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), EMBED_DIM as i32),
            false,
        ),
    ]))
}

fn links_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("source_id", DataType::Utf8, false),
        Field::new("source_kb", DataType::Utf8, false),
        Field::new("target_id", DataType::Utf8, false),
        Field::new("target_kb", DataType::Utf8, false),
        Field::new("relation", DataType::Utf8, false),
        Field::new("inverse_relation", DataType::Utf8, false),
        Field::new("note", DataType::Utf8, false),
    ]))
}

fn sources_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("entry_id", DataType::Utf8, false),
        Field::new("kb_name", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("url", DataType::Utf8, false),
        Field::new("outlet", DataType::Utf8, false),
        Field::new("date", DataType::Utf8, false),
        Field::new("verified", DataType::Boolean, false),
    ]))
}

fn refs_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("source_id", DataType::Utf8, false),
        Field::new("source_kb", DataType::Utf8, false),
        Field::new("target_id", DataType::Utf8, false),
        Field::new("target_kb", DataType::Utf8, false),
        Field::new("field_name", DataType::Utf8, false),
        Field::new("target_type", DataType::Utf8, false),
    ]))
}

fn blocks_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("entry_id", DataType::Utf8, false),
        Field::new("kb_name", DataType::Utf8, false),
        Field::new("block_id", DataType::Utf8, false),
        Field::new("heading", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("position", DataType::Int32, false),
        Field::new("block_type", DataType::Utf8, false),
    ]))
}

fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> &'a StringArray {
    batch.column_by_name(name).unwrap().as_any().downcast_ref::<StringArray>().unwrap()
}

fn int_col<'a>(batch: &'a RecordBatch, name: &str) -> &'a Int32Array {
    batch.column_by_name(name).unwrap().as_any().downcast_ref::<Int32Array>().unwrap()
}

fn bool_col<'a>(batch: &'a RecordBatch, name: &str) -> &'a BooleanArray {
    batch.column_by_name(name).unwrap().as_any().downcast_ref::<BooleanArray>().unwrap()
}

fn decode_entry_rows(batches: &[RecordBatch]) -> Vec<RawRow> {
    let mut out = Vec::new();
    for batch in batches {
        let tags_col = batch.column_by_name("tags").unwrap().as_any().downcast_ref::<ListArray>().unwrap();
        let emb_col = batch.column_by_name("embedding").unwrap().as_any().downcast_ref::<FixedSizeListArray>().unwrap();
        for i in 0..batch.num_rows() {
            let tag_values = tags_col.value(i);
            let tag_strs = tag_values.as_any().downcast_ref::<StringArray>().unwrap();
            let tags = (0..tag_strs.len()).map(|j| tag_strs.value(j).to_string()).collect();

            let emb_values = emb_col.value(i);
            let emb_f32 = emb_values.as_any().downcast_ref::<Float32Array>().unwrap();
            let embedding = emb_f32.values().to_vec();

            out.push(RawRow {
                id: str_col(batch, "id").value(i).to_string(),
                kb_name: str_col(batch, "kb_name").value(i).to_string(),
                entry_type: str_col(batch, "entry_type").value(i).to_string(),
                title: str_col(batch, "title").value(i).to_string(),
                body: str_col(batch, "body").value(i).to_string(),
                summary: str_col(batch, "summary").value(i).to_string(),
                file_path: str_col(batch, "file_path").value(i).to_string(),
                date: str_col(batch, "date").value(i).to_string(),
                importance: int_col(batch, "importance").value(i),
                status: str_col(batch, "status").value(i).to_string(),
                location: str_col(batch, "location").value(i).to_string(),
                metadata: str_col(batch, "metadata").value(i).to_string(),
                created_at: str_col(batch, "created_at").value(i).to_string(),
                updated_at: str_col(batch, "updated_at").value(i).to_string(),
                indexed_at: str_col(batch, "indexed_at").value(i).to_string(),
                created_by: str_col(batch, "created_by").value(i).to_string(),
                modified_by: str_col(batch, "modified_by").value(i).to_string(),
                tags,
                fts_text: str_col(batch, "_fts_text").value(i).to_string(),
                embedding,
            });
        }
    }
    out
}

fn decode_link_rows(batches: &[RecordBatch]) -> Vec<LinkRow> {
    let mut out = Vec::new();
    for batch in batches {
        for i in 0..batch.num_rows() {
            out.push(LinkRow {
                source_id: str_col(batch, "source_id").value(i).to_string(),
                source_kb: str_col(batch, "source_kb").value(i).to_string(),
                target_id: str_col(batch, "target_id").value(i).to_string(),
                target_kb: str_col(batch, "target_kb").value(i).to_string(),
                relation: str_col(batch, "relation").value(i).to_string(),
                inverse_relation: str_col(batch, "inverse_relation").value(i).to_string(),
                note: str_col(batch, "note").value(i).to_string(),
            });
        }
    }
    out
}

fn decode_source_rows(batches: &[RecordBatch]) -> Vec<SourceRow> {
    let mut out = Vec::new();
    for batch in batches {
        for i in 0..batch.num_rows() {
            out.push(SourceRow {
                entry_id: str_col(batch, "entry_id").value(i).to_string(),
                kb_name: str_col(batch, "kb_name").value(i).to_string(),
                title: str_col(batch, "title").value(i).to_string(),
                url: str_col(batch, "url").value(i).to_string(),
                outlet: str_col(batch, "outlet").value(i).to_string(),
                date: str_col(batch, "date").value(i).to_string(),
                verified: bool_col(batch, "verified").value(i),
            });
        }
    }
    out
}

fn decode_ref_rows(batches: &[RecordBatch]) -> Vec<RefRow> {
    let mut out = Vec::new();
    for batch in batches {
        for i in 0..batch.num_rows() {
            out.push(RefRow {
                source_id: str_col(batch, "source_id").value(i).to_string(),
                source_kb: str_col(batch, "source_kb").value(i).to_string(),
                target_id: str_col(batch, "target_id").value(i).to_string(),
                target_kb: str_col(batch, "target_kb").value(i).to_string(),
                field_name: str_col(batch, "field_name").value(i).to_string(),
                target_type: str_col(batch, "target_type").value(i).to_string(),
            });
        }
    }
    out
}

fn decode_block_rows(batches: &[RecordBatch]) -> Vec<BlockRow> {
    let mut out = Vec::new();
    for batch in batches {
        for i in 0..batch.num_rows() {
            out.push(BlockRow {
                entry_id: str_col(batch, "entry_id").value(i).to_string(),
                kb_name: str_col(batch, "kb_name").value(i).to_string(),
                block_id: str_col(batch, "block_id").value(i).to_string(),
                heading: str_col(batch, "heading").value(i).to_string(),
                content: str_col(batch, "content").value(i).to_string(),
                position: int_col(batch, "position").value(i),
                block_type: str_col(batch, "block_type").value(i).to_string(),
            });
        }
    }
    out
}

fn raw_to_entry(row: &RawRow) -> Result<Entry> {
    let metadata: HashMap<String, Value> = match serde_json::from_str::<Value>(&row.metadata).map_err(storage_err)? {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    let date = if row.date.is_empty() { None } else { Some(NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").map_err(storage_err)?) };
    let importance = if row.importance > 0 { Some(Importance::new(row.importance as i64).map_err(storage_err)?) } else { None };

    Ok(Entry {
        id: EntryId::new(row.id.clone()).map_err(storage_err)?,
        kb_name: KbName::new(row.kb_name.clone()).map_err(storage_err)?,
        entry_type: EntryKind::from_str(&row.entry_type),
        title: Title::new(row.title.clone()).map_err(storage_err)?,
        body: row.body.clone(),
        summary: if row.summary.is_empty() { None } else { Some(row.summary.clone()) },
        file_path: if row.file_path.is_empty() { None } else { Some(row.file_path.clone()) },
        date,
        importance,
        status: if row.status.is_empty() { None } else { Some(row.status.clone()) },
        location: if row.location.is_empty() { None } else { Some(row.location.clone()) },
        created_at: DateTime::parse_from_rfc3339(&row.created_at).map_err(storage_err)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&row.updated_at).map_err(storage_err)?.with_timezone(&Utc),
        indexed_at: DateTime::parse_from_rfc3339(&row.indexed_at).map_err(storage_err)?.with_timezone(&Utc),
        created_by: if row.created_by.is_empty() { None } else { Some(row.created_by.clone()) },
        modified_by: if row.modified_by.is_empty() { None } else { Some(row.modified_by.clone()) },
        metadata,
        tags: row.tags.iter().map(|t| Tag::new(t.clone()).map_err(storage_err)).collect::<Result<_>>()?,
        sources: Vec::new(),
        links: Vec::new(),
        entry_refs: Vec::new(),
        blocks: Vec::new(),
    })
}

fn make_snippet(text: &str) -> String {
    text.chars().take(200).collect()
}

pub struct ColumnarBackend {
    _connection: Connection,
    entries: Table,
    links: Table,
    sources: Table,
    refs: Table,
    blocks: Table,
    dimension: usize,
    fts_dirty: AtomicBool,
    fts: Mutex<Option<(Index, tantivy::schema::Field, tantivy::schema::Field, tantivy::schema::Field, tantivy::IndexReader)>>,
}

impl ColumnarBackend {
    pub async fn connect(uri: &str) -> Result<Self> {
        Self::connect_with_dimension(uri, EMBED_DIM).await
    }

    pub async fn connect_with_dimension(uri: &str, dimension: usize) -> Result<Self> {
        let connection = lancedb::connect(uri).execute().await.map_err(storage_err)?;
        let backend = Self {
            entries: Self::open_or_create(&connection, "entries", entries_schema()).await?,
            links: Self::open_or_create(&connection, "links", links_schema()).await?,
            sources: Self::open_or_create(&connection, "sources", sources_schema()).await?,
            refs: Self::open_or_create(&connection, "refs", refs_schema()).await?,
            blocks: Self::open_or_create(&connection, "blocks", blocks_schema()).await?,
            _connection: connection,
            dimension,
            fts_dirty: AtomicBool::new(true),
            fts: Mutex::new(None),
        };
        Ok(backend)
    }

    async fn open_or_create(connection: &Connection, name: &str, schema: SchemaRef) -> Result<Table> {
        let names = connection.table_names().execute().await.map_err(storage_err)?;
        if !names.iter().any(|n| n == name) {
            connection.create_empty_table(name, schema).execute().await.map_err(storage_err)?;
        }
        connection.open_table(name).execute().await.map_err(storage_err)
    }

    async fn scan_entries(&self) -> Result<Vec<RawRow>> {
        let stream = self.entries.query().execute().await.map_err(storage_err)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(storage_err)?;
        Ok(decode_entry_rows(&batches))
    }

    async fn scan_links(&self) -> Result<Vec<LinkRow>> {
        let stream = self.links.query().execute().await.map_err(storage_err)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(storage_err)?;
        Ok(decode_link_rows(&batches))
    }

    async fn scan_sources(&self) -> Result<Vec<SourceRow>> {
        let stream = self.sources.query().execute().await.map_err(storage_err)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(storage_err)?;
        Ok(decode_source_rows(&batches))
    }

    async fn scan_refs(&self) -> Result<Vec<RefRow>> {
        let stream = self.refs.query().execute().await.map_err(storage_err)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(storage_err)?;
        Ok(decode_ref_rows(&batches))
    }

    async fn scan_blocks(&self) -> Result<Vec<BlockRow>> {
        let stream = self.blocks.query().execute().await.map_err(storage_err)?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(storage_err)?;
        Ok(decode_block_rows(&batches))
    }

    async fn find_raw(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<RawRow>> {
        let rows = self.scan_entries().await?;
        Ok(rows.into_iter().find(|r| r.id == id.as_str() && r.kb_name == kb_name.as_str()))
    }

    async fn hydrate(&self, raw: &RawRow) -> Result<Entry> {
        let mut entry = raw_to_entry(raw)?;

        let sources = self.scan_sources().await?;
        entry.sources = sources
            .into_iter()
            .filter(|s| s.entry_id == raw.id && s.kb_name == raw.kb_name)
            .map(|s| Source { title: Some(s.title), url: Some(s.url), outlet: Some(s.outlet), date: Some(s.date), verified: s.verified })
            .collect();

        let links = self.scan_links().await?;
        entry.links = links
            .into_iter()
            .filter(|l| l.source_id == raw.id && l.source_kb == raw.kb_name)
            .map(link_row_to_link)
            .collect::<Result<_>>()?;

        let refs = self.scan_refs().await?;
        entry.entry_refs = refs
            .into_iter()
            .filter(|r| r.source_id == raw.id && r.source_kb == raw.kb_name)
            .map(ref_row_to_ref)
            .collect::<Result<_>>()?;

        let blocks = self.scan_blocks().await?;
        let mut entry_blocks: Vec<_> = blocks.into_iter().filter(|b| b.entry_id == raw.id && b.kb_name == raw.kb_name).collect();
        entry_blocks.sort_by_key(|b| b.position);
        entry.blocks = entry_blocks
            .into_iter()
            .map(|b| Block {
                block_id: b.block_id,
                heading: if b.heading.is_empty() { None } else { Some(b.heading) },
                content: b.content,
                position: b.position as usize,
                block_type: match b.block_type.as_str() {
                    "heading" => BlockType::Heading,
                    "list" => BlockType::List,
                    "code" => BlockType::Code,
                    _ => BlockType::Paragraph,
                },
            })
            .collect();

        Ok(entry)
    }

    async fn rebuild_fts_if_dirty(&self) -> Result<()> {
        if !self.fts_dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let rows = self.scan_entries().await?;

        let mut schema_builder = TantivySchema::builder();
        let id_field = schema_builder.add_text_field("id", STORED);
        let kb_field = schema_builder.add_text_field("kb_name", STORED);
        let text_field = schema_builder.add_text_field("text", TEXT | STORED);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let mut writer = index.writer(32 * 1024 * 1024).map_err(storage_err)?;
        writer.delete_all_documents().map_err(storage_err)?;
        for row in &rows {
            let text = format!("{} {} {}", row.title, row.summary, row.body);
            writer
                .add_document(doc!(id_field => row.id.clone(), kb_field => row.kb_name.clone(), text_field => text))
                .map_err(storage_err)?;
        }
        writer.commit().map_err(storage_err)?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(storage_err)?;
        reader.reload().map_err(storage_err)?;

        let mut guard = self.fts.lock().await;
        *guard = Some((index, id_field, kb_field, text_field, reader));
        self.fts_dirty.store(false, Ordering::Release);
        Ok(())
    }

    async fn upsert_raw(&self, row: &RawRow) -> Result<()> {
        let mut id_b = StringBuilder::new();
        let mut kb_b = StringBuilder::new();
        let mut type_b = StringBuilder::new();
        let mut title_b = StringBuilder::new();
        let mut body_b = StringBuilder::new();
        let mut summary_b = StringBuilder::new();
        let mut path_b = StringBuilder::new();
        let mut date_b = StringBuilder::new();
        let mut importance_b = Int32Builder::new();
        let mut status_b = StringBuilder::new();
        let mut location_b = StringBuilder::new();
        let mut metadata_b = StringBuilder::new();
        let mut created_at_b = StringBuilder::new();
        let mut updated_at_b = StringBuilder::new();
        let mut indexed_at_b = StringBuilder::new();
        let mut created_by_b = StringBuilder::new();
        let mut modified_by_b = StringBuilder::new();
        let mut tags_b = ListBuilder::new(StringBuilder::new());
        let mut fts_b = StringBuilder::new();
        let mut emb_b = arrow_array::builder::FixedSizeListBuilder::new(Float32Builder::new(), self.dimension as i32);

        id_b.append_value(&row.id);
        kb_b.append_value(&row.kb_name);
        type_b.append_value(&row.entry_type);
        title_b.append_value(&row.title);
        body_b.append_value(&row.body);
        summary_b.append_value(&row.summary);
        path_b.append_value(&row.file_path);
        date_b.append_value(&row.date);
        importance_b.append_value(row.importance);
        status_b.append_value(&row.status);
        location_b.append_value(&row.location);
        metadata_b.append_value(&row.metadata);
        created_at_b.append_value(&row.created_at);
        updated_at_b.append_value(&row.updated_at);
        indexed_at_b.append_value(&row.indexed_at);
        created_by_b.append_value(&row.created_by);
        modified_by_b.append_value(&row.modified_by);
        for t in &row.tags {
            tags_b.values().append_value(t);
        }
        tags_b.append(true);
        fts_b.append_value(&row.fts_text);
        for v in &row.embedding {
            emb_b.values().append_value(*v);
        }
        emb_b.append(true);

        let batch = RecordBatch::try_new(
            entries_schema(),
            vec![
                Arc::new(id_b.finish()),
                Arc::new(kb_b.finish()),
                Arc::new(type_b.finish()),
                Arc::new(title_b.finish()),
                Arc::new(body_b.finish()),
                Arc::new(summary_b.finish()),
                Arc::new(path_b.finish()),
                Arc::new(date_b.finish()),
                Arc::new(importance_b.finish()),
                Arc::new(status_b.finish()),
                Arc::new(location_b.finish()),
                Arc::new(metadata_b.finish()),
                Arc::new(created_at_b.finish()),
                Arc::new(updated_at_b.finish()),
                Arc::new(indexed_at_b.finish()),
                Arc::new(created_by_b.finish()),
                Arc::new(modified_by_b.finish()),
                Arc::new(tags_b.finish()),
                Arc::new(fts_b.finish()),
                Arc::new(emb_b.finish()),
            ],
        )
        .map_err(storage_err)?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], entries_schema());
        self.entries
            .merge_insert(&["id", "kb_name"])
            .when_matched_update_all(None)
            .when_not_matched_insert_all()
            .execute(Box::new(reader))
            .await
            .map_err(storage_err)?;
        self.fts_dirty.store(true, Ordering::Release);
        Ok(())
    }
}

fn link_row_to_link(r: LinkRow) -> Result<Link> {
    Ok(Link {
        source_id: EntryId::new(r.source_id).map_err(storage_err)?,
        source_kb: KbName::new(r.source_kb).map_err(storage_err)?,
        target_id: EntryId::new(r.target_id).map_err(storage_err)?,
        target_kb: KbName::new(r.target_kb).map_err(storage_err)?,
        relation: RelationName::new(r.relation).map_err(storage_err)?,
        inverse_relation: RelationName::new(r.inverse_relation).map_err(storage_err)?,
        note: if r.note.is_empty() { None } else { Some(r.note) },
    })
}

fn ref_row_to_ref(r: RefRow) -> Result<EntryRef> {
    Ok(EntryRef {
        source_id: EntryId::new(r.source_id).map_err(storage_err)?,
        source_kb: KbName::new(r.source_kb).map_err(storage_err)?,
        target_id: EntryId::new(r.target_id).map_err(storage_err)?,
        target_kb: KbName::new(r.target_kb).map_err(storage_err)?,
        field_name: r.field_name,
        target_type: r.target_type,
    })
}

fn sort_rows(rows: &mut [RawRow], sort: Option<SortField>, order: Option<SortOrder>) {
    let desc = !matches!(order, Some(SortOrder::Asc));
    match sort.unwrap_or(SortField::UpdatedAt) {
        SortField::Title => rows.sort_by(|a, b| a.title.cmp(&b.title)),
        SortField::UpdatedAt => rows.sort_by(|a, b| a.updated_at.cmp(&b.updated_at)),
        SortField::CreatedAt => rows.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        SortField::EntryType => rows.sort_by(|a, b| a.entry_type.cmp(&b.entry_type)),
    }
    if desc {
        rows.reverse();
    }
}

#[async_trait]
impl SearchBackend for ColumnarBackend {
    async fn ensure_schema(&self) -> Result<()> {
        // Table creation already happened (idempotently) in `connect`;
        // nothing further is required on subsequent startups.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        let existing = self.find_raw(&entry.id, &entry.kb_name).await?;
        let embedding = existing.as_ref().map(|r| r.embedding.clone()).filter(|v| v.iter().any(|x| *x != 0.0)).unwrap_or_else(|| vec![0.0; self.dimension]);
        let created_by = entry.created_by.clone().or_else(|| existing.as_ref().map(|r| r.created_by.clone()).filter(|s| !s.is_empty()));

        let metadata = serde_json::to_string(&Value::Object(entry.metadata.clone().into_iter().collect())).map_err(storage_err)?;
        let fts_text = format!("{} {} {}", entry.title.as_str(), entry.summary.clone().unwrap_or_default(), entry.body);

        let raw = RawRow {
            id: entry.id.as_str().to_string(),
            kb_name: entry.kb_name.as_str().to_string(),
            entry_type: entry.entry_type.as_str().to_string(),
            title: entry.title.as_str().to_string(),
            body: entry.body.clone(),
            summary: entry.summary.clone().unwrap_or_default(),
            file_path: entry.file_path.clone().unwrap_or_default(),
            date: entry.date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
            importance: entry.importance.map(|i| i.get() as i32).unwrap_or(0),
            status: entry.status.clone().unwrap_or_default(),
            location: entry.location.clone().unwrap_or_default(),
            metadata,
            created_at: entry.created_at.to_rfc3339(),
            updated_at: entry.updated_at.to_rfc3339(),
            indexed_at: entry.indexed_at.to_rfc3339(),
            created_by: created_by.unwrap_or_default(),
            modified_by: entry.modified_by.clone().unwrap_or_default(),
            tags: entry.tags.iter().map(|t| t.as_str().to_string()).collect(),
            fts_text,
            embedding,
        };
        self.upsert_raw(&raw).await?;

        let delete_pred = format!("entry_id = '{}' AND kb_name = '{}'", escape(entry.id.as_str()), escape(entry.kb_name.as_str()));
        let _ = self.sources.delete(&delete_pred).await;
        if !entry.sources.is_empty() {
            let mut eid_b = StringBuilder::new();
            let mut kb_b = StringBuilder::new();
            let mut title_b = StringBuilder::new();
            let mut url_b = StringBuilder::new();
            let mut outlet_b = StringBuilder::new();
            let mut date_b = StringBuilder::new();
            let mut verified_b = BooleanBuilder::new();
            for s in &entry.sources {
                eid_b.append_value(entry.id.as_str());
                kb_b.append_value(entry.kb_name.as_str());
                title_b.append_value(s.title.clone().unwrap_or_default());
                url_b.append_value(s.url.clone().unwrap_or_default());
                outlet_b.append_value(s.outlet.clone().unwrap_or_default());
                date_b.append_value(s.date.clone().unwrap_or_default());
                verified_b.append_value(s.verified);
            }
            let batch = RecordBatch::try_new(
                sources_schema(),
                vec![
                    Arc::new(eid_b.finish()),
                    Arc::new(kb_b.finish()),
                    Arc::new(title_b.finish()),
                    Arc::new(url_b.finish()),
                    Arc::new(outlet_b.finish()),
                    Arc::new(date_b.finish()),
                    Arc::new(verified_b.finish()),
                ],
            )
            .map_err(storage_err)?;
            let reader = RecordBatchIterator::new(vec![Ok(batch)], sources_schema());
            self.sources.add(Box::new(reader)).execute().await.map_err(storage_err)?;
        }

        let link_pred = format!("source_id = '{}' AND source_kb = '{}'", escape(entry.id.as_str()), escape(entry.kb_name.as_str()));
        let _ = self.links.delete(&link_pred).await;
        if !entry.links.is_empty() {
            let mut sid_b = StringBuilder::new();
            let mut skb_b = StringBuilder::new();
            let mut tid_b = StringBuilder::new();
            let mut tkb_b = StringBuilder::new();
            let mut rel_b = StringBuilder::new();
            let mut inv_b = StringBuilder::new();
            let mut note_b = StringBuilder::new();
            for l in &entry.links {
                sid_b.append_value(l.source_id.as_str());
                skb_b.append_value(l.source_kb.as_str());
                tid_b.append_value(l.target_id.as_str());
                tkb_b.append_value(l.target_kb.as_str());
                rel_b.append_value(l.relation.as_str());
                inv_b.append_value(l.inverse_relation.as_str());
                note_b.append_value(l.note.clone().unwrap_or_default());
            }
            let batch = RecordBatch::try_new(
                links_schema(),
                vec![
                    Arc::new(sid_b.finish()),
                    Arc::new(skb_b.finish()),
                    Arc::new(tid_b.finish()),
                    Arc::new(tkb_b.finish()),
                    Arc::new(rel_b.finish()),
                    Arc::new(inv_b.finish()),
                    Arc::new(note_b.finish()),
                ],
            )
            .map_err(storage_err)?;
            let reader = RecordBatchIterator::new(vec![Ok(batch)], links_schema());
            self.links.add(Box::new(reader)).execute().await.map_err(storage_err)?;
        }

        let _ = self.refs.delete(&link_pred).await;
        if !entry.entry_refs.is_empty() {
            let mut sid_b = StringBuilder::new();
            let mut skb_b = StringBuilder::new();
            let mut tid_b = StringBuilder::new();
            let mut tkb_b = StringBuilder::new();
            let mut field_b = StringBuilder::new();
            let mut ttype_b = StringBuilder::new();
            for r in &entry.entry_refs {
                sid_b.append_value(r.source_id.as_str());
                skb_b.append_value(r.source_kb.as_str());
                tid_b.append_value(r.target_id.as_str());
                tkb_b.append_value(r.target_kb.as_str());
                field_b.append_value(&r.field_name);
                ttype_b.append_value(&r.target_type);
            }
            let batch = RecordBatch::try_new(
                refs_schema(),
                vec![
                    Arc::new(sid_b.finish()),
                    Arc::new(skb_b.finish()),
                    Arc::new(tid_b.finish()),
                    Arc::new(tkb_b.finish()),
                    Arc::new(field_b.finish()),
                    Arc::new(ttype_b.finish()),
                ],
            )
            .map_err(storage_err)?;
            let reader = RecordBatchIterator::new(vec![Ok(batch)], refs_schema());
            self.refs.add(Box::new(reader)).execute().await.map_err(storage_err)?;
        }

        let _ = self.blocks.delete(&delete_pred).await;
        if !entry.blocks.is_empty() {
            let mut eid_b = StringBuilder::new();
            let mut kb_b = StringBuilder::new();
            let mut bid_b = StringBuilder::new();
            let mut heading_b = StringBuilder::new();
            let mut content_b = StringBuilder::new();
            let mut position_b = Int32Builder::new();
            let mut btype_b = StringBuilder::new();
            for b in &entry.blocks {
                eid_b.append_value(entry.id.as_str());
                kb_b.append_value(entry.kb_name.as_str());
                bid_b.append_value(&b.block_id);
                heading_b.append_value(b.heading.clone().unwrap_or_default());
                content_b.append_value(&b.content);
                position_b.append_value(b.position as i32);
                btype_b.append_value(match b.block_type {
                    BlockType::Heading => "heading",
                    BlockType::Paragraph => "paragraph",
                    BlockType::List => "list",
                    BlockType::Code => "code",
                });
            }
            let batch = RecordBatch::try_new(
                blocks_schema(),
                vec![
                    Arc::new(eid_b.finish()),
                    Arc::new(kb_b.finish()),
                    Arc::new(bid_b.finish()),
                    Arc::new(heading_b.finish()),
                    Arc::new(content_b.finish()),
                    Arc::new(position_b.finish()),
                    Arc::new(btype_b.finish()),
                ],
            )
            .map_err(storage_err)?;
            let reader = RecordBatchIterator::new(vec![Ok(batch)], blocks_schema());
            self.blocks.add(Box::new(reader)).execute().await.map_err(storage_err)?;
        }

        Ok(())
    }

    async fn delete_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let existed = self.find_raw(id, kb_name).await?.is_some();
        if !existed {
            return Ok(false);
        }
        let pred = format!("id = '{}' AND kb_name = '{}'", escape(id.as_str()), escape(kb_name.as_str()));
        self.entries.delete(&pred).await.map_err(storage_err)?;
        let child_pred = format!("source_id = '{}' AND source_kb = '{}'", escape(id.as_str()), escape(kb_name.as_str()));
        let _ = self.links.delete(&child_pred).await;
        let _ = self.refs.delete(&child_pred).await;
        let entry_pred = format!("entry_id = '{}' AND kb_name = '{}'", escape(id.as_str()), escape(kb_name.as_str()));
        let _ = self.sources.delete(&entry_pred).await;
        let _ = self.blocks.delete(&entry_pred).await;
        self.fts_dirty.store(true, Ordering::Release);
        Ok(true)
    }

    async fn get_entry(&self, id: &EntryId, kb_name: &KbName) -> Result<Option<Entry>> {
        let Some(raw) = self.find_raw(id, kb_name).await? else { return Ok(None) };
        Ok(Some(self.hydrate(&raw).await?))
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<Entry>> {
        let mut rows = self.scan_entries().await?;
        rows.retain(|r| {
            filter.kb_name.as_ref().map_or(true, |kb| r.kb_name == kb.as_str())
                && filter.entry_type.as_ref().map_or(true, |t| &r.entry_type == t)
                && filter.tag.as_ref().map_or(true, |tag| r.tags.iter().any(|t| t == tag.as_str()))
        });
        sort_rows(&mut rows, filter.sort, filter.order);
        let limit = filter.limit.map(|l| l.get()).unwrap_or(crate::types::Limit::DEFAULT);
        let page: Vec<_> = rows.into_iter().skip(filter.offset).take(limit).collect();
        let mut entries = Vec::with_capacity(page.len());
        for raw in &page {
            entries.push(self.hydrate(raw).await?);
        }
        Ok(entries)
    }

    async fn count_entries(&self, filter: &ListFilter) -> Result<u64> {
        let mut rows = self.scan_entries().await?;
        rows.retain(|r| {
            filter.kb_name.as_ref().map_or(true, |kb| r.kb_name == kb.as_str())
                && filter.entry_type.as_ref().map_or(true, |t| &r.entry_type == t)
        });
        Ok(rows.len() as u64)
    }

    async fn search(&self, query: &SearchQuery, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        self.rebuild_fts_if_dirty().await?;
        let guard = self.fts.lock().await;
        let Some((index, id_field, kb_field, text_field, reader)) = guard.as_ref() else { return Ok(Vec::new()) };

        let searcher = reader.searcher();
        let parser = QueryParser::for_index(index, vec![*text_field]);
        let parsed = parser.parse_query(query.as_str()).map_err(storage_err)?;
        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(filter.limit.get() + filter.offset))
            .map_err(storage_err)?;

        let mut matched_ids = Vec::new();
        for (_score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr).map_err(storage_err)?;
            let id = doc.get_first(*id_field).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let kb = doc.get_first(*kb_field).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            matched_ids.push((id, kb));
        }
        drop(guard);

        let rows = self.scan_entries().await?;
        let mut hits = Vec::new();
        for (rank, (id, kb)) in matched_ids.into_iter().skip(filter.offset).enumerate() {
            let Some(raw) = rows.iter().find(|r| r.id == id && r.kb_name == kb) else { continue };
            if let Some(f_kb) = &filter.kb_name {
                if raw.kb_name != f_kb.as_str() {
                    continue;
                }
            }
            if let Some(t) = &filter.entry_type {
                if &raw.entry_type != t {
                    continue;
                }
            }
            if !filter.tags.is_empty() && !filter.tags.iter().all(|tag| raw.tags.iter().any(|t| t == tag.as_str())) {
                continue;
            }
            if let Some(from) = filter.date_from {
                if raw.date.as_str() < from.format("%Y-%m-%d").to_string().as_str() {
                    continue;
                }
            }
            if let Some(to) = filter.date_to {
                if raw.date.as_str() > to.format("%Y-%m-%d").to_string().as_str() {
                    continue;
                }
            }
            let entry = raw_to_entry(raw)?;
            hits.push(SearchHit {
                id: entry.id,
                kb_name: entry.kb_name,
                entry_type: entry.entry_type.as_str().to_string(),
                title: entry.title.as_str().to_string(),
                summary: entry.summary,
                date: entry.date,
                importance: entry.importance,
                snippet: make_snippet(&raw.fts_text),
                rank: rank + 1,
            });
        }
        Ok(hits)
    }

    async fn search_by_tag(&self, tag: &Tag, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let filter = ListFilter { kb_name: kb_name.cloned(), tag: Some(tag.clone()), ..Default::default() };
        self.list_entries(&filter).await
    }

    async fn search_by_date_range(&self, from: NaiveDate, to: NaiveDate, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let mut rows = self.scan_entries().await?;
        let from_s = from.format("%Y-%m-%d").to_string();
        let to_s = to.format("%Y-%m-%d").to_string();
        rows.retain(|r| {
            !r.date.is_empty()
                && r.date.as_str() >= from_s.as_str()
                && r.date.as_str() <= to_s.as_str()
                && kb_name.map_or(true, |kb| r.kb_name == kb.as_str())
        });
        rows.sort_by(|a, b| a.date.cmp(&b.date));
        let mut entries = Vec::new();
        for raw in &rows {
            entries.push(self.hydrate(raw).await?);
        }
        Ok(entries)
    }

    async fn search_by_tag_prefix(&self, prefix: &str, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let mut rows = self.scan_entries().await?;
        let nested = format!("{prefix}/");
        rows.retain(|r| {
            kb_name.map_or(true, |kb| r.kb_name == kb.as_str()) && r.tags.iter().any(|t| t == prefix || t.starts_with(&nested))
        });
        let mut entries = Vec::new();
        for raw in &rows {
            entries.push(self.hydrate(raw).await?);
        }
        Ok(entries)
    }

    async fn upsert_embedding(&self, id: &EntryId, kb_name: &KbName, vector: &[f32]) -> Result<bool> {
        let Some(mut raw) = self.find_raw(id, kb_name).await? else { return Ok(false) };
        raw.embedding = vector.to_vec();
        self.upsert_raw(&raw).await?;
        Ok(true)
    }

    async fn search_semantic(&self, vector: &[f32], kb_name: Option<&KbName>, limit: usize, max_distance: f32) -> Result<Vec<SemanticHit>> {
        let mut rows = self.scan_entries().await?;
        rows.retain(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str()) && r.embedding.iter().any(|v| *v != 0.0));
        let mut scored: Vec<(f32, &RawRow)> = rows.iter().map(|r| (cosine_distance(vector, &r.embedding), r)).collect();
        scored.retain(|(d, _)| *d <= max_distance);
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut hits = Vec::new();
        for (rank, (distance, raw)) in scored.into_iter().enumerate() {
            let entry = raw_to_entry(raw)?;
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
                    rank: rank + 1,
                },
                distance,
            });
        }
        Ok(hits)
    }

    async fn has_embeddings(&self, kb_name: Option<&KbName>) -> Result<bool> {
        // Lance cannot null a vector column; "has an embedding" is therefore a
        // sampled non-zero check rather than an exact count, per the known
        // imprecision documented for this backend.
        let rows = self.scan_entries().await?;
        Ok(rows
            .iter()
            .filter(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str()))
            .any(|r| r.embedding.iter().any(|v| *v != 0.0)))
    }

    async fn embedding_stats(&self, kb_name: Option<&KbName>) -> Result<EmbeddingStats> {
        let rows = self.scan_entries().await?;
        let relevant: Vec<_> = rows.iter().filter(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str())).collect();
        let embedded = relevant.iter().filter(|r| r.embedding.iter().any(|v| *v != 0.0)).count();
        Ok(EmbeddingStats { total_entries: relevant.len() as u64, embedded_count: embedded as u64 })
    }

    async fn delete_embedding(&self, id: &EntryId, kb_name: &KbName) -> Result<bool> {
        let Some(mut raw) = self.find_raw(id, kb_name).await? else { return Ok(false) };
        if raw.embedding.iter().all(|v| *v == 0.0) {
            return Ok(false);
        }
        raw.embedding = vec![0.0; self.dimension];
        self.upsert_raw(&raw).await?;
        Ok(true)
    }

    async fn get_backlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        let links = self.scan_links().await?;
        links
            .into_iter()
            .filter(|l| l.target_id == id.as_str() && l.target_kb == kb_name.as_str())
            .map(link_row_to_link)
            .collect()
    }

    async fn get_outlinks(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<Link>> {
        let links = self.scan_links().await?;
        links
            .into_iter()
            .filter(|l| l.source_id == id.as_str() && l.source_kb == kb_name.as_str())
            .map(link_row_to_link)
            .collect()
    }

    async fn get_most_linked(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<(Entry, u64)>> {
        let links = self.scan_links().await?;
        let mut counts: HashMap<(String, String), u64> = HashMap::new();
        for l in &links {
            *counts.entry((l.target_id.clone(), l.target_kb.clone())).or_insert(0) += 1;
        }
        let mut rows = self.scan_entries().await?;
        rows.retain(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str()));
        let mut with_counts: Vec<(RawRow, u64)> =
            rows.into_iter().map(|r| { let c = *counts.get(&(r.id.clone(), r.kb_name.clone())).unwrap_or(&0); (r, c) }).collect();
        with_counts.sort_by(|a, b| b.1.cmp(&a.1));
        with_counts.truncate(limit);
        let mut out = Vec::new();
        for (raw, count) in &with_counts {
            out.push((self.hydrate(raw).await?, *count));
        }
        Ok(out)
    }

    async fn get_orphans(&self, kb_name: Option<&KbName>) -> Result<Vec<Entry>> {
        let links = self.scan_links().await?;
        let mut linked: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
        for l in &links {
            linked.insert((l.source_id.clone(), l.source_kb.clone()));
            linked.insert((l.target_id.clone(), l.target_kb.clone()));
        }
        let mut rows = self.scan_entries().await?;
        rows.retain(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str()) && !linked.contains(&(r.id.clone(), r.kb_name.clone())));
        let mut entries = Vec::new();
        for raw in &rows {
            entries.push(self.hydrate(raw).await?);
        }
        Ok(entries)
    }

    async fn get_all_tags(&self, kb_name: Option<&KbName>) -> Result<Vec<TagCount>> {
        let rows = self.scan_entries().await?;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for r in rows.iter().filter(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str())) {
            for t in &r.tags {
                *counts.entry(t.clone()).or_insert(0) += 1;
            }
        }
        let mut out: Vec<_> = counts.into_iter().map(|(tag, count)| TagCount { tag, count }).collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(out)
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
        let mut rows = self.scan_entries().await?;
        let min = min_importance.map(|i| i.get()).unwrap_or(1);
        rows.retain(|r| {
            !r.date.is_empty()
                && r.importance >= min as i32
                && kb_name.map_or(true, |kb| r.kb_name == kb.as_str())
                && from.map_or(true, |f| r.date.as_str() >= f.format("%Y-%m-%d").to_string().as_str())
                && to.map_or(true, |t| r.date.as_str() <= t.format("%Y-%m-%d").to_string().as_str())
        });
        rows.sort_by(|a, b| a.date.cmp(&b.date));
        rows.truncate(limit);
        rows.iter().map(raw_to_entry).collect()
    }

    async fn get_refs_from(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        let refs = self.scan_refs().await?;
        refs.into_iter().filter(|r| r.source_id == id.as_str() && r.source_kb == kb_name.as_str()).map(ref_row_to_ref).collect()
    }

    async fn get_refs_to(&self, id: &EntryId, kb_name: &KbName) -> Result<Vec<EntryRef>> {
        let refs = self.scan_refs().await?;
        refs.into_iter().filter(|r| r.target_id == id.as_str() && r.target_kb == kb_name.as_str()).map(ref_row_to_ref).collect()
    }

    async fn list_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<Vec<Entry>> {
        let prefix = format!("{folder}/");
        let mut rows = self.scan_entries().await?;
        rows.retain(|r| r.kb_name == kb_name.as_str() && r.entry_type != "collection" && r.file_path.starts_with(&prefix));
        rows.iter().map(raw_to_entry).collect()
    }

    async fn count_entries_in_folder(&self, folder: &str, kb_name: &KbName) -> Result<u64> {
        Ok(self.list_entries_in_folder(folder, kb_name).await?.len() as u64)
    }

    async fn get_all_links(&self, kb_name: Option<&KbName>) -> Result<Vec<Link>> {
        let links = self.scan_links().await?;
        links
            .into_iter()
            .filter(|l| kb_name.map_or(true, |kb| l.source_kb == kb.as_str() || l.target_kb == kb.as_str()))
            .map(link_row_to_link)
            .collect()
    }

    async fn get_entries_for_indexing(&self, kb_name: &KbName) -> Result<Vec<(EntryId, DateTime<Utc>)>> {
        let rows = self.scan_entries().await?;
        rows.into_iter()
            .filter(|r| r.kb_name == kb_name.as_str())
            .map(|r| {
                let id = EntryId::new(r.id).map_err(storage_err)?;
                let indexed_at = DateTime::parse_from_rfc3339(&r.indexed_at).map_err(storage_err)?.with_timezone(&Utc);
                Ok((id, indexed_at))
            })
            .collect()
    }

    async fn get_embedded_rowids(&self, kb_name: Option<&KbName>) -> Result<Vec<(EntryId, KbName)>> {
        let rows = self.scan_entries().await?;
        rows.into_iter()
            .filter(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str()) && r.embedding.iter().any(|v| *v != 0.0))
            .map(|r| Ok((EntryId::new(r.id).map_err(storage_err)?, KbName::new(r.kb_name).map_err(storage_err)?)))
            .collect()
    }

    async fn get_entries_for_embedding(&self, kb_name: Option<&KbName>, limit: usize) -> Result<Vec<Entry>> {
        let mut rows = self.scan_entries().await?;
        rows.retain(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str()) && r.embedding.iter().all(|v| *v == 0.0));
        rows.truncate(limit);
        rows.iter().map(raw_to_entry).collect()
    }

    async fn get_global_counts(&self) -> Result<GlobalCounts> {
        let rows = self.scan_entries().await?;
        let links = self.scan_links().await?;
        let tags = self.get_all_tags(None).await?;
        let kb_count = rows.iter().map(|r| r.kb_name.clone()).collect::<std::collections::HashSet<_>>().len();
        Ok(GlobalCounts {
            kb_count: kb_count as u64,
            entry_count: rows.len() as u64,
            link_count: links.len() as u64,
            tag_count: tags.len() as u64,
        })
    }

    async fn get_distinct_types(&self, kb_name: Option<&KbName>) -> Result<Vec<String>> {
        let rows = self.scan_entries().await?;
        let mut types: Vec<String> = rows
            .into_iter()
            .filter(|r| kb_name.map_or(true, |kb| r.kb_name == kb.as_str()))
            .map(|r| r.entry_type)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        types.sort();
        Ok(types)
    }
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::types::{EntryId, KbName, Limit, SearchQuery, Title};

    #[test]
    fn snippet_truncates_to_window() {
        let long = "a".repeat(500);
        assert_eq!(make_snippet(&long).len(), 200);
    }

    #[test]
    fn escape_doubles_single_quotes() {
        assert_eq!(escape("o'brien"), "o''brien");
    }

    async fn backend() -> (tempfile::TempDir, ColumnarBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ColumnarBackend::connect(dir.path().to_str().unwrap()).await.expect("lancedb should connect");
        backend.ensure_schema().await.unwrap();
        (dir, backend)
    }

    fn sample_entry(id: &str, title: &str, body: &str) -> Entry {
        Entry::new(EntryId::new(id).unwrap(), KbName::new("k").unwrap(), EntryKind::Note, Title::new(title).unwrap(), body.to_string()).unwrap()
    }

    #[tokio::test]
    async fn upsert_get_and_search_round_trip_against_real_lancedb() {
        let (_dir, backend) = backend().await;
        let entry = sample_entry("e1", "Quantum Computing", "Quantum entanglement and superposition.");
        backend.upsert_entry(&entry).await.unwrap();

        let fetched = backend.get_entry(&EntryId::new("e1").unwrap(), &KbName::new("k").unwrap()).await.unwrap();
        assert_eq!(fetched.unwrap().title.as_str(), "Quantum Computing");

        let query = SearchQuery::new("entanglement").unwrap();
        let filter = SearchFilter { kb_name: Some(KbName::new("k").unwrap()), limit: Limit::new(10).unwrap(), ..Default::default() };
        let hits = backend.search(&query, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "e1");
    }

    #[tokio::test]
    async fn search_semantic_finds_nearest_vector_against_real_lancedb() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ColumnarBackend::connect_with_dimension(dir.path().to_str().unwrap(), 2).await.expect("lancedb should connect");
        backend.ensure_schema().await.unwrap();
        let a = sample_entry("a", "A", "body a");
        let b = sample_entry("b", "B", "body b");
        backend.upsert_entry(&a).await.unwrap();
        backend.upsert_entry(&b).await.unwrap();
        backend.upsert_embedding(&EntryId::new("a").unwrap(), &KbName::new("k").unwrap(), &[1.0, 0.0]).await.unwrap();
        backend.upsert_embedding(&EntryId::new("b").unwrap(), &KbName::new("k").unwrap(), &[0.0, 1.0]).await.unwrap();

        let hits = backend.search_semantic(&[1.0, 0.0], Some(&KbName::new("k").unwrap()), 10, 2.0).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].hit.id.as_str(), "a");
    }
}
