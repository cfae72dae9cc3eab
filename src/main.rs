// Pyrite CLI - thin command surface over the Service facade.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pyrite::{
    BackendKind, EntryId, GraphDepth, Kb, KbName, KbRegistry, Limit, PyriteConfig, RelationName,
    SearchBackend, SearchFilter, SearchQuery, Service,
};
use std::path::PathBuf;
use tracing::info;

mod frontmatter;
use frontmatter::FrontmatterParser;

macro_rules! qprintln {
    ($quiet:expr, $($arg:tt)*) => {
        if !$quiet {
            println!($($arg)*);
        }
    };
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Pyrite - search and graph queries over Markdown knowledge bases",
    long_about = None,
    after_help = "QUICK START:
  1. Register a knowledge base: pyrite register-kb notes generic ./notes
  2. Index it:                  pyrite sync notes --full
  3. Search it:                 pyrite search notes 'quarterly planning'
  4. Walk its link graph:       pyrite graph notes some-entry-id"
)]
struct Cli {
    /// Enable verbose logging (DEBUG level). Default is WARN level.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all non-essential output.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Directory holding pyrite.toml (and PYRITE_* env overrides apply regardless).
    #[arg(long, default_value = ".")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a knowledge base at a filesystem path.
    RegisterKb {
        name: String,
        kb_type: String,
        path: PathBuf,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        read_only: bool,
    },

    /// List registered knowledge bases.
    ListKbs,

    /// Drop a knowledge base registration (does not touch its files).
    UnregisterKb { name: String },

    /// Parse every Markdown file under a KB's path and upsert the results.
    Sync {
        kb_name: String,
        /// Reindex every file unconditionally instead of comparing mtimes.
        #[arg(long)]
        full: bool,
    },

    /// Lexical full-text search within (or across) knowledge bases.
    Search {
        kb_name: String,
        query: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Fetch a single entry by id.
    Get { kb_name: String, id: String },

    /// Walk the link graph outward from an entry.
    Graph {
        kb_name: String,
        id: String,
        #[arg(short, long, default_value = "1")]
        depth: u8,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Link two existing entries with a typed relation.
    Link {
        source_kb: String,
        source_id: String,
        target_kb: String,
        target_id: String,
        relation: String,
        #[arg(long)]
        note: Option<String>,
    },

    /// Show global entry/link/tag counts.
    Stats,
}

/// The KB registry (§ `kb.rs`) is process-local, so the CLI persists its
/// contents to a small JSON sidecar in `config_dir` between invocations,
/// the "workspace config file" `KbRegistry`'s own doc comment assumes a
/// caller provides.
fn kb_registry_path(config_dir: &str) -> PathBuf {
    PathBuf::from(config_dir).join("kbs.json")
}

fn load_kb_registry(config_dir: &str) -> Result<KbRegistry> {
    let registry = KbRegistry::new();
    let path = kb_registry_path(config_dir);
    if !path.exists() {
        return Ok(registry);
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let kbs: Vec<Kb> = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    for kb in kbs {
        registry.register(kb);
    }
    Ok(registry)
}

fn save_kb_registry(config_dir: &str, kbs: &[Kb]) -> Result<()> {
    let path = kb_registry_path(config_dir);
    let raw = serde_json::to_string_pretty(kbs)?;
    std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

async fn connect_backend(config: &PyriteConfig) -> Result<Box<dyn SearchBackend>> {
    match config.backend {
        #[cfg(feature = "embedded-backend")]
        BackendKind::Embedded => {
            let backend = pyrite::backends::embedded::EmbeddedBackend::connect(&config.embedded_path).await?;
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "embedded-backend"))]
        BackendKind::Embedded => anyhow::bail!("binary was built without the embedded-backend feature"),
        #[cfg(feature = "server-backend")]
        BackendKind::Server => {
            let dsn = config
                .postgres_dsn
                .as_deref()
                .context("server backend requires postgres_dsn in pyrite.toml or PYRITE_POSTGRES_DSN")?;
            let backend = pyrite::backends::server::ServerBackend::connect(dsn, config.embedding_dimension).await?;
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "server-backend"))]
        BackendKind::Server => anyhow::bail!("binary was built without the server-backend feature"),
        #[cfg(feature = "columnar-backend")]
        BackendKind::Columnar => {
            let backend =
                pyrite::backends::columnar::ColumnarBackend::connect_with_dimension(&config.lancedb_uri, config.embedding_dimension)
                    .await?;
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "columnar-backend"))]
        BackendKind::Columnar => anyhow::bail!("binary was built without the columnar-backend feature"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = pyrite::observability::init_logging_with_level(cli.verbose, cli.quiet);
    let quiet = cli.quiet;

    let config = PyriteConfig::load(&cli.config_dir).context("loading pyrite.toml")?;
    let backend = connect_backend(&config).await?;
    backend.ensure_schema().await?;

    let registry = load_kb_registry(&cli.config_dir)?;
    let service = Service::new(backend.as_ref(), registry).with_config(&config);

    match cli.command {
        Commands::RegisterKb { name, kb_type, path, repo, read_only } => {
            let kb_name = KbName::new(name)?;
            let mut kb = Kb::new(kb_name, kb_type, path.to_string_lossy().to_string());
            kb.repo = repo;
            kb.read_only = read_only;
            service.register_kb(kb);
            save_kb_registry(&cli.config_dir, &service.list_kbs())?;
            qprintln!(quiet, "registered knowledge base");
        }

        Commands::UnregisterKb { name } => {
            let kb_name = KbName::new(name)?;
            service.unregister_kb(&kb_name)?;
            save_kb_registry(&cli.config_dir, &service.list_kbs())?;
            qprintln!(quiet, "unregistered knowledge base");
        }

        Commands::ListKbs => {
            for kb in service.list_kbs() {
                println!("{}\t{}\t{}\tentries={}", kb.name, kb.kb_type, kb.path, kb.entry_count);
            }
        }

        Commands::Sync { kb_name, full } => {
            let kb_name = KbName::new(kb_name)?;
            let parser = FrontmatterParser::new();
            if full {
                let report = service.full_reindex(&kb_name, &parser).await?;
                qprintln!(quiet, "indexed {} entries ({} errors)", report.indexed, report.errors.len());
                for error in &report.errors {
                    eprintln!("  {error}");
                }
            } else {
                let report = service.sync_index(&kb_name, &parser).await?;
                qprintln!(
                    quiet,
                    "added {}, updated {}, removed {} ({} errors)",
                    report.added,
                    report.updated,
                    report.removed,
                    report.errors.len()
                );
                for error in &report.errors {
                    eprintln!("  {error}");
                }
            }
            save_kb_registry(&cli.config_dir, &service.list_kbs())?;
        }

        Commands::Search { kb_name, query, limit } => {
            let kb_name = KbName::new(kb_name)?;
            let search_query = SearchQuery::new(query)?;
            let filter = SearchFilter { kb_name: Some(kb_name), limit: Limit::new(limit)?, ..Default::default() };
            let hits = service.search(&search_query, &filter).await?;
            if hits.is_empty() {
                qprintln!(quiet, "no matches");
            }
            for hit in hits {
                println!("{}\t{}\t{}", hit.id, hit.title, hit.snippet);
            }
        }

        Commands::Get { kb_name, id } => {
            let kb_name = KbName::new(kb_name)?;
            let id = EntryId::new(id)?;
            match service.get_entry(&id, &kb_name).await? {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => qprintln!(quiet, "not found"),
            }
        }

        Commands::Graph { kb_name, id, depth, limit } => {
            let kb_name = KbName::new(kb_name)?;
            let id = EntryId::new(id)?;
            let graph = service.get_graph(&id, &kb_name, GraphDepth::clamped(depth), None, None, limit).await?;
            qprintln!(quiet, "{} nodes, {} edges", graph.nodes.len(), graph.edges.len());
            for node in &graph.nodes {
                println!("node\t{}\t{}\t{}", node.id, node.kb_name, node.title);
            }
            for edge in &graph.edges {
                println!("edge\t{}:{}\t{}\t{}:{}", edge.source_kb, edge.source_id, edge.relation, edge.target_kb, edge.target_id);
            }
        }

        Commands::Link { source_kb, source_id, target_kb, target_id, relation, note } => {
            let source_kb = KbName::new(source_kb)?;
            let source_id = EntryId::new(source_id)?;
            let target_kb = KbName::new(target_kb)?;
            let target_id = EntryId::new(target_id)?;
            let relation = RelationName::new(relation)?;
            service.add_link(&source_id, &source_kb, &target_id, &target_kb, relation, note).await?;
            qprintln!(quiet, "linked");
        }

        Commands::Stats => {
            let counts = service.get_index_stats().await?;
            println!("knowledge bases: {}", counts.kb_count);
            println!("entries:         {}", counts.entry_count);
            println!("links:           {}", counts.link_count);
            println!("distinct tags:   {}", counts.tag_count);
        }
    }

    info!("pyrite command finished");
    backend.close().await?;
    Ok(())
}
