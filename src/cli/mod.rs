//! CLI module
//!
//! instant-rag command definitions and their implementations

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::collector::{CollectorConfig, FileCollector};
use crate::config::RagConfig;
use crate::conversation::{QueryResult, Session, SessionSettings, SessionState};
use crate::embedding::create_embedder;
use crate::extractor::DocumentLoader;
use crate::knowledge::{
    index_exists, ChunkConfig, IngestManifest, IngestReport, Ingestor, TextChunker, VectorIndex,
    VectorStore,
};
use crate::llm::OllamaChat;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "instant-rag")]
#[command(version, about = "Chat with your documents using a local RAG pipeline", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags that take precedence over `.env` and the environment
#[derive(Args, Debug, Default)]
pub struct ConfigOverrides {
    /// Maximum chunk length in characters
    #[arg(long, global = true, env = "CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long, global = true, env = "CHUNK_OVERLAP")]
    pub chunk_overlap: Option<usize>,

    /// Embedding model (`hash` for the offline embedder)
    #[arg(long, global = true, env = "EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// Chat model
    #[arg(long, global = true, env = "LLM_MODEL")]
    pub llm_model: Option<String>,

    /// Directory holding the persisted index
    #[arg(long, global = true, env = "DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Directory scanned by `ingest` when no inputs are given
    #[arg(long, global = true, env = "DATA_PATH")]
    pub data_path: Option<PathBuf>,

    /// Chunks retrieved per question
    #[arg(long, global = true, env = "TOP_K")]
    pub top_k: Option<usize>,
}

impl ConfigOverrides {
    fn apply(self, mut config: RagConfig) -> RagConfig {
        if let Some(v) = self.chunk_size {
            config.chunk_size = v;
        }
        if let Some(v) = self.chunk_overlap {
            config.chunk_overlap = v;
        }
        if let Some(v) = self.embedding_model {
            config.embedding_model = v;
        }
        if let Some(v) = self.llm_model {
            config.llm_model = v;
        }
        if let Some(v) = self.db_path {
            config.db_path = v;
        }
        if let Some(v) = self.data_path {
            config.data_path = v;
        }
        if let Some(v) = self.top_k {
            config.top_k = v;
        }
        config
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add files or a directory to the persisted index
    Ingest {
        /// Files to ingest
        files: Vec<PathBuf>,

        /// Directory to scan recursively
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Re-ingest files whose content is already recorded
        #[arg(long)]
        force: bool,
    },

    /// Interactive chat over the persisted index or a single document
    Chat {
        /// Chat about this file only (fresh in-memory index)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Ask one question against the persisted index
    Ask {
        /// The question
        question: String,
    },

    /// Show configuration and index status
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// Execute a CLI command
pub async fn run(cli: Cli) -> Result<()> {
    let config = cli
        .overrides
        .apply(RagConfig::from_env().context("Failed to read configuration")?);
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Ingest { files, dir, force } => cmd_ingest(&config, files, dir, force).await,
        Commands::Chat { file } => cmd_chat(&config, file).await,
        Commands::Ask { question } => cmd_ask(&config, &question).await,
        Commands::Status => cmd_status(&config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Ingest command
///
/// Files given on the command line, else `--dir`, else `data_path`.
async fn cmd_ingest(
    config: &RagConfig,
    files: Vec<PathBuf>,
    dir: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let embedder = create_embedder(config).context("Failed to create embedding provider")?;
    let index = Arc::new(
        VectorIndex::load_or_new(&config.db_path)
            .await
            .context("Failed to open vector index")?,
    );
    let manifest = Arc::new(
        IngestManifest::open_in(&config.db_path).context("Failed to open ingest manifest")?,
    );
    if !index_exists(&config.db_path) {
        // entries without a persisted index would make every file look unchanged
        let stale = manifest.clear().context("Failed to reset ingest manifest")?;
        if stale > 0 {
            println!("[!] No persisted index; forgot {} recorded source(s)", stale);
        }
    }

    let ingestor = Ingestor::from_config(config, embedder, index.clone())
        .context("Failed to create ingestor")?
        .with_manifest(manifest)
        .force(force);

    let report = if !files.is_empty() {
        println!("[*] Ingesting {} file(s)", files.len());
        ingestor.ingest_paths(&files).await
    } else {
        let dir = dir.unwrap_or_else(|| config.data_path.clone());
        if !dir.is_dir() {
            bail!("Directory not found: {}", dir.display());
        }

        let collector = FileCollector::new(CollectorConfig::from_config(config));
        let collection = collector
            .collect_directory(&dir)
            .with_context(|| format!("Failed to scan {}", dir.display()))?;

        println!("[*] Scanning: {}", dir.display());
        println!(
            "    {} supported, {} unsupported, {} over the size limit",
            collection.files.len(),
            collection.unsupported.len(),
            collection.oversized.len()
        );
        println!("    Total size: {}", format_bytes(collection.total_size()));
        println!();

        ingestor.ingest_collection(collection).await
    };

    if report.chunks_added > 0 {
        index
            .persist(&config.db_path)
            .await
            .context("Failed to persist vector index")?;
    }
    ingestor
        .commit_manifest()
        .context("Failed to update ingest manifest")?;

    print_report(&report);
    Ok(())
}

/// Chat command
///
/// With `--file`, the document is ingested into a fresh in-memory index.
async fn cmd_chat(config: &RagConfig, file: Option<PathBuf>) -> Result<()> {
    let mut session = open_session(config)?;

    if let Some(ref path) = file {
        println!("[*] Ingesting {}", path.display());
        let chunker = TextChunker::new(ChunkConfig {
            max_size: config.chunk_size,
            overlap: config.chunk_overlap,
        })?;
        let chunks = session
            .ingest(path, DocumentLoader::from_config(config), chunker)
            .await
            .with_context(|| format!("Failed to ingest {}", path.display()))?;
        println!("[OK] {} chunks indexed", chunks);
    } else {
        let index = load_index(&config.db_path).await?;
        println!("[OK] Loaded index: {} chunks", index.len().await);
        session.attach_index(index);
    }

    println!("Ask a question about your document(s). Type 'exit' or 'quit' to leave.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        if let Err(e) = answer_streaming(&mut session, question).await {
            println!();
            println!("[!] {}", e);
        }
        println!();
    }

    if let SessionState::Answering { turn } = session.state() {
        println!("[OK] Session ended after {} question(s)", turn);
    }
    Ok(())
}

/// Print fragments as they arrive, then the sources
async fn answer_streaming(session: &mut Session, question: &str) -> crate::Result<()> {
    let mut pending = session.ask_streaming(question).await?;

    let mut stdout = std::io::stdout();
    while let Some(fragment) = pending.next().await {
        let fragment = fragment?;
        print!("{}", fragment);
        let _ = stdout.flush();
    }

    let result = pending.complete().await?;
    println!();
    print_sources(&result);
    Ok(())
}

/// Ask command
async fn cmd_ask(config: &RagConfig, question: &str) -> Result<()> {
    let mut session = open_session(config)?;
    session.attach_index(load_index(&config.db_path).await?);

    println!("[*] Question: \"{}\"", question);
    let result = session.ask(question).await.context("Query failed")?;

    println!();
    println!("{}", result.answer);
    println!();
    print_sources(&result);
    Ok(())
}

/// Status command
async fn cmd_status(config: &RagConfig) -> Result<()> {
    println!("instant-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] Data directory: {}", config.data_path.display());
    println!("[*] Index directory: {}", config.db_path.display());
    println!("[*] Ollama: {}", config.ollama_url);
    println!(
        "[*] Models: embedding={}, llm={}",
        config.embedding_model, config.llm_model
    );
    println!(
        "[*] Chunking: size={}, overlap={}, top_k={}",
        config.chunk_size, config.chunk_overlap, config.top_k
    );

    if index_exists(&config.db_path) {
        match VectorIndex::load(&config.db_path).await {
            Ok(index) => {
                let dimension = index
                    .dimension()
                    .await
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "[OK] Vector index: {} chunks (dimension {})",
                    index.len().await,
                    dimension
                );
            }
            Err(e) => println!("[!] Failed to load vector index: {}", e),
        }
    } else {
        println!("[!] Vector index: not created yet (run `instant-rag ingest`)");
    }

    let manifest = IngestManifest::open_in(&config.db_path);
    if let Ok(ref m) = manifest {
        println!("[*] Manifest: {}", m.db_path().display());
    }
    match manifest.and_then(|m| m.list()) {
        Ok(entries) if entries.is_empty() => println!("[!] No sources ingested"),
        Ok(entries) => {
            println!("[OK] Ingested sources ({}):", entries.len());
            for entry in entries {
                println!(
                    "     {} | {} chunks | {}",
                    entry.source,
                    entry.chunk_count,
                    entry.ingested_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Err(e) => println!("[!] Failed to read ingest manifest: {}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn open_session(config: &RagConfig) -> Result<Session> {
    let embedder = create_embedder(config).context("Failed to create embedding provider")?;
    let model = OllamaChat::from_config(config).context("Failed to create chat model")?;
    Ok(Session::new(
        embedder,
        Arc::new(model),
        SessionSettings::from_config(config),
    ))
}

async fn load_index(db_path: &Path) -> Result<Arc<dyn VectorStore>> {
    let index = VectorIndex::load(db_path).await.with_context(|| {
        format!(
            "No index at {} (run `instant-rag ingest` first)",
            db_path.display()
        )
    })?;
    Ok(Arc::new(index))
}

fn print_report(report: &IngestReport) {
    println!();
    for (path, error) in &report.failed {
        println!("[!] {}: {}", path.display(), error);
    }
    println!(
        "[OK] Done: {} succeeded, {} skipped, {} failed ({} chunks added)",
        report.succeeded,
        report.skipped,
        report.failure_count(),
        report.chunks_added
    );
}

fn print_sources(result: &QueryResult) {
    if result.supporting_chunks.is_empty() {
        println!("No sources found");
        return;
    }
    println!("Sources:");
    for ((name, text), chunk) in result.excerpts().zip(&result.supporting_chunks) {
        println!("  {} ({}): {}", name, chunk.source_id, truncate_text(text, 200));
    }
}

/// Truncate text for display (UTF-8 safe)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
        assert_eq!(truncate_text("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_overrides_win_over_config() {
        let overrides = ConfigOverrides {
            chunk_size: Some(500),
            top_k: Some(8),
            embedding_model: Some("hash".to_string()),
            ..Default::default()
        };
        let config = overrides.apply(RagConfig::default());

        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.top_k, 8);
        assert_eq!(config.embedding_model, "hash");
        assert_eq!(config.chunk_overlap, RagConfig::default().chunk_overlap);
    }

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["instant-rag", "ingest", "a.txt", "b.pdf", "--force"]).unwrap();
        match cli.command {
            Commands::Ingest { files, dir, force } => {
                assert_eq!(files, vec![PathBuf::from("a.txt"), PathBuf::from("b.pdf")]);
                assert!(dir.is_none());
                assert!(force);
            }
            _ => panic!("expected ingest"),
        }

        let cli = Cli::try_parse_from(["instant-rag", "ask", "what is due?", "--top-k", "2"]).unwrap();
        assert_eq!(cli.overrides.top_k, Some(2));
        assert!(matches!(cli.command, Commands::Ask { ref question } if question == "what is due?"));
    }
}
