//! CLI command implementations.
//!
//! Contains the business logic for each CLI command. Async pipeline
//! stages run on a per-command tokio runtime; the SQLite handle stays
//! on this thread throughout.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;

use crate::cli::output::{
    OutputFormat, format_eval_outcomes, format_records, format_report, format_sessions,
    format_status,
};
use crate::cli::parser::{Cli, Commands, SessionCommands};
use crate::client::{
    ClientConfig, EmbeddingClient, MemoryVectorIndex, OpenAiEmbedder, OpenAiLlm,
};
use crate::core::{Chunk, EmbeddedChunk, EvalConfig, RagConfig};
use crate::dispatch::{FanoutDispatcher, FanoutRequest};
use crate::eval::{DimensionalJudge, EvalDispatcher, ReferenceEvaluator};
use crate::storage::{SqliteStorage, Storage};
use crate::technique::Capabilities;

/// A command's rendered output plus its process exit code.
#[derive(Debug)]
pub struct CliOutcome {
    /// Text or JSON to print on stdout.
    pub output: String,
    /// Process exit code (0 success, 1 partial failure, 2 request failure).
    pub exit_code: u8,
}

impl CliOutcome {
    fn ok(output: String) -> Self {
        Self {
            output,
            exit_code: 0,
        }
    }

    const fn with_code(output: String, exit_code: u8) -> Self {
        Self { output, exit_code }
    }
}

/// Executes the parsed CLI command.
///
/// # Errors
///
/// Returns an error for request-level failures; the caller maps those
/// to exit code 2.
pub fn execute(cli: &Cli) -> anyhow::Result<CliOutcome> {
    let format = OutputFormat::parse(&cli.format);
    let db_path = cli.get_db_path();

    match &cli.command {
        Commands::Init { force } => cmd_init(&db_path, *force),
        Commands::Status => cmd_status(&db_path, format),
        Commands::Ingest {
            file,
            document_id,
            chunk_chars,
        } => cmd_ingest(&db_path, file, document_id.as_deref(), *chunk_chars),
        Commands::Session(sub) => match sub {
            SessionCommands::New { title } => cmd_session_new(&db_path, title),
            SessionCommands::List => cmd_session_list(&db_path, format),
        },
        Commands::Run {
            query,
            techniques,
            session,
            top_k,
            max_concurrency,
            timeout_s,
            documents,
            config_json,
        } => {
            let params = RunParams {
                query,
                techniques,
                session: *session,
                top_k: *top_k,
                max_concurrency: *max_concurrency,
                timeout_s: *timeout_s,
                documents: documents.as_deref(),
                config_json: config_json.as_deref(),
            };
            cmd_run(&db_path, &params, format)
        }
        Commands::Records { session } => cmd_records(&db_path, *session, format),
        Commands::Eval {
            records,
            no_llm,
            no_reference,
            eval_concurrency,
            reference,
        } => cmd_eval(
            &db_path,
            records,
            !no_llm,
            !no_reference,
            *eval_concurrency,
            reference.as_deref(),
            format,
        ),
    }
}

/// Parameters for the run command.
#[derive(Debug, Clone)]
struct RunParams<'a> {
    query: &'a str,
    techniques: &'a str,
    session: Option<i64>,
    top_k: Option<usize>,
    max_concurrency: Option<usize>,
    timeout_s: Option<f64>,
    documents: Option<&'a str>,
    config_json: Option<&'a str>,
}

/// Opens storage and ensures it's initialized.
fn open_storage(db_path: &Path) -> anyhow::Result<SqliteStorage> {
    let storage = SqliteStorage::open(db_path)?;
    if !storage.is_initialized()? {
        return Err(anyhow!(
            "database not initialized (run 'rag-arena init' first)"
        ));
    }
    Ok(storage)
}

fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to create async runtime")
}

// ==================== Command Implementations ====================

fn cmd_init(db_path: &Path, force: bool) -> anyhow::Result<CliOutcome> {
    if db_path.exists() && !force {
        return Err(anyhow!(
            "database already exists at {}; use --force to reinitialize",
            db_path.display()
        ));
    }

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if force && db_path.exists() {
        std::fs::remove_file(db_path)
            .with_context(|| format!("failed to remove {}", db_path.display()))?;
    }

    let mut storage = SqliteStorage::open(db_path)?;
    storage.init()?;
    Ok(CliOutcome::ok(format!(
        "Initialized database at {}",
        db_path.display()
    )))
}

fn cmd_status(db_path: &Path, format: OutputFormat) -> anyhow::Result<CliOutcome> {
    let storage = open_storage(db_path)?;
    let sessions = storage.list_sessions()?;
    let chunks = storage.load_chunks()?;
    let documents: std::collections::BTreeSet<&str> = chunks
        .iter()
        .map(|c| c.chunk.document_id.as_str())
        .collect();
    Ok(CliOutcome::ok(format_status(
        sessions.len(),
        chunks.len(),
        documents.len(),
        format,
    )))
}

fn cmd_ingest(
    db_path: &Path,
    file: &Path,
    document_id: Option<&str>,
    chunk_chars: usize,
) -> anyhow::Result<CliOutcome> {
    let storage = open_storage(db_path)?;
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let document_id = document_id.map_or_else(
        || {
            file.file_stem()
                .map_or_else(|| "document".to_string(), |s| s.to_string_lossy().into_owned())
        },
        str::to_string,
    );

    let pieces = chunk_paragraphs(&text, chunk_chars.max(1));
    if pieces.is_empty() {
        return Err(anyhow!("{} contains no text to ingest", file.display()));
    }

    let client_config = ClientConfig::from_env()?;
    let embedder = OpenAiEmbedder::new(&client_config);
    let runtime = build_runtime()?;
    let vectors = runtime
        .block_on(embedder.embed(&pieces))
        .context("embedding failed")?;

    // The corpus must keep one dimension; compare against what's stored.
    if let (Some(existing), Some(new)) = (
        storage.load_chunks()?.first().map(|c| c.vector.len()),
        vectors.first().map(Vec::len),
    ) && existing != new
    {
        return Err(anyhow!(
            "embedding dimension mismatch: corpus has {existing}, new chunks have {new}"
        ));
    }

    let filename = file
        .file_name()
        .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
    let embedded: Vec<EmbeddedChunk> = pieces
        .into_iter()
        .zip(vectors)
        .enumerate()
        .map(|(ordinal, (piece, vector))| EmbeddedChunk {
            chunk: Chunk {
                chunk_id: format!("{document_id}:{ordinal}"),
                document_id: document_id.clone(),
                ordinal,
                text: piece,
                metadata: std::iter::once(("filename".to_string(), filename.clone())).collect(),
            },
            vector,
        })
        .collect();

    let count = embedded.len();
    storage.upsert_chunks(&embedded)?;
    Ok(CliOutcome::ok(format!(
        "Ingested {count} chunks from {} as document '{document_id}'",
        file.display()
    )))
}

fn cmd_session_new(db_path: &Path, title: &str) -> anyhow::Result<CliOutcome> {
    let storage = open_storage(db_path)?;
    let session = storage.create_session(title)?;
    Ok(CliOutcome::ok(format!(
        "Created session #{} '{}'",
        session.id, session.title
    )))
}

fn cmd_session_list(db_path: &Path, format: OutputFormat) -> anyhow::Result<CliOutcome> {
    let storage = open_storage(db_path)?;
    let sessions = storage.list_sessions()?;
    Ok(CliOutcome::ok(format_sessions(&sessions, format)))
}

fn cmd_run(
    db_path: &Path,
    params: &RunParams<'_>,
    format: OutputFormat,
) -> anyhow::Result<CliOutcome> {
    let storage = open_storage(db_path)?;

    // Hydrate the in-memory index from the persisted vector store.
    let index = MemoryVectorIndex::hydrate(storage.load_chunks()?)
        .map_err(|e| anyhow!("failed to hydrate vector index: {e}"))?;

    let client_config = ClientConfig::from_env()?;
    let caps = Capabilities {
        index: Arc::new(index),
        llm: Arc::new(OpenAiLlm::generation(&client_config)),
        embedder: Arc::new(OpenAiEmbedder::new(&client_config)),
    };

    let session_id = match params.session {
        Some(id) => id,
        None => {
            let title = crate::core::trace::preview(params.query, 60);
            storage.create_session(&title)?.id
        }
    };

    let config = RagConfig::from_value(&merge_config(params)?);
    let technique_names: Vec<String> = split_list(params.techniques);
    if technique_names.is_empty() {
        return Err(anyhow!("no techniques given"));
    }
    let document_ids: Vec<String> = params.documents.map(split_list).unwrap_or_default();

    let request = FanoutRequest {
        session_id,
        query: params.query.to_string(),
        document_ids,
        technique_names,
        config,
    };

    let dispatcher = FanoutDispatcher::new(caps);
    let runtime = build_runtime()?;
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, canceling in-flight techniques");
            signal_cancel.cancel();
        }
    });

    let report = runtime.block_on(dispatcher.run(&storage, &request, &cancel))?;

    let exit_code = report.exit_code();
    Ok(CliOutcome::with_code(
        format_report(&report, params.query, format),
        exit_code,
    ))
}

fn cmd_records(db_path: &Path, session_id: i64, format: OutputFormat) -> anyhow::Result<CliOutcome> {
    let storage = open_storage(db_path)?;
    storage
        .get_session(session_id)?
        .ok_or_else(|| anyhow!("session not found: {session_id}"))?;
    let records = storage.list_qa_records(session_id)?;
    Ok(CliOutcome::ok(format_records(&records, format)))
}

#[allow(clippy::too_many_arguments)]
fn cmd_eval(
    db_path: &Path,
    records: &str,
    use_llm: bool,
    use_reference: bool,
    eval_concurrency: Option<usize>,
    reference: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<CliOutcome> {
    let storage = open_storage(db_path)?;

    let record_ids: Vec<i64> = split_list(records)
        .iter()
        .map(|s| s.parse::<i64>().map_err(|_| anyhow!("invalid record id: {s}")))
        .collect::<anyhow::Result<_>>()?;
    if record_ids.is_empty() {
        return Err(anyhow!("no record ids given"));
    }

    let mut eval_config = EvalConfig {
        use_llm,
        use_reference,
        ..EvalConfig::default()
    };
    if let Some(n) = eval_concurrency {
        eval_config.eval_concurrency = n;
    }

    let client_config = ClientConfig::from_env()?;
    let judge_llm: Arc<OpenAiLlm> = Arc::new(OpenAiLlm::judge(&client_config));
    let judge = Arc::new(DimensionalJudge::new(
        judge_llm.clone(),
        client_config.judge_model.clone(),
    ));
    let reference_eval = Arc::new(ReferenceEvaluator::new(
        judge_llm,
        Arc::new(OpenAiEmbedder::new(&client_config)),
        eval_config.concurrency(),
        eval_config.reference_timeout(),
    ));

    let reference_answers: BTreeMap<i64, String> = reference.map_or_else(BTreeMap::new, |text| {
        record_ids.iter().map(|&id| (id, text.to_string())).collect()
    });

    let dispatcher = EvalDispatcher::new(judge, reference_eval, eval_config);
    let runtime = build_runtime()?;
    let outcomes =
        runtime.block_on(dispatcher.evaluate_batch(&storage, &record_ids, &reference_answers))?;

    let any_failed = outcomes.iter().any(|o| o.error_kind.is_some());
    Ok(CliOutcome::with_code(
        format_eval_outcomes(&outcomes, format),
        u8::from(any_failed),
    ))
}

// ==================== Helpers ====================

/// Splits a comma-separated flag value into trimmed entries.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Merges `--config-json` with the explicit flags (flags win).
fn merge_config(params: &RunParams<'_>) -> anyhow::Result<serde_json::Value> {
    let mut map = match params.config_json {
        Some(raw) => serde_json::from_str::<serde_json::Value>(raw)
            .context("invalid --config-json")?
            .as_object()
            .cloned()
            .ok_or_else(|| anyhow!("--config-json must be a JSON object"))?,
        None => serde_json::Map::new(),
    };
    if let Some(top_k) = params.top_k {
        map.insert("top_k".to_string(), serde_json::json!(top_k));
    }
    if let Some(n) = params.max_concurrency {
        map.insert("max_concurrency".to_string(), serde_json::json!(n));
    }
    if let Some(secs) = params.timeout_s {
        map.insert(
            "per_technique_timeout_s".to_string(),
            serde_json::json!(secs),
        );
    }
    Ok(serde_json::Value::Object(map))
}

/// Splits text into paragraph-aligned chunks of roughly `chunk_chars`
/// characters. Oversized paragraphs are split on char boundaries.
fn chunk_paragraphs(text: &str, chunk_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if paragraph.chars().count() > chunk_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut piece = String::new();
            let mut piece_len = 0usize;
            for c in paragraph.chars() {
                piece.push(c);
                piece_len += 1;
                if piece_len >= chunk_chars {
                    chunks.push(std::mem::take(&mut piece));
                    piece_len = 0;
                }
            }
            if !piece.is_empty() {
                chunks.push(piece);
            }
            continue;
        }

        if !current.is_empty()
            && current.chars().count() + paragraph.chars().count() + 2 > chunk_chars
        {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(split_list(""), Vec::<String>::new());
        assert_eq!(split_list("one"), vec!["one"]);
    }

    #[test]
    fn test_chunk_paragraphs_groups_small() {
        let text = "one\n\ntwo\n\nthree";
        let chunks = chunk_paragraphs(text, 100);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("one") && chunks[0].contains("three"));
    }

    #[test]
    fn test_chunk_paragraphs_splits_at_budget() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let chunks = chunk_paragraphs(text, 10);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 12);
        }
    }

    #[test]
    fn test_chunk_paragraphs_oversized_paragraph() {
        let text = "x".repeat(2500);
        let chunks = chunk_paragraphs(&text, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 1000);
    }

    #[test]
    fn test_merge_config_flags_win() {
        let params = RunParams {
            query: "q",
            techniques: "baseline",
            session: None,
            top_k: Some(7),
            max_concurrency: None,
            timeout_s: None,
            documents: None,
            config_json: Some(r#"{"top_k": 2, "vector_weight": 0.8}"#),
        };
        let value = merge_config(&params).unwrap_or_default();
        assert_eq!(value["top_k"], serde_json::json!(7));
        assert_eq!(value["vector_weight"], serde_json::json!(0.8));
    }
}
