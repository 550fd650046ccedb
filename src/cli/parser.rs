//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default characters per ingested chunk.
pub const DEFAULT_CHUNK_CHARS: usize = 1200;

/// rag-arena: compare RAG techniques side by side and score the results.
///
/// Runs named retrieval strategies against a shared corpus for one
/// query, persists the full trace, and evaluates the answers.
#[derive(Parser, Debug)]
#[command(name = "rag-arena")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the rag-arena database file.
    ///
    /// Defaults to `.rag-arena/arena.db` in the current directory.
    #[arg(short, long, env = "RAG_ARENA_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Resolves the database path with its default.
    #[must_use]
    pub fn get_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(".rag-arena").join("arena.db"))
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the rag-arena database.
    ///
    /// Creates the database file and schema if they don't exist.
    #[command(after_help = r"Examples:
  rag-arena init                      # Initialize in current directory
  rag-arena init --force              # Re-initialize (destroys existing data)
  rag-arena --db-path ./my.db init    # Initialize with custom path
")]
    Init {
        /// Force re-initialization (destroys existing data).
        #[arg(short, long)]
        force: bool,
    },

    /// Show corpus and session statistics.
    Status,

    /// Ingest a plain-text file into the corpus.
    ///
    /// The file is split into paragraph-aligned chunks, embedded, and
    /// written to the vector store.
    #[command(after_help = r"Examples:
  rag-arena ingest notes.txt                      # Document id from filename
  rag-arena ingest paper.txt -d paper-2024        # Explicit document id
  rag-arena ingest big.txt --chunk-chars 800      # Smaller chunks
")]
    Ingest {
        /// Path to the text file.
        file: PathBuf,

        /// Document id (defaults to the file stem).
        #[arg(short, long)]
        document_id: Option<String>,

        /// Target chunk size in characters.
        #[arg(long, default_value_t = DEFAULT_CHUNK_CHARS)]
        chunk_chars: usize,
    },

    /// Session operations (new, list).
    #[command(subcommand)]
    Session(SessionCommands),

    /// Run techniques against the corpus for one query.
    ///
    /// Exit codes: 0 all techniques succeeded, 1 at least one failed,
    /// 2 request-level failure.
    #[command(after_help = r#"Examples:
  rag-arena run "What is the capital?" -t baseline
  rag-arena run "Compare X and Y" -t baseline,fusion,reranker -k 8
  rag-arena run "Why?" -t adaptive --session 3 --documents paper-2024
  rag-arena --format json run "q" -t baseline | jq '.results[0].answer'
"#)]
    Run {
        /// The query text.
        query: String,

        /// Comma-separated technique names.
        #[arg(short, long, default_value = "baseline")]
        techniques: String,

        /// Session to record into (created on the fly when omitted).
        #[arg(short, long)]
        session: Option<i64>,

        /// Final context size (top-k).
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Maximum concurrent techniques (1-10).
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Per-technique timeout in seconds.
        #[arg(long)]
        timeout_s: Option<f64>,

        /// Comma-separated document ids to scope retrieval.
        #[arg(long)]
        documents: Option<String>,

        /// Additional config as a JSON object (unknown keys ignored).
        #[arg(long)]
        config_json: Option<String>,
    },

    /// List the QA records of a session.
    Records {
        /// Session id.
        #[arg(short, long)]
        session: i64,
    },

    /// Evaluate persisted QA records.
    ///
    /// Runs the LLM dimensional judge and the reference-metric track
    /// unless disabled.
    #[command(after_help = r"Examples:
  rag-arena eval --records 1,2,3
  rag-arena eval --records 4 --no-reference        # Judge only
  rag-arena eval --records 4 --reference 'Paris.'  # Enables precision/recall
")]
    Eval {
        /// Comma-separated QA record ids.
        #[arg(short, long)]
        records: String,

        /// Skip the LLM dimensional judge.
        #[arg(long)]
        no_llm: bool,

        /// Skip the reference-metric track.
        #[arg(long)]
        no_reference: bool,

        /// Evaluation concurrency (1-5).
        #[arg(long)]
        eval_concurrency: Option<usize>,

        /// Reference answer applied to every listed record.
        #[arg(long)]
        reference: Option<String>,
    },
}

/// Session subcommands.
#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Create a session.
    New {
        /// Session title.
        #[arg(short, long, default_value = "untitled")]
        title: String,
    },

    /// List sessions, most recently updated first.
    List,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_db_path() {
        let cli = Cli::parse_from(["rag-arena", "status"]);
        assert_eq!(
            cli.get_db_path(),
            PathBuf::from(".rag-arena").join("arena.db")
        );
    }

    #[test]
    fn test_run_parses_techniques() {
        let cli = Cli::parse_from([
            "rag-arena",
            "run",
            "what is up",
            "--techniques",
            "baseline,fusion",
            "-k",
            "3",
        ]);
        match cli.command {
            Commands::Run {
                techniques, top_k, ..
            } => {
                assert_eq!(techniques, "baseline,fusion");
                assert_eq!(top_k, Some(3));
            }
            _ => unreachable!(),
        }
    }
}
