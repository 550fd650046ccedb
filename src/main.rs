//! Binary entry point for rag-arena.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;

use rag_arena::cli::{self, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli::execute(&cli) {
        Ok(outcome) => {
            let mut stdout = std::io::stdout();
            let _ = writeln!(stdout, "{}", outcome.output.trim_end());
            ExitCode::from(outcome.exit_code)
        }
        Err(err) => {
            let _ = writeln!(std::io::stderr(), "error: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// Installs the tracing subscriber; `--verbose` lowers the filter to
/// debug, otherwise `RUST_LOG` (default `warn`) applies.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
