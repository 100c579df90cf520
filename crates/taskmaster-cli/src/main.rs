// SPDX-License-Identifier: Apache-2.0

//! Taskmaster CLI binary entrypoint.

mod shell;
mod signals;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use taskmaster_runtime::Engine;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Taskmaster — a declarative process supervisor with an interactive
/// operator shell.
#[derive(Parser)]
#[command(name = "taskmaster", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML program configuration.
    config: PathBuf,

    /// Log level for the supervisor's own diagnostics (trace/debug/info/warn/error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Suppress the startup banner.
    #[arg(short = 'q', long)]
    no_banner: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap exits 0 on --help/--version; everything else is a usage
            // error and must map to exit code 1, distinct from the 2 used
            // for a failed initial config load below.
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                print!("{e}");
                return ExitCode::SUCCESS;
            }
            eprint!("{e}");
            return ExitCode::from(1);
        }
    };
    let _ = dotenvy::dotenv();
    let _log_guard = init_logging(&cli.log_level);

    if !cli.no_banner {
        println!("Taskmaster CLI. Type 'help' for commands.");
    }

    let (handle, events, _engine_thread) = match Engine::spawn(cli.config.clone()) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("taskmaster: {e}");
            return ExitCode::from(2);
        }
    };

    signals::install(handle.clone());
    shell::run(handle, events);

    ExitCode::SUCCESS
}

/// Installs a `tracing` subscriber writing to stdout and to `taskmaster.log`,
/// mirroring the dual destinations of the supervisor's own process log.
fn init_logging(level: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", "taskmaster.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(std::io::stdout))
        .init();

    guard
}
