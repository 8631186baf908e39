mod builtins;
mod exec;
mod expand;
mod history;
mod input;
mod jobs;
mod parser;
mod pipeline;
mod redirect;
mod shell;
mod signals;
mod terminal;
mod utils;

use anyhow::Context;
use history::History;
use input::LineSource;
use nix::libc;
use nix::unistd::isatty;
use shell::{Options, Shell};
use std::env;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use terminal::Terminal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("jobsh: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    // Parse command-line arguments.
    let mut emit_prompt = true;
    let mut verbose = false;
    let mut script: Option<PathBuf> = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-h" => utils::print_usage(),
            "-v" => verbose = true,
            "-p" => emit_prompt = false,
            _ if arg.starts_with('-') => {}
            _ => {
                if script.is_none() {
                    script = Some(PathBuf::from(arg));
                }
            }
        }
    }

    init_tracing(verbose);

    let interactive = script.is_none() && isatty(libc::STDIN_FILENO).unwrap_or(false);
    let source = match &script {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("couldn't open {}", path.display()))?;
            LineSource::reader(BufReader::new(file))
        }
        None if interactive => LineSource::editor().context("couldn't start the line editor")?,
        None => LineSource::reader(BufReader::new(io::stdin())),
    };

    let terminal = if interactive {
        Terminal::acquire(libc::STDIN_FILENO).context("couldn't initialise job control")?
    } else {
        Terminal::detached(libc::STDIN_FILENO)
    };
    signals::install_signal_handlers(interactive).context("couldn't install signal handlers")?;
    tracing::debug!(interactive, ?script, "starting");

    let mut shell = Shell::new(terminal);
    if interactive {
        if let Some(path) = History::default_path() {
            shell.persist_history(path);
        }
    }
    let options = Options {
        emit_prompt: emit_prompt && interactive,
    };
    shell::run_shell(shell, source, options).context("couldn't read input")
}

/// Logs go to stderr. `RUST_LOG` wins; otherwise `-v` means debug.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_ansi(false))
        .with(filter)
        .init();
}
