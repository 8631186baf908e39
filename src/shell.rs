use crate::builtins::{dispatch, Builtin, Flow};
use crate::exec::execute_command;
use crate::expand::{expand_words, AliasTable};
use crate::history::History;
use crate::input::LineSource;
use crate::jobs::{JobStatus, JobTable};
use crate::parser::parse_command_line;
use crate::redirect;
use crate::signals;
use crate::terminal::Terminal;
use nix::sys::signal::{killpg, Signal};
use std::env;
use std::io;
use std::iter;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Global prompt string.
pub static PROMPT: &str = "jobsh> ";

#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Print [`PROMPT`] before each line.
    pub emit_prompt: bool,
}

/// All of the shell's mutable state, owned by the read-eval loop.
pub struct Shell {
    pub(crate) jobs: JobTable,
    pub(crate) terminal: Terminal,
    pub(crate) aliases: AliasTable,
    pub(crate) history: History,
    /// Status of the last foreground command, for `$?`.
    pub(crate) last_status: i32,
    self_exe: Option<PathBuf>,
    history_path: Option<PathBuf>,
}

impl Shell {
    pub fn new(terminal: Terminal) -> Self {
        Shell {
            jobs: JobTable::new(),
            terminal,
            aliases: AliasTable::new(),
            history: History::new(),
            last_status: 0,
            self_exe: env::current_exe().ok(),
            history_path: None,
        }
    }

    /// Loads `path` into the history and saves back to it on exit.
    pub fn persist_history(&mut self, path: PathBuf) {
        if let Err(e) = self.history.load(&path) {
            warn!("couldn't load history from {}: {}", path.display(), e);
        }
        self.history_path = Some(path);
    }

    /// History step for one raw input line: expands events, records the
    /// result and hands back the line to evaluate. `None` means there is
    /// nothing to run.
    pub fn recall(&mut self, raw: &str) -> Option<String> {
        if raw.trim().is_empty() {
            return None;
        }
        let line = match self.history.expand(raw) {
            Ok(Some(expanded)) => {
                println!("{}", expanded);
                expanded
            }
            Ok(None) => raw.to_string(),
            Err(e) => {
                eprintln!("{}", e);
                self.last_status = 1;
                return None;
            }
        };
        self.history.push(&line);
        Some(line)
    }

    /// Parses, expands and runs one command line.
    pub fn eval(&mut self, line: &str) -> Flow {
        let cmd = match parse_command_line(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("jobsh: {}", e);
                self.last_status = 2;
                return Flow::Continue;
            }
        };
        if cmd.is_empty() {
            return Flow::Continue;
        }

        // Scripts have no job control; `&` is ignored there.
        let background = cmd.background && self.terminal.is_interactive();
        if cmd.background && !background {
            debug!("running `&` command in the foreground");
        }
        let pipeline = cmd.is_pipeline();
        let stages: Vec<Vec<String>> = cmd
            .stages
            .into_iter()
            .map(|stage| expand_words(stage, &self.aliases, self.last_status))
            .collect();

        // Built-ins only run on their own, never as a pipeline stage.
        if !pipeline {
            let only = &stages[0];
            if only.is_empty() {
                return Flow::Continue;
            }
            let mut args = only.clone();
            redirect::strip(&mut args);
            if let Some(builtin) = args.first().and_then(|name| Builtin::from_name(name)) {
                return self.run_builtin(builtin, &args);
            }
        }
        self.launch(&stages, background, line.trim());
        Flow::Continue
    }

    fn run_builtin(&mut self, builtin: Builtin, args: &[String]) -> Flow {
        debug!(builtin = builtin.name(), "running built-in");
        match dispatch(builtin, args, self) {
            Ok(flow) => {
                if builtin != Builtin::Fg {
                    self.last_status = 0;
                }
                flow
            }
            Err(e) => {
                eprintln!("{}: {}", builtin.name(), e);
                self.last_status = 1;
                Flow::Continue
            }
        }
    }

    fn launch(&mut self, stages: &[Vec<String>], background: bool, cmdline: &str) {
        let result = execute_command(
            &mut self.jobs,
            &self.terminal,
            stages,
            background,
            cmdline,
            self.self_exe.as_deref(),
        );
        match result {
            Ok(Some(outcome)) => self.last_status = outcome.status_code(),
            Ok(None) => self.last_status = 0,
            Err(e) => {
                eprintln!("jobsh: {}", e);
                self.last_status = 1;
            }
        }
    }

    /// Pre-prompt pass: reaps children whose state changed in the
    /// background, reports stops, then frees and reports finished jobs.
    pub fn housekeeping(&mut self) {
        let pending = signals::take_child_events();
        if pending || !self.jobs.is_empty() {
            for (job_id, status) in signals::reap_children(&mut self.jobs) {
                if status != JobStatus::Stopped {
                    continue;
                }
                if let Some(job) = self.jobs.find_by_job_id(job_id) {
                    eprintln!("{}", job.notice());
                }
            }
        }
        for job in self.jobs.sweep() {
            debug!(job_id = job.job_id, status = ?job.exit_code(), "background job finished");
            eprintln!("{}", job.notice());
        }
    }

    /// Hangs up stopped groups, which would otherwise stay stopped forever,
    /// and saves the history.
    fn shutdown(&mut self) {
        for pgid in self.jobs.stopped_groups() {
            debug!(%pgid, "hanging up stopped group");
            for sig in [Signal::SIGHUP, Signal::SIGCONT] {
                if let Err(e) = killpg(pgid, sig) {
                    warn!("kill ({}): {}", sig, e);
                }
            }
        }
        if let Some(path) = &self.history_path {
            if let Err(e) = self.history.save(path) {
                warn!("couldn't save history to {}: {}", path.display(), e);
            }
        }
    }
}

/// Runs the read-eval loop until end of input or `exit`.
pub fn run_shell(mut shell: Shell, mut source: LineSource, options: Options) -> io::Result<()> {
    if source.is_editor() {
        source.remember(shell.history.iter().map(|(_, line)| line));
    }
    let prompt = if options.emit_prompt { PROMPT } else { "" };

    loop {
        shell.housekeeping();
        let raw = match source.read_line(prompt) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                if source.is_editor() {
                    println!();
                }
                break;
            }
            Err(e) => {
                shell.shutdown();
                return Err(e);
            }
        };
        let Some(line) = shell.recall(&raw) else {
            continue;
        };
        source.remember(iter::once(line.as_str()));
        if shell.eval(&line) == Flow::Exit {
            break;
        }
    }
    shell.shutdown();
    Ok(())
}
