use crate::expand::{format_alias, AliasError};
use crate::jobs::{JobError, JobId};
use crate::shell::Shell;
use crate::terminal::put_job_in_background;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Commands the shell runs itself instead of forking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Cd,
    Pwd,
    Help,
    Exit,
    Quit,
    Jobs,
    Fg,
    Bg,
    History,
    Alias,
    Unalias,
}

impl Builtin {
    pub const ALL: [Builtin; 11] = [
        Builtin::Cd,
        Builtin::Pwd,
        Builtin::Help,
        Builtin::Exit,
        Builtin::Quit,
        Builtin::Jobs,
        Builtin::Fg,
        Builtin::Bg,
        Builtin::History,
        Builtin::Alias,
        Builtin::Unalias,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Cd => "cd",
            Builtin::Pwd => "pwd",
            Builtin::Help => "help",
            Builtin::Exit => "exit",
            Builtin::Quit => "quit",
            Builtin::Jobs => "jobs",
            Builtin::Fg => "fg",
            Builtin::Bg => "bg",
            Builtin::History => "history",
            Builtin::Alias => "alias",
            Builtin::Unalias => "unalias",
        }
    }

    fn synopsis(self) -> &'static str {
        match self {
            Builtin::Cd => "cd [dir]",
            Builtin::Pwd => "pwd",
            Builtin::Help => "help",
            Builtin::Exit => "exit",
            Builtin::Quit => "quit",
            Builtin::Jobs => "jobs",
            Builtin::Fg => "fg <job_id>",
            Builtin::Bg => "bg <job_id>",
            Builtin::History => "history",
            Builtin::Alias => "alias [name[=value]]",
            Builtin::Unalias => "unalias <name>",
        }
    }

    fn summary(self) -> &'static str {
        match self {
            Builtin::Cd => "change the working directory",
            Builtin::Pwd => "print the working directory",
            Builtin::Help => "show this list",
            Builtin::Exit | Builtin::Quit => "leave the shell",
            Builtin::Jobs => "list jobs",
            Builtin::Fg => "resume a job in the foreground",
            Builtin::Bg => "resume a stopped job in the background",
            Builtin::History => "list previous commands",
            Builtin::Alias => "list or define aliases",
            Builtin::Unalias => "remove an alias",
        }
    }
}

#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("{0}: invalid job id")]
    BadJobId(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("{dir}: {source}")]
    Cd {
        dir: String,
        #[source]
        source: io::Error,
    },
    #[error("HOME not set")]
    NoHome,
    #[error(transparent)]
    Alias(#[from] AliasError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Whether the read-eval loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Runs `builtin` with `args` (the full word list, name included).
pub fn dispatch(builtin: Builtin, args: &[String], shell: &mut Shell) -> Result<Flow, BuiltinError> {
    match builtin {
        Builtin::Exit | Builtin::Quit => return Ok(Flow::Exit),
        Builtin::Cd => change_dir(args.get(1))?,
        Builtin::Pwd => println!("{}", env::current_dir()?.display()),
        Builtin::Help => print_help()?,
        Builtin::Jobs => shell.jobs.list(&mut io::stdout().lock())?,
        Builtin::Fg => {
            let job_id = job_id_arg(builtin, args)?;
            let outcome = shell
                .terminal
                .put_job_in_foreground(&mut shell.jobs, job_id, true)?;
            shell.last_status = outcome.status_code();
        }
        Builtin::Bg => {
            let job_id = job_id_arg(builtin, args)?;
            put_job_in_background(&mut shell.jobs, job_id, true)?;
        }
        Builtin::History => shell.history.list(&mut io::stdout().lock())?,
        Builtin::Alias => alias(&args[1..], shell)?,
        Builtin::Unalias => {
            let name = args.get(1).ok_or(BuiltinError::Usage(builtin.synopsis()))?;
            shell.aliases.remove(name)?;
        }
    }
    Ok(Flow::Continue)
}

/// Reads `<job_id>` or `%<job_id>` from the first argument.
fn job_id_arg(builtin: Builtin, args: &[String]) -> Result<JobId, BuiltinError> {
    let arg = args.get(1).ok_or(BuiltinError::Usage(builtin.synopsis()))?;
    let digits = arg.strip_prefix('%').unwrap_or(arg);
    digits
        .parse::<JobId>()
        .map_err(|_| BuiltinError::BadJobId(arg.clone()))
}

fn change_dir(dir: Option<&String>) -> Result<(), BuiltinError> {
    let target = match dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs_next::home_dir().ok_or(BuiltinError::NoHome)?,
    };
    env::set_current_dir(&target).map_err(|source| BuiltinError::Cd {
        dir: target.display().to_string(),
        source,
    })
}

fn print_help() -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "jobsh built-in commands:")?;
    for builtin in Builtin::ALL {
        writeln!(out, "  {:<22}{}", builtin.synopsis(), builtin.summary())?;
    }
    Ok(())
}

/// `alias` lists everything, `alias name` shows one definition and
/// `alias name=value ...` defines one. The words after `alias` are
/// rejoined so an unquoted value may contain spaces.
fn alias(args: &[String], shell: &mut Shell) -> Result<(), BuiltinError> {
    if args.is_empty() {
        let mut out = io::stdout().lock();
        for (name, value) in shell.aliases.iter() {
            writeln!(out, "{}", format_alias(name, value))?;
        }
        return Ok(());
    }
    let definition = args.join(" ");
    match definition.split_once('=') {
        Some((name, value)) => shell.aliases.define(name, value)?,
        None => {
            let value = shell
                .aliases
                .get(&definition)
                .ok_or_else(|| AliasError::NotFound(definition.clone()))?;
            println!("{}", format_alias(&definition, value));
        }
    }
    Ok(())
}
