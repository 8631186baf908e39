use crate::jobs::{JobError, JobId, JobStatus, JobTable};
use crate::pipeline::{PipelineWiring, StageIo};
use crate::redirect;
use crate::signals;
use crate::terminal::{Outcome, Terminal};
use crate::utils::{child_exit, retry_eintr};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{execv, fork, getpid, setpgid, tcsetpgrp, ForkResult, Pid};
use std::env;
use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("pipe: {0}")]
    Pipe(#[source] nix::Error),
    #[error("fork: {0}")]
    Fork(#[source] nix::Error),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Per-launch settings every forked stage needs.
struct ChildSetup<'a> {
    /// Group to join; `None` makes the stage the group leader.
    pgid: Option<Pid>,
    /// Terminal to hand to the group before exec, when running in the
    /// foreground of an interactive shell.
    terminal: Option<RawFd>,
    self_exe: Option<&'a Path>,
}

/// Launches `stages` as one job: one forked process per stage, all in the
/// process group of the first, connected by pipes.
///
/// The job is entered in the table right after the leader is forked, before
/// anything waits on it. A foreground job is then handed to the terminal
/// controller and its outcome returned; a background job returns `None`
/// straight away.
pub fn execute_command(
    jobs: &mut JobTable,
    terminal: &Terminal,
    stages: &[Vec<String>],
    background: bool,
    cmdline: &str,
    self_exe: Option<&Path>,
) -> Result<Option<Outcome>, LaunchError> {
    let grant_terminal = !background && terminal.is_interactive();
    let mut wiring = PipelineWiring::new(stages.len());
    let mut pgid: Option<Pid> = None;
    let mut job_id: Option<JobId> = None;
    let mut pids: Vec<Pid> = Vec::with_capacity(stages.len());

    // Anything still buffered would otherwise be written by every child too.
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    for (index, argv) in stages.iter().enumerate() {
        let stage_io = match wiring.next_stage() {
            Ok(stage_io) => stage_io,
            Err(e) => {
                abandon(jobs, pgid, job_id, &pids);
                return Err(LaunchError::Pipe(e));
            }
        };

        // SAFETY: the shell is single-threaded, so the child may allocate
        // and use the usual runtime until exec.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // The read end waiting for the next stage is not ours.
                drop(wiring);
                let setup = ChildSetup {
                    pgid,
                    terminal: grant_terminal.then(|| terminal.fd()),
                    self_exe,
                };
                run_child(argv, stage_io, &setup);
            }
            Ok(ForkResult::Parent { child }) => {
                let group = *pgid.get_or_insert(child);
                // The child does the same; whichever runs first wins, and a
                // child that already exec'd makes this fail harmlessly.
                let _ = setpgid(child, group);
                drop(stage_io);
                pids.push(child);
                debug!(stage = index, pid = %child, pgid = %group, "forked pipeline stage");

                if index == 0 {
                    job_id = register_job(jobs, child, cmdline, background);
                } else if let Some(id) = job_id {
                    jobs.add_member(id, child)?;
                }
            }
            Err(e) => {
                drop(stage_io);
                abandon(jobs, pgid, job_id, &pids);
                return Err(LaunchError::Fork(e));
            }
        }
    }

    let Some(pgid) = pgid else {
        return Ok(None);
    };
    match (job_id, background) {
        (Some(id), false) => Ok(Some(terminal.put_job_in_foreground(jobs, id, false)?)),
        (None, false) => {
            let outcome = terminal.wait_untracked(pgid, &pids);
            if let Outcome::Stopped(_) = outcome {
                jobs.strand(pgid);
            }
            Ok(Some(outcome))
        }
        (_, true) => Ok(None),
    }
}

fn register_job(jobs: &mut JobTable, leader: Pid, cmdline: &str, background: bool) -> Option<JobId> {
    let status = if background {
        JobStatus::Background
    } else {
        JobStatus::Foreground
    };
    match jobs.add(leader, leader, cmdline, status, background) {
        Ok(id) => Some(id),
        Err(e) => {
            eprintln!("jobsh: {}", e);
            None
        }
    }
}

/// Tears down a partially launched pipeline after a pipe or fork failure.
fn abandon(jobs: &mut JobTable, pgid: Option<Pid>, job_id: Option<JobId>, pids: &[Pid]) {
    if let Some(group) = pgid {
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            warn!("kill (SIGKILL): {}", e);
        }
    }
    for &pid in pids {
        let _ = retry_eintr(|| waitpid(pid, None));
    }
    if let Some(id) = job_id {
        jobs.remove(id);
    }
}

/// Everything a stage does between fork and exec. Never returns: the
/// process either becomes the target program or exits.
fn run_child(argv: &[String], stage_io: StageIo, setup: &ChildSetup<'_>) -> ! {
    let group = setup.pgid.unwrap_or_else(|| Pid::from_raw(0));
    if let Err(e) = setpgid(Pid::from_raw(0), group) {
        child_exit(&format!("setpgid: {}\n", e.desc()), 1);
    }
    if let Some(fd) = setup.terminal {
        // SIGTTOU is still ignored here, so this works from a background group.
        let _ = tcsetpgrp(fd, setup.pgid.unwrap_or_else(getpid));
    }
    signals::reset_child_signals();

    if let Err(e) = stage_io.install() {
        child_exit(&format!("dup2: {}\n", e.desc()), 1);
    }

    let mut argv = argv.to_vec();
    if let Err(e) = redirect::resolve(&mut argv) {
        child_exit(&format!("jobsh: {}\n", e), 1);
    }
    if argv.is_empty() {
        // A bare redirection such as `> file` only creates the file.
        child_exit("", 0);
    }
    exec_program(&argv, setup.self_exe)
}

fn exec_program(argv: &[String], self_exe: Option<&Path>) -> ! {
    let name = argv[0].as_str();
    let Some(path) = resolve_program(name) else {
        child_exit(&format!("{}: command not found\n", name), 127);
    };
    let Ok(c_args) = to_cstrings(argv.iter().map(|arg| arg.as_bytes())) else {
        child_exit(&format!("{}: argument contains a NUL byte\n", name), 126);
    };
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        child_exit(&format!("{}: argument contains a NUL byte\n", name), 126);
    };

    let err = match execv(&c_path, &c_args) {
        Err(e) => e,
        Ok(never) => match never {},
    };
    if err == Errno::ENOEXEC {
        if let Some(shell) = self_exe {
            run_as_script(shell, &path, &argv[1..]);
        }
    }
    let code = if err == Errno::ENOENT { 127 } else { 126 };
    child_exit(&format!("{}: {}\n", name, err.desc()), code)
}

/// Re-executes the shell itself with `script` as its script argument.
/// Returns only if that exec fails too.
fn run_as_script(shell: &Path, script: &Path, args: &[String]) {
    let words = [shell.as_os_str().as_bytes(), script.as_os_str().as_bytes()]
        .into_iter()
        .chain(args.iter().map(|arg| arg.as_bytes()));
    if let (Ok(c_args), Ok(c_shell)) = (
        to_cstrings(words),
        CString::new(shell.as_os_str().as_bytes()),
    ) {
        let _ = execv(&c_shell, &c_args);
    }
}

fn to_cstrings<'a>(words: impl Iterator<Item = &'a [u8]>) -> Result<Vec<CString>, std::ffi::NulError> {
    words.map(CString::new).collect()
}

/// Finds the file `name` refers to: itself when it contains a slash,
/// otherwise the first executable regular file of that name on `$PATH`.
pub fn resolve_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        return Some(PathBuf::from(name));
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_resolve_program_with_slash_is_taken_verbatim() {
        assert_eq!(
            resolve_program("./run.sh"),
            Some(PathBuf::from("./run.sh"))
        );
    }

    #[test]
    fn test_resolve_program_searches_path() {
        let resolved = resolve_program("sh").expect("sh should be on PATH");
        assert!(is_executable(&resolved));
        assert_eq!(resolve_program("definitely-not-a-real-program-jobsh"), None);
    }

    #[test]
    fn test_is_executable_requires_exec_bit() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tool");
        fs::write(&script, "echo hi\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!is_executable(&script));
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&script));
        assert!(!is_executable(dir.path()));
    }

    #[test]
    fn test_to_cstrings_rejects_nul() {
        let ok = to_cstrings(["ls", "-l"].into_iter().map(str::as_bytes)).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(to_cstrings(["a\0b"].into_iter().map(str::as_bytes)).is_err());
    }
}
