//! Ownership of the controlling terminal and the foreground wait loop.
//!
//! A foreground session moves through three states:
//! - Idle: the shell's group owns the terminal.
//! - GrantedToJob: a [`ForegroundGrant`] is alive, the job's group owns the
//!   terminal, and the shell blocks in [`Terminal::put_job_in_foreground`].
//! - Reclaiming: the grant is dropped, the terminal goes back to the shell,
//!   and the saved modes are restored.

use crate::jobs::{JobError, JobId, JobStatus, JobTable, ProcessState};
use crate::signals;
use crate::utils::retry_eintr;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgrp, getpid, setpgid, tcgetpgrp, tcsetpgrp, Pid};
use std::os::unix::io::RawFd;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("couldn't put the shell in its own process group: {0}")]
    ProcessGroup(#[source] nix::Error),
    #[error("couldn't take control of the terminal: {0}")]
    Control(#[source] nix::Error),
    #[error("couldn't read terminal modes: {0}")]
    Modes(#[source] nix::Error),
    #[error(transparent)]
    Signals(#[from] nix::Error),
}

/// How a foreground session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exited(i32),
    Signaled(Signal),
    Stopped(Signal),
}

impl Outcome {
    /// Value for `$?`: exit code, or 128 + signal number.
    pub fn status_code(self) -> i32 {
        match self {
            Outcome::Exited(code) => code,
            Outcome::Signaled(sig) | Outcome::Stopped(sig) => 128 + sig as i32,
        }
    }

    fn from_process_state(state: ProcessState) -> Option<Self> {
        match state {
            ProcessState::Exited(code) => Some(Outcome::Exited(code)),
            ProcessState::Signaled(sig) => Some(Outcome::Signaled(sig)),
            ProcessState::Stopped(sig) => Some(Outcome::Stopped(sig)),
            ProcessState::Running => None,
        }
    }
}

/// Process-wide terminal state: the shell's process group, the terminal
/// descriptor and the modes captured once at startup.
#[derive(Debug)]
pub struct Terminal {
    fd: RawFd,
    shell_pgid: Pid,
    modes: Option<Termios>,
    interactive: bool,
}

impl Terminal {
    /// Script mode: no terminal to arbitrate. Grants and reclaims only
    /// update the foreground marker used for signal forwarding.
    pub fn detached(fd: RawFd) -> Self {
        Terminal {
            fd,
            shell_pgid: getpgrp(),
            modes: None,
            interactive: false,
        }
    }

    /// Makes the shell the owner of the terminal on `fd`.
    ///
    /// Waits (by stopping itself with SIGTTIN) until the shell's group is
    /// in the foreground, ignores the job-control signals, moves into its
    /// own process group, takes the terminal and saves its modes.
    pub fn acquire(fd: RawFd) -> Result<Self, TerminalError> {
        loop {
            let pgrp = getpgrp();
            let owner = retry_eintr(|| tcgetpgrp(fd)).map_err(TerminalError::Control)?;
            if owner == pgrp {
                break;
            }
            killpg(pgrp, Signal::SIGTTIN)?;
        }

        signals::ignore_job_control_signals()?;

        let shell_pgid = getpid();
        if getpgrp() != shell_pgid {
            setpgid(shell_pgid, shell_pgid).map_err(TerminalError::ProcessGroup)?;
        }
        retry_eintr(|| tcsetpgrp(fd, shell_pgid)).map_err(TerminalError::Control)?;
        let modes = tcgetattr(fd).map_err(TerminalError::Modes)?;
        debug!(%shell_pgid, fd, "acquired controlling terminal");

        Ok(Terminal {
            fd,
            shell_pgid,
            modes: Some(modes),
            interactive: true,
        })
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Lends the terminal to `pgid` until the returned grant is dropped.
    pub fn grant(&self, pgid: Pid) -> ForegroundGrant<'_> {
        if self.interactive {
            if let Err(e) = retry_eintr(|| tcsetpgrp(self.fd, pgid)) {
                warn!("tcsetpgrp: {}", e);
            }
        }
        signals::set_foreground(pgid);
        debug!(%pgid, "granted terminal");
        ForegroundGrant {
            terminal: self,
            pgid,
        }
    }

    fn reclaim(&self) {
        signals::clear_foreground();
        if !self.interactive {
            return;
        }
        if let Err(e) = retry_eintr(|| tcsetpgrp(self.fd, self.shell_pgid)) {
            warn!("tcsetpgrp: {}", e);
        }
        if let Some(modes) = &self.modes {
            if let Err(e) = retry_eintr(|| tcsetattr(self.fd, SetArg::TCSADRAIN, modes)) {
                warn!("tcsetattr: {}", e);
            }
        }
    }

    /// Runs job `job_id` in the foreground until it exits, dies or stops.
    ///
    /// With `cont`, a stopped job is sent SIGCONT after it has been given
    /// the terminal. A continuation alone never ends the session. On exit or
    /// signal death the notice is printed and the job removed; on stop the
    /// notice is printed and the job stays in the table.
    pub fn put_job_in_foreground(
        &self,
        jobs: &mut JobTable,
        job_id: JobId,
        cont: bool,
    ) -> Result<Outcome, JobError> {
        let (pid, pgid, was_stopped) = {
            let job = jobs
                .find_by_job_id(job_id)
                .ok_or(JobError::NoSuchJob(job_id))?;
            (job.pid, job.pgid, job.status == JobStatus::Stopped)
        };
        jobs.set_status(pid, JobStatus::Foreground)?;

        let grant = self.grant(pgid);
        if cont && was_stopped {
            if let Err(e) = killpg(pgid, Signal::SIGCONT) {
                warn!("kill (SIGCONT): {}", e);
            }
        }
        let outcome = wait_for_job(jobs, job_id, pgid);
        drop(grant);

        let finished = match jobs.find_by_job_id(job_id) {
            Some(job) => {
                eprintln!("{}", job.notice());
                job.status.is_finished()
            }
            None => false,
        };
        if finished {
            jobs.remove(job_id);
        }
        Ok(outcome)
    }

    /// Foreground wait for a launch the job table could not record: the
    /// processes still run, but there is no job to resume them with. A stop
    /// ends the wait like it would for a tracked job.
    pub fn wait_untracked(&self, pgid: Pid, pids: &[Pid]) -> Outcome {
        let _grant = self.grant(pgid);
        let mut outcome = Outcome::Exited(0);
        for &pid in pids {
            match retry_eintr(|| waitpid(pid, Some(WaitPidFlag::WUNTRACED))) {
                Ok(WaitStatus::Exited(_, code)) => outcome = Outcome::Exited(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => outcome = Outcome::Signaled(sig),
                Ok(WaitStatus::Stopped(_, sig)) => {
                    eprintln!("jobsh: process group {} stopped and cannot be resumed", pgid);
                    return Outcome::Stopped(sig);
                }
                Ok(_) => {}
                Err(e) => warn!("waitpid: {}", e),
            }
        }
        outcome
    }
}

/// Terminal ownership lent to one job's process group. Dropping it hands
/// the terminal back to the shell on every exit path.
pub struct ForegroundGrant<'a> {
    terminal: &'a Terminal,
    pgid: Pid,
}

impl Drop for ForegroundGrant<'_> {
    fn drop(&mut self) {
        debug!(pgid = %self.pgid, "reclaiming terminal");
        self.terminal.reclaim();
    }
}

/// Blocks on the job's process group, folding every state change into the
/// table, until the job finishes or stops.
fn wait_for_job(jobs: &mut JobTable, job_id: JobId, pgid: Pid) -> Outcome {
    let group = Pid::from_raw(-pgid.as_raw());
    let flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    loop {
        let status = match retry_eintr(|| waitpid(group, Some(flags))) {
            Ok(status) => status,
            Err(Errno::ECHILD) => return settle_vanished_job(jobs, job_id),
            Err(e) => {
                warn!("waitpid: {}", e);
                return settle_vanished_job(jobs, job_id);
            }
        };
        trace!(?status, job_id, "foreground wait");
        match jobs.apply_wait_status(status) {
            Some((id, JobStatus::Completed | JobStatus::Terminated)) if id == job_id => {
                return jobs
                    .find_by_job_id(job_id)
                    .and_then(|job| job.outcome())
                    .and_then(Outcome::from_process_state)
                    .unwrap_or(Outcome::Exited(0));
            }
            Some((id, JobStatus::Stopped)) if id == job_id => {
                let sig = match status {
                    WaitStatus::Stopped(_, sig) => sig,
                    _ => Signal::SIGTSTP,
                };
                return Outcome::Stopped(sig);
            }
            _ => continue,
        }
    }
}

/// The group has no children left to wait for even though the table still
/// thinks the job is alive, e.g. its members were reaped elsewhere. Mark it
/// finished so the session can end.
fn settle_vanished_job(jobs: &mut JobTable, job_id: JobId) -> Outcome {
    let Some(job) = jobs.find_by_job_id_mut(job_id) else {
        return Outcome::Exited(0);
    };
    if let Some(outcome) = job.outcome().and_then(Outcome::from_process_state) {
        job.status = match outcome {
            Outcome::Signaled(_) => JobStatus::Terminated,
            _ => JobStatus::Completed,
        };
        return outcome;
    }
    // Probe the leader: if it is gone, the job is over. Otherwise it keeps
    // running, but no longer in the foreground.
    job.status = if kill(job.pid, None).is_err() {
        JobStatus::Completed
    } else {
        JobStatus::Running
    };
    Outcome::Exited(0)
}

/// Moves a job to the background. A stopped job is continued first. The
/// shell keeps the terminal.
pub fn put_job_in_background(
    jobs: &mut JobTable,
    job_id: JobId,
    cont: bool,
) -> Result<(), JobError> {
    let job = jobs
        .find_by_job_id_mut(job_id)
        .ok_or(JobError::NoSuchJob(job_id))?;
    let was_stopped = job.status == JobStatus::Stopped;
    if cont && was_stopped {
        if let Err(e) = killpg(job.pgid, Signal::SIGCONT) {
            warn!("kill (SIGCONT): {}", e);
        }
    }
    job.status = JobStatus::Background;
    job.is_background = true;
    eprintln!(
        "[{}] {} {}",
        job.job_id,
        if cont && was_stopped { "Continuing" } else { "Running" },
        job.command
    );
    Ok(())
}
