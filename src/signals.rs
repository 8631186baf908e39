//! The shell's own signal handling.
//!
//! Only async-signal-safe work happens inside a handler: SIGCHLD raises a
//! flag, SIGINT and SIGTSTP read the foreground process group from an
//! atomic and `killpg` it. Reaping and every job-table update happen later,
//! on the main loop, in [`reap_children`].

use crate::jobs::{JobId, JobStatus, JobTable};
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use signal_hook::consts::signal::*;
use signal_hook::{flag, low_level};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Process group currently holding the foreground, or 0 for the shell.
static FOREGROUND_PGID: AtomicI32 = AtomicI32::new(0);

/// Raised by SIGCHLD, drained by [`take_child_events`].
static CHILD_EVENTS: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Signals a child must see with their default disposition.
const JOB_CONTROL_SIGNALS: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGCHLD,
];

/// Installs the shell's handlers:
/// - SIGCHLD: records that some child changed state.
/// - SIGINT (Ctrl-C): forwarded to the foreground job's process group.
///   Without one, a script-mode shell dies as usual while an interactive
///   shell ignores it.
/// - SIGTSTP (Ctrl-Z): forwarded to the foreground job; never stops the
///   shell itself.
pub fn install_signal_handlers(interactive: bool) -> io::Result<()> {
    flag::register(SIGCHLD, Arc::clone(&CHILD_EVENTS))?;
    // SAFETY: both closures only load an atomic and call kill(2), or
    // emulate_default_handler, all of which are async-signal-safe.
    unsafe {
        low_level::register(SIGINT, move || {
            if !forward_to_foreground(Signal::SIGINT) && !interactive {
                let _ = low_level::emulate_default_handler(SIGINT);
            }
        })?;
        low_level::register(SIGTSTP, || {
            forward_to_foreground(Signal::SIGTSTP);
        })?;
    }
    Ok(())
}

fn forward_to_foreground(sig: Signal) -> bool {
    let Some(pgid) = foreground_pgid() else {
        return false;
    };
    let _ = killpg(pgid, sig);
    true
}

/// Makes an interactive shell immune to the signals the terminal sends to
/// background groups and to Ctrl-\.
pub fn ignore_job_control_signals() -> nix::Result<()> {
    for sig in [Signal::SIGQUIT, Signal::SIGTTIN, Signal::SIGTTOU] {
        // SAFETY: SIG_IGN installs no handler code.
        unsafe { signal::signal(sig, SigHandler::SigIgn)? };
    }
    Ok(())
}

/// Restores default dispositions in a freshly forked child so it does not
/// inherit the shell's ignores and handlers.
pub fn reset_child_signals() {
    for sig in JOB_CONTROL_SIGNALS {
        // SAFETY: SIG_DFL installs no handler code; we are single-threaded
        // after fork.
        unsafe {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
    }
}

pub fn set_foreground(pgid: Pid) {
    FOREGROUND_PGID.store(pgid.as_raw(), Ordering::SeqCst);
}

pub fn clear_foreground() {
    FOREGROUND_PGID.store(0, Ordering::SeqCst);
}

pub fn foreground_pgid() -> Option<Pid> {
    match FOREGROUND_PGID.load(Ordering::SeqCst) {
        raw if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

/// Returns whether SIGCHLD arrived since the last call, and resets the flag.
pub fn take_child_events() -> bool {
    CHILD_EVENTS.swap(false, Ordering::SeqCst)
}

/// Reaps every child with a pending state change without blocking, and
/// folds each status into the job table.
///
/// Returns the jobs whose status changed. Children the table does not know
/// about are reaped and otherwise ignored.
pub fn reap_children(jobs: &mut JobTable) -> Vec<(JobId, JobStatus)> {
    let mut changed = Vec::new();
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    loop {
        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                trace!(?status, "reaped child");
                if let Some(change) = jobs.apply_wait_status(status) {
                    changed.push(change);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!("waitpid: {}", e);
                break;
            }
        }
    }
    changed
}
