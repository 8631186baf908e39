/*
 * mysplit.rs - workload for jobsh's job-control tests
 *
 * usage: mysplit <secs>
 * Forks a child that sleeps <secs> seconds; the parent waits for it and
 * exits with the child's status. Both stay in the caller's process group,
 * so a signal sent to the job reaches the grandchild too.
 */

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::env;
use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    let secs = match env::args().nth(1).map(|arg| arg.parse::<f64>()) {
        Some(Ok(secs)) if secs >= 0.0 => secs,
        _ => {
            eprintln!("usage: mysplit <secs>");
            process::exit(2);
        }
    };

    // SAFETY: no other threads exist yet.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            thread::sleep(Duration::from_secs_f64(secs));
            process::exit(0);
        }
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => process::exit(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => process::exit(128 + sig as i32),
            Ok(_) => process::exit(0),
            Err(err) => {
                eprintln!("mysplit: waitpid: {}", err);
                process::exit(1);
            }
        },
        Err(err) => {
            eprintln!("mysplit: fork: {}", err);
            process::exit(1);
        }
    }
}
