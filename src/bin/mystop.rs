/*
 * mystop.rs - workload for jobsh's job-control tests
 *
 * usage: mystop <secs>
 * Waits <secs> seconds, stops its whole process group with SIGTSTP and,
 * once continued, prints "mystop: resumed" and exits 0.
 */

use nix::sys::signal::{killpg, Signal};
use nix::unistd::getpgrp;
use std::env;
use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    let secs = match env::args().nth(1).map(|arg| arg.parse::<f64>()) {
        Some(Ok(secs)) if secs >= 0.0 => secs,
        _ => {
            eprintln!("usage: mystop <secs>");
            process::exit(2);
        }
    };

    thread::sleep(Duration::from_secs_f64(secs));
    if let Err(err) = killpg(getpgrp(), Signal::SIGTSTP) {
        eprintln!("mystop: kill (tstp): {}", err);
        process::exit(1);
    }
    println!("mystop: resumed");
}
