/*
 * myint.rs - workload for jobsh's job-control tests
 *
 * usage: myint <secs>
 * Waits <secs> seconds, then interrupts itself with SIGINT.
 */

use nix::sys::signal::{raise, Signal};
use std::env;
use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    let secs = match env::args().nth(1).map(|arg| arg.parse::<f64>()) {
        Some(Ok(secs)) if secs >= 0.0 => secs,
        _ => {
            eprintln!("usage: myint <secs>");
            process::exit(2);
        }
    };

    thread::sleep(Duration::from_secs_f64(secs));
    if let Err(err) = raise(Signal::SIGINT) {
        eprintln!("myint: raise: {}", err);
        process::exit(1);
    }
    // Only reached when SIGINT is ignored or caught.
    println!("myint: survived SIGINT");
}
