/*
 * myspin.rs - workload for jobsh's job-control tests
 *
 * usage: myspin <secs>
 * Busy-waits in 100 ms naps for <secs> seconds (fractions allowed), then exits 0.
 */

use std::env;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

fn main() {
    let secs = match env::args().nth(1).map(|arg| arg.parse::<f64>()) {
        Some(Ok(secs)) if secs >= 0.0 => secs,
        _ => {
            eprintln!("usage: myspin <secs>");
            process::exit(2);
        }
    };

    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }
}
