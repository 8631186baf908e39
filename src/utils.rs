use nix::errno::Errno;
use nix::libc;
use nix::unistd;
use std::process;

pub fn print_usage() -> ! {
    println!("Usage: jobsh [-hvp] [script]");
    println!("   -h   Print this help message");
    println!("   -v   Enable verbose mode");
    println!("   -p   Do not print a command prompt");
    process::exit(1);
}

/// Re-issues a system call for as long as it fails with `EINTR`.
///
/// The shell's own SIGCHLD/SIGINT/SIGTSTP handlers can interrupt any
/// blocking call, so every wait, dup and terminal call goes through here.
pub fn retry_eintr<T, F>(mut f: F) -> nix::Result<T>
where
    F: FnMut() -> nix::Result<T>,
{
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

/// Leaves a forked child immediately with `code`, after writing `msg` to fd 2.
///
/// Uses `_exit` so the parent's buffered stdio and destructors never run a
/// second time in the child.
pub fn child_exit(msg: &str, code: i32) -> ! {
    if !msg.is_empty() {
        let _ = unistd::write(libc::STDERR_FILENO, msg.as_bytes());
    }
    // SAFETY: _exit takes no pointers and never returns.
    unsafe { libc::_exit(code) }
}

/// Shortens `s` to at most `max` bytes without splitting a character.
pub fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
