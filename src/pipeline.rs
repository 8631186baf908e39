//! Inter-stage pipes for an N-stage pipeline.
//!
//! Every pipe end is an `OwnedFd`, so whichever process ends up holding
//! an end it does not need closes it simply by dropping it.

use crate::utils::retry_eintr;
use nix::fcntl::OFlag;
use nix::libc;
use nix::unistd::{dup2, pipe2};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

/// Both ends of one pipe between adjacent stages.
#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    /// Creates a close-on-exec pipe. Only the copies installed onto fd 0/1
    /// survive an `exec`.
    pub fn new() -> nix::Result<Pipe> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
        unsafe {
            Ok(Pipe {
                read: OwnedFd::from_raw_fd(read),
                write: OwnedFd::from_raw_fd(write),
            })
        }
    }
}

/// The pipe ends one stage reads from and writes to. `None` means the stage
/// keeps the shell's own stream.
#[derive(Debug, Default)]
pub struct StageIo {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
}

impl StageIo {
    /// Duplicates the pipe ends onto stdin/stdout. The originals are closed
    /// when `self` is dropped on return.
    pub fn install(self) -> nix::Result<()> {
        if let Some(fd) = &self.stdin {
            retry_eintr(|| dup2(fd.as_raw_fd(), libc::STDIN_FILENO))?;
        }
        if let Some(fd) = &self.stdout {
            retry_eintr(|| dup2(fd.as_raw_fd(), libc::STDOUT_FILENO))?;
        }
        Ok(())
    }
}

/// Hands out the wiring of a pipeline one stage at a time, in stage order.
///
/// The pipe between stage `i` and `i + 1` is created when stage `i` asks
/// for its I/O, i.e. before either side is forked. The read end waits in
/// `pending_read` until stage `i + 1` takes it.
#[derive(Debug)]
pub struct PipelineWiring {
    stages: usize,
    next: usize,
    pending_read: Option<OwnedFd>,
}

impl PipelineWiring {
    pub fn new(stages: usize) -> Self {
        PipelineWiring {
            stages,
            next: 0,
            pending_read: None,
        }
    }

    pub fn next_stage(&mut self) -> nix::Result<StageIo> {
        let index = self.next;
        debug_assert!(index < self.stages, "pipeline has only {} stages", self.stages);
        self.next += 1;

        let stdin = self.pending_read.take();
        let stdout = if index + 1 < self.stages {
            let pipe = Pipe::new()?;
            self.pending_read = Some(pipe.read);
            Some(pipe.write)
        } else {
            None
        };
        Ok(StageIo { stdin, stdout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn test_single_stage_uses_shell_streams() {
        let mut wiring = PipelineWiring::new(1);
        let io = wiring.next_stage().unwrap();
        assert!(io.stdin.is_none());
        assert!(io.stdout.is_none());
        assert!(wiring.pending_read.is_none());
    }

    #[test]
    fn test_three_stage_wiring_shape() {
        let mut wiring = PipelineWiring::new(3);

        let first = wiring.next_stage().unwrap();
        assert!(first.stdin.is_none());
        assert!(first.stdout.is_some());
        assert!(wiring.pending_read.is_some());

        let middle = wiring.next_stage().unwrap();
        assert!(middle.stdin.is_some());
        assert!(middle.stdout.is_some());

        let last = wiring.next_stage().unwrap();
        assert!(last.stdin.is_some());
        assert!(last.stdout.is_none());
        assert!(wiring.pending_read.is_none());
    }

    #[test]
    fn test_adjacent_stages_share_a_pipe() {
        let mut wiring = PipelineWiring::new(2);
        let producer = wiring.next_stage().unwrap();
        let consumer = wiring.next_stage().unwrap();

        let mut writer = File::from(producer.stdout.unwrap());
        writer.write_all(b"b\na\n").unwrap();
        // Closing the only write end is what lets the reader see EOF.
        drop(writer);

        let mut reader = File::from(consumer.stdin.unwrap());
        let mut received = String::new();
        reader.read_to_string(&mut received).unwrap();
        assert_eq!(received, "b\na\n");
    }

    #[test]
    fn test_pipe_ends_are_close_on_exec() {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let pipe = Pipe::new().unwrap();
        for fd in [pipe.read.as_raw_fd(), pipe.write.as_raw_fd()] {
            let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }
}
