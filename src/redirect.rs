//! Redirection of a stage's standard streams to files.
//!
//! Runs inside the forked child, after the pipe wiring has been installed,
//! so an explicit redirection wins over the pipe.

use crate::utils::retry_eintr;
use nix::libc;
use nix::unistd::dup2;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `<`
    Input,
    /// `>`
    Truncate,
    /// `>>`
    Append,
}

impl RedirectKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "<" => Some(RedirectKind::Input),
            ">" => Some(RedirectKind::Truncate),
            ">>" => Some(RedirectKind::Append),
            _ => None,
        }
    }

    fn target_fd(self) -> RawFd {
        match self {
            RedirectKind::Input => libc::STDIN_FILENO,
            RedirectKind::Truncate | RedirectKind::Append => libc::STDOUT_FILENO,
        }
    }

    fn open(self, path: &str) -> io::Result<File> {
        let mut options = OpenOptions::new();
        match self {
            RedirectKind::Input => options.read(true),
            RedirectKind::Truncate => options.write(true).create(true).truncate(true),
            RedirectKind::Append => options.append(true).create(true),
        };
        options.mode(0o644).open(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect<'a> {
    pub kind: RedirectKind,
    pub target: &'a str,
}

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("syntax error near unexpected token `{0}'")]
    MissingOperand(String),
    #[error("{path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("dup2: {0}")]
    Dup(#[from] nix::Error),
}

pub fn is_operator(token: &str) -> bool {
    RedirectKind::from_token(token).is_some()
}

/// Walks the redirections of an argument vector left to right without
/// touching any descriptor. A missing operand is reported where it occurs.
pub struct Redirects<'a> {
    words: std::slice::Iter<'a, String>,
}

pub fn redirects(argv: &[String]) -> Redirects<'_> {
    Redirects { words: argv.iter() }
}

impl<'a> Iterator for Redirects<'a> {
    type Item = Result<Redirect<'a>, RedirectError>;

    fn next(&mut self) -> Option<Self::Item> {
        let kind = self.words.find_map(|word| RedirectKind::from_token(word))?;
        Some(match self.words.next() {
            Some(target) if !is_operator(target) => Ok(Redirect { kind, target }),
            Some(other) => Err(RedirectError::MissingOperand(other.clone())),
            None => Err(RedirectError::MissingOperand("newline".into())),
        })
    }
}

/// Opens the target and installs it over stdin or stdout.
fn apply(redirect: &Redirect<'_>) -> Result<(), RedirectError> {
    let file = redirect
        .kind
        .open(redirect.target)
        .map_err(|source| RedirectError::Open {
            path: redirect.target.to_string(),
            source,
        })?;
    let target = redirect.kind.target_fd();
    if file.as_raw_fd() == target {
        // The stream was closed and open() reused its slot; keep it.
        let _ = file.into_raw_fd();
        return Ok(());
    }
    retry_eintr(|| dup2(file.as_raw_fd(), target))?;
    Ok(())
}

/// Drops every operator/operand pair from `argv`, keeping the order of
/// all other words.
pub fn strip(argv: &mut Vec<String>) {
    let mut skip_operand = false;
    argv.retain(|token| {
        if skip_operand {
            skip_operand = false;
            return false;
        }
        if is_operator(token) {
            skip_operand = true;
            return false;
        }
        true
    });
}

/// Both passes: applies each redirection as it is found, then cleans
/// `argv`. A later redirection of the same stream replaces an earlier one,
/// and files opened before an error stay created. Returns how many files
/// were opened. Running it on an already-cleaned vector opens nothing and
/// leaves the vector as it is.
pub fn resolve(argv: &mut Vec<String>) -> Result<usize, RedirectError> {
    let mut opened = 0;
    for redirect in redirects(argv) {
        apply(&redirect?)?;
        opened += 1;
    }
    strip(argv);
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    fn plan(args: &[String]) -> Result<Vec<Redirect<'_>>, RedirectError> {
        redirects(args).collect()
    }

    #[test]
    fn test_plan_finds_each_operator() {
        let args = argv(&["sort", "<", "in.txt", "-r", ">", "out.txt", ">>", "log"]);
        let found = plan(&args).unwrap();
        assert_eq!(
            found,
            vec![
                Redirect { kind: RedirectKind::Input, target: "in.txt" },
                Redirect { kind: RedirectKind::Truncate, target: "out.txt" },
                Redirect { kind: RedirectKind::Append, target: "log" },
            ]
        );
    }

    #[test]
    fn test_plan_missing_operand() {
        let err = plan(&argv(&["echo", "hi", ">"])).unwrap_err();
        assert!(matches!(err, RedirectError::MissingOperand(ref t) if t == "newline"));
        assert_eq!(
            err.to_string(),
            "syntax error near unexpected token `newline'"
        );

        let err = plan(&argv(&["cat", "<", ">", "x"])).unwrap_err();
        assert!(matches!(err, RedirectError::MissingOperand(ref t) if t == ">"));
    }

    #[test]
    fn test_redirects_before_an_error_are_still_yielded() {
        let args = argv(&["echo", "hi", ">", "a", "<"]);
        let mut iter = redirects(&args);
        assert_eq!(
            iter.next().unwrap().unwrap(),
            Redirect { kind: RedirectKind::Truncate, target: "a" }
        );
        assert!(matches!(iter.next(), Some(Err(RedirectError::MissingOperand(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_strip_preserves_order() {
        let mut args = argv(&["grep", "<", "in", "-n", "pat", ">>", "out", "-i"]);
        strip(&mut args);
        assert_eq!(args, argv(&["grep", "-n", "pat", "-i"]));
    }

    #[test]
    fn test_strip_is_idempotent() {
        let mut args = argv(&["wc", "-l", "<", "file"]);
        strip(&mut args);
        let once = args.clone();
        assert!(plan(&args).unwrap().is_empty());
        strip(&mut args);
        assert_eq!(args, once);
    }

    #[test]
    fn test_resolve_on_clean_vector_is_a_no_op() {
        let mut args = argv(&["ls", "-l", "/tmp"]);
        assert_eq!(resolve(&mut args).unwrap(), 0);
        assert_eq!(args, argv(&["ls", "-l", "/tmp"]));
    }

    #[test]
    fn test_open_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let path = path.to_str().unwrap();

        std::fs::write(path, "old contents\n").unwrap();
        {
            use std::io::Write;
            let mut f = RedirectKind::Append.open(path).unwrap();
            f.write_all(b"more\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(path).unwrap(), "old contents\nmore\n");

        {
            use std::io::Write;
            let mut f = RedirectKind::Truncate.open(path).unwrap();
            f.write_all(b"new\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(path).unwrap(), "new\n");

        let err = RedirectKind::Input.open("/nonexistent/jobsh/input").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
