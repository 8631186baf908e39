//! Command history with `!!`, `!n` and `!-n` event expansion.
//!
//! Entries are numbered from 1. Numbers stay attached to their entry when
//! old entries fall off the front, so `!n` always means the same line.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAX_HISTORY: usize = 1000;

const HISTORY_FILE: &str = ".jobsh_history";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("{0}: event not found")]
    EventNotFound(String),
}

#[derive(Debug, Default)]
pub struct History {
    entries: VecDeque<String>,
    /// Entries dropped off the front so far.
    dropped: usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the persisted history: `$HOME/.jobsh_history`.
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(HISTORY_FILE))
    }

    pub fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if self.entries.len() == MAX_HISTORY {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(line.to_string());
    }

    /// Entry number `n`, counting from 1.
    pub fn get(&self, n: usize) -> Option<&str> {
        n.checked_sub(self.dropped + 1)
            .and_then(|index| self.entries.get(index))
            .map(String::as_str)
    }

    /// The `back`-th most recent entry; 1 is the latest.
    fn recent(&self, back: usize) -> Option<&str> {
        self.entries
            .len()
            .checked_sub(back)
            .filter(|_| back > 0)
            .and_then(|index| self.entries.get(index))
            .map(String::as_str)
    }

    /// Numbered entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        let first = self.dropped + 1;
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, line)| (first + i, line.as_str()))
    }

    pub fn list(&self, out: &mut impl Write) -> io::Result<()> {
        for (n, line) in self.iter() {
            writeln!(out, "{:5}  {}", n, line)?;
        }
        Ok(())
    }

    /// Replaces history events in `line`. Returns `None` when the line has
    /// no events, so the caller knows whether to echo the result.
    pub fn expand(&self, line: &str) -> Result<Option<String>, HistoryError> {
        if !line.contains('!') {
            return Ok(None);
        }
        let mut out = String::with_capacity(line.len());
        let mut changed = false;
        let mut rest = line;
        while let Some(pos) = rest.find('!') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            let (event, len) = if after.starts_with('!') {
                (self.recent(1), 1)
            } else if let Some(digits) = after.strip_prefix('-') {
                let len = leading_digits(digits);
                if len == 0 {
                    out.push('!');
                    rest = after;
                    continue;
                }
                (digits[..len].parse().ok().and_then(|n| self.recent(n)), len + 1)
            } else {
                let len = leading_digits(after);
                if len == 0 {
                    out.push('!');
                    rest = after;
                    continue;
                }
                (after[..len].parse().ok().and_then(|n| self.get(n)), len)
            };

            let Some(text) = event else {
                return Err(HistoryError::EventNotFound(format!("!{}", &after[..len])));
            };
            out.push_str(text);
            changed = true;
            rest = &after[len..];
        }
        out.push_str(rest);
        Ok(changed.then_some(out))
    }

    /// Appends the lines of `path`. A missing file is not an error.
    pub fn load(&mut self, path: &Path) -> io::Result<()> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for line in contents.lines() {
            self.push(line);
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut file = io::BufWriter::new(fs::File::create(path)?);
        for line in &self.entries {
            writeln!(file, "{}", line)?;
        }
        file.flush()
    }
}

fn leading_digits(s: &str) -> usize {
    s.bytes().take_while(u8::is_ascii_digit).count()
}
