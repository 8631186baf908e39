//! Where command lines come from: a line editor on a terminal, or any
//! buffered reader (script file, piped stdin).

use crate::builtins::Builtin;
use rustyline::completion::{Completer, FilenameCompleter, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use std::io::{self, BufRead};
use tracing::warn;

/// Completes built-in names in command position and file names elsewhere.
pub struct ShellHelper {
    files: FilenameCompleter,
}

impl ShellHelper {
    pub fn new() -> Self {
        ShellHelper {
            files: FilenameCompleter::new(),
        }
    }
}

impl Completer for ShellHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let start = line[..pos]
            .rfind(char::is_whitespace)
            .map(|i| i + 1)
            .unwrap_or(0);
        let word = &line[start..pos];
        let command_position = line[..start].trim().is_empty() && !word.contains('/');
        if command_position {
            let names: Vec<Pair> = builtin_candidates(word)
                .map(|name| Pair {
                    display: name.to_string(),
                    replacement: name.to_string(),
                })
                .collect();
            if !names.is_empty() {
                return Ok((start, names));
            }
        }
        self.files.complete(line, pos, ctx)
    }
}

fn builtin_candidates(prefix: &str) -> impl Iterator<Item = &'static str> + '_ {
    Builtin::ALL
        .into_iter()
        .map(Builtin::name)
        .filter(move |name| name.starts_with(prefix))
}

impl Hinter for ShellHelper {
    type Hint = String;
}

impl Highlighter for ShellHelper {}

impl Validator for ShellHelper {}

impl Helper for ShellHelper {}

pub enum LineSource {
    Editor(Box<Editor<ShellHelper, DefaultHistory>>),
    Reader(Box<dyn BufRead>),
}

impl LineSource {
    pub fn editor() -> rustyline::Result<Self> {
        let mut editor = Editor::<ShellHelper, DefaultHistory>::new()?;
        editor.set_helper(Some(ShellHelper::new()));
        Ok(LineSource::Editor(Box::new(editor)))
    }

    pub fn reader(reader: impl BufRead + 'static) -> Self {
        LineSource::Reader(Box::new(reader))
    }

    pub fn is_editor(&self) -> bool {
        matches!(self, LineSource::Editor(_))
    }

    /// Adds lines to the editor's recall list (arrow keys). Readers keep
    /// no recall list.
    pub fn remember<'a>(&mut self, lines: impl Iterator<Item = &'a str>) {
        if let LineSource::Editor(editor) = self {
            for line in lines {
                if let Err(e) = editor.add_history_entry(line) {
                    warn!("couldn't add history entry: {}", e);
                }
            }
        }
    }

    /// Reads one line without its terminator. `Ok(None)` is end of input.
    /// Ctrl-C at the editor prompt yields an empty line.
    pub fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        match self {
            LineSource::Editor(editor) => match editor.readline(prompt) {
                Ok(line) => Ok(Some(line)),
                Err(ReadlineError::Interrupted) => Ok(Some(String::new())),
                Err(ReadlineError::Eof) => Ok(None),
                Err(ReadlineError::Io(e)) => Err(e),
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
            },
            LineSource::Reader(reader) => {
                if !prompt.is_empty() {
                    print!("{}", prompt);
                    io::Write::flush(&mut io::stdout())?;
                }
                // Read bytes: a line that is not UTF-8 still runs, with the
                // bad sequences replaced.
                let mut bytes = Vec::new();
                if reader.read_until(b'\n', &mut bytes)? == 0 {
                    return Ok(None);
                }
                while let Some(b'\n' | b'\r') = bytes.last().copied() {
                    bytes.pop();
                }
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_builtin_candidates() {
        let found: Vec<_> = builtin_candidates("h").collect();
        assert_eq!(found, vec!["help", "history"]);
        assert_eq!(builtin_candidates("").count(), Builtin::ALL.len());
        assert_eq!(builtin_candidates("zz").count(), 0);
    }

    #[test]
    fn test_reader_strips_terminators() {
        let mut source = LineSource::reader(Cursor::new("ls -l\r\necho hi\nlast"));
        assert!(!source.is_editor());
        assert_eq!(source.read_line("").unwrap().as_deref(), Some("ls -l"));
        assert_eq!(source.read_line("").unwrap().as_deref(), Some("echo hi"));
        assert_eq!(source.read_line("").unwrap().as_deref(), Some("last"));
        assert_eq!(source.read_line("").unwrap(), None);
    }

    #[test]
    fn test_reader_survives_invalid_utf8() {
        let input: &[u8] = b"echo one\necho \xff\xfe\necho three\n";
        let mut source = LineSource::reader(Cursor::new(input.to_vec()));
        assert_eq!(source.read_line("").unwrap().as_deref(), Some("echo one"));
        assert_eq!(
            source.read_line("").unwrap().as_deref(),
            Some("echo \u{fffd}\u{fffd}")
        );
        assert_eq!(source.read_line("").unwrap().as_deref(), Some("echo three"));
        assert_eq!(source.read_line("").unwrap(), None);
    }
}
