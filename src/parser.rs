use thiserror::Error;

pub const MAX_LINE: usize = 1024;
pub const MAX_ARGS: usize = 128;
pub const MAX_STAGES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("input line too long (limit is {MAX_LINE} bytes)")]
    LineTooLong,
    #[error("syntax error near unexpected token `{0}'")]
    UnexpectedToken(String),
    #[error("too many arguments")]
    TooManyArgs,
    #[error("too many commands in pipeline")]
    TooManyStages,
}

/// A tokenized command line: one argument vector per pipeline stage.
///
/// Redirection operators and their operands stay inside the stage's
/// vector; the redirection resolver strips them after the fork.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CommandLine {
    pub stages: Vec<Vec<String>>,
    /// Set when the line ended with `&`.
    pub background: bool,
}

impl CommandLine {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn is_pipeline(&self) -> bool {
        self.stages.len() > 1
    }
}

/// Parses the input command line into pipeline stages plus the background flag.
///
/// - Words are whitespace-delimited; there is no quoting or escaping.
/// - `|` separates stages, and no stage may be empty.
/// - A trailing `&` (with or without surrounding whitespace) marks the
///   line as a background job; `&` anywhere else is a syntax error.
/// - `<`, `>` and `>>` are split into their own tokens even when written
///   against a word (`sort>out`).
/// - A word starting with `#` comments out the rest of the line.
pub fn parse_command_line(cmdline: &str) -> Result<CommandLine, ParseError> {
    if cmdline.len() > MAX_LINE {
        return Err(ParseError::LineTooLong);
    }

    let tokens = tokenize(cmdline);
    let mut line = CommandLine::default();
    let mut current: Vec<String> = Vec::new();
    let mut iter = tokens.into_iter().peekable();

    while let Some(token) = iter.next() {
        match token.as_str() {
            "|" => {
                if current.is_empty() {
                    return Err(ParseError::UnexpectedToken(token));
                }
                if line.stages.len() + 1 >= MAX_STAGES {
                    return Err(ParseError::TooManyStages);
                }
                line.stages.push(std::mem::take(&mut current));
            }
            "&" => {
                if iter.peek().is_some() || current.is_empty() {
                    return Err(ParseError::UnexpectedToken(token));
                }
                line.background = true;
            }
            _ => {
                if current.len() >= MAX_ARGS - 1 {
                    return Err(ParseError::TooManyArgs);
                }
                current.push(token);
            }
        }
    }

    if current.is_empty() {
        if !line.stages.is_empty() {
            return Err(ParseError::UnexpectedToken("newline".into()));
        }
    } else {
        line.stages.push(current);
    }
    Ok(line)
}

/// Splits the input command line into a vector of tokens, treating `<`,
/// `>`, `>>`, `|` and `&` as tokens of their own.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '#' {
            break;
        }
        if ch == '>' {
            chars.next();
            if chars.peek() == Some(&'>') {
                chars.next();
                tokens.push(">>".to_string());
            } else {
                tokens.push(">".to_string());
            }
        } else if is_special(ch) {
            tokens.push(ch.to_string());
            chars.next();
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || is_special(c) {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    tokens
}

fn is_special(ch: char) -> bool {
    matches!(ch, '<' | '>' | '|' | '&')
}
