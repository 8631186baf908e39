//! Word expansion applied to each pipeline stage before dispatch: alias
//! substitution on the first word, then `~`, `$NAME`, `${NAME}` and `$?`
//! on every word.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

pub const MAX_ALIASES: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AliasError {
    #[error("too many aliases (limit is {MAX_ALIASES})")]
    TableFull,
    #[error("{0}: invalid alias name")]
    InvalidName(String),
    #[error("{0}: not found")]
    NotFound(String),
}

/// Alias definitions, in the order they were first defined.
#[derive(Debug, Default)]
pub struct AliasTable {
    entries: Vec<(String, String)>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name` or replaces its value. Surrounding quotes on `value`
    /// are dropped.
    pub fn define(&mut self, name: &str, value: &str) -> Result<(), AliasError> {
        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '=' || c == '/') {
            return Err(AliasError::InvalidName(name.to_string()));
        }
        let value = strip_quotes(value).to_string();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
            return Ok(());
        }
        if self.entries.len() >= MAX_ALIASES {
            return Err(AliasError::TableFull);
        }
        self.entries.push((name.to_string(), value));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), AliasError> {
        let index = self
            .entries
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| AliasError::NotFound(name.to_string()))?;
        self.entries.remove(index);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Formats one definition the way `alias` lists it.
pub fn format_alias(name: &str, value: &str) -> String {
    format!("alias {}='{}'", name, value)
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Replaces the first word with its alias value, split on whitespace.
/// Only one level is expanded, so `alias ls='ls -F'` does not loop.
pub fn expand_alias(words: Vec<String>, aliases: &AliasTable) -> Vec<String> {
    let Some(value) = words.first().and_then(|first| aliases.get(first)) else {
        return words;
    };
    let mut expanded: Vec<String> = value.split_whitespace().map(str::to_string).collect();
    expanded.extend(words.into_iter().skip(1));
    expanded
}

/// Expands one stage: alias first, then tilde and variables per word.
/// Words that expand to nothing are dropped.
pub fn expand_words(words: Vec<String>, aliases: &AliasTable, last_status: i32) -> Vec<String> {
    let home = dirs_next::home_dir();
    expand_alias(words, aliases)
        .into_iter()
        .map(|word| {
            let word = expand_tilde(&word, home.as_ref());
            expand_variables(&word, last_status)
        })
        .filter(|word| !word.is_empty())
        .collect()
}

fn expand_tilde(word: &str, home: Option<&PathBuf>) -> String {
    let Some(home) = home else {
        return word.to_string();
    };
    let home = home.to_string_lossy();
    if word == "~" {
        home.into_owned()
    } else if let Some(rest) = word.strip_prefix("~/") {
        format!("{}/{}", home.trim_end_matches('/'), rest)
    } else {
        word.to_string()
    }
}

/// Substitutes `$?`, `$NAME` and `${NAME}` in `word`. Unset names give an
/// empty string; a `$` that starts no reference is kept as is.
pub fn expand_variables(word: &str, last_status: i32) -> String {
    let mut out = String::with_capacity(word.len());
    let mut rest = word;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('?') {
            out.push_str(&last_status.to_string());
            rest = tail;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_name(&braced[..end]) => {
                    out.push_str(&lookup(&braced[..end]));
                    rest = &braced[end + 1..];
                }
                _ => {
                    out.push('$');
                    rest = after;
                }
            }
        } else {
            let len = name_len(after);
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(&lookup(&after[..len]));
            }
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    out
}

fn lookup(name: &str) -> String {
    env::var(name).unwrap_or_default()
}

fn name_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return 0,
    }
    chars
        .find(|&(_, c)| !(c == '_' || c.is_ascii_alphanumeric()))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && name_len(s) == s.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_alias_define_replace_remove() {
        let mut aliases = AliasTable::new();
        aliases.define("ll", "'ls -l'").unwrap();
        assert_eq!(aliases.get("ll"), Some("ls -l"));

        aliases.define("ll", "\"ls -la\"").unwrap();
        assert_eq!(aliases.get("ll"), Some("ls -la"));
        assert_eq!(aliases.iter().count(), 1);

        aliases.remove("ll").unwrap();
        assert_eq!(aliases.get("ll"), None);
        assert_eq!(
            aliases.remove("ll"),
            Err(AliasError::NotFound("ll".to_string()))
        );
    }

    #[test]
    fn test_alias_table_is_bounded() {
        let mut aliases = AliasTable::new();
        for i in 0..MAX_ALIASES {
            aliases.define(&format!("a{}", i), "true").unwrap();
        }
        assert_eq!(aliases.define("one_more", "true"), Err(AliasError::TableFull));
        // Redefining an existing name still works when full.
        aliases.define("a0", "false").unwrap();
    }

    #[test]
    fn test_alias_rejects_bad_names() {
        let mut aliases = AliasTable::new();
        assert_eq!(
            aliases.define("", "x"),
            Err(AliasError::InvalidName(String::new()))
        );
        assert!(aliases.define("a/b", "x").is_err());
    }

    #[test]
    fn test_expand_alias_first_word_only() {
        let mut aliases = AliasTable::new();
        aliases.define("ll", "ls -l").unwrap();
        aliases.define("ls", "ls -F").unwrap();

        assert_eq!(expand_alias(words("ll /tmp"), &aliases), words("ls -l /tmp"));
        assert_eq!(expand_alias(words("ls"), &aliases), words("ls -F"));
        assert_eq!(expand_alias(words("echo ll"), &aliases), words("echo ll"));
    }

    #[test]
    fn test_format_alias() {
        assert_eq!(format_alias("ll", "ls -l"), "alias ll='ls -l'");
    }

    #[test]
    fn test_expand_status_and_env() {
        env::set_var("JOBSH_EXPAND_TEST", "value");
        assert_eq!(expand_variables("$?", 127), "127");
        assert_eq!(expand_variables("x$JOBSH_EXPAND_TEST.y", 0), "xvalue.y");
        assert_eq!(expand_variables("${JOBSH_EXPAND_TEST}s", 0), "values");
        assert_eq!(expand_variables("$JOBSH_EXPAND_UNSET_NAME", 0), "");
    }

    #[test]
    fn test_expand_keeps_lone_dollar() {
        assert_eq!(expand_variables("$", 0), "$");
        assert_eq!(expand_variables("a$1", 0), "a$1");
        assert_eq!(expand_variables("cost: 5$", 0), "cost: 5$");
        assert_eq!(expand_variables("${unclosed", 0), "${unclosed");
    }

    #[test]
    fn test_expand_tilde() {
        let home = PathBuf::from("/home/user");
        assert_eq!(expand_tilde("~", Some(&home)), "/home/user");
        assert_eq!(expand_tilde("~/src", Some(&home)), "/home/user/src");
        assert_eq!(expand_tilde("a~", Some(&home)), "a~");
        assert_eq!(expand_tilde("~other", Some(&home)), "~other");
        assert_eq!(expand_tilde("~", None), "~");
    }

    #[test]
    fn test_unset_words_vanish() {
        let aliases = AliasTable::new();
        assert_eq!(
            expand_words(words("echo $JOBSH_EXPAND_UNSET_NAME done"), &aliases, 0),
            words("echo done")
        );
    }
}
