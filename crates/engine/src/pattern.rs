//! Named-capture extraction from file names.
//!
//! A pattern such as `{sample}_{lane}.fastq` matches whole file names;
//! every `{name}` captures one or more characters. Literal braces are
//! written `{{` and `}}`.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::EngineError;

fn invalid(pattern: &str, message: impl Into<String>) -> EngineError {
    EngineError::InvalidOption {
        option: "pattern".into(),
        message: format!("{} in '{pattern}'", message.into()),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// A compiled file-name pattern.
#[derive(Debug, Clone)]
pub struct FilePattern {
    regex: Regex,
    names: Vec<String>,
}

impl FilePattern {
    pub fn parse(pattern: &str) -> Result<Self, EngineError> {
        let mut source = String::from("^");
        let mut names: Vec<String> = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(invalid(pattern, "unclosed '{'")),
                        }
                    }
                    if !is_identifier(&name) {
                        return Err(invalid(pattern, format!("bad wildcard name '{name}'")));
                    }
                    if names.contains(&name) {
                        return Err(invalid(pattern, format!("wildcard '{name}' repeated")));
                    }
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(&format!("(?P<{name}>.+)"));
                    names.push(name);
                }
                '}' => return Err(invalid(pattern, "unmatched '}'")),
                other => literal.push(other),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| invalid(pattern, e.to_string()))?;
        Ok(Self { regex, names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Captured values per wildcard, one entry per file; `null` where a
    /// file does not match.
    pub fn extract(&self, files: &[String]) -> BTreeMap<String, Vec<Value>> {
        let mut captured: BTreeMap<String, Vec<Value>> = self
            .names
            .iter()
            .map(|name| (name.clone(), Vec::with_capacity(files.len())))
            .collect();
        for file in files {
            let caps = self.regex.captures(file);
            for (name, values) in captured.iter_mut() {
                let value = caps
                    .as_ref()
                    .and_then(|c| c.name(name))
                    .map(|m| Value::from(m.as_str()))
                    .unwrap_or(Value::Null);
                values.push(value);
            }
        }
        captured
    }
}

/// Parse `pattern` and extract its captures from `files`.
pub fn extract_pattern(
    pattern: &str,
    files: &[String],
) -> Result<BTreeMap<String, Vec<Value>>, EngineError> {
    FilePattern::parse(pattern).map(|p| p.extract(files))
}
