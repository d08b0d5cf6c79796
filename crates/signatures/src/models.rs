//! Typed records persisted by the signature store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use eval::FileSignature;
use serde::{Deserialize, Serialize};

use crate::SignatureError;

// ---------------------------------------------------------------------------
// SignatureMode
// ---------------------------------------------------------------------------

/// How the executor consults signatures for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// Skip a group whose record is still valid.
    #[default]
    Default,
    /// A record mismatch is a fatal error.
    Assert,
    /// Always (re)write records from existing files; a successful write
    /// counts as satisfied.
    Construct,
    /// Signatures are neither read nor written.
    Ignore,
}

impl FromStr for SignatureMode {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(SignatureMode::Default),
            "assert" => Ok(SignatureMode::Assert),
            "construct" => Ok(SignatureMode::Construct),
            "ignore" => Ok(SignatureMode::Ignore),
            other => Err(SignatureError::UnknownMode(other.to_owned())),
        }
    }
}

impl fmt::Display for SignatureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignatureMode::Default => "default",
            SignatureMode::Assert => "assert",
            SignatureMode::Construct => "construct",
            SignatureMode::Ignore => "ignore",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// SignatureRecord
// ---------------------------------------------------------------------------

/// One file and the signature it had when the record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFile {
    pub path: String,
    pub signature: FileSignature,
}

/// A persisted memoization record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Step content token plus the sorted values of the variables it read.
    pub content: String,
    pub input: Vec<RecordedFile>,
    pub output: Vec<RecordedFile>,
    pub depends: Vec<RecordedFile>,
    pub written_at: DateTime<Utc>,
}

impl SignatureRecord {
    pub fn output_files(&self) -> Vec<String> {
        self.output.iter().map(|f| f.path.clone()).collect()
    }

    /// Every recorded file, inputs first.
    pub fn files(&self) -> impl Iterator<Item = &RecordedFile> {
        self.input.iter().chain(&self.output).chain(&self.depends)
    }

    /// Equality that ignores when the record was written.
    pub fn same_as(&self, other: &SignatureRecord) -> bool {
        self.content == other.content
            && self.input == other.input
            && self.output == other.output
            && self.depends == other.depends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_and_display() {
        for name in ["default", "assert", "construct", "ignore"] {
            let mode: SignatureMode = name.parse().unwrap();
            assert_eq!(mode.to_string(), name);
        }
        assert!(matches!(
            "sometimes".parse::<SignatureMode>(),
            Err(SignatureError::UnknownMode(m)) if m == "sometimes"
        ));
    }
}
