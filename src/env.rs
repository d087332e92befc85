// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Environment file layout.
//!
//! Services deployed by Nixopus read their settings from plain `KEY=value`
//! environment files. Nixopus always renders these files the same way: one
//! entry per line, keys sorted lexicographically, no duplicates, no comments.
//! Rendering the same mapping twice yields byte-identical content.
//!
//! Parsing is more lenient so that hand-edited files can be read back. Blank
//! lines and lines starting with `#` are skipped, keys and values are trimmed,
//! and each line is split on its first `=`. Later duplicates win.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Render mapping into environment file content.
pub fn serialize(config: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in config {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }

    out
}

/// Parsed environment file.
///
/// # Invariant
///
/// - No duplicate keys.
/// - Keys are never empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvFile {
    entries: BTreeMap<String, String>,
}

impl EnvFile {
    /// Construct new empty environment file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup value of key.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.entries.get(key.as_ref()).map(String::as_str)
    }

    /// Insert or replace entry, returning the previous value.
    ///
    /// # Errors
    ///
    /// - Return [`EnvError::EmptyKey`] if key is empty after trimming.
    /// - Return [`EnvError::InvalidKey`] if key contains `=` or a line break,
    ///   or starts with `#`.
    /// - Return [`EnvError::InvalidValue`] if value contains a line break.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Result<Option<String>> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return Err(EnvError::EmptyKey);
        }

        // INVARIANT: Every entry renders to a single line that parses back to itself.
        if key.starts_with('#') || key.contains(['=', '\n', '\r']) {
            return Err(EnvError::InvalidKey(key.to_owned()));
        }

        let value = value.as_ref().trim();
        if value.contains(['\n', '\r']) {
            return Err(EnvError::InvalidValue {
                key: key.to_owned(),
                value: value.to_owned(),
            });
        }

        Ok(self.entries.insert(key.to_owned(), value.to_owned()))
    }

    /// Remove entry, returning its value if it existed.
    pub fn remove(&mut self, key: impl AsRef<str>) -> Option<String> {
        self.entries.remove(key.as_ref())
    }

    /// Iterate entries in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Treat entries as plain mapping.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

impl FromStr for EnvFile {
    type Err = EnvError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        for (index, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| EnvError::MalformedLine {
                    line_number: index + 1,
                    line: line.to_owned(),
                })?;
            entries.insert(key.to_owned(), value.to_owned());
        }

        Ok(Self { entries })
    }
}

impl Display for EnvFile {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(serialize(&self.entries).as_str())
    }
}

impl From<BTreeMap<String, String>> for EnvFile {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}

/// Environment file error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvError {
    /// Line is neither blank, a comment, nor a `KEY=value` entry.
    #[error("malformed entry at line {line_number}: {line:?}")]
    MalformedLine { line_number: usize, line: String },

    /// Entry key is empty.
    #[error("environment keys cannot be empty")]
    EmptyKey,

    /// Entry key cannot be rendered on a single line.
    #[error("invalid environment key {0:?}: keys cannot contain '=' or line breaks, or start with '#'")]
    InvalidKey(String),

    /// Entry value cannot be rendered on a single line.
    #[error("invalid value for {key:?}: values cannot contain line breaks")]
    InvalidValue { key: String, value: String },
}

/// Friendly result alias :3
type Result<T, E = EnvError> = std::result::Result<T, E>;
