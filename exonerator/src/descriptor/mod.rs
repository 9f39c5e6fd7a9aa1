//! Tokenizing parsers for the two descriptor formats the importer reads.
//!
//! A source file holds one or more records of a single kind. The kind is
//! decided by the first line that is neither blank nor an `@` annotation,
//! and the file is cut into records at every start-of-record marker.

pub mod consensus;
pub mod exit_list;

use crate::models::FingerprintError;
use exonerator_utils::dates::DateError;
use std::fmt::Display;
use thiserror::Error;

/// First line of every network-status consensus
pub const CONSENSUS_START: &str = "network-status-version 3";

/// Prefix of the first line of every exit list
pub const EXIT_LIST_START: &str = "Downloaded ";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("line {line}: '{keyword}' expects {expected} fields, found {found}")]
    FieldCount { line: usize, keyword: &'static str, expected: usize, found: usize },

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("missing '{0}' line")]
    MissingLine(&'static str),

    #[error("vote-status is '{0}', not a consensus")]
    NotConsensus(String),

    #[error("line {line}: {source}")]
    Fingerprint { line: usize, source: FingerprintError },

    #[error("line {line}: {source}")]
    Timestamp { line: usize, source: DateError },
}

pub type DescriptorResult<T> = Result<T, DescriptorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Consensus,
    ExitList,
}

impl DescriptorKind {
    /// Decide the kind of a source file from its first meaningful line.
    pub fn sniff(text: &str) -> Option<Self> {
        let first = text.lines().map(str::trim).find(|line| !line.is_empty() && !line.starts_with('@'))?;
        if first == CONSENSUS_START {
            Some(DescriptorKind::Consensus)
        } else if first.starts_with(EXIT_LIST_START) {
            Some(DescriptorKind::ExitList)
        } else {
            None
        }
    }

    fn is_record_start(&self, line: &str) -> bool {
        match self {
            DescriptorKind::Consensus => line == CONSENSUS_START,
            DescriptorKind::ExitList => line.starts_with(EXIT_LIST_START),
        }
    }
}

impl Display for DescriptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DescriptorKind::Consensus => "consensus",
            DescriptorKind::ExitList => "exit_list",
        };
        f.write_str(s)
    }
}

/// Cut `text` into records, each starting at a start-of-record marker line.
///
/// Records are slices of the input, so concatenating them gives back the
/// input minus anything preceding the first marker.
pub fn split_records(text: &str, kind: DescriptorKind) -> Vec<&str> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if kind.is_record_start(line.trim_end()) {
            starts.push(offset);
        }
        offset += line.len();
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(text.len());
            &text[start..end]
        })
        .collect()
}

/// A non-empty, non-annotation line split into whitespace separated tokens
pub(crate) struct Line<'a> {
    pub number: usize,
    pub tokens: Vec<&'a str>,
}

impl<'a> Line<'a> {
    pub fn keyword(&self) -> &'a str {
        self.tokens[0]
    }

    /// Fail unless the line has exactly `expected` tokens including the keyword
    pub fn expect_fields(&self, keyword: &'static str, expected: usize) -> DescriptorResult<()> {
        if self.tokens.len() != expected {
            return Err(DescriptorError::FieldCount {
                line: self.number,
                keyword,
                expected,
                found: self.tokens.len(),
            });
        }
        Ok(())
    }

    pub fn malformed(&self, message: impl Into<String>) -> DescriptorError {
        DescriptorError::Malformed { line: self.number, message: message.into() }
    }
}

/// Iterate over the meaningful lines of a record, numbered from 1.
pub(crate) fn tokenize(record: &str) -> impl Iterator<Item = Line<'_>> {
    record.lines().enumerate().filter_map(|(i, raw)| {
        let tokens = raw.split_whitespace().collect::<Vec<_>>();
        if tokens.is_empty() || tokens[0].starts_with('@') {
            None
        } else {
            Some(Line { number: i + 1, tokens })
        }
    })
}
