use super::{tokenize, DescriptorError, DescriptorResult, Line};
use crate::models::{ExitProbeFact, Fingerprint};
use chrono::{DateTime, Utc};
use exonerator_utils::dates::parse_timestamp;
use exonerator_utils::networking::{AddressResult, CanonicalAddress};

/// A parsed exit list, as published by the exit scanner
#[derive(Debug, Clone)]
pub struct ExitList {
    pub downloaded: DateTime<Utc>,
    pub entries: Vec<ExitListEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitListEntry {
    pub line: usize,
    pub fingerprint: Fingerprint,
    /// Observed exit addresses with their scan time
    pub exit_addresses: Vec<(String, DateTime<Utc>)>,
}

impl ExitListEntry {
    /// One fact per (fingerprint, address, scan time) triple.
    pub fn to_facts(&self) -> AddressResult<Vec<ExitProbeFact>> {
        self.exit_addresses
            .iter()
            .map(|(text, scanned_time)| {
                Ok(ExitProbeFact {
                    fingerprint: self.fingerprint,
                    scanned_time: *scanned_time,
                    exit_address: text.parse::<CanonicalAddress>()?,
                })
            })
            .collect()
    }
}

/// Parse one exit list record.
pub fn parse(record: &str) -> DescriptorResult<ExitList> {
    let mut lines = tokenize(record);

    let downloaded = match lines.next() {
        Some(first) if first.keyword() == "Downloaded" => {
            first.expect_fields("Downloaded", 3)?;
            timestamp(&first, 1)?
        }
        _ => return Err(DescriptorError::MissingLine("Downloaded")),
    };

    let mut entries: Vec<ExitListEntry> = Vec::new();
    for line in lines {
        match line.keyword() {
            "ExitNode" => {
                line.expect_fields("ExitNode", 2)?;
                let fingerprint = Fingerprint::from_hex(line.tokens[1])
                    .map_err(|source| DescriptorError::Fingerprint { line: line.number, source })?;
                entries.push(ExitListEntry { line: line.number, fingerprint, exit_addresses: Vec::new() });
            }
            "Published" => check_entry_timestamp(&line, "Published", !entries.is_empty())?,
            "LastStatus" => check_entry_timestamp(&line, "LastStatus", !entries.is_empty())?,
            "ExitAddress" => {
                let Some(entry) = entries.last_mut() else {
                    return Err(line.malformed("'ExitAddress' line outside of an entry"));
                };
                line.expect_fields("ExitAddress", 4)?;
                let scanned = timestamp(&line, 2)?;
                entry.exit_addresses.push((line.tokens[1].to_string(), scanned));
            }
            _ => {}
        }
    }

    Ok(ExitList { downloaded, entries })
}

/// `Published` and `LastStatus` only need to be well formed.
fn check_entry_timestamp(line: &Line<'_>, keyword: &'static str, in_entry: bool) -> DescriptorResult<()> {
    if !in_entry {
        return Err(line.malformed(format!("'{}' line outside of an entry", keyword)));
    }
    line.expect_fields(keyword, 3)?;
    timestamp(line, 1).map(|_| ())
}

fn timestamp(line: &Line<'_>, at: usize) -> DescriptorResult<DateTime<Utc>> {
    parse_timestamp(line.tokens[at], line.tokens[at + 1])
        .map_err(|source| DescriptorError::Timestamp { line: line.number, source })
}
