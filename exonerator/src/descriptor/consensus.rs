use super::{tokenize, DescriptorError, DescriptorResult, Line, CONSENSUS_START};
use crate::models::{ExitPolicy, Fingerprint, StatusFact};
use chrono::{DateTime, Utc};
use exonerator_utils::dates::parse_timestamp;
use exonerator_utils::networking::{AddressResult, CanonicalAddress};
use std::collections::BTreeSet;

/// Port list of a policy summary that covers every port
const ALL_PORTS: &str = "1-65535";

/// A parsed network-status consensus
#[derive(Debug, Clone)]
pub struct Consensus {
    pub valid_after: DateTime<Utc>,
    pub entries: Vec<StatusEntry>,
}

/// One relay's entry, addresses still in their textual form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Line of the entry's `r` line within its record
    pub line: usize,
    pub nickname: String,
    pub fingerprint: Fingerprint,
    pub address: String,
    /// `a` line addresses with the port removed
    pub or_addresses: Vec<String>,
    pub running: bool,
    pub exit: Option<bool>,
}

impl StatusEntry {
    /// Canonicalize every address of this entry. One bad address fails the entry.
    pub fn to_fact(&self, valid_after: DateTime<Utc>) -> AddressResult<StatusFact> {
        let addresses = std::iter::once(&self.address)
            .chain(&self.or_addresses)
            .map(|text| text.parse::<CanonicalAddress>())
            .collect::<AddressResult<BTreeSet<_>>>()?;

        Ok(StatusFact {
            snapshot_time: valid_after,
            fingerprint: self.fingerprint,
            nickname: Some(self.nickname.clone()),
            exit_policy: ExitPolicy::from(self.exit),
            addresses,
        })
    }
}

enum EntryState {
    Idle,
    Accumulating(StatusEntry),
}

impl EntryState {
    /// Hand out the entry being built, if any, and go idle.
    fn emit(&mut self) -> Option<StatusEntry> {
        match std::mem::replace(self, EntryState::Idle) {
            EntryState::Accumulating(entry) => Some(entry),
            EntryState::Idle => None,
        }
    }
}

/// Parse one consensus record.
pub fn parse(record: &str) -> DescriptorResult<Consensus> {
    let mut lines = tokenize(record);

    match lines.next() {
        Some(first) if first.tokens.join(" ") == CONSENSUS_START => {}
        _ => return Err(DescriptorError::MissingLine(CONSENSUS_START)),
    }

    let mut vote_status = None;
    let mut valid_after = None;
    let mut entries = Vec::new();
    let mut state = EntryState::Idle;

    for line in lines {
        match line.keyword() {
            "vote-status" => {
                line.expect_fields("vote-status", 2)?;
                vote_status = Some(line.tokens[1].to_string());
            }
            "valid-after" => {
                line.expect_fields("valid-after", 3)?;
                let time = parse_timestamp(line.tokens[1], line.tokens[2])
                    .map_err(|source| DescriptorError::Timestamp { line: line.number, source })?;
                valid_after = Some(time);
            }
            "r" => {
                entries.extend(state.emit());
                state = EntryState::Accumulating(parse_r_line(&line)?);
            }
            "a" => {
                let EntryState::Accumulating(entry) = &mut state else {
                    return Err(line.malformed("'a' line outside of a status entry"));
                };
                line.expect_fields("a", 2)?;
                let (address, _port) =
                    line.tokens[1].rsplit_once(':').ok_or_else(|| line.malformed("'a' line without port"))?;
                entry.or_addresses.push(address.to_string());
            }
            "s" => {
                if let EntryState::Accumulating(entry) = &mut state {
                    entry.running = line.tokens[1..].contains(&"Running");
                }
            }
            "p" => {
                if let EntryState::Accumulating(entry) = &mut state {
                    line.expect_fields("p", 3)?;
                    entry.exit = Some(match line.tokens[1] {
                        "accept" => true,
                        "reject" => line.tokens[2] != ALL_PORTS,
                        other => return Err(line.malformed(format!("unknown policy summary '{}'", other))),
                    });
                }
            }
            "directory-footer" => {
                entries.extend(state.emit());
                break;
            }
            _ => {}
        }
    }
    entries.extend(state.emit());

    match vote_status.as_deref() {
        Some("consensus") => {}
        Some(other) => return Err(DescriptorError::NotConsensus(other.to_string())),
        None => return Err(DescriptorError::MissingLine("vote-status")),
    }
    let valid_after = valid_after.ok_or(DescriptorError::MissingLine("valid-after"))?;

    Ok(Consensus { valid_after, entries })
}

fn parse_r_line(line: &Line<'_>) -> DescriptorResult<StatusEntry> {
    line.expect_fields("r", 9)?;
    let fingerprint = Fingerprint::from_base64(line.tokens[2])
        .map_err(|source| DescriptorError::Fingerprint { line: line.number, source })?;

    Ok(StatusEntry {
        line: line.number,
        nickname: line.tokens[1].to_string(),
        fingerprint,
        address: line.tokens[6].to_string(),
        or_addresses: Vec::new(),
        running: false,
        exit: None,
    })
}
