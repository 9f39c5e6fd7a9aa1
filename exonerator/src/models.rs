use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use exonerator_utils::networking::CanonicalAddress;
use faster_hex::{hex_decode, hex_string};
use std::collections::BTreeSet;
use std::fmt::Display;
use thiserror::Error;

pub const FINGERPRINT_LEN: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("invalid hex fingerprint '{0}'")]
    InvalidHex(String),

    #[error("invalid base64 identity '{0}'")]
    InvalidBase64(String),

    #[error("fingerprint has {0} bytes instead of 20")]
    InvalidLength(usize),
}

/// A relay's 20-byte identity.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn new(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FingerprintError> {
        let bytes: [u8; FINGERPRINT_LEN] = bytes.try_into().map_err(|_| FingerprintError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// 40 hex digits, any case, as found in exit lists.
    pub fn from_hex(hex: &str) -> Result<Self, FingerprintError> {
        if hex.len() != 2 * FINGERPRINT_LEN {
            return Err(FingerprintError::InvalidHex(hex.to_string()));
        }
        let mut bytes = [0u8; FINGERPRINT_LEN];
        hex_decode(hex.as_bytes(), &mut bytes).map_err(|_| FingerprintError::InvalidHex(hex.to_string()))?;
        Ok(Self(bytes))
    }

    /// Unpadded base64 identity, as found in consensus `r` lines.
    pub fn from_base64(identity: &str) -> Result<Self, FingerprintError> {
        let bytes = STANDARD_NO_PAD
            .decode(identity.trim_end_matches('='))
            .map_err(|_| FingerprintError::InvalidBase64(identity.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex_string(&self.0).to_uppercase())
    }
}

/// Whether a relay permitted exiting according to its policy summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitPolicy {
    /// Policy summary accepts at least some ports
    PermitsExit,
    /// Policy summary rejects all ports
    RejectsAll,
    /// No policy summary was published
    Unknown,
}

impl ExitPolicy {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ExitPolicy::PermitsExit => Some(true),
            ExitPolicy::RejectsAll => Some(false),
            ExitPolicy::Unknown => None,
        }
    }
}

impl From<Option<bool>> for ExitPolicy {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => ExitPolicy::PermitsExit,
            Some(false) => ExitPolicy::RejectsAll,
            None => ExitPolicy::Unknown,
        }
    }
}

/// One running relay's appearance in one consensus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFact {
    /// Consensus valid-after time (UTC, whole seconds)
    pub snapshot_time: DateTime<Utc>,

    pub fingerprint: Fingerprint,

    pub nickname: Option<String>,

    pub exit_policy: ExitPolicy,

    /// Registered address plus alternate OR addresses; never empty
    pub addresses: BTreeSet<CanonicalAddress>,
}

/// One externally observed exit address of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitProbeFact {
    pub fingerprint: Fingerprint,

    pub scanned_time: DateTime<Utc>,

    pub exit_address: CanonicalAddress,
}
