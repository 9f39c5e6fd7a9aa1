use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Version of the response format written by this crate
pub const RESPONSE_VERSION: &str = "1.0";

/// Lowest response version accepted when decoding
const FIRST_RECOGNIZED_VERSION: &str = "1.0";

/// Responses with this version or higher are not understood
const FIRST_UNRECOGNIZED_VERSION: &str = "2.0";

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("unsupported response version '{0}'")]
    UnsupportedVersion(String),
}

pub type ResponseResult<T> = Result<T, ResponseError>;

/// Answer to a single address and date lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub version: String,

    /// Canonical form of the queried address
    pub query_address: String,

    pub query_date: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_date_in_database: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_date_in_database: Option<String>,

    /// Whether any consensus lies within the search window
    #[serde(default)]
    pub relevant_statuses: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<MatchEntry>,

    /// Addresses in the same /24 or /48, only filled without direct matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nearby_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEntry {
    /// Consensus valid-after time, `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,

    /// All addresses of the relay at that time, IPv6 ones in brackets
    pub addresses: Vec<String>,

    pub fingerprint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    /// Whether the relay permitted exiting; absent when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<bool>,
}

impl QueryResponse {
    pub fn to_json(&self) -> ResponseResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a response, refusing versions outside `[1.0, 2.0)`.
    pub fn from_json(json: &str) -> ResponseResult<Self> {
        let response: QueryResponse = serde_json::from_str(json).map_err(|e| {
            error!("JSON decoding failed: {}", e);
            e
        })?;
        if response.version.as_str() < FIRST_RECOGNIZED_VERSION || response.version.as_str() >= FIRST_UNRECOGNIZED_VERSION {
            warn!(
                "Response has version {}, outside the range we can handle: {} <= x < {}",
                response.version, FIRST_RECOGNIZED_VERSION, FIRST_UNRECOGNIZED_VERSION
            );
            return Err(ResponseError::UnsupportedVersion(response.version));
        }
        Ok(response)
    }

    /// Classify the response the way a front end would present it.
    pub fn summary(&self) -> Summary {
        let (Some(first), Some(last)) = (&self.first_date_in_database, &self.last_date_in_database) else {
            return Summary::NoData;
        };
        // ISO dates compare correctly as strings.
        if self.query_date.as_str() < first.as_str() || self.query_date.as_str() > last.as_str() {
            Summary::OutsideCoverage
        } else if !self.relevant_statuses {
            Summary::NoDataForInterval
        } else if !self.matches.is_empty() {
            Summary::Positive
        } else if !self.nearby_addresses.is_empty() {
            Summary::SameNetwork
        } else {
            Summary::Negative
        }
    }
}

/// Distinct outcomes of a successful lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Summary {
    /// The store holds no consensus at all
    NoData,
    /// The date lies before the first or after the last consensus
    OutsideCoverage,
    /// No consensus was published around the date
    NoDataForInterval,
    /// The address was a relay address
    Positive,
    /// The address was not a relay, but neighbors in its network were
    SameNetwork,
    Negative,
}

impl Summary {
    /// Short machine readable label
    pub fn label(&self) -> &'static str {
        match self {
            Summary::NoData => "no_data",
            Summary::OutsideCoverage => "outside_coverage",
            Summary::NoDataForInterval => "no_data_for_interval",
            Summary::Positive => "positive",
            Summary::SameNetwork => "same_network",
            Summary::Negative => "negative",
        }
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Summary::NoData => "No data available: the database does not contain any relay lists",
            Summary::OutsideCoverage => "Date outside of the range covered by the database",
            Summary::NoDataForInterval => "No relay lists found for the requested date",
            Summary::Positive => "Result is positive: the address was used by a relay",
            Summary::SameNetwork => "Result is negative, but relays were found in the same network",
            Summary::Negative => "Result is negative: the address was not used by a relay",
        };
        f.write_str(s)
    }
}
