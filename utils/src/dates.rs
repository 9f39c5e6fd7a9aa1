use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use thiserror::Error;

/// ISO-8601 date as used in queries and responses.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Timestamp layout used by descriptors and match timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DATE_LEN: usize = "yyyy-mm-dd".len();

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DateError {
    #[error("no date given")]
    Empty,

    #[error("invalid date '{0}'")]
    Invalid(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

pub type DateResult<T> = Result<T, DateError>;

/// Exact 24-hour day, independent of calendar rules.
pub fn one_day() -> TimeDelta {
    TimeDelta::seconds(86_400)
}

/// Parses a query date parameter.
///
/// All whitespace is removed and only the leading `yyyy-mm-dd` is looked at,
/// so trailing time or zone designations are tolerated. Returns `Ok(None)`
/// for empty input.
pub fn parse_query_date(text: &str) -> DateResult<Option<NaiveDate>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Ok(None);
    }
    let datestamp: String = compact.chars().take(DATE_LEN).collect();
    if !is_iso_date_shape(&datestamp) {
        return Err(DateError::Invalid(text.to_string()));
    }
    NaiveDate::parse_from_str(&datestamp, DATE_FORMAT).map(Some).map_err(|_| DateError::Invalid(text.to_string()))
}

fn is_iso_date_shape(datestamp: &str) -> bool {
    let bytes = datestamp.as_bytes();
    bytes.len() == DATE_LEN
        && bytes.iter().enumerate().all(|(i, b)| if i == 4 || i == 7 { *b == b'-' } else { b.is_ascii_digit() })
}

/// Midnight UTC at the start of `date`.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Parses a `yyyy-mm-dd HH:MM:SS` UTC timestamp from two whitespace separated tokens.
pub fn parse_timestamp(date: &str, time: &str) -> DateResult<DateTime<Utc>> {
    let joined = format!("{} {}", date, time);
    NaiveDateTime::parse_from_str(&joined, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| DateError::InvalidTimestamp(joined))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}
