use crate::config::QueryConfig;
use crate::metrics::ExoneratorMetrics;
use crate::models::Fingerprint;
use crate::response::{MatchEntry, QueryResponse, RESPONSE_VERSION};
use crate::storage::{FactSource, FactWindow, StorageError};
use chrono::{DateTime, Days, NaiveDate, TimeDelta, Utc};
use exonerator_utils::dates::{day_start, format_date, format_timestamp, one_day, parse_query_date, DateError};
use exonerator_utils::networking::{parse_address, AddressError, CanonicalAddress};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// How long after a consensus an exit probe still corroborates it
pub const EXIT_PROBE_GRACE_SECS: i64 = 24 * 60 * 60;

/// Consensuses from this many days before the queried date are considered
const WINDOW_DAYS_BEFORE: i32 = 1;

/// Consensuses up to, but excluding, this many days after the queried date are considered
const WINDOW_DAYS_AFTER: i32 = 2;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no address given")]
    AddressAbsent,

    #[error("invalid address: {0}")]
    InvalidAddress(AddressError),

    #[error("no date given")]
    DateAbsent,

    #[error("invalid date: {0}")]
    InvalidDate(DateError),

    #[error("date {0} is too recent")]
    DateTooRecent(NaiveDate),

    #[error("server problem: {0}")]
    Storage(#[from] StorageError),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// A relay at one consensus, collecting every address known for it
#[derive(Debug, Clone)]
struct Candidate {
    nickname: Option<String>,
    exit: Option<bool>,
    addresses: BTreeSet<CanonicalAddress>,
}

type CandidateKey = (Fingerprint, DateTime<Utc>);

/// Read-only lookups against previously imported facts
pub struct QueryEngine<S> {
    source: S,
    reject_recent_days: u32,
    metrics: Option<Arc<ExoneratorMetrics>>,
}

impl<S: FactSource> QueryEngine<S> {
    pub fn new(source: S, config: &QueryConfig) -> Self {
        Self { source, reject_recent_days: config.reject_recent_days, metrics: None }
    }

    pub fn with_metrics(source: S, config: &QueryConfig, metrics: Arc<ExoneratorMetrics>) -> Self {
        Self { source, reject_recent_days: config.reject_recent_days, metrics: Some(metrics) }
    }

    /// Look up `address` on `date` as of today.
    pub fn lookup(&self, address: &str, date: &str) -> QueryResult<QueryResponse> {
        self.lookup_at(address, date, Utc::now().date_naive())
    }

    /// Look up `address` on `date`, judging recency against `today`.
    pub fn lookup_at(&self, address: &str, date: &str, today: NaiveDate) -> QueryResult<QueryResponse> {
        let started = Instant::now();
        let result = self.validate(address, date, today).and_then(|(address, date)| self.correlate(&address, date));
        let elapsed = started.elapsed();

        match &result {
            Ok(response) => {
                info!("Query for {} on {}: {} ({:?})", address.trim(), date.trim(), response.summary().label(), elapsed)
            }
            Err(QueryError::Storage(e)) => warn!("Query for {} on {} failed: {}", address.trim(), date.trim(), e),
            Err(e) => info!("Rejected query for '{}' on '{}': {}", address, date, e),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_query(result.as_ref().ok().map(QueryResponse::summary), elapsed.as_secs_f64());
        }
        result
    }

    fn validate(&self, address: &str, date: &str, today: NaiveDate) -> QueryResult<(CanonicalAddress, NaiveDate)> {
        let address = parse_address(address).map_err(QueryError::InvalidAddress)?.ok_or(QueryError::AddressAbsent)?;
        let date = parse_query_date(date).map_err(QueryError::InvalidDate)?.ok_or(QueryError::DateAbsent)?;

        if let Some(limit) = today.checked_sub_days(Days::new(u64::from(self.reject_recent_days))) {
            if date > limit {
                return Err(QueryError::DateTooRecent(date));
            }
        }
        Ok((address, date))
    }

    /// Find every relay that used `address` around `date`, or its neighbors if none did.
    pub fn correlate(&self, address: &CanonicalAddress, date: NaiveDate) -> QueryResult<QueryResponse> {
        let prefix = address.prefix_key();
        let start = day_start(date);
        let window = self.source.fetch_window(
            &prefix,
            start - one_day() * WINDOW_DAYS_BEFORE,
            start + one_day() * WINDOW_DAYS_AFTER,
        )?;
        let coverage = window.coverage;
        let relevant_statuses = window.relevant_statuses;

        let candidates = join_exit_probes(window);

        let mut direct = candidates.iter().filter(|(_, candidate)| candidate.addresses.contains(address)).collect::<Vec<_>>();
        direct.sort_by_key(|((fingerprint, valid_after), _)| (*valid_after, *fingerprint));

        let matches = direct
            .into_iter()
            .map(|((fingerprint, valid_after), candidate)| MatchEntry {
                timestamp: format_timestamp(valid_after),
                addresses: sorted_text(candidate.addresses.iter().map(CanonicalAddress::bracketed)),
                fingerprint: fingerprint.to_string(),
                nickname: candidate.nickname.clone(),
                exit: candidate.exit,
            })
            .collect::<Vec<_>>();

        let nearby_addresses = if matches.is_empty() {
            sorted_text(
                candidates
                    .values()
                    .flat_map(|candidate| candidate.addresses.iter())
                    .filter(|other| *other != address && other.prefix_key() == prefix)
                    .map(CanonicalAddress::to_string),
            )
        } else {
            Vec::new()
        };

        Ok(QueryResponse {
            version: RESPONSE_VERSION.to_string(),
            query_address: address.to_string(),
            query_date: format_date(date),
            first_date_in_database: coverage.first.map(|t| format_date(t.date_naive())),
            last_date_in_database: coverage.last.map(|t| format_date(t.date_naive())),
            relevant_statuses,
            matches,
            nearby_addresses,
        })
    }
}

/// Deduplicated and in string order, so "86.59.21.200" sorts before "86.59.21.38".
fn sorted_text(addresses: impl Iterator<Item = String>) -> Vec<String> {
    addresses.collect::<BTreeSet<_>>().into_iter().collect()
}

/// Group status rows per relay and consensus, then add exit addresses
/// observed within the grace period after each consensus.
fn join_exit_probes(window: FactWindow) -> BTreeMap<CandidateKey, Candidate> {
    let mut candidates: BTreeMap<CandidateKey, Candidate> = BTreeMap::new();
    for row in window.statuses {
        candidates
            .entry((row.fingerprint, row.valid_after))
            .or_insert_with(|| Candidate { nickname: row.nickname.clone(), exit: row.exit, addresses: BTreeSet::new() })
            .addresses
            .insert(row.address);
    }

    let grace = TimeDelta::seconds(EXIT_PROBE_GRACE_SECS);
    for probe in window.exit_probes {
        // valid_after <= scanned < valid_after + grace
        let lower = (probe.fingerprint, probe.scanned - grace);
        let upper = (probe.fingerprint, probe.scanned);
        let mut joined = 0;
        for (_, candidate) in candidates.range_mut((Excluded(lower), Included(upper))) {
            candidate.addresses.insert(probe.address);
            joined += 1;
        }
        if joined == 0 {
            debug!("Exit probe of {} scanned at {} matches no consensus entry", probe.fingerprint, probe.scanned);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Summary;
    use crate::storage::{Coverage, ExitProbeRow, StatusRow, StorageResult};
    use chrono::TimeZone;
    use exonerator_utils::networking::PrefixKey;

    /// In-memory stand-in for the SQLite store with the same window semantics
    #[derive(Default)]
    struct MemorySource {
        statuses: Vec<StatusRow>,
        exit_probes: Vec<ExitProbeRow>,
        fail: bool,
    }

    impl MemorySource {
        fn status(mut self, valid_after: DateTime<Utc>, fingerprint: u8, exit: Option<bool>, addresses: &[&str]) -> Self {
            for address in addresses {
                self.statuses.push(StatusRow {
                    valid_after,
                    fingerprint: Fingerprint::new([fingerprint; 20]),
                    nickname: Some(format!("relay{:02X}", fingerprint)),
                    exit,
                    address: address.parse().unwrap(),
                });
            }
            self
        }

        fn probe(mut self, fingerprint: u8, scanned: DateTime<Utc>, address: &str) -> Self {
            self.exit_probes.push(ExitProbeRow {
                fingerprint: Fingerprint::new([fingerprint; 20]),
                scanned,
                address: address.parse().unwrap(),
            });
            self
        }
    }

    impl FactSource for MemorySource {
        fn fetch_window(&self, prefix: &PrefixKey, from: DateTime<Utc>, until: DateTime<Utc>) -> StorageResult<FactWindow> {
            if self.fail {
                return Err(StorageError::InvalidData("unavailable".to_string()));
            }
            let exit_probes =
                self.exit_probes.iter().filter(|p| p.address.prefix_key() == *prefix).cloned().collect::<Vec<_>>();
            let in_window = |t: &DateTime<Utc>| *t >= from && *t < until;
            let statuses = self
                .statuses
                .iter()
                .filter(|s| in_window(&s.valid_after))
                .filter(|s| {
                    self.statuses.iter().any(|o| {
                        o.valid_after == s.valid_after && o.fingerprint == s.fingerprint && o.address.prefix_key() == *prefix
                    }) || exit_probes.iter().any(|p| p.fingerprint == s.fingerprint)
                })
                .cloned()
                .collect();
            let relevant_statuses = self.statuses.iter().any(|s| in_window(&s.valid_after));
            let coverage = Coverage {
                first: self.statuses.iter().map(|s| s.valid_after).min(),
                last: self.statuses.iter().map(|s| s.valid_after).max(),
            };
            Ok(FactWindow { statuses, exit_probes, relevant_statuses, coverage })
        }
    }

    fn at(month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, month, day, hour, 0, 0).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 7, 1).unwrap()
    }

    fn engine(source: MemorySource) -> QueryEngine<MemorySource> {
        QueryEngine::new(source, &QueryConfig::default())
    }

    fn f1_store() -> MemorySource {
        MemorySource::default().status(at(6, 1, 0), 0xF1, None, &["86.59.21.38"])
    }

    #[test]
    fn test_direct_match() {
        let response = engine(f1_store()).lookup_at("86.59.21.38", "2020-06-01", today()).unwrap();
        assert_eq!(response.summary(), Summary::Positive);
        assert_eq!(response.matches.len(), 1);
        let m = &response.matches[0];
        assert_eq!(m.timestamp, "2020-06-01 00:00:00");
        assert_eq!(m.fingerprint, "F1".repeat(20));
        assert_eq!(m.addresses, vec!["86.59.21.38".to_string()]);
        assert_eq!(m.exit, None);
        assert!(response.nearby_addresses.is_empty());
        assert_eq!(response.first_date_in_database.as_deref(), Some("2020-06-01"));
        assert_eq!(response.last_date_in_database.as_deref(), Some("2020-06-01"));
    }

    #[test]
    fn test_exit_flag_is_reported() {
        let source = MemorySource::default().status(at(6, 1, 0), 0xF1, Some(false), &["86.59.21.38"]);
        let response = engine(source).lookup_at("86.59.21.38", "2020-06-01", today()).unwrap();
        assert_eq!(response.matches[0].exit, Some(false));
    }

    #[test]
    fn test_nearby_addresses() {
        let response = engine(f1_store()).lookup_at("86.59.21.99", "2020-06-01", today()).unwrap();
        assert!(response.matches.is_empty());
        assert_eq!(response.nearby_addresses, vec!["86.59.21.38".to_string()]);
        assert_eq!(response.summary(), Summary::SameNetwork);
    }

    #[test]
    fn test_addresses_are_sorted_as_text() {
        let source = MemorySource::default()
            .status(at(6, 1, 0), 0xA1, None, &["86.59.21.38"])
            .status(at(6, 1, 0), 0xA2, None, &["86.59.21.200"])
            .status(at(6, 1, 0), 0xA3, None, &["86.59.21.5", "86.59.21.99", "[2001:db8::1]"]);
        let engine = engine(source);

        let nearby = engine.lookup_at("86.59.21.1", "2020-06-01", today()).unwrap();
        assert_eq!(
            nearby.nearby_addresses,
            vec!["86.59.21.200".to_string(), "86.59.21.38".to_string(), "86.59.21.5".to_string(), "86.59.21.99".to_string()]
        );

        let direct = engine.lookup_at("86.59.21.99", "2020-06-01", today()).unwrap();
        assert_eq!(
            direct.matches[0].addresses,
            vec!["86.59.21.5".to_string(), "86.59.21.99".to_string(), "[2001:db8::1]".to_string()]
        );
    }

    #[test]
    fn test_negative_without_neighbors() {
        let source = f1_store().status(at(6, 1, 0), 0xAA, None, &["10.0.0.1"]);
        let response = engine(source).lookup_at("192.0.2.1", "2020-06-01", today()).unwrap();
        assert!(response.relevant_statuses);
        assert!(response.matches.is_empty());
        assert!(response.nearby_addresses.is_empty());
        assert_eq!(response.summary(), Summary::Negative);
    }

    #[test]
    fn test_exit_probe_within_a_day_joins() {
        let source = MemorySource::default()
            .status(at(6, 1, 0), 0xAA, Some(true), &["10.0.0.1"])
            .probe(0xAA, at(6, 1, 12), "86.59.21.200");
        let response = engine(source).lookup_at("86.59.21.200", "2020-06-01", today()).unwrap();
        assert_eq!(response.matches.len(), 1);
        assert_eq!(response.matches[0].addresses, vec!["10.0.0.1".to_string(), "86.59.21.200".to_string()]);
    }

    #[test]
    fn test_exit_probe_after_a_day_does_not_join() {
        let source = MemorySource::default()
            .status(at(6, 1, 0), 0xAA, Some(true), &["10.0.0.1"])
            .probe(0xAA, at(6, 1, 12), "86.59.21.200")
            .probe(0xAA, at(6, 2, 12), "86.59.21.201");
        let response = engine(source).lookup_at("86.59.21.201", "2020-06-01", today()).unwrap();
        assert!(response.matches.is_empty());
        assert_eq!(response.nearby_addresses, vec!["86.59.21.200".to_string()]);
    }

    #[test]
    fn test_exit_probe_grace_boundaries() {
        let source = MemorySource::default()
            .status(at(6, 1, 0), 0xAA, None, &["10.0.0.1"])
            .probe(0xAA, at(6, 1, 0), "86.59.21.200")
            .probe(0xAA, at(6, 2, 0), "86.59.21.201")
            .probe(0xAA, at(5, 31, 23), "86.59.21.202");
        let engine = engine(source);
        assert_eq!(engine.lookup_at("86.59.21.200", "2020-06-01", today()).unwrap().matches.len(), 1);
        assert!(engine.lookup_at("86.59.21.201", "2020-06-01", today()).unwrap().matches.is_empty());
        assert!(engine.lookup_at("86.59.21.202", "2020-06-01", today()).unwrap().matches.is_empty());
    }

    #[test]
    fn test_orphan_exit_probe_is_ignored() {
        let source = f1_store().probe(0xBB, at(6, 1, 6), "86.59.21.77");
        let response = engine(source).lookup_at("86.59.21.77", "2020-06-01", today()).unwrap();
        assert!(response.matches.is_empty());
        assert_eq!(response.nearby_addresses, vec!["86.59.21.38".to_string()]);
    }

    #[test]
    fn test_matches_sorted_by_time_then_fingerprint() {
        let source = MemorySource::default()
            .status(at(6, 1, 1), 0xBB, None, &["86.59.21.38"])
            .status(at(6, 1, 1), 0xAA, None, &["86.59.21.38"])
            .status(at(6, 1, 0), 0xBB, None, &["86.59.21.38"]);
        let response = engine(source).lookup_at("86.59.21.38", "2020-06-01", today()).unwrap();
        let order =
            response.matches.iter().map(|m| (m.timestamp.as_str(), &m.fingerprint[..2])).collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![("2020-06-01 00:00:00", "BB"), ("2020-06-01 01:00:00", "AA"), ("2020-06-01 01:00:00", "BB")]
        );
    }

    #[test]
    fn test_ipv6_lookup() {
        let source = MemorySource::default().status(
            at(6, 1, 0),
            0xF1,
            None,
            &["86.59.21.38", "[2001:858:2:2:aabb:0:563b:1526]", "[2001:858:2:2::1]"],
        );
        let engine = engine(source);

        let response = engine.lookup_at("[2001:858:2:2:aabb:0:563b:1526]", "2020-06-01", today()).unwrap();
        assert_eq!(response.query_address, "2001:858:2:2:aabb:0:563b:1526");
        assert_eq!(
            response.matches[0].addresses,
            vec![
                "86.59.21.38".to_string(),
                "[2001:858:2:2::1]".to_string(),
                "[2001:858:2:2:aabb:0:563b:1526]".to_string()
            ]
        );

        let nearby = engine.lookup_at("2001:858:2:3::1", "2020-06-01", today()).unwrap();
        assert!(nearby.matches.is_empty());
        assert_eq!(
            nearby.nearby_addresses,
            vec!["2001:858:2:2::1".to_string(), "2001:858:2:2:aabb:0:563b:1526".to_string()]
        );
    }

    #[test]
    fn test_window_edges() {
        let engine = engine(f1_store());
        // Consensus at 2020-06-01 00:00 lies in [D - 1 day, D + 2 days) for D in 05-31 ..= 06-01.
        assert_eq!(engine.lookup_at("86.59.21.38", "2020-05-31", today()).unwrap().matches.len(), 1);
        assert_eq!(engine.lookup_at("86.59.21.38", "2020-06-02", today()).unwrap().matches.len(), 1);
        let late = engine.lookup_at("86.59.21.38", "2020-06-03", today()).unwrap();
        assert!(late.matches.is_empty());
        assert_eq!(late.summary(), Summary::OutsideCoverage);
    }

    #[test]
    fn test_no_data_for_interval() {
        let source = f1_store().status(at(6, 20, 0), 0xF1, None, &["86.59.21.38"]);
        let response = engine(source).lookup_at("86.59.21.38", "2020-06-10", today()).unwrap();
        assert!(!response.relevant_statuses);
        assert_eq!(response.summary(), Summary::NoDataForInterval);
    }

    #[test]
    fn test_empty_store() {
        let response = engine(MemorySource::default()).lookup_at("86.59.21.38", "2020-06-01", today()).unwrap();
        assert_eq!(response.first_date_in_database, None);
        assert_eq!(response.summary(), Summary::NoData);
    }

    #[test]
    fn test_input_validation() {
        let engine = engine(f1_store());
        assert!(matches!(engine.lookup_at("", "2020-06-01", today()), Err(QueryError::AddressAbsent)));
        assert!(matches!(engine.lookup_at("  ", "2020-06-01", today()), Err(QueryError::AddressAbsent)));
        assert!(matches!(engine.lookup_at("86.59.21", "2020-06-01", today()), Err(QueryError::InvalidAddress(_))));
        assert!(matches!(engine.lookup_at("86.59.21.38", "", today()), Err(QueryError::DateAbsent)));
        assert!(matches!(engine.lookup_at("86.59.21.38", "2020-13-01", today()), Err(QueryError::InvalidDate(_))));
        assert!(matches!(engine.lookup_at("86.59.21.38", "2020-06-30", today()), Err(QueryError::DateTooRecent(_))));
        assert!(engine.lookup_at("86.59.21.38", "2020-06-29", today()).is_ok());
    }

    #[test]
    fn test_storage_failure_is_server_problem() {
        let source = MemorySource { fail: true, ..Default::default() };
        assert!(matches!(engine(source).lookup_at("86.59.21.38", "2020-06-01", today()), Err(QueryError::Storage(_))));
    }

    #[test]
    fn test_metrics_count_queries() {
        let metrics = Arc::new(ExoneratorMetrics::new().unwrap());
        let engine = QueryEngine::with_metrics(f1_store(), &QueryConfig::default(), metrics.clone());
        engine.lookup_at("86.59.21.38", "2020-06-01", today()).unwrap();
        assert!(engine.lookup_at("", "2020-06-01", today()).is_err());
        assert_eq!(metrics.queries_total.with_label_values(&["positive"]).get(), 1);
        assert_eq!(metrics.queries_total.with_label_values(&["error"]).get(), 1);
    }
}
