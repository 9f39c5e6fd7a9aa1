//! Integration tests for ExoneraTor
//!
//! These tests import descriptor files from a temporary directory into a
//! temporary database and query the result.

use chrono::NaiveDate;
use exonerator::{
    config::{DatabaseConfig, ExoneratorConfig, ImportConfig, MetricsConfig, QueryConfig},
    importer::Importer,
    metrics::ExoneratorMetrics,
    query::QueryEngine,
    response::Summary,
    storage::FactStore,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const CONSENSUS: &str = "\
@type network-status-consensus-3 1.0
network-status-version 3
vote-status consensus
consensus-method 28
valid-after 2020-06-01 00:00:00
fresh-until 2020-06-01 01:00:00
valid-until 2020-06-01 03:00:00
known-flags Exit Fast Guard Running Stable Valid
r relayF1 8fHx8fHx8fHx8fHx8fHx8fHx8fE 8fHx8fHx8fHx8fHx8fHx8fHx8fE 2020-05-31 18:00:00 86.59.21.38 443 80
s Fast Running Stable Valid
v Tor 0.4.3.5
w Bandwidth=2000
r relayAA qqqqqqqqqqqqqqqqqqqqqqqqqqo qqqqqqqqqqqqqqqqqqqqqqqqqqo 2020-05-31 19:00:00 10.0.0.1 9001 0
a [2001:db8:1::5]:9001
s Exit Fast Running Valid
p accept 80,443
r relayBB u7u7u7u7u7u7u7u7u7u7u7u7u7s u7u7u7u7u7u7u7u7u7u7u7u7u7s 2020-05-31 20:00:00 86.59.21.39 9001 0
s Fast Valid
p reject 1-65535
directory-footer
bandwidth-weights Wbd=0
";

const EXIT_LIST: &str = "\
@type tordnsel 1.0
Downloaded 2020-06-01 12:00:00
ExitNode AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA
Published 2020-05-31 19:00:00
LastStatus 2020-06-01 11:00:00
ExitAddress 86.59.21.200 2020-06-01 06:00:00
";

/// Create a test configuration with temp directories
fn create_test_config(temp_dir: &TempDir) -> ExoneratorConfig {
    ExoneratorConfig {
        database: DatabaseConfig { path: temp_dir.path().join("exonerator.db"), pool_size: 2, enable_wal: true },
        import: ImportConfig {
            directory: temp_dir.path().join("in"),
            history_file: temp_dir.path().join("stats").join("exonerator-import-history"),
            lock_file: temp_dir.path().join("exonerator-lock"),
            lock_stale_hours: 6,
            abort_on_invalid_address: true,
        },
        query: QueryConfig::default(),
        metrics: MetricsConfig::default(),
    }
}

fn write_sources(config: &ExoneratorConfig) {
    let consensuses = config.import.directory.join("recent").join("relay-descriptors").join("consensuses");
    let exit_lists = config.import.directory.join("recent").join("exit-lists");
    fs::create_dir_all(&consensuses).unwrap();
    fs::create_dir_all(&exit_lists).unwrap();
    fs::write(consensuses.join("2020-06-01-00-00-00-consensus"), CONSENSUS).unwrap();
    fs::write(exit_lists.join("2020-06-01-12-00-00"), EXIT_LIST).unwrap();
}

fn touch_later(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 7, 1).unwrap()
}

#[test]
fn test_import_then_query() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    write_sources(&config);

    let store = FactStore::new(&config.database).unwrap();
    let report = Importer::new(store.clone(), &config.import).run().unwrap();
    assert_eq!(report.files_parsed, 2);
    assert_eq!(report.status_facts, 3);
    assert_eq!(report.exit_probe_facts, 1);

    let stats = store.statistics().unwrap();
    assert_eq!(stats.snapshots, 1);
    assert_eq!(stats.status_rows, 3);
    assert_eq!(stats.exit_probe_rows, 1);

    let engine = QueryEngine::new(store, &config.query);

    let positive = engine.lookup_at("86.59.21.38", "2020-06-01", today()).unwrap();
    assert_eq!(positive.summary(), Summary::Positive);
    assert_eq!(
        positive.to_json().unwrap(),
        "{\"version\":\"1.0\",\"query_address\":\"86.59.21.38\",\"query_date\":\"2020-06-01\",\
\"first_date_in_database\":\"2020-06-01\",\"last_date_in_database\":\"2020-06-01\",\
\"relevant_statuses\":true,\"matches\":[{\"timestamp\":\"2020-06-01 00:00:00\",\
\"addresses\":[\"86.59.21.38\"],\"fingerprint\":\"F1F1F1F1F1F1F1F1F1F1F1F1F1F1F1F1F1F1F1F1\",\
\"nickname\":\"relayF1\"}]}"
    );

    let nearby = engine.lookup_at("86.59.21.99", "2020-06-01", today()).unwrap();
    assert_eq!(nearby.summary(), Summary::SameNetwork);
    assert!(nearby.matches.is_empty());
    assert_eq!(nearby.nearby_addresses, vec!["86.59.21.200".to_string(), "86.59.21.38".to_string()]);

    // relayBB is not running, so its address is unknown
    let not_running = engine.lookup_at("86.59.21.39", "2020-06-01", today()).unwrap();
    assert!(not_running.matches.is_empty());

    let exit = engine.lookup_at("86.59.21.200", "2020-06-01", today()).unwrap();
    assert_eq!(exit.matches.len(), 1);
    assert_eq!(exit.matches[0].fingerprint, "A".repeat(40));
    assert_eq!(exit.matches[0].exit, Some(true));
    assert_eq!(
        exit.matches[0].addresses,
        vec!["10.0.0.1".to_string(), "86.59.21.200".to_string(), "[2001:db8:1::5]".to_string()]
    );

    let v6 = engine.lookup_at("[2001:0db8:0001:0000:0000:0000:0000:0005]", "2020-06-01", today()).unwrap();
    assert_eq!(v6.query_address, "2001:db8:1::5");
    assert_eq!(v6.matches.len(), 1);

    let elsewhere = engine.lookup_at("192.0.2.1", "2020-06-01", today()).unwrap();
    assert_eq!(elsewhere.summary(), Summary::Negative);

    let too_late = engine.lookup_at("86.59.21.38", "2020-06-10", today()).unwrap();
    assert_eq!(too_late.summary(), Summary::OutsideCoverage);
}

#[test]
fn test_reimport_is_idempotent_and_incremental() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    write_sources(&config);
    let store = FactStore::new(&config.database).unwrap();

    Importer::new(store.clone(), &config.import).run().unwrap();
    let before = store.statistics().unwrap();

    let second = Importer::new(store.clone(), &config.import).run().unwrap();
    assert_eq!(second.files_parsed, 0);
    assert_eq!(second.files_unchanged, 2);
    assert_eq!(second.status_facts + second.exit_probe_facts, 0);

    // Without history every file is parsed again, but nothing is duplicated.
    fs::remove_file(&config.import.history_file).unwrap();
    let forced = Importer::new(store.clone(), &config.import).run().unwrap();
    assert_eq!(forced.files_parsed, 2);
    assert_eq!(forced.status_facts + forced.exit_probe_facts, 0);

    let after = store.statistics().unwrap();
    assert_eq!(before.status_rows, after.status_rows);
    assert_eq!(before.exit_probe_rows, after.exit_probe_rows);
}

#[test]
fn test_modified_file_is_reimported() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(&temp_dir);
    write_sources(&config);
    let store = FactStore::new(&config.database).unwrap();
    Importer::new(store.clone(), &config.import).run().unwrap();

    let exit_list = config.import.directory.join("recent").join("exit-lists").join("2020-06-01-12-00-00");
    let appended = format!(
        "{}Downloaded 2020-06-01 13:00:00\nExitNode {}\nExitAddress 86.59.21.201 2020-06-01 12:40:00\n",
        EXIT_LIST,
        "A".repeat(40)
    );
    fs::write(&exit_list, appended).unwrap();
    touch_later(&exit_list);

    let metrics = Arc::new(ExoneratorMetrics::new().unwrap());
    let report = Importer::with_metrics(store.clone(), &config.import, metrics.clone()).run().unwrap();
    assert_eq!(report.files_parsed, 1);
    assert_eq!(report.files_unchanged, 1);
    assert_eq!(report.exit_probe_facts, 1);
    assert!(metrics.gather().contains("exonerator_import_files_total"));

    let engine = QueryEngine::new(store, &config.query);
    let response = engine.lookup_at("86.59.21.201", "2020-06-01", today()).unwrap();
    assert_eq!(response.matches.len(), 1);
}

#[test]
fn test_generated_config_loads() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("exonerator.toml");
    ExoneratorConfig::create_default_config_file(&path).unwrap();
    let config = ExoneratorConfig::from_file(&path).unwrap();
    assert_eq!(config.import.lock_stale_hours, 6);
    assert_eq!(config.query.reject_recent_days, 2);
}
