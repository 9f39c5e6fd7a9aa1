use crate::config::DatabaseConfig;
use crate::models::{ExitProbeFact, Fingerprint, StatusFact};
use chrono::{DateTime, Utc};
use exonerator_utils::networking::{CanonicalAddress, PrefixKey};
use log::{debug, info, warn};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Result as SqliteResult};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A status entry row, one per (snapshot, relay, address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub valid_after: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub nickname: Option<String>,
    pub exit: Option<bool>,
    pub address: CanonicalAddress,
}

/// An exit list row, one per (relay, scan, exit address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitProbeRow {
    pub fingerprint: Fingerprint,
    pub scanned: DateTime<Utc>,
    pub address: CanonicalAddress,
}

/// Everything stored about one prefix around one date
#[derive(Debug, Clone, Default)]
pub struct FactWindow {
    /// Status rows of every (snapshot, relay) pair in the window that has an
    /// address with the prefix or an exit probe with the prefix
    pub statuses: Vec<StatusRow>,

    /// Exit probe rows with the prefix, regardless of scan time
    pub exit_probes: Vec<ExitProbeRow>,

    /// Whether any consensus at all falls into the window
    pub relevant_statuses: bool,

    /// Store coverage as of the same read
    pub coverage: Coverage,
}

/// First and last consensus known to the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// Read side of the fact store as seen by the query engine
pub trait FactSource {
    /// Fetch facts for `prefix` with consensus valid-after in `[from, until)`,
    /// together with the coverage of the store, from one consistent read.
    fn fetch_window(&self, prefix: &PrefixKey, from: DateTime<Utc>, until: DateTime<Utc>) -> StorageResult<FactWindow>;
}

/// Facts extracted from one source record, written atomically
#[derive(Debug, Clone)]
pub enum FactBatch {
    Consensus { valid_after: DateTime<Utc>, statuses: Vec<StatusFact> },
    ExitList { probes: Vec<ExitProbeFact> },
}

/// Number of facts that were new to the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub status_rows: usize,
    pub exit_probe_rows: usize,
}

/// SQLite backed store of status entries and exit list entries
#[derive(Clone)]
pub struct FactStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl FactStore {
    /// Open (and create if needed) the fact database
    pub fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        let enable_wal = config.enable_wal;
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            if enable_wal {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            conn.execute_batch(
                "
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                PRAGMA temp_store = MEMORY;
                ",
            )?;
            Ok(())
        });

        let pool = Pool::builder().max_size(config.pool_size).build(manager)?;

        let store = Self { pool: Arc::new(pool) };
        store.init_schema()?;

        info!("Fact store initialized at {:?}", config.path);
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.pool.get()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS snapshot (
                valid_after INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS status_entry (
                valid_after INTEGER NOT NULL,
                fingerprint BLOB NOT NULL,
                nickname TEXT,
                exit INTEGER,
                address_hex TEXT NOT NULL,
                address_prefix TEXT NOT NULL,
                PRIMARY KEY (valid_after, fingerprint, address_hex)
            );

            CREATE INDEX IF NOT EXISTS idx_status_prefix_date ON status_entry(address_prefix, valid_after);
            CREATE INDEX IF NOT EXISTS idx_status_fingerprint_date ON status_entry(fingerprint, valid_after);

            CREATE TABLE IF NOT EXISTS exit_probe (
                fingerprint BLOB NOT NULL,
                scanned INTEGER NOT NULL,
                address_hex TEXT NOT NULL,
                address_prefix TEXT NOT NULL,
                PRIMARY KEY (fingerprint, scanned, address_hex)
            );

            CREATE INDEX IF NOT EXISTS idx_exit_probe_prefix ON exit_probe(address_prefix);
            ",
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Write all facts of one record in a single transaction.
    ///
    /// Re-inserting facts that are already present is a no-op.
    pub fn write_batch(&self, batch: &FactBatch) -> StorageResult<WriteCounts> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut counts = WriteCounts::default();

        match batch {
            FactBatch::Consensus { valid_after, statuses } => {
                tx.execute("INSERT OR IGNORE INTO snapshot (valid_after) VALUES (?1)", params![valid_after.timestamp()])?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR IGNORE INTO status_entry (
                            valid_after, fingerprint, nickname, exit, address_hex, address_prefix
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for status in statuses {
                        for address in &status.addresses {
                            counts.status_rows += stmt.execute(params![
                                status.snapshot_time.timestamp(),
                                status.fingerprint.as_bytes(),
                                &status.nickname,
                                status.exit_policy.as_bool(),
                                address.to_hex(),
                                address.prefix_key().to_hex(),
                            ])?;
                        }
                    }
                }
            }
            FactBatch::ExitList { probes } => {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO exit_probe (
                        fingerprint, scanned, address_hex, address_prefix
                    ) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for probe in probes {
                    counts.exit_probe_rows += stmt.execute(params![
                        probe.fingerprint.as_bytes(),
                        probe.scanned_time.timestamp(),
                        probe.exit_address.to_hex(),
                        probe.exit_address.prefix_key().to_hex(),
                    ])?;
                }
            }
        }

        tx.commit()?;
        debug!("Wrote {} status rows and {} exit probe rows", counts.status_rows, counts.exit_probe_rows);
        Ok(counts)
    }

    /// Get statistics
    pub fn statistics(&self) -> StorageResult<StorageStatistics> {
        let conn = self.pool.get()?;

        let snapshots: i64 = conn.query_row("SELECT COUNT(*) FROM snapshot", [], |row| row.get(0))?;
        let status_rows: i64 = conn.query_row("SELECT COUNT(*) FROM status_entry", [], |row| row.get(0))?;
        let exit_probe_rows: i64 = conn.query_row("SELECT COUNT(*) FROM exit_probe", [], |row| row.get(0))?;
        let coverage = coverage_on(&conn)?;

        Ok(StorageStatistics {
            snapshots: snapshots as usize,
            status_rows: status_rows as usize,
            exit_probe_rows: exit_probe_rows as usize,
            first_snapshot: coverage.first,
            last_snapshot: coverage.last,
        })
    }
}

/// Status rows of every (consensus, relay) pair that has an address in the
/// prefix, or an exit probe in the prefix. Both key sets are found through
/// the prefix indexes before the rows themselves are joined in.
const WINDOW_STATUS_SQL: &str = "
    WITH relay_key(valid_after, fingerprint) AS (
        SELECT valid_after, fingerprint FROM status_entry
        WHERE address_prefix = ?3 AND valid_after >= ?1 AND valid_after < ?2
        UNION
        SELECT s.valid_after, s.fingerprint
        FROM exit_probe e
        JOIN status_entry s ON s.fingerprint = e.fingerprint
        WHERE e.address_prefix = ?3 AND s.valid_after >= ?1 AND s.valid_after < ?2
    )
    SELECT s.valid_after, s.fingerprint, s.nickname, s.exit, s.address_hex
    FROM relay_key k
    JOIN status_entry s ON s.valid_after = k.valid_after AND s.fingerprint = k.fingerprint";

impl FactSource for FactStore {
    fn fetch_window(&self, prefix: &PrefixKey, from: DateTime<Utc>, until: DateTime<Utc>) -> StorageResult<FactWindow> {
        let mut conn = self.pool.get()?;
        // One read transaction, so a concurrent import cannot commit between the reads.
        let tx = conn.transaction()?;
        let prefix_hex = prefix.to_hex();

        let raw_statuses = {
            let mut stmt = tx.prepare_cached(WINDOW_STATUS_SQL)?;
            let rows = stmt
                .query_map(params![from.timestamp(), until.timestamp(), &prefix_hex], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<bool>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<SqliteResult<Vec<_>>>()?;
            rows
        };

        let raw_probes = {
            let mut stmt =
                tx.prepare_cached("SELECT fingerprint, scanned, address_hex FROM exit_probe WHERE address_prefix = ?1")?;
            let rows = stmt
                .query_map(params![&prefix_hex], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<SqliteResult<Vec<_>>>()?;
            rows
        };

        let relevant_statuses: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM snapshot WHERE valid_after >= ?1 AND valid_after < ?2)",
            params![from.timestamp(), until.timestamp()],
            |row| row.get(0),
        )?;
        let coverage = coverage_on(&tx)?;
        tx.commit()?;

        // Rows that do not decode are dropped with a warning rather than failing the query.
        let statuses = raw_statuses
            .into_iter()
            .filter_map(|(valid_after, fingerprint, nickname, exit, address_hex)| {
                match decode_row(valid_after, &fingerprint, &address_hex) {
                    Ok((valid_after, fingerprint, address)) => {
                        Some(StatusRow { valid_after, fingerprint, nickname, exit, address })
                    }
                    Err(e) => {
                        warn!("Skipping malformed status entry row: {}", e);
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        let exit_probes = raw_probes
            .into_iter()
            .filter_map(|(fingerprint, scanned, address_hex)| match decode_row(scanned, &fingerprint, &address_hex) {
                Ok((scanned, fingerprint, address)) => Some(ExitProbeRow { fingerprint, scanned, address }),
                Err(e) => {
                    warn!("Skipping malformed exit probe row: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "Fetched {} status rows and {} exit probe rows for prefix {}",
            statuses.len(),
            exit_probes.len(),
            prefix_hex
        );
        Ok(FactWindow { statuses, exit_probes, relevant_statuses, coverage })
    }
}

fn coverage_on(conn: &rusqlite::Connection) -> StorageResult<Coverage> {
    let bounds: Option<(Option<i64>, Option<i64>)> = conn
        .query_row("SELECT MIN(valid_after), MAX(valid_after) FROM snapshot", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;
    let (first, last) = bounds.unwrap_or((None, None));
    Ok(Coverage { first: first.map(timestamp_to_utc).transpose()?, last: last.map(timestamp_to_utc).transpose()? })
}

fn timestamp_to_utc(seconds: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| StorageError::InvalidData(format!("timestamp {} out of range", seconds)))
}

fn decode_row(
    seconds: i64,
    fingerprint: &[u8],
    address_hex: &str,
) -> StorageResult<(DateTime<Utc>, Fingerprint, CanonicalAddress)> {
    let time = timestamp_to_utc(seconds)?;
    let fingerprint = Fingerprint::from_slice(fingerprint).map_err(|e| StorageError::InvalidData(e.to_string()))?;
    let address = CanonicalAddress::from_hex(address_hex).map_err(|e| StorageError::InvalidData(e.to_string()))?;
    Ok((time, fingerprint, address))
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStatistics {
    pub snapshots: usize,
    pub status_rows: usize,
    pub exit_probe_rows: usize,
    pub first_snapshot: Option<DateTime<Utc>>,
    pub last_snapshot: Option<DateTime<Utc>>,
}
