// ExoneraTor - answers whether an IP address was a Tor relay at a given date
//
// The importer turns consensuses and exit lists into normalized facts in a
// SQLite store; the query engine correlates those facts for one address and
// date, and falls back to nearby addresses in the same /24 or /48.

pub mod config;
pub mod cursor;
pub mod descriptor;
pub mod importer;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod query;
pub mod response;
pub mod storage;

// Re-export commonly used types
pub use config::{DatabaseConfig, ExoneratorConfig, ImportConfig, MetricsConfig, QueryConfig};
pub use importer::{ImportReport, Importer};
pub use metrics::ExoneratorMetrics;
pub use models::{ExitPolicy, ExitProbeFact, Fingerprint, StatusFact};
pub use query::{QueryEngine, QueryError};
pub use response::{MatchEntry, QueryResponse, Summary};
pub use storage::{FactSource, FactStore, StorageStatistics};
