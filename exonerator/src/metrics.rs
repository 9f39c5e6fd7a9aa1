use crate::descriptor::DescriptorKind;
use crate::response::Summary;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Outcome of looking at one source file during an import run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Imported(DescriptorKind),
    Unchanged,
    Unrecognized,
}

/// Prometheus metrics collector for imports and queries
pub struct ExoneratorMetrics {
    registry: Arc<Registry>,

    // Import metrics
    pub files_total: IntCounterVec,
    pub records_rejected_total: IntCounter,
    pub entries_discarded_total: IntCounter,
    pub facts_written_total: IntCounterVec,

    // Query metrics
    pub queries_total: IntCounterVec,
    pub query_duration: Histogram,
}

impl ExoneratorMetrics {
    /// Create a new metrics collector
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let files_total = IntCounterVec::new(
            Opts::new("exonerator_import_files_total", "Source files seen by the importer"),
            &["result"],
        )?;
        registry.register(Box::new(files_total.clone()))?;

        let records_rejected_total = IntCounter::new(
            "exonerator_import_records_rejected_total",
            "Descriptor records skipped because they did not parse",
        )?;
        registry.register(Box::new(records_rejected_total.clone()))?;

        let entries_discarded_total = IntCounter::new(
            "exonerator_import_entries_discarded_total",
            "Entries discarded because an address could not be canonicalized",
        )?;
        registry.register(Box::new(entries_discarded_total.clone()))?;

        let facts_written_total = IntCounterVec::new(
            Opts::new("exonerator_import_facts_written_total", "Facts newly written to the store"),
            &["kind"],
        )?;
        registry.register(Box::new(facts_written_total.clone()))?;

        let queries_total = IntCounterVec::new(
            Opts::new("exonerator_queries_total", "Answered queries by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(queries_total.clone()))?;

        let query_duration = Histogram::with_opts(
            HistogramOpts::new("exonerator_query_duration_seconds", "Duration of lookups")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(query_duration.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            files_total,
            records_rejected_total,
            entries_discarded_total,
            facts_written_total,
            queries_total,
            query_duration,
        })
    }

    pub fn record_file(&self, outcome: FileOutcome) {
        let result = match outcome {
            FileOutcome::Imported(DescriptorKind::Consensus) => "consensus",
            FileOutcome::Imported(DescriptorKind::ExitList) => "exit_list",
            FileOutcome::Unchanged => "unchanged",
            FileOutcome::Unrecognized => "unrecognized",
        };
        self.files_total.with_label_values(&[result]).inc();
    }

    pub fn record_facts(&self, status_rows: usize, exit_probe_rows: usize) {
        self.facts_written_total.with_label_values(&["status_entry"]).inc_by(status_rows as u64);
        self.facts_written_total.with_label_values(&["exit_probe"]).inc_by(exit_probe_rows as u64);
    }

    /// Record a query, `None` standing for a rejected or failed one
    pub fn record_query(&self, summary: Option<Summary>, duration_secs: f64) {
        let outcome = summary.map(|s| s.label()).unwrap_or("error");
        self.queries_total.with_label_values(&[outcome]).inc();
        self.query_duration.observe(duration_secs);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
