use crate::config::ImportConfig;
use crate::cursor::{CursorError, ImportCursor};
use crate::descriptor::{consensus, exit_list, split_records, DescriptorKind};
use crate::lock::{ImportLock, LockError};
use crate::metrics::{ExoneratorMetrics, FileOutcome};
use crate::storage::{FactBatch, FactStore, StorageError};
use chrono::TimeDelta;
use exonerator_utils::networking::AddressError;
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Lock error: {0}")]
    LockError(#[from] LockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Cursor error: {0}")]
    CursorError(#[from] CursorError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{file}, record {record}, line {line}: address cannot be canonicalized: {source}")]
    InvalidAddress { file: String, record: usize, line: usize, source: AddressError },
}

pub type ImportResult<T> = Result<T, ImportError>;

/// What one import run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub files_parsed: usize,
    pub files_unchanged: usize,
    pub files_unrecognized: usize,
    pub records_rejected: usize,
    pub entries_discarded: usize,
    /// Status rows new to the store
    pub status_facts: usize,
    /// Exit probe rows new to the store
    pub exit_probe_facts: usize,
}

/// Batch importer of consensuses and exit lists
pub struct Importer {
    store: FactStore,
    config: ImportConfig,
    metrics: Option<Arc<ExoneratorMetrics>>,
}

impl Importer {
    pub fn new(store: FactStore, config: &ImportConfig) -> Self {
        Self { store, config: config.clone(), metrics: None }
    }

    pub fn with_metrics(store: FactStore, config: &ImportConfig, metrics: Arc<ExoneratorMetrics>) -> Self {
        Self { store, config: config.clone(), metrics: Some(metrics) }
    }

    /// Import all new or modified files below the import directory.
    ///
    /// Stops at the first storage failure. The cursor is saved either way,
    /// covering only the files that were completely processed.
    pub fn run(&self) -> ImportResult<ImportReport> {
        let stale_after =
            i64::try_from(self.config.lock_stale_hours).ok().and_then(TimeDelta::try_hours).unwrap_or(TimeDelta::MAX);
        let _lock = ImportLock::acquire(&self.config.lock_file, stale_after)?;

        let started = Instant::now();
        info!("Starting import from {:?}", self.config.directory);

        let previous = ImportCursor::load(&self.config.history_file);
        let mut next = ImportCursor::default();
        let mut report = ImportReport::default();

        let result = list_files(&self.config.directory)
            .map_err(ImportError::from)
            .and_then(|files| self.import_files(&files, &previous, &mut next, &mut report));

        match result {
            Ok(()) => {
                next.save(&self.config.history_file)?;
                info!(
                    "Import finished in {:?}: {} files parsed, {} unchanged, {} unrecognized, {} records rejected, \
                     {} entries discarded, {} status rows and {} exit probe rows written",
                    started.elapsed(),
                    report.files_parsed,
                    report.files_unchanged,
                    report.files_unrecognized,
                    report.records_rejected,
                    report.entries_discarded,
                    report.status_facts,
                    report.exit_probe_facts
                );
                Ok(report)
            }
            Err(e) => {
                error!("Import aborted: {}", e);
                let mut merged = previous;
                merged.merge(next);
                if let Err(save_err) = merged.save(&self.config.history_file) {
                    error!("Failed to save import history: {}", save_err);
                }
                Err(e)
            }
        }
    }

    fn import_files(
        &self,
        files: &[PathBuf],
        previous: &ImportCursor,
        next: &mut ImportCursor,
        report: &mut ImportReport,
    ) -> ImportResult<()> {
        for path in files {
            let name = path.to_string_lossy().into_owned();
            let modified = modified_millis(path)?;

            let outcome = if previous.is_current(&name, modified) {
                debug!("Skipping unchanged file {}", name);
                report.files_unchanged += 1;
                FileOutcome::Unchanged
            } else {
                self.import_file(path, &name, report)?
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_file(outcome);
            }
            next.record(name, modified);
        }
        Ok(())
    }

    fn import_file(&self, path: &Path, name: &str, report: &mut ImportReport) -> ImportResult<FileOutcome> {
        let bytes = fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);

        let Some(kind) = DescriptorKind::sniff(&text) else {
            warn!("Skipping unrecognized file {}", name);
            report.files_unrecognized += 1;
            return Ok(FileOutcome::Unrecognized);
        };

        let records = split_records(&text, kind);
        debug!("Importing {} with {} {} records", name, records.len(), kind);
        for (index, record) in records.into_iter().enumerate() {
            let batch = match kind {
                DescriptorKind::Consensus => self.consensus_batch(name, index + 1, record, report)?,
                DescriptorKind::ExitList => self.exit_list_batch(name, index + 1, record, report)?,
            };
            let Some(batch) = batch else {
                continue;
            };

            let counts = self.store.write_batch(&batch)?;
            report.status_facts += counts.status_rows;
            report.exit_probe_facts += counts.exit_probe_rows;
            if let Some(metrics) = &self.metrics {
                metrics.record_facts(counts.status_rows, counts.exit_probe_rows);
            }
        }

        report.files_parsed += 1;
        Ok(FileOutcome::Imported(kind))
    }

    fn consensus_batch(
        &self,
        name: &str,
        record: usize,
        text: &str,
        report: &mut ImportReport,
    ) -> ImportResult<Option<FactBatch>> {
        let consensus = match consensus::parse(text) {
            Ok(consensus) => consensus,
            Err(e) => {
                warn!("Skipping malformed consensus in {}, record {}: {}", name, record, e);
                self.reject_record(report);
                return Ok(None);
            }
        };

        let mut statuses = Vec::with_capacity(consensus.entries.len());
        for entry in consensus.entries.iter().filter(|entry| entry.running) {
            match entry.to_fact(consensus.valid_after) {
                Ok(fact) => statuses.push(fact),
                Err(source) => self.address_failure(name, record, entry.line, source, report)?,
            }
        }
        Ok(Some(FactBatch::Consensus { valid_after: consensus.valid_after, statuses }))
    }

    fn exit_list_batch(
        &self,
        name: &str,
        record: usize,
        text: &str,
        report: &mut ImportReport,
    ) -> ImportResult<Option<FactBatch>> {
        let list = match exit_list::parse(text) {
            Ok(list) => list,
            Err(e) => {
                warn!("Skipping malformed exit list in {}, record {}: {}", name, record, e);
                self.reject_record(report);
                return Ok(None);
            }
        };

        debug!("{}, record {}: exit list downloaded at {}", name, record, list.downloaded);
        let mut probes = Vec::new();
        for entry in &list.entries {
            match entry.to_facts() {
                Ok(facts) => probes.extend(facts),
                Err(source) => self.address_failure(name, record, entry.line, source, report)?,
            }
        }
        Ok(Some(FactBatch::ExitList { probes }))
    }

    fn reject_record(&self, report: &mut ImportReport) {
        report.records_rejected += 1;
        if let Some(metrics) = &self.metrics {
            metrics.records_rejected_total.inc();
        }
    }

    /// An address the codec refuses means the codec and the descriptor format disagree.
    fn address_failure(
        &self,
        name: &str,
        record: usize,
        line: usize,
        source: AddressError,
        report: &mut ImportReport,
    ) -> ImportResult<()> {
        error!("{}, record {}, line {}: could not canonicalize address: {}", name, record, line, source);
        if self.config.abort_on_invalid_address {
            return Err(ImportError::InvalidAddress { file: name.to_string(), record, line, source });
        }
        report.entries_discarded += 1;
        if let Some(metrics) = &self.metrics {
            metrics.entries_discarded_total.inc();
        }
        Ok(())
    }
}

/// All regular files below `dir`, in a stable order.
fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

fn modified_millis(path: &Path) -> std::io::Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    let millis = modified.duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    Ok(i64::try_from(millis).unwrap_or(i64::MAX))
}
