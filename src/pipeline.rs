// 🔁 Import Pipeline - ledger check → fetch → sanitize → reconcile
//
// One `run_import()` call is one run. Runs against the same configuration
// identity are serialized by a process-wide lock; a second caller gets
// `AlreadyRunning` instead of waiting.

use crate::catalog::{CatalogStore, SqliteCatalogStore};
use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult};
use crate::fetcher::{CatalogFetcher, FetchFailure, FetchOutcome, LogProgressReporter};
use crate::ledger::{file_checksum, DownloadLedger, LedgerAction, LedgerEntry};
use crate::reconcile::{ReconcileReport, ReconciliationEngine};
use crate::sanitizer::{CsvSanitizer, SanitizeReport};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// STAGES & OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Idle,
    CheckLedger,
    Reuse,
    Fetch,
    Sanitize,
    Reconcile,
    Done,
    Abort,
}

/// What the trigger sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub success: bool,
    pub message: String,
}

/// Everything a successful run produced
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub csv_path: PathBuf,
    pub reused: bool,

    /// Set when the download failed and an older file was used
    pub fallback: Option<FetchFailure>,

    pub sanitize: SanitizeReport,
    pub reconcile: ReconcileReport,
}

impl RunSummary {
    pub fn message(&self) -> String {
        let source = if self.reused {
            "cached file"
        } else if self.fallback.is_some() {
            "previous download (fallback)"
        } else {
            "fresh download"
        };
        format!(
            "Import complete from {} {}: {}",
            source,
            self.csv_path.display(),
            self.reconcile.summary()
        )
    }
}

// ============================================================================
// CACHE DECISION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FetchReason {
    NoPreviousFetch,
    Stale { age_seconds: i64 },
    /// Fresh enough, but the file is gone from disk
    FileMissing { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    Reuse { path: PathBuf, age_seconds: i64 },
    Fetch(FetchReason),
}

/// Reuse the last fetched file when it is younger than `refresh_period`
/// seconds and still on disk. Entries dated in the future count as stale.
pub fn decide_cache(
    last_fetch: Option<&LedgerEntry>,
    now: DateTime<Utc>,
    refresh_period_seconds: i64,
) -> CacheDecision {
    let entry = match last_fetch {
        Some(entry) => entry,
        None => return CacheDecision::Fetch(FetchReason::NoPreviousFetch),
    };

    let age_seconds = entry.age_seconds(now);
    if age_seconds < 0 || age_seconds >= refresh_period_seconds {
        return CacheDecision::Fetch(FetchReason::Stale { age_seconds });
    }

    if !entry.file_exists() {
        return CacheDecision::Fetch(FetchReason::FileMissing {
            path: entry.file_path.clone(),
        });
    }

    CacheDecision::Reuse {
        path: entry.file_path.clone(),
        age_seconds,
    }
}

// ============================================================================
// RUN LOCK
// ============================================================================

static ACTIVE_RUNS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Held for the duration of a run; released on drop
struct RunGuard {
    key: String,
}

impl RunGuard {
    fn acquire(key: String) -> ImportResult<Self> {
        let mut active = ACTIVE_RUNS.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(key.clone()) {
            return Err(ImportError::AlreadyRunning(key));
        }
        Ok(RunGuard { key })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut active = ACTIVE_RUNS.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.key);
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct ImportPipeline<S: CatalogStore> {
    config: ImportConfig,
    ledger: DownloadLedger,
    store: S,
    fetcher: CatalogFetcher,
    stage: PipelineStage,
}

impl ImportPipeline<SqliteCatalogStore> {
    /// Pipeline over the configured SQLite database and HTTP source
    pub fn open(config: ImportConfig) -> ImportResult<Self> {
        config.validate()?;
        let ledger = DownloadLedger::open(&config.database_path).map_err(ImportError::Ledger)?;
        let store = open_catalog_store(&config.database_path)?;
        let fetcher =
            CatalogFetcher::http(&config).map_err(|e| ImportError::Config(format!("{:#}", e)))?;
        Ok(Self::new(config, ledger, store, fetcher))
    }
}

impl<S: CatalogStore> ImportPipeline<S> {
    pub fn new(config: ImportConfig, ledger: DownloadLedger, store: S, fetcher: CatalogFetcher) -> Self {
        ImportPipeline {
            config,
            ledger,
            store,
            fetcher,
            stage: PipelineStage::Idle,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn ledger(&self) -> &DownloadLedger {
        &self.ledger
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Trigger entry point: never panics, never returns an error
    pub fn run_import(&mut self) -> ImportOutcome {
        match self.run() {
            Ok(summary) => ImportOutcome {
                success: true,
                message: summary.message(),
            },
            Err(err) => {
                if err.is_no_csv() {
                    error!(error = %err, "Import aborted: no CSV available");
                } else {
                    error!(error = %err, "Import aborted");
                }
                ImportOutcome {
                    success: false,
                    message: err.to_string(),
                }
            }
        }
    }

    /// Full run with the typed error
    pub fn run(&mut self) -> ImportResult<RunSummary> {
        let _guard = RunGuard::acquire(self.config.identity())?;
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("import_run", run_id = %run_id);
        let _enter = span.enter();

        info!("Starting product import");
        let result = self.run_stages(&run_id);
        self.stage = match result {
            Ok(_) => PipelineStage::Done,
            Err(_) => PipelineStage::Abort,
        };
        result
    }

    fn run_stages(&mut self, run_id: &str) -> ImportResult<RunSummary> {
        // 1. Ledger check
        self.stage = PipelineStage::CheckLedger;
        let last_fetch = self
            .ledger
            .most_recent(Some(LedgerAction::Fetch))
            .map_err(ImportError::Ledger)?;
        let decision = decide_cache(
            last_fetch.as_ref(),
            Utc::now(),
            self.config.refresh_period_seconds,
        );

        // 2. Reuse or fetch
        let (csv_path, reused, fallback) = match decision {
            CacheDecision::Reuse { path, age_seconds } => {
                self.stage = PipelineStage::Reuse;
                info!(
                    path = %path.display(),
                    age_seconds,
                    "Using cached CSV, refresh period not elapsed"
                );
                (path, true, None)
            }
            CacheDecision::Fetch(reason) => {
                self.stage = PipelineStage::Fetch;
                match &reason {
                    FetchReason::FileMissing { path } => warn!(
                        path = %path.display(),
                        "Cached CSV missing from disk, downloading again"
                    ),
                    other => info!(reason = ?other, "Downloading a fresh CSV"),
                }
                match self.fetcher.fetch(&self.ledger, &mut LogProgressReporter, run_id)? {
                    FetchOutcome::Downloaded { path, .. } => (path, false, None),
                    FetchOutcome::Fallback { path, reason } => (path, false, Some(reason)),
                }
            }
        };

        // 3. Sanitize
        self.stage = PipelineStage::Sanitize;
        let sanitize = self.sanitize(&csv_path, run_id)?;

        // 4. Reconcile
        self.stage = PipelineStage::Reconcile;
        let engine = ReconciliationEngine::new(&self.config);
        let reconcile = engine
            .reconcile(
                &mut self.store,
                &csv_path,
                &self.config.allowed_categories(),
                self.config.margin_percent,
            )
            .map_err(ImportError::Reconcile)?;
        info!(summary = %reconcile.summary(), "Reconciliation finished");

        Ok(RunSummary {
            run_id: run_id.to_string(),
            csv_path,
            reused,
            fallback,
            sanitize,
            reconcile,
        })
    }

    fn sanitize(&self, path: &Path, run_id: &str) -> ImportResult<SanitizeReport> {
        let sanitizer = CsvSanitizer::new(self.config.repair_strategy);
        let report = sanitizer
            .sanitize(path)
            .map_err(|source| ImportError::Sanitize {
                path: path.to_path_buf(),
                source,
            })?;
        info!(summary = %report.summary(), "CSV sanitized");

        self.ledger
            .append(&clean_entry(path, run_id))
            .map_err(ImportError::Ledger)?;

        Ok(report)
    }
}

/// Ledger entry for a sanitized file. Size or checksum that cannot be read
/// is logged and left out instead of failing the run.
fn clean_entry(path: &Path, run_id: &str) -> LedgerEntry {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read sanitized file size; recording 0");
            0
        }
    };

    let entry = LedgerEntry::clean(path, size).with_run_id(run_id);
    match file_checksum(path) {
        Ok(checksum) => entry.with_checksum(checksum),
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{:#}", e), "Could not checksum sanitized file");
            entry
        }
    }
}

/// Catalog store at `path`; open failures are store errors
fn open_catalog_store(path: &Path) -> ImportResult<SqliteCatalogStore> {
    SqliteCatalogStore::open(path).map_err(ImportError::Store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TaxUse;
    use crate::fetcher::{CatalogSource, SourceResponse};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CSV: &str = "Modelo,Título,Su Precio,Menu Nvl 1,Menu Nvl 2,Menu Nvl 3,Código Fiscal\n\
                       A100,Cámara IP,100.00,Videovigilancia,Cámaras,,43211500\n\
                       B200,Switch 8p,\"1,000.00\",Redes,,,43222600\n";

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        body: Option<Vec<u8>>,
    }

    impl CatalogSource for CountingSource {
        fn open(&self, _url: &str) -> anyhow::Result<SourceResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = match &self.body {
                Some(body) => body.clone(),
                None => anyhow::bail!("connection refused"),
            };
            Ok(SourceResponse {
                status: 200,
                content_type: Some("text/csv".to_string()),
                content_length: Some(body.len() as u64),
                body: Box::new(Cursor::new(body)),
            })
        }
    }

    fn pipeline(
        dir: &Path,
        body: Option<&str>,
    ) -> (ImportPipeline<SqliteCatalogStore>, Arc<AtomicUsize>) {
        let mut config = ImportConfig::new(format!("https://example.com/{}", dir.display()));
        config.download_dir = dir.to_path_buf();
        config.database_path = dir.join("catalog.db");

        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            calls: calls.clone(),
            body: body.map(|b| b.as_bytes().to_vec()),
        };
        let fetcher = CatalogFetcher::new(&config, Box::new(source));
        let ledger = DownloadLedger::open_in_memory().unwrap();
        let store = SqliteCatalogStore::open_in_memory().unwrap();
        store.insert_tax_rule("IVA 16%", 16.0, TaxUse::Sale).unwrap();

        (ImportPipeline::new(config, ledger, store, fetcher), calls)
    }

    fn seed_fetch(pipeline: &ImportPipeline<SqliteCatalogStore>, path: &Path, age_seconds: i64) {
        let entry = LedgerEntry::fetch(path, "https://example.com", "", 10)
            .with_recorded_at(Utc::now() - chrono::Duration::seconds(age_seconds));
        pipeline.ledger().append(&entry).unwrap();
    }

    #[test]
    fn test_decide_cache() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("syscom_products_20250101_000000.csv");
        std::fs::write(&file, CSV).unwrap();
        let now = Utc::now();

        assert_eq!(
            decide_cache(None, now, 3600),
            CacheDecision::Fetch(FetchReason::NoPreviousFetch)
        );

        let fresh = LedgerEntry::fetch(&file, "u", "", 1)
            .with_recorded_at(now - chrono::Duration::seconds(1800));
        assert_eq!(
            decide_cache(Some(&fresh), now, 3600),
            CacheDecision::Reuse {
                path: file.clone(),
                age_seconds: 1800
            }
        );

        let stale = fresh.clone().with_recorded_at(now - chrono::Duration::seconds(3600));
        assert_eq!(
            decide_cache(Some(&stale), now, 3600),
            CacheDecision::Fetch(FetchReason::Stale { age_seconds: 3600 })
        );

        std::fs::remove_file(&file).unwrap();
        assert_eq!(
            decide_cache(Some(&fresh), now, 3600),
            CacheDecision::Fetch(FetchReason::FileMissing { path: file })
        );

        println!("✅ Cache decision test PASSED");
    }

    #[test]
    fn test_recent_file_is_reused_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("syscom_products_20250101_000000.csv");
        std::fs::write(&cached, CSV).unwrap();

        let (mut pipeline, calls) = pipeline(dir.path(), Some(CSV));
        seed_fetch(&pipeline, &cached, 1800);

        let summary = pipeline.run().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(summary.reused);
        assert_eq!(summary.csv_path, cached);
        assert_eq!(summary.reconcile.created, 2);
        assert_eq!(pipeline.stage(), PipelineStage::Done);
        assert_eq!(pipeline.store().product_count().unwrap(), 2);

        // Ledger: seeded fetch + clean
        let clean = pipeline
            .ledger()
            .most_recent(Some(LedgerAction::Clean))
            .unwrap()
            .unwrap();
        assert_eq!(clean.categories, "----");
        assert_eq!(clean.run_id.as_deref(), Some(summary.run_id.as_str()));

        println!("✅ Cache reuse test PASSED");
    }

    #[test]
    fn test_missing_cached_file_triggers_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("syscom_products_20250101_000000.csv");

        let (mut pipeline, calls) = pipeline(dir.path(), Some(CSV));
        seed_fetch(&pipeline, &cached, 1800);

        let outcome = pipeline.run_import();

        assert!(outcome.success, "{}", outcome.message);
        assert!(outcome.message.contains("fresh download"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.store().product_count().unwrap(), 2);
    }

    #[test]
    fn test_failed_download_uses_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let previous = dir.path().join("syscom_products_20250101_000000.csv");
        std::fs::write(&previous, CSV).unwrap();

        let (mut pipeline, calls) = pipeline(dir.path(), None);
        seed_fetch(&pipeline, &previous, 7200);

        let summary = pipeline.run().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!summary.reused);
        assert!(matches!(summary.fallback, Some(FetchFailure::Network(_))));
        assert_eq!(summary.csv_path, previous);
        assert_eq!(summary.reconcile.created, 2);
    }

    #[test]
    fn test_no_csv_available_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, _calls) = pipeline(dir.path(), None);

        let outcome = pipeline.run_import();

        assert!(!outcome.success);
        assert!(outcome.message.starts_with("no CSV available"));
        assert!(outcome.message.contains("connection refused"));
        assert_eq!(pipeline.stage(), PipelineStage::Abort);
        assert_eq!(pipeline.store().product_count().unwrap(), 0);
    }

    #[test]
    fn test_second_run_updates_prices_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, calls) = pipeline(dir.path(), Some(CSV));

        let first = pipeline.run().unwrap();
        assert_eq!(first.reconcile.created, 2);

        // Within the refresh period: cached file reused
        let second = pipeline.run().unwrap();
        assert!(second.reused);
        assert_eq!(second.reconcile.created, 0);
        assert_eq!(second.reconcile.updated, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.store().product_count().unwrap(), 2);
    }

    #[test]
    fn test_clean_entry_records_size_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("syscom_products_20250101_000000.csv");
        std::fs::write(&file, CSV).unwrap();

        let entry = clean_entry(&file, "run-9");
        assert_eq!(entry.action, LedgerAction::Clean);
        assert_eq!(entry.run_id.as_deref(), Some("run-9"));
        assert_eq!(entry.checksum, Some(file_checksum(&file).unwrap()));

        // Unreadable file: entry still produced, nothing invented
        let gone = clean_entry(&dir.path().join("gone.csv"), "run-9");
        assert_eq!(gone.size_label, "0.00 MB");
        assert!(gone.checksum.is_none());
    }

    #[test]
    fn test_store_open_failure_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let unreachable = dir.path().join("no").join("such").join("catalog.db");

        let err = open_catalog_store(&unreachable).err().unwrap();

        assert!(matches!(err, ImportError::Store(_)));
        assert!(err.to_string().starts_with("catalog store error"));
    }

    #[test]
    fn test_concurrent_run_same_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, calls) = pipeline(dir.path(), Some(CSV));

        let held = RunGuard::acquire(pipeline.config().identity()).unwrap();
        let err = pipeline.run().unwrap_err();
        assert!(matches!(err, ImportError::AlreadyRunning(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(held);
        assert!(pipeline.run().is_ok());

        println!("✅ Run lock test PASSED");
    }
}
