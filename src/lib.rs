// Syscom Catalog Import - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod config;
pub mod logging;
pub mod encoding;   // Line decoding: UTF-8 → Windows-1252 → U+FFFD
pub mod sanitizer;  // In-place CSV repair with backup
pub mod ledger;     // Download/clean audit trail (SQLite)
pub mod fetcher;    // HTTP download with fallback to the ledger
pub mod vendor;     // Vendor CSV → CatalogRow mapping
pub mod catalog;    // Catalog store interface + SQLite store
pub mod reconcile;  // Create-or-update against the catalog
pub mod pipeline;   // run_import() orchestration

// Re-export commonly used types
pub use error::{ImportError, ImportResult};
pub use config::{ImportConfig, LoggingConfig, RepairStrategy};
pub use logging::init_logging;
pub use encoding::{DecodePath, DecodedLine, EncodingRepairer};
pub use sanitizer::{CsvSanitizer, SanitizeReport};
pub use ledger::{DownloadLedger, LedgerAction, LedgerEntry};
pub use fetcher::{
    CatalogFetcher, CatalogSource, FetchFailure, FetchOutcome, HttpSource,
    ProgressReporter, PruneReport, SourceResponse,
};
pub use vendor::{CatalogRow, ParsedCatalog, SkipCounts};
pub use catalog::{
    CatalogStore, CategoryRef, PriceUpdate, ProductDraft, ProductRef,
    SqliteCatalogStore, TaxRef, TaxUse,
};
pub use reconcile::{
    CategoryResolver, ReconcileReport, ReconciliationEngine, TaxAssignment,
};
pub use pipeline::{ImportOutcome, ImportPipeline, PipelineStage, RunSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
