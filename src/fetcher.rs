// 🌐 Catalog Fetcher - download the vendor CSV, fall back to the last good file
//
// Soft failures (network error, timeout, non-2xx, HTML instead of CSV) never
// abort on their own: the newest `fetch` file in the ledger is reused when it
// still exists. Only when there is nothing to fall back to does the fetch
// fail with `NoCsvAvailable`.

use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult};
use crate::ledger::{file_checksum, DownloadLedger, LedgerAction, LedgerEntry};
use crate::sanitizer::{backup_path_for, BACKUP_SUFFIX};
use anyhow::{Context, Result};
use chrono::Local;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const FILE_PREFIX: &str = "syscom_products_";
pub const FILE_EXTENSION: &str = ".csv";

const MIB: f64 = 1024.0 * 1024.0;

// ============================================================================
// SOURCE (HTTP seam)
// ============================================================================

/// An opened response, body not yet read
pub struct SourceResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// Where the catalog bytes come from
pub trait CatalogSource: Send + Sync {
    fn open(&self, url: &str) -> Result<SourceResponse>;
}

/// Blocking HTTP source with browser-like headers
pub struct HttpSource {
    client: HttpClient,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"),
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/csv,application/csv,text/plain,*/*"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("es-MX,es;q=0.9,en;q=0.8"),
        );

        let client = HttpClient::builder()
            .timeout(timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(HttpSource { client })
    }
}

impl CatalogSource for HttpSource {
    fn open(&self, url: &str) -> Result<SourceResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Request to {} failed", truncate_url(url)))?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let content_type = header(CONTENT_TYPE);
        let content_length = header(CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());

        Ok(SourceResponse {
            status: response.status().as_u16(),
            content_type,
            content_length,
            body: Box::new(response),
        })
    }
}

fn truncate_url(url: &str) -> &str {
    match url.char_indices().nth(100) {
        Some((idx, _)) => &url[..idx],
        None => url,
    }
}

// ============================================================================
// PROGRESS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some(self.downloaded as f64 * 100.0 / total as f64),
            _ => None,
        }
    }

    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.downloaded as f64 / MIB / secs
        } else {
            0.0
        }
    }
}

/// Receives download progress; the fetcher decides the cadence
pub trait ProgressReporter {
    fn on_progress(&mut self, progress: &DownloadProgress);

    fn on_complete(&mut self, _progress: &DownloadProgress) {}
}

/// Reports through `tracing`
#[derive(Debug, Default)]
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn on_progress(&mut self, progress: &DownloadProgress) {
        let done = match progress.percent() {
            Some(pct) => format!("{:.1}%", pct),
            None => format!("{:.2} MB", progress.downloaded as f64 / MIB),
        };
        info!(
            "Downloading: {} | {:.2} MB/s | {:.0}s",
            done,
            progress.throughput_mib_s(),
            progress.elapsed.as_secs_f64()
        );
    }

    fn on_complete(&mut self, progress: &DownloadProgress) {
        info!(
            size_mb = format!("{:.2}", progress.downloaded as f64 / MIB),
            seconds = format!("{:.1}", progress.elapsed.as_secs_f64()),
            avg_mb_s = format!("{:.2}", progress.throughput_mib_s()),
            "Download completed"
        );
    }
}

/// Fires every `byte_step` bytes or every `interval`, whichever comes first
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    byte_step: u64,
    interval: Duration,
    last_bytes: u64,
    last_at: Duration,
}

impl ProgressThrottle {
    pub fn new(byte_step: u64, interval: Duration) -> Self {
        ProgressThrottle {
            byte_step,
            interval,
            last_bytes: 0,
            last_at: Duration::ZERO,
        }
    }

    pub fn should_report(&mut self, downloaded: u64, elapsed: Duration) -> bool {
        let due = downloaded.saturating_sub(self.last_bytes) >= self.byte_step
            || elapsed.saturating_sub(self.last_at) >= self.interval;
        if due {
            self.last_bytes = downloaded;
            self.last_at = elapsed;
        }
        due
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Why a download was not accepted
#[derive(Debug, Clone, PartialEq)]
pub enum FetchFailure {
    Network(String),
    Status(u16),
    /// Server answered with HTML (login wall, block page)
    HtmlPayload(String),
    Timeout(Duration),
    Io(String),
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Network(msg) => write!(f, "network error: {}", msg),
            FetchFailure::Status(code) => write!(f, "HTTP status {}", code),
            FetchFailure::HtmlPayload(ct) => write!(f, "server returned HTML ({})", ct),
            FetchFailure::Timeout(limit) => write!(f, "download exceeded {}s", limit.as_secs()),
            FetchFailure::Io(msg) => write!(f, "write error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Downloaded {
        path: PathBuf,
        bytes: u64,
        entry: LedgerEntry,
        pruned: PruneReport,
    },
    /// Download failed softly; reusing the newest ledger file
    Fallback { path: PathBuf, reason: FetchFailure },
}

impl FetchOutcome {
    pub fn path(&self) -> &Path {
        match self {
            FetchOutcome::Downloaded { path, .. } => path,
            FetchOutcome::Fallback { path, .. } => path,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, FetchOutcome::Fallback { .. })
    }
}

// ============================================================================
// FETCHER
// ============================================================================

pub struct CatalogFetcher {
    source: Box<dyn CatalogSource>,
    url: String,
    download_dir: PathBuf,
    categories: String,
    chunk_size: usize,
    timeout: Duration,
    progress_bytes: u64,
    progress_interval: Duration,
}

impl CatalogFetcher {
    pub fn new(config: &ImportConfig, source: Box<dyn CatalogSource>) -> Self {
        CatalogFetcher {
            source,
            url: config.source_url.clone(),
            download_dir: config.download_dir.clone(),
            categories: config.category_allow_list.clone().unwrap_or_default(),
            chunk_size: config.chunk_size.max(1),
            timeout: Duration::from_secs(config.download_timeout_secs),
            progress_bytes: config.progress_bytes,
            progress_interval: Duration::from_secs(config.progress_interval_secs),
        }
    }

    /// Fetcher over HTTP with the configured timeout
    pub fn http(config: &ImportConfig) -> Result<Self> {
        let source = HttpSource::new(Duration::from_secs(config.download_timeout_secs))?;
        Ok(Self::new(config, Box::new(source)))
    }

    /// Download a fresh file, or fall back to the last good one.
    pub fn fetch(
        &self,
        ledger: &DownloadLedger,
        reporter: &mut dyn ProgressReporter,
        run_id: &str,
    ) -> ImportResult<FetchOutcome> {
        info!(url = %truncate_url(&self.url), "Downloading CSV");

        let (path, bytes) = match self.download(reporter) {
            Ok(done) => done,
            Err(failure) => {
                error!(reason = %failure, "CSV download failed");
                return self.fall_back(ledger, failure);
            }
        };

        let checksum = file_checksum(&path).map_err(ImportError::Ledger)?;
        let entry = LedgerEntry::fetch(&path, &self.url, &self.categories, bytes)
            .with_run_id(run_id)
            .with_checksum(checksum);
        let entry = ledger.append(&entry).map_err(ImportError::Ledger)?;
        info!(id = ?entry.id, path = %path.display(), "Download recorded in ledger");

        let pruned = prune_downloads(&self.download_dir, &path);

        Ok(FetchOutcome::Downloaded {
            path,
            bytes,
            entry,
            pruned,
        })
    }

    fn fall_back(&self, ledger: &DownloadLedger, failure: FetchFailure) -> ImportResult<FetchOutcome> {
        let previous = ledger
            .most_recent(Some(LedgerAction::Fetch))
            .map_err(ImportError::Ledger)?;

        match previous {
            Some(entry) if entry.file_exists() => {
                warn!(
                    path = %entry.file_path.display(),
                    reason = %failure,
                    "Reusing previous download from the ledger"
                );
                Ok(FetchOutcome::Fallback {
                    path: entry.file_path,
                    reason: failure,
                })
            }
            _ => Err(ImportError::NoCsvAvailable {
                reason: failure.to_string(),
            }),
        }
    }

    /// Stream the response to a fresh timestamped file
    fn download(&self, reporter: &mut dyn ProgressReporter) -> Result<(PathBuf, u64), FetchFailure> {
        let started = Instant::now();

        let response = self
            .source
            .open(&self.url)
            .map_err(|e| FetchFailure::Network(format!("{:#}", e)))?;

        if !(200..300).contains(&response.status) {
            return Err(FetchFailure::Status(response.status));
        }

        let content_type = response.content_type.clone().unwrap_or_default();
        if content_type.to_ascii_lowercase().contains("text/html") {
            return Err(FetchFailure::HtmlPayload(content_type));
        }

        if let Some(total) = response.content_length {
            info!(size_mb = format!("{:.2}", total as f64 / MIB), "Remote file size");
        }

        fs::create_dir_all(&self.download_dir).map_err(|e| FetchFailure::Io(e.to_string()))?;
        let path = self.download_dir.join(download_file_name(Local::now()));
        let part_path = path.with_extension("csv.part");

        let result = self.stream_to(response, &part_path, started, reporter);
        match result {
            Ok(bytes) => {
                fs::rename(&part_path, &path).map_err(|e| FetchFailure::Io(e.to_string()))?;
                Ok((path, bytes))
            }
            Err(failure) => {
                let _ = fs::remove_file(&part_path);
                Err(failure)
            }
        }
    }

    fn stream_to(
        &self,
        response: SourceResponse,
        part_path: &Path,
        started: Instant,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64, FetchFailure> {
        let io_err = |e: std::io::Error| FetchFailure::Io(e.to_string());

        let total = response.content_length;
        let mut body = response.body;
        let mut writer = BufWriter::new(File::create(part_path).map_err(io_err)?);
        let mut throttle = ProgressThrottle::new(self.progress_bytes, self.progress_interval);
        let mut buf = vec![0u8; self.chunk_size];
        let mut downloaded: u64 = 0;

        loop {
            if started.elapsed() > self.timeout {
                return Err(FetchFailure::Timeout(self.timeout));
            }

            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(FetchFailure::Timeout(self.timeout))
                }
                Err(e) => return Err(FetchFailure::Network(e.to_string())),
            };

            writer.write_all(&buf[..n]).map_err(io_err)?;
            downloaded += n as u64;

            let elapsed = started.elapsed();
            if throttle.should_report(downloaded, elapsed) {
                reporter.on_progress(&DownloadProgress {
                    downloaded,
                    total,
                    elapsed,
                });
            }
        }

        writer.flush().map_err(io_err)?;
        reporter.on_complete(&DownloadProgress {
            downloaded,
            total,
            elapsed: started.elapsed(),
        });

        Ok(downloaded)
    }
}

/// `syscom_products_<YYYYMMDD_HHMMSS>.csv`
pub fn download_file_name(at: chrono::DateTime<Local>) -> String {
    format!("{}{}{}", FILE_PREFIX, at.format("%Y%m%d_%H%M%S"), FILE_EXTENSION)
}

/// Delete every earlier download in `dir`, and its sanitize backup, except
/// `keep`. Best effort.
pub fn prune_downloads(dir: &Path, keep: &Path) -> PruneReport {
    let keep_backup = backup_path_for(keep);
    let mut report = PruneReport::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Could not list download directory");
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path == keep || path == keep_backup {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stem = name.strip_suffix(BACKUP_SUFFIX).unwrap_or(&*name);
        if !(stem.starts_with(FILE_PREFIX) && stem.ends_with(FILE_EXTENSION)) {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed old download");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not remove old download");
                report.failed.push((path, e.to_string()));
            }
        }
    }

    report
}
