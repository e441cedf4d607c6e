// 🧹 CSV Sanitizer - rewrite a vendor file as clean UTF-8, line by line
//
// Sequence for `<path>`:
//   1. stream `<path>` → `<path>_` repairing every line
//   2. copy `<path>` → `<path>_bak`
//   3. rename `<path>_` → `<path>`
// The original is never touched until the repaired copy is fully written.

use crate::config::RepairStrategy;
use crate::encoding::{DecodePath, EncodingRepairer};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SanitizeReport {
    /// Lines written to the output (a trailing line left empty by repair is
    /// dropped, not counted)
    pub lines: usize,

    /// Lines that needed at least one excision
    pub lines_repaired: usize,

    /// Total bytes dropped across the file
    pub bytes_excised: usize,

    /// Lines decoded through Windows-1252 (transcode strategy)
    pub lines_transcoded: usize,

    /// Lines that received U+FFFD (transcode strategy)
    pub lines_substituted: usize,

    pub backup_path: PathBuf,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.lines_repaired == 0 && self.lines_transcoded == 0 && self.lines_substituted == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} lines, {} repaired ({} bytes excised), {} transcoded, {} substituted",
            self.lines,
            self.lines_repaired,
            self.bytes_excised,
            self.lines_transcoded,
            self.lines_substituted
        )
    }
}

// ============================================================================
// BYTE EXCISION
// ============================================================================

/// Drop offending bytes one at a time until the buffer decodes.
/// Returns the text and how many bytes were removed.
pub fn excise_invalid_bytes(mut raw: Vec<u8>) -> (String, usize) {
    let mut excised = 0;

    loop {
        match std::str::from_utf8(&raw) {
            Ok(_) => break,
            Err(err) => {
                // Exactly one byte per pass, at the reported offset
                raw.remove(err.valid_up_to());
                excised += 1;
            }
        }
    }

    // The loop only exits once `raw` is valid UTF-8
    let text = String::from_utf8(raw).unwrap_or_default();
    (text, excised)
}

/// Appended to a sanitized file's name for the untouched original
pub const BACKUP_SUFFIX: &str = "_bak";

pub fn backup_path_for(path: &Path) -> PathBuf {
    sibling_with_suffix(path, BACKUP_SUFFIX)
}

fn temp_path_for(path: &Path) -> PathBuf {
    sibling_with_suffix(path, "_")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

// ============================================================================
// SANITIZER
// ============================================================================

#[derive(Debug, Clone)]
pub struct CsvSanitizer {
    strategy: RepairStrategy,
    repairer: EncodingRepairer,
}

impl CsvSanitizer {
    pub fn new(strategy: RepairStrategy) -> Self {
        CsvSanitizer {
            strategy,
            repairer: EncodingRepairer::new(),
        }
    }

    pub fn strategy(&self) -> RepairStrategy {
        self.strategy
    }

    /// Repair `path` in place, leaving the original at `<path>_bak`.
    ///
    /// Decode problems are always repaired; only I/O errors are returned.
    pub fn sanitize(&self, path: &Path) -> Result<SanitizeReport> {
        let temp_path = temp_path_for(path);
        let backup_path = backup_path_for(path);

        info!(path = %path.display(), strategy = ?self.strategy, "Sanitizing CSV file");

        let mut report = self
            .rewrite(path, &temp_path)
            .with_context(|| format!("Failed to write repaired copy {}", temp_path.display()))?;

        fs::copy(path, &backup_path).with_context(|| {
            format!(
                "Failed to back up {} to {}",
                path.display(),
                backup_path.display()
            )
        })?;
        debug!(backup = %backup_path.display(), "Backup written");

        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to replace {} with {}",
                path.display(),
                temp_path.display()
            )
        })?;

        report.backup_path = backup_path;
        info!(summary = %report.summary(), "CSV file sanitized");

        Ok(report)
    }

    fn rewrite(&self, input: &Path, output: &Path) -> Result<SanitizeReport> {
        let reader = File::open(input)
            .with_context(|| format!("Failed to open {}", input.display()))?;
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(File::create(output)?);

        let mut report = SanitizeReport::default();
        let mut raw = Vec::new();
        let mut line_number = 0;

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            line_number += 1;

            let text = match self.strategy {
                RepairStrategy::Excise => {
                    let (text, excised) = excise_invalid_bytes(raw.clone());
                    if excised > 0 {
                        warn!(line = line_number, bytes = excised, "Dropped undecodable bytes");
                        report.lines_repaired += 1;
                        report.bytes_excised += excised;
                    }
                    text
                }
                RepairStrategy::Transcode => {
                    let decoded = self.repairer.decode_line(&raw);
                    match decoded.path {
                        DecodePath::Strict => {}
                        DecodePath::Windows1252 => report.lines_transcoded += 1,
                        DecodePath::Substituted => {
                            warn!(line = line_number, "Unrecoverable bytes replaced with U+FFFD");
                            report.lines_substituted += 1;
                        }
                    }
                    decoded.text
                }
            };

            // Unterminated last line made only of bad bytes
            if text.is_empty() {
                debug!(line = line_number, "Line empty after repair, dropped");
                continue;
            }

            writer.write_all(text.as_bytes())?;
            report.lines += 1;
        }

        writer.flush()?;
        Ok(report)
    }
}

impl Default for CsvSanitizer {
    fn default() -> Self {
        Self::new(RepairStrategy::Excise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excise_multiple_non_contiguous_bytes() {
        let (text, excised) = excise_invalid_bytes(b"a\xffb\xfec\x80d".to_vec());
        assert_eq!(text, "abcd");
        assert_eq!(excised, 3);

        let (text, excised) = excise_invalid_bytes("ñandú".as_bytes().to_vec());
        assert_eq!(text, "ñandú");
        assert_eq!(excised, 0);
    }

    #[test]
    fn test_excise_truncated_sequence_at_end() {
        // Lead byte of a 3-byte sequence with one continuation, then newline
        let (text, excised) = excise_invalid_bytes(b"abc\xe2\x82\n".to_vec());
        assert_eq!(text, "abc\n");
        assert_eq!(excised, 2);

        let (text, _) = excise_invalid_bytes(b"\xff\xff".to_vec());
        assert_eq!(text, "");
    }

    #[test]
    fn test_sanitize_file_preserves_lines_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syscom_products_20250101_000000.csv");
        let original: Vec<u8> =
            b"Modelo,T\xc3\xadtulo\nA1,Cable\xff HDMI\nA2,Switch \xfe8p\nA3,ok\n".to_vec();
        fs::write(&path, &original).unwrap();

        let report = CsvSanitizer::default().sanitize(&path).unwrap();

        assert_eq!(report.lines, 4);
        assert_eq!(report.lines_repaired, 2);
        assert_eq!(report.bytes_excised, 2);

        let cleaned = fs::read(&path).unwrap();
        let text = String::from_utf8(cleaned.clone()).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(!cleaned.contains(&0xff));
        assert!(!cleaned.contains(&0xfe));
        assert!(text.contains("Título"));
        assert!(text.contains("Cable HDMI"));

        let backup = fs::read(&report.backup_path).unwrap();
        assert_eq!(backup, original);
        assert!(!temp_path_for(&path).exists());

        println!("✅ Sanitize file test PASSED: {}", report.summary());
    }

    #[test]
    fn test_transcode_strategy_counts_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        fs::write(&path, b"ok\nC\xe1mara\nbad\x81\n").unwrap();

        let report = CsvSanitizer::new(RepairStrategy::Transcode)
            .sanitize(&path)
            .unwrap();

        assert_eq!(report.lines, 3);
        assert_eq!(report.lines_transcoded, 1);
        assert_eq!(report.lines_substituted, 1);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "ok\nCámara\nbad\u{FFFD}\n");
    }

    #[test]
    fn test_trailing_line_of_only_bad_bytes_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.csv");
        fs::write(&path, b"a\nb\n\xff").unwrap();

        let report = CsvSanitizer::default().sanitize(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "a\nb\n");
        assert_eq!(report.lines, written.lines().count());
        assert_eq!(report.bytes_excised, 1);
        assert_eq!(fs::read(&report.backup_path).unwrap(), b"a\nb\n\xff".to_vec());
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CsvSanitizer::default().sanitize(&dir.path().join("nope.csv"));
        assert!(result.is_err());
    }

    #[test]
    fn test_sibling_paths() {
        let p = Path::new("/tmp/a.csv");
        assert_eq!(backup_path_for(p), PathBuf::from("/tmp/a.csv_bak"));
        assert_eq!(temp_path_for(p), PathBuf::from("/tmp/a.csv_"));
    }
}
