// 📄 Vendor CSV - the fixed Syscom product export, parsed into typed rows
//
// Header-keyed columns:
//   Modelo | Título | Su Precio | Menu Nvl 1 | Menu Nvl 2 | Menu Nvl 3 | Código Fiscal
// Any other columns are ignored.

use crate::config::clean_category;
use anyhow::{Context, Result};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// ============================================================================
// RAW RECORD (as it appears in the file)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VendorRecord {
    pub code: String,
    pub title: String,
    pub price: String,
    pub menu_level_1: String,
    pub menu_level_2: String,
    pub menu_level_3: String,
    pub fiscal_code: String,
}

impl Default for VendorRecord {
    fn default() -> Self {
        VendorRecord {
            code: String::new(),
            title: String::new(),
            // Missing price column reads as zero
            price: "0".to_string(),
            menu_level_1: String::new(),
            menu_level_2: String::new(),
            menu_level_3: String::new(),
            fiscal_code: String::new(),
        }
    }
}

/// Header positions of the columns we read. Rows may be shorter than the
/// header; absent trailing cells read as empty.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    code: Option<usize>,
    title: Option<usize>,
    price: Option<usize>,
    menu_level_1: Option<usize>,
    menu_level_2: Option<usize>,
    menu_level_3: Option<usize>,
    fiscal_code: Option<usize>,
}

impl ColumnMap {
    pub fn from_headers(headers: &StringRecord) -> Self {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        ColumnMap {
            code: find("Modelo"),
            title: find("Título"),
            price: find("Su Precio"),
            menu_level_1: find("Menu Nvl 1"),
            menu_level_2: find("Menu Nvl 2"),
            menu_level_3: find("Menu Nvl 3"),
            fiscal_code: find("Código Fiscal"),
        }
    }

    /// Columns a row cannot be imported without
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.code.is_none() {
            missing.push("Modelo");
        }
        if self.title.is_none() {
            missing.push("Título");
        }
        if self.price.is_none() {
            missing.push("Su Precio");
        }
        missing
    }

    pub fn read(&self, record: &StringRecord) -> VendorRecord {
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(|v| v.to_string())
        };
        VendorRecord {
            code: cell(self.code).unwrap_or_default(),
            title: cell(self.title).unwrap_or_default(),
            price: cell(self.price).unwrap_or_else(|| "0".to_string()),
            menu_level_1: cell(self.menu_level_1).unwrap_or_default(),
            menu_level_2: cell(self.menu_level_2).unwrap_or_default(),
            menu_level_3: cell(self.menu_level_3).unwrap_or_default(),
            fiscal_code: cell(self.fiscal_code).unwrap_or_default(),
        }
    }
}

// ============================================================================
// CATALOG ROW (validated)
// ============================================================================

/// Fixed per-import values stamped on every row
#[derive(Debug, Clone, PartialEq)]
pub struct RowDefaults {
    pub margin_percent: f64,
    pub tax_object_id: String,
    pub uom_category_id: i64,
}

/// One vendor row that survived filtering and validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    /// 1-based data row number (header excluded)
    pub row_number: usize,
    pub code: String,
    pub name: String,
    pub base_price: f64,
    pub sale_price: f64,

    /// Non-empty category levels, top first
    pub category_levels: Vec<String>,

    pub fiscal_code: String,
    pub tax_object_id: String,
    pub uom_category_id: i64,
}

impl CatalogRow {
    /// Levels joined with " / ", empty for uncategorized rows
    pub fn category_path(&self) -> String {
        self.category_levels.join(" / ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Top-level category not in the allow-list
    CategoryFiltered,
    MissingCode,
    MissingName,
    InvalidPrice(String),
}

/// Per-reason skip tallies for one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub filtered: usize,
    pub missing_code: usize,
    pub missing_name: usize,
    pub invalid_price: usize,
}

impl SkipCounts {
    fn record(&mut self, reason: &SkipReason) {
        match reason {
            SkipReason::CategoryFiltered => self.filtered += 1,
            SkipReason::MissingCode => self.missing_code += 1,
            SkipReason::MissingName => self.missing_name += 1,
            SkipReason::InvalidPrice(_) => self.invalid_price += 1,
        }
    }

    /// Rows rejected for bad data (filtered rows are not defects)
    pub fn invalid(&self) -> usize {
        self.missing_code + self.missing_name + self.invalid_price
    }
}

/// Result of the parse pass
#[derive(Debug, Clone, Default)]
pub struct ParsedCatalog {
    pub rows: Vec<CatalogRow>,
    pub skipped: SkipCounts,
}

// ============================================================================
// FIELD PARSING
// ============================================================================

/// Decimal price; commas are thousands separators
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// base × (1 + margin/100), rounded to cents
pub fn sale_price(base: f64, margin_percent: f64) -> f64 {
    let raw = base * (1.0 + margin_percent / 100.0);
    (raw * 100.0).round() / 100.0
}

/// Build a validated row, or say why the record is skipped
pub fn build_row(
    row_number: usize,
    record: &VendorRecord,
    allow_list: &[String],
    defaults: &RowDefaults,
) -> std::result::Result<CatalogRow, SkipReason> {
    let top_level = record.menu_level_1.trim();

    if !allow_list.is_empty() {
        let compared = clean_category(top_level);
        if !allow_list.iter().any(|allowed| *allowed == compared) {
            return Err(SkipReason::CategoryFiltered);
        }
    }

    let code = record.code.trim();
    if code.is_empty() {
        return Err(SkipReason::MissingCode);
    }

    let name = record.title.trim();
    if name.is_empty() {
        return Err(SkipReason::MissingName);
    }

    let base_price = parse_price(&record.price)
        .ok_or_else(|| SkipReason::InvalidPrice(record.price.trim().to_string()))?;

    let category_levels = [
        top_level,
        record.menu_level_2.trim(),
        record.menu_level_3.trim(),
    ]
    .iter()
    .filter(|level| !level.is_empty())
    .map(|level| level.to_string())
    .collect();

    Ok(CatalogRow {
        row_number,
        code: code.to_string(),
        name: name.to_string(),
        base_price,
        sale_price: sale_price(base_price, defaults.margin_percent),
        category_levels,
        fiscal_code: record.fiscal_code.trim().to_string(),
        tax_object_id: defaults.tax_object_id.clone(),
        uom_category_id: defaults.uom_category_id,
    })
}

// ============================================================================
// FILE PARSING
// ============================================================================

/// Open a file for CSV reading, skipping a leading UTF-8 BOM
fn open_without_bom(path: &Path) -> Result<impl Read> {
    let file = File::open(path).with_context(|| format!("Failed to open CSV file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let has_bom = reader.fill_buf()?.starts_with(UTF8_BOM);
    if has_bom {
        reader.consume(UTF8_BOM.len());
    }

    Ok(reader)
}

/// Pass 1: read every row, keep the ones that validate
pub fn parse_catalog_file(
    path: &Path,
    allow_list: &[String],
    defaults: &RowDefaults,
) -> Result<ParsedCatalog> {
    let reader = open_without_bom(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(reader);

    let mut parsed = ParsedCatalog::default();

    let headers = rdr
        .headers()
        .with_context(|| format!("Failed to read CSV header of {}", path.display()))?
        .clone();
    let columns = ColumnMap::from_headers(&headers);
    let missing = columns.missing_required();
    if !missing.is_empty() {
        warn!(columns = ?missing, "CSV header lacks expected columns");
    }

    for (index, result) in rdr.records().enumerate() {
        let row_number = index + 1;
        let raw = result.with_context(|| format!("Failed to read CSV row {}", row_number))?;
        let record = columns.read(&raw);

        match build_row(row_number, &record, allow_list, defaults) {
            Ok(row) => parsed.rows.push(row),
            Err(reason) => {
                match &reason {
                    SkipReason::CategoryFiltered => {}
                    SkipReason::MissingCode => {
                        debug!(row = row_number, "Skipping row without product code")
                    }
                    SkipReason::MissingName => {
                        debug!(row = row_number, code = %record.code.trim(), "Skipping row without name")
                    }
                    SkipReason::InvalidPrice(price) => {
                        warn!(row = row_number, code = %record.code.trim(), price = %price, "Skipping row with invalid price")
                    }
                }
                parsed.skipped.record(&reason);
            }
        }
    }

    info!(
        rows = parsed.rows.len(),
        filtered = parsed.skipped.filtered,
        invalid = parsed.skipped.invalid(),
        "CSV parsing completed"
    );

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RowDefaults {
        RowDefaults {
            margin_percent: 15.0,
            tax_object_id: "02".to_string(),
            uom_category_id: 1,
        }
    }

    fn record(code: &str, title: &str, price: &str, menu1: &str) -> VendorRecord {
        VendorRecord {
            code: code.to_string(),
            title: title.to_string(),
            price: price.to_string(),
            menu_level_1: menu1.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("1,234.56"), Some(1234.56));
        assert_eq!(parse_price(" 10.00 "), Some(10.0));
        assert_eq!(parse_price("abc"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("NaN"), None);
        assert_eq!(parse_price("inf"), None);

        println!("✅ Price parsing test PASSED");
    }

    #[test]
    fn test_sale_price_rounds_to_cents() {
        assert_eq!(sale_price(20.0, 15.0), 23.0);
        assert_eq!(sale_price(10.0, 0.0), 10.0);
        assert_eq!(sale_price(99.99, 10.0), 109.99);
    }

    #[test]
    fn test_build_row_category_levels() {
        let mut rec = record("A1", "Audífonos", "100", "Electronics");
        rec.menu_level_2 = " Audio ".to_string();
        rec.menu_level_3 = "Headphones".to_string();
        rec.fiscal_code = "52161500".to_string();

        let row = build_row(1, &rec, &[], &defaults()).unwrap();
        assert_eq!(row.category_path(), "Electronics / Audio / Headphones");
        assert_eq!(row.sale_price, 115.0);
        assert_eq!(row.fiscal_code, "52161500");
        assert_eq!(row.tax_object_id, "02");

        // Empty middle level is dropped
        let mut rec = record("A2", "Cable", "1", "Cables");
        rec.menu_level_3 = "HDMI".to_string();
        let row = build_row(2, &rec, &[], &defaults()).unwrap();
        assert_eq!(row.category_path(), "Cables / HDMI");

        let row = build_row(3, &record("A3", "X", "1", ""), &[], &defaults()).unwrap();
        assert_eq!(row.category_path(), "");
    }

    #[test]
    fn test_build_row_skips() {
        let d = defaults();
        assert_eq!(
            build_row(1, &record("", "Name", "1", "Tools"), &[], &d),
            Err(SkipReason::MissingCode)
        );
        assert_eq!(
            build_row(1, &record("A1", "  ", "1", "Tools"), &[], &d),
            Err(SkipReason::MissingName)
        );
        assert_eq!(
            build_row(1, &record("A1", "Name", "abc", "Tools"), &[], &d),
            Err(SkipReason::InvalidPrice("abc".to_string()))
        );
    }

    #[test]
    fn test_allow_list_filter_trims_quotes() {
        let allow = vec!["Tools".to_string(), "Audio".to_string()];
        let d = defaults();

        assert!(build_row(1, &record("A1", "N", "1", " \"Tools\" "), &allow, &d).is_ok());
        assert!(build_row(1, &record("A1", "N", "1", "'Audio'"), &allow, &d).is_ok());
        assert_eq!(
            build_row(1, &record("A1", "N", "1", "Video"), &allow, &d),
            Err(SkipReason::CategoryFiltered)
        );
    }

    #[test]
    fn test_parse_file_with_bom_and_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let mut content = UTF8_BOM.to_vec();
        content.extend_from_slice(
            "Modelo,Título,Marca,Su Precio,Menu Nvl 1,Menu Nvl 2,Menu Nvl 3,Código Fiscal\n\
             A1,Widget,ACME,\"1,234.56\",Tools,Hand,,27111700\n\
             A2,Gadget,ACME,abc,Tools,,,\n\
             ,NoCode,ACME,5,Tools,,,\n\
             A3,Short row,ACME,7\n"
                .as_bytes(),
        );
        std::fs::write(&path, content).unwrap();

        let parsed = parse_catalog_file(&path, &[], &defaults()).unwrap();

        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].code, "A1");
        assert_eq!(parsed.rows[0].base_price, 1234.56);
        assert_eq!(parsed.rows[0].category_path(), "Tools / Hand");
        assert_eq!(parsed.rows[0].fiscal_code, "27111700");
        assert_eq!(parsed.rows[1].code, "A3");
        assert!(parsed.rows[1].category_levels.is_empty());
        assert_eq!(parsed.skipped.invalid_price, 1);
        assert_eq!(parsed.skipped.missing_code, 1);

        println!("✅ CSV file parsing test PASSED");
    }

    #[test]
    fn test_truncated_rows_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        std::fs::write(
            &path,
            "Modelo, Título ,Su Precio,Menu Nvl 1,Menu Nvl 2,Menu Nvl 3,Código Fiscal\n\
             B1\n\
             B2,Only a name\n\
             B3,Router,250.00,Redes,Routers,,43222600\n",
        )
        .unwrap();

        let parsed = parse_catalog_file(&path, &[], &defaults()).unwrap();

        // B1 lacks a name; B2 has no price cell and reads as zero
        assert_eq!(parsed.skipped.missing_name, 1);
        let codes: Vec<&str> = parsed.rows.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["B2", "B3"]);
        assert_eq!(parsed.rows[0].base_price, 0.0);
        assert_eq!(parsed.rows[1].name, "Router");
        assert_eq!(parsed.rows[1].category_path(), "Redes / Routers");
        assert_eq!(parsed.rows[1].row_number, 3);

        println!("✅ Truncated row test PASSED");
    }

    #[test]
    fn test_column_map_reports_missing_headers() {
        let headers = StringRecord::from(vec!["Modelo", "Precio"]);
        let columns = ColumnMap::from_headers(&headers);
        assert_eq!(columns.missing_required(), vec!["Título", "Su Precio"]);

        let record = columns.read(&StringRecord::from(vec!["X1"]));
        assert_eq!(record.code, "X1");
        assert_eq!(record.title, "");
        assert_eq!(record.price, "0");
    }
}
