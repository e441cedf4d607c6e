// ⚖️ Reconciliation Engine - match vendor rows against the catalog
//
// Two passes:
//   1. parse and validate every row, collect the referenced codes
//   2. one existence lookup splits rows into updates and creates,
//      then the store is written: price updates, batched creates, tax
//
// Re-running on the same file is safe: codes created by an earlier (even
// partial) run are found by the lookup and become price updates.

use crate::catalog::{CatalogStore, CategoryRef, PriceUpdate, ProductDraft, ProductRef, TaxUse};
use crate::config::ImportConfig;
use crate::vendor::{parse_catalog_file, CatalogRow, RowDefaults, SkipCounts};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, error, info, warn};

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    /// Index of the first draft of the batch
    pub offset: usize,
    pub rows: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaxAssignment {
    /// Rule found and assigned to this many products
    Assigned(usize),
    NothingCreated,
    RuleMissing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Rows that passed validation
    pub processed: usize,

    /// Products actually created (failed batches excluded)
    pub created: usize,

    /// Distinct existing products whose prices were written
    pub updated: usize,

    /// Later rows repeating a code already seen in this file
    pub duplicates_folded: usize,

    pub skipped: SkipCounts,
    pub failed_batches: Vec<FailedBatch>,
    pub categories_resolved: usize,
    pub tax: TaxAssignment,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        format!(
            "{} processed, {} created, {} updated ({} duplicate rows folded, {} invalid, {} filtered, {} failed batches)",
            self.processed,
            self.created,
            self.updated,
            self.duplicates_folded,
            self.skipped.invalid(),
            self.skipped.filtered,
            self.failed_batches.len()
        )
    }
}

// ============================================================================
// CATEGORY RESOLVER
// ============================================================================

/// Walks category paths top-down, memoizing every resolved prefix
#[derive(Debug, Default)]
pub struct CategoryResolver {
    cache: HashMap<Vec<String>, CategoryRef>,
    store_calls: usize,
}

impl CategoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaf node for `levels`, creating missing segments; `None` for an empty path
    pub fn resolve<S: CatalogStore + ?Sized>(
        &mut self,
        store: &mut S,
        levels: &[String],
    ) -> Result<Option<CategoryRef>> {
        if levels.is_empty() {
            return Ok(None);
        }

        let mut parent: Option<CategoryRef> = None;
        for depth in 1..=levels.len() {
            let prefix = &levels[..depth];
            if let Some(cached) = self.cache.get(prefix) {
                parent = Some(*cached);
                continue;
            }

            let name = &levels[depth - 1];
            let node = store
                .find_or_create_category(name, parent)
                .with_context(|| format!("Failed to resolve category '{}'", prefix.join(" / ")))?;
            self.store_calls += 1;
            self.cache.insert(prefix.to_vec(), node);
            parent = Some(node);
        }

        Ok(parent)
    }

    /// Lookups that reached the store (cache misses)
    pub fn store_calls(&self) -> usize {
        self.store_calls
    }

    pub fn cached_paths(&self) -> usize {
        self.cache.len()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Drafts per `create_many` call (default: 5000)
    pub batch_size: usize,

    /// Sales tax assigned to new products (default: 16%)
    pub tax_rate: f64,

    pub tax_object_id: String,
    pub uom_category_id: i64,
}

impl ReconciliationEngine {
    pub fn new(config: &ImportConfig) -> Self {
        ReconciliationEngine {
            batch_size: config.create_batch_size.max(1),
            tax_rate: config.tax_rate,
            tax_object_id: config.tax_object_id.clone(),
            uom_category_id: config.uom_category_id,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Reconcile a sanitized vendor file against `store`.
    ///
    /// Row defects and failed create batches are reported, not returned as
    /// errors. Read errors and failed updates abort with the cause attached.
    pub fn reconcile<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        path: &Path,
        allow_list: &[String],
        margin_percent: f64,
    ) -> Result<ReconcileReport> {
        info!(path = %path.display(), "Starting CSV processing");

        let defaults = RowDefaults {
            margin_percent,
            tax_object_id: self.tax_object_id.clone(),
            uom_category_id: self.uom_category_id,
        };
        let parsed = parse_catalog_file(path, allow_list, &defaults)?;
        let processed = parsed.rows.len();

        // Single existence lookup for every referenced code
        let codes: HashSet<String> = parsed.rows.iter().map(|r| r.code.clone()).collect();
        let existing = if codes.is_empty() {
            HashMap::new()
        } else {
            store
                .find_by_codes(&codes)
                .context("Failed to look up existing products")?
        };

        let plan = plan_writes(parsed.rows, &existing);
        debug!(
            updates = plan.updates.len(),
            creates = plan.creates.len(),
            folded = plan.duplicates_folded,
            "Rows partitioned"
        );

        let updated = self.apply_updates(store, &plan.updates)?;

        let mut resolver = CategoryResolver::new();
        let mut drafts = Vec::with_capacity(plan.creates.len());
        for row in &plan.creates {
            let category = resolver.resolve(store, &row.category_levels)?;
            drafts.push(self.draft_for(row, category));
        }

        let (created_refs, failed_batches) = self.apply_creates(store, &drafts);
        let tax = self.assign_tax(store, &created_refs);

        let report = ReconcileReport {
            processed,
            created: created_refs.len(),
            updated,
            duplicates_folded: plan.duplicates_folded,
            skipped: parsed.skipped,
            failed_batches,
            categories_resolved: resolver.cached_paths(),
            tax,
        };

        info!(summary = %report.summary(), "Import completed");
        Ok(report)
    }

    fn apply_updates<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        updates: &[(ProductRef, PriceUpdate)],
    ) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        info!(count = updates.len(), "Updating existing products");
        for (product, fields) in updates {
            store
                .update(*product, fields)
                .with_context(|| format!("Failed to update product {}", product.0))?;
        }

        Ok(updates.len())
    }

    fn apply_creates<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        drafts: &[ProductDraft],
    ) -> (Vec<ProductRef>, Vec<FailedBatch>) {
        let mut created = Vec::new();
        let mut failed = Vec::new();

        if drafts.is_empty() {
            return (created, failed);
        }

        info!(
            count = drafts.len(),
            batch_size = self.batch_size,
            "Creating products in batches"
        );

        for (batch_index, chunk) in drafts.chunks(self.batch_size).enumerate() {
            let offset = batch_index * self.batch_size;
            match store.create_many(chunk) {
                Ok(refs) => {
                    info!(created = refs.len(), offset, "Product batch created");
                    created.extend(refs);
                }
                Err(e) => {
                    error!(offset, rows = chunk.len(), error = %format!("{:#}", e), "Product batch failed");
                    failed.push(FailedBatch {
                        offset,
                        rows: chunk.len(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        (created, failed)
    }

    fn assign_tax<S: CatalogStore + ?Sized>(
        &self,
        store: &mut S,
        created: &[ProductRef],
    ) -> TaxAssignment {
        if created.is_empty() {
            return TaxAssignment::NothingCreated;
        }

        let tax = match store.find_tax_rule(self.tax_rate, TaxUse::Sale) {
            Ok(Some(tax)) => tax,
            Ok(None) => {
                warn!(rate = self.tax_rate, "Sales tax rule not found; new products left untaxed");
                return TaxAssignment::RuleMissing;
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Sales tax lookup failed");
                return TaxAssignment::Failed(format!("{:#}", e));
            }
        };

        match store.assign_tax(created, tax) {
            Ok(()) => {
                info!(count = created.len(), rate = self.tax_rate, "Sales tax assigned to new products");
                TaxAssignment::Assigned(created.len())
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Sales tax assignment failed");
                TaxAssignment::Failed(format!("{:#}", e))
            }
        }
    }

    fn draft_for(&self, row: &CatalogRow, category: Option<CategoryRef>) -> ProductDraft {
        ProductDraft {
            code: row.code.clone(),
            name: row.name.clone(),
            description_sale: row.name.clone(),
            standard_price: row.base_price,
            list_price: row.sale_price,
            category,
            product_type: "consu".to_string(),
            purchase_ok: true,
            sale_ok: true,
            uom_category_id: row.uom_category_id,
            fiscal_code: row.fiscal_code.clone(),
            tax_object_id: row.tax_object_id.clone(),
        }
    }
}

// ============================================================================
// WRITE PLAN
// ============================================================================

struct WritePlan {
    /// One entry per existing product, last row's prices win
    updates: Vec<(ProductRef, PriceUpdate)>,

    /// One row per new code; first row's name/category, last row's prices
    creates: Vec<CatalogRow>,

    duplicates_folded: usize,
}

fn plan_writes(rows: Vec<CatalogRow>, existing: &HashMap<String, ProductRef>) -> WritePlan {
    let mut updates: Vec<(ProductRef, PriceUpdate)> = Vec::new();
    let mut update_index: HashMap<ProductRef, usize> = HashMap::new();
    let mut creates: Vec<CatalogRow> = Vec::new();
    let mut create_index: HashMap<String, usize> = HashMap::new();
    let mut duplicates_folded = 0;

    for row in rows {
        let prices = PriceUpdate {
            standard_price: row.base_price,
            list_price: row.sale_price,
        };

        if let Some(product) = existing.get(&row.code) {
            match update_index.get(product) {
                Some(&i) => updates[i].1 = prices,
                None => {
                    update_index.insert(*product, updates.len());
                    updates.push((*product, prices));
                }
            }
        } else if let Some(&i) = create_index.get(&row.code) {
            debug!(code = %row.code, row = row.row_number, "Repeated code folded into pending create");
            creates[i].base_price = row.base_price;
            creates[i].sale_price = row.sale_price;
            duplicates_folded += 1;
        } else {
            create_index.insert(row.code.clone(), creates.len());
            creates.push(row);
        }
    }

    WritePlan {
        updates,
        creates,
        duplicates_folded,
    }
}

// ============================================================================
// TESTS
// ============================================================================
