// 🗄️ Catalog Store - products, category tree and tax rules
//
// The reconciliation engine only talks to the `CatalogStore` trait. The
// SQLite implementation below is the store used by the binary and by tests.

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

// ============================================================================
// REFERENCES & PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductRef(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryRef(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaxRef(pub i64);

/// Which side of a sale a tax rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaxUse {
    Sale,
    Purchase,
}

impl TaxUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxUse::Sale => "sale",
            TaxUse::Purchase => "purchase",
        }
    }
}

/// Everything needed to create one product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDraft {
    pub code: String,
    pub name: String,
    pub description_sale: String,

    /// Vendor price (cost)
    pub standard_price: f64,

    /// Price with margin applied
    pub list_price: f64,

    pub category: Option<CategoryRef>,
    pub product_type: String,
    pub purchase_ok: bool,
    pub sale_ok: bool,
    pub uom_category_id: i64,
    pub fiscal_code: String,
    pub tax_object_id: String,
}

/// The only fields a re-import may touch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub standard_price: f64,
    pub list_price: f64,
}

/// Stored product as read back from the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductRef,
    pub code: String,
    pub name: String,
    pub standard_price: f64,
    pub list_price: f64,
    pub category: Option<CategoryRef>,
    pub fiscal_code: String,
    pub tax_object_id: String,
    pub uom_category_id: i64,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Key-based access to the product catalog.
///
/// `create_many` must be atomic per call: either every draft is stored or none.
pub trait CatalogStore {
    /// Existing products among `codes`
    fn find_by_codes(&self, codes: &HashSet<String>) -> Result<HashMap<String, ProductRef>>;

    fn create_many(&mut self, drafts: &[ProductDraft]) -> Result<Vec<ProductRef>>;

    fn update(&mut self, product: ProductRef, fields: &PriceUpdate) -> Result<()>;

    /// Category named `name` directly under `parent` (root when `None`)
    fn find_or_create_category(
        &mut self,
        name: &str,
        parent: Option<CategoryRef>,
    ) -> Result<CategoryRef>;

    fn find_tax_rule(&self, rate: f64, usage: TaxUse) -> Result<Option<TaxRef>>;

    /// Replace the tax set of every product with `tax`
    fn assign_tax(&mut self, products: &[ProductRef], tax: TaxRef) -> Result<()>;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Codes per `IN (...)` lookup, well under SQLite's parameter limit
const LOOKUP_CHUNK: usize = 500;

pub struct SqliteCatalogStore {
    conn: Connection,
}

impl SqliteCatalogStore {
    pub fn new(conn: Connection) -> Result<Self> {
        setup_catalog(&conn)?;
        Ok(SqliteCatalogStore { conn })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open catalog database {}", path.display()))?;
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Register a tax rule (catalog setup, not part of an import)
    pub fn insert_tax_rule(&self, name: &str, rate: f64, usage: TaxUse) -> Result<TaxRef> {
        self.conn.execute(
            "INSERT INTO taxes (name, amount, type_tax_use) VALUES (?1, ?2, ?3)",
            params![name, rate, usage.as_str()],
        )?;
        Ok(TaxRef(self.conn.last_insert_rowid()))
    }

    pub fn get_product(&self, code: &str) -> Result<Option<Product>> {
        let product = self
            .conn
            .query_row(
                "SELECT id, code, name, standard_price, list_price, category_id,
                        fiscal_code, tax_object_id, uom_category_id
                 FROM products WHERE code = ?1",
                params![code],
                |row| {
                    let category_id: Option<i64> = row.get(5)?;
                    Ok(Product {
                        id: ProductRef(row.get(0)?),
                        code: row.get(1)?,
                        name: row.get(2)?,
                        standard_price: row.get(3)?,
                        list_price: row.get(4)?,
                        category: category_id.map(CategoryRef),
                        fiscal_code: row.get(6)?,
                        tax_object_id: row.get(7)?,
                        uom_category_id: row.get(8)?,
                    })
                },
            )
            .optional()?;

        Ok(product)
    }

    pub fn product_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn category_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM categories", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn product_taxes(&self, product: ProductRef) -> Result<Vec<TaxRef>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tax_id FROM product_taxes WHERE product_id = ?1 ORDER BY tax_id")?;
        let taxes = stmt
            .query_map(params![product.0], |row| Ok(TaxRef(row.get(0)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(taxes)
    }

    /// "Root / Child / Leaf" for a category, walking parents upward
    pub fn category_path(&self, category: CategoryRef) -> Result<String> {
        let mut names = Vec::new();
        let mut current = Some(category.0);

        while let Some(id) = current {
            let (name, parent): (String, Option<i64>) = self.conn.query_row(
                "SELECT name, parent_id FROM categories WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            names.push(name);
            current = parent;
        }

        names.reverse();
        Ok(names.join(" / "))
    }
}

impl CatalogStore for SqliteCatalogStore {
    fn find_by_codes(&self, codes: &HashSet<String>) -> Result<HashMap<String, ProductRef>> {
        let mut found = HashMap::new();
        let codes: Vec<&String> = codes.iter().collect();

        for chunk in codes.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT code, id FROM products WHERE code IN ({})",
                placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, ProductRef(row.get(1)?)))
            })?;
            for row in rows {
                let (code, id) = row?;
                found.insert(code, id);
            }
        }

        Ok(found)
    }

    fn create_many(&mut self, drafts: &[ProductDraft]) -> Result<Vec<ProductRef>> {
        let tx = self.conn.transaction()?;
        let mut created = Vec::with_capacity(drafts.len());

        {
            let mut stmt = tx.prepare(
                "INSERT INTO products (
                    code, name, description_sale, standard_price, list_price,
                    category_id, product_type, purchase_ok, sale_ok,
                    uom_category_id, fiscal_code, tax_object_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for draft in drafts {
                stmt.execute(params![
                    draft.code,
                    draft.name,
                    draft.description_sale,
                    draft.standard_price,
                    draft.list_price,
                    draft.category.map(|c| c.0),
                    draft.product_type,
                    draft.purchase_ok,
                    draft.sale_ok,
                    draft.uom_category_id,
                    draft.fiscal_code,
                    draft.tax_object_id,
                ])
                .with_context(|| format!("Failed to insert product {}", draft.code))?;
                created.push(ProductRef(tx.last_insert_rowid()));
            }
        }

        tx.commit()?;
        Ok(created)
    }

    fn update(&mut self, product: ProductRef, fields: &PriceUpdate) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE products
             SET standard_price = ?1, list_price = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![fields.standard_price, fields.list_price, product.0],
        )?;

        if changed == 0 {
            anyhow::bail!("product {} not found", product.0);
        }
        Ok(())
    }

    fn find_or_create_category(
        &mut self,
        name: &str,
        parent: Option<CategoryRef>,
    ) -> Result<CategoryRef> {
        let parent_id = parent.map(|p| p.0);

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM categories WHERE name = ?1 AND parent_id IS ?2 ORDER BY id LIMIT 1",
                params![name, parent_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(CategoryRef(id));
        }

        self.conn.execute(
            "INSERT INTO categories (name, parent_id) VALUES (?1, ?2)",
            params![name, parent_id],
        )?;
        Ok(CategoryRef(self.conn.last_insert_rowid()))
    }

    fn find_tax_rule(&self, rate: f64, usage: TaxUse) -> Result<Option<TaxRef>> {
        let tax = self
            .conn
            .query_row(
                "SELECT id FROM taxes
                 WHERE ABS(amount - ?1) < 0.000001 AND type_tax_use = ?2
                 ORDER BY id LIMIT 1",
                params![rate, usage.as_str()],
                |row| Ok(TaxRef(row.get(0)?)),
            )
            .optional()?;
        Ok(tax)
    }

    fn assign_tax(&mut self, products: &[ProductRef], tax: TaxRef) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut clear = tx.prepare("DELETE FROM product_taxes WHERE product_id = ?1")?;
            let mut insert =
                tx.prepare("INSERT INTO product_taxes (product_id, tax_id) VALUES (?1, ?2)")?;
            for product in products {
                clear.execute(params![product.0])?;
                insert.execute(params![product.0, tax.0])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

pub fn setup_catalog(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            parent_id INTEGER REFERENCES categories(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            description_sale TEXT,
            standard_price REAL NOT NULL,
            list_price REAL NOT NULL,
            category_id INTEGER REFERENCES categories(id),
            product_type TEXT NOT NULL DEFAULT 'consu',
            purchase_ok INTEGER NOT NULL DEFAULT 1,
            sale_ok INTEGER NOT NULL DEFAULT 1,
            uom_category_id INTEGER NOT NULL,
            fiscal_code TEXT NOT NULL DEFAULT '',
            tax_object_id TEXT NOT NULL DEFAULT '',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS taxes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            type_tax_use TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS product_taxes (
            product_id INTEGER NOT NULL REFERENCES products(id),
            tax_id INTEGER NOT NULL REFERENCES taxes(id),
            PRIMARY KEY (product_id, tax_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_categories_name_parent ON categories(name, parent_id)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(code: &str, price: f64) -> ProductDraft {
        ProductDraft {
            code: code.to_string(),
            name: format!("Product {}", code),
            description_sale: format!("Product {}", code),
            standard_price: price,
            list_price: price * 1.15,
            category: None,
            product_type: "consu".to_string(),
            purchase_ok: true,
            sale_ok: true,
            uom_category_id: 1,
            fiscal_code: "43201500".to_string(),
            tax_object_id: "02".to_string(),
        }
    }

    #[test]
    fn test_create_and_find_by_codes() {
        let mut store = SqliteCatalogStore::open_in_memory().unwrap();
        let created = store
            .create_many(&[draft("A1", 10.0), draft("B2", 20.0)])
            .unwrap();
        assert_eq!(created.len(), 2);

        let codes: HashSet<String> = ["A1", "B2", "ZZ"].iter().map(|s| s.to_string()).collect();
        let found = store.find_by_codes(&codes).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["A1"], created[0]);
        assert!(!found.contains_key("ZZ"));

        println!("✅ Create/find test PASSED");
    }

    #[test]
    fn test_find_by_codes_spans_chunks() {
        let mut store = SqliteCatalogStore::open_in_memory().unwrap();
        let drafts: Vec<ProductDraft> = (0..1200).map(|i| draft(&format!("C{}", i), 1.0)).collect();
        store.create_many(&drafts).unwrap();

        let codes: HashSet<String> = (0..1300).map(|i| format!("C{}", i)).collect();
        assert_eq!(store.find_by_codes(&codes).unwrap().len(), 1200);
    }

    #[test]
    fn test_create_many_is_atomic() {
        let mut store = SqliteCatalogStore::open_in_memory().unwrap();
        store.create_many(&[draft("A1", 1.0)]).unwrap();

        // Second draft collides on the unique code
        let result = store.create_many(&[draft("N1", 1.0), draft("A1", 2.0)]);
        assert!(result.is_err());
        assert_eq!(store.product_count().unwrap(), 1);
        assert!(store.get_product("N1").unwrap().is_none());
    }

    #[test]
    fn test_update_touches_prices_only() {
        let mut store = SqliteCatalogStore::open_in_memory().unwrap();
        let ids = store.create_many(&[draft("A1", 10.0)]).unwrap();

        store
            .update(
                ids[0],
                &PriceUpdate {
                    standard_price: 20.0,
                    list_price: 23.0,
                },
            )
            .unwrap();

        let product = store.get_product("A1").unwrap().unwrap();
        assert_eq!(product.standard_price, 20.0);
        assert_eq!(product.list_price, 23.0);
        assert_eq!(product.name, "Product A1");

        assert!(store
            .update(ProductRef(999), &PriceUpdate { standard_price: 1.0, list_price: 1.0 })
            .is_err());
    }

    #[test]
    fn test_category_tree() {
        let mut store = SqliteCatalogStore::open_in_memory().unwrap();
        let root = store.find_or_create_category("Audio", None).unwrap();
        let child = store.find_or_create_category("Bocinas", Some(root)).unwrap();
        let again = store.find_or_create_category("Audio", None).unwrap();
        // Same name under a different parent is a different node
        let nested = store.find_or_create_category("Audio", Some(child)).unwrap();

        assert_eq!(root, again);
        assert_ne!(root, nested);
        assert_eq!(store.category_count().unwrap(), 3);
        assert_eq!(store.category_path(nested).unwrap(), "Audio / Bocinas / Audio");
    }

    #[test]
    fn test_tax_rules() {
        let mut store = SqliteCatalogStore::open_in_memory().unwrap();
        assert!(store.find_tax_rule(16.0, TaxUse::Sale).unwrap().is_none());

        store.insert_tax_rule("IVA 16% compras", 16.0, TaxUse::Purchase).unwrap();
        let sale = store.insert_tax_rule("IVA 16%", 16.0, TaxUse::Sale).unwrap();
        assert_eq!(store.find_tax_rule(16.0, TaxUse::Sale).unwrap(), Some(sale));

        let ids = store.create_many(&[draft("A1", 1.0), draft("A2", 1.0)]).unwrap();
        store.assign_tax(&ids, sale).unwrap();
        store.assign_tax(&ids, sale).unwrap();
        assert_eq!(store.product_taxes(ids[0]).unwrap(), vec![sale]);
        assert_eq!(store.product_taxes(ids[1]).unwrap(), vec![sale]);
    }
}
