use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use stockroom_core::stock::StockTransition;
use stockroom_core::types::{
    Category, NewCategory, NewProduct, Product, ProductFilter, StockHistoryEntry,
};

/// SQLite extended error code for a foreign key constraint violation.
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a transaction spanning multiple repository writes.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle for interacting with categories.
    pub fn categories(&self) -> CategoryRepository {
        CategoryRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for interacting with products.
    pub fn products(&self) -> ProductRepository {
        ProductRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the stock history ledger.
    pub fn stock_history(&self) -> StockHistoryRepository {
        StockHistoryRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository managing category rows.
#[derive(Clone)]
pub struct CategoryRepository {
    pool: SqlitePool,
}

impl CategoryRepository {
    /// Inserts a new category and returns it with its assigned id.
    pub async fn insert(&self, record: &NewCategory) -> Result<Category, CategoryError> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO categories (name, description) VALUES (?, ?) RETURNING id")
                .bind(&record.name)
                .bind(&record.description)
                .fetch_one(&self.pool)
                .await?;

        Ok(Category {
            id,
            name: record.name.clone(),
            description: record.description.clone(),
        })
    }

    /// Lists all categories in primary key order.
    pub async fn list(&self) -> Result<Vec<Category>, CategoryError> {
        let rows = sqlx::query_as::<_, CategoryRow>(
            "SELECT id, name, description FROM categories ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CategoryRow::into_domain).collect())
    }

    /// Lists categories with no referencing products.
    pub async fn list_empty(&self) -> Result<Vec<Category>, CategoryError> {
        let rows = sqlx::query_as::<_, CategoryRow>(
            "SELECT c.id, c.name, c.description \
               FROM categories AS c \
               LEFT JOIN products AS p ON p.category_id = c.id \
              WHERE p.id IS NULL \
              ORDER BY c.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CategoryRow::into_domain).collect())
    }

    /// Fetches one category by id.
    pub async fn fetch(&self, id: i64) -> Result<Option<Category>, CategoryError> {
        let row = sqlx::query_as::<_, CategoryRow>(
            "SELECT id, name, description FROM categories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CategoryRow::into_domain))
    }

    /// Persists a fully merged category, returning the number of affected rows.
    pub async fn update(&self, category: &Category) -> Result<u64, CategoryError> {
        let result = sqlx::query("UPDATE categories SET name = ?, description = ? WHERE id = ?")
            .bind(&category.name)
            .bind(&category.description)
            .bind(category.id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes a category, returning the number of affected rows.
    ///
    /// The products table carries a plain foreign key on `category_id`, so a
    /// delete while products still reference the row fails and is reported as
    /// [`CategoryError::InUse`].
    pub async fn delete(&self, id: i64) -> Result<u64, CategoryError> {
        let result = sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await;

        match result {
            Ok(outcome) => Ok(outcome.rows_affected()),
            Err(sqlx::Error::Database(db_err)) => {
                if db_err.code() == Some(Cow::Borrowed(SQLITE_CONSTRAINT_FOREIGNKEY)) {
                    return Err(CategoryError::InUse);
                }
                Err(CategoryError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(CategoryError::Database(err)),
        }
    }
}

/// Row shape shared by the category queries.
#[derive(Debug, sqlx::FromRow)]
struct CategoryRow {
    id: i64,
    name: String,
    description: Option<String>,
}

impl CategoryRow {
    fn into_domain(self) -> Category {
        Category {
            id: self.id,
            name: self.name,
            description: self.description,
        }
    }
}

/// Errors that can occur while operating on categories.
#[derive(Debug, Error)]
pub enum CategoryError {
    #[error("category is still referenced by products")]
    InUse,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Flat column form of a product used for full-row updates.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRecord {
    pub id: i64,
    pub name: String,
    pub sku: String,
    pub price: f64,
    pub quantity: i64,
    pub category_id: i64,
}

impl ProductRecord {
    /// Flattens a joined product back into its column form.
    pub fn from_domain(product: &Product) -> Self {
        Self {
            id: product.id,
            name: product.name.clone(),
            sku: product.sku.clone(),
            price: product.price,
            quantity: product.quantity,
            category_id: product.category.id,
        }
    }
}

const PRODUCT_COLUMNS: &str = "p.id, p.name, p.sku, p.price, p.quantity, \
     p.category_id, c.name AS category_name, c.description AS category_description";

/// Repository managing product rows, always joined with their category.
#[derive(Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    /// Fetches one product with its category resolved.
    pub async fn fetch(&self, id: i64) -> Result<Option<Product>, ProductError> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products AS p \
              JOIN categories AS c ON c.id = p.category_id WHERE p.id = ?"
        );
        let row = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ProductRow::into_domain))
    }

    /// Runs the filtered, paginated search and returns the page rows plus the
    /// total match count ignoring pagination.
    pub async fn search(&self, filter: &ProductFilter) -> Result<(Vec<Product>, i64), ProductError> {
        let mut conditions = String::new();
        if filter.query.is_some() {
            conditions.push_str(" AND (p.name LIKE ? OR p.sku LIKE ?)");
        }
        if filter.category_id.is_some() {
            conditions.push_str(" AND p.category_id = ?");
        }

        let select = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products AS p \
              JOIN categories AS c ON c.id = p.category_id \
             WHERE 1 = 1{conditions} \
             ORDER BY p.id ASC LIMIT ? OFFSET ?"
        );
        let count = format!("SELECT COUNT(*) FROM products AS p WHERE 1 = 1{conditions}");

        let pattern = filter.query.as_deref().map(|query| format!("%{query}%"));

        let mut page_query = sqlx::query_as::<_, ProductRow>(&select);
        if let Some(pattern) = &pattern {
            page_query = page_query.bind(pattern).bind(pattern);
        }
        if let Some(category_id) = filter.category_id {
            page_query = page_query.bind(category_id);
        }
        let rows = page_query
            .bind(i64::from(filter.paging.limit()))
            .bind(filter.paging.offset())
            .fetch_all(&self.pool)
            .await?;

        let mut count_query = sqlx::query_scalar::<_, i64>(&count);
        if let Some(pattern) = &pattern {
            count_query = count_query.bind(pattern).bind(pattern);
        }
        if let Some(category_id) = filter.category_id {
            count_query = count_query.bind(category_id);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        Ok((rows.into_iter().map(ProductRow::into_domain).collect(), total))
    }

    /// Lists products strictly below the threshold, quantity ascending.
    pub async fn list_low_stock(&self, threshold: i64) -> Result<Vec<Product>, ProductError> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products AS p \
              JOIN categories AS c ON c.id = p.category_id \
             WHERE p.quantity < ? \
             ORDER BY p.quantity ASC, p.id ASC"
        );
        let rows = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ProductRow::into_domain).collect())
    }

    /// Counts products referencing the provided category.
    pub async fn count_for_category(&self, category_id: i64) -> Result<i64, ProductError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM products WHERE category_id = ?",
        )
        .bind(category_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Inserts a new product inside the provided transaction and returns the
    /// assigned id.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewProduct,
    ) -> Result<i64, ProductError> {
        let result = sqlx::query_scalar::<_, i64>(
            "INSERT INTO products (name, sku, price, quantity, category_id) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&record.name)
        .bind(&record.sku)
        .bind(record.price)
        .bind(record.quantity)
        .bind(record.category_id)
        .fetch_one(&mut **tx)
        .await;

        result.map_err(map_missing_category)
    }

    /// Persists a fully merged product row inside the provided transaction.
    pub async fn update(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &ProductRecord,
    ) -> Result<u64, ProductError> {
        let result = sqlx::query(
            "UPDATE products SET name = ?, sku = ?, price = ?, quantity = ?, category_id = ? \
             WHERE id = ?",
        )
        .bind(&record.name)
        .bind(&record.sku)
        .bind(record.price)
        .bind(record.quantity)
        .bind(record.category_id)
        .bind(record.id)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(outcome) => Ok(outcome.rows_affected()),
            Err(err) => Err(map_missing_category(err)),
        }
    }

    /// Deletes a product; its stock history rows cascade with it.
    pub async fn delete(&self, id: i64) -> Result<u64, ProductError> {
        let result = sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn map_missing_category(err: sqlx::Error) -> ProductError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code() == Some(Cow::Borrowed(SQLITE_CONSTRAINT_FOREIGNKEY)) {
                ProductError::MissingCategory
            } else {
                ProductError::Database(sqlx::Error::Database(db_err))
            }
        }
        other => ProductError::Database(other),
    }
}

/// Row shape shared by the joined product queries.
#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: i64,
    name: String,
    sku: String,
    price: f64,
    quantity: i64,
    category_id: i64,
    category_name: String,
    category_description: Option<String>,
}

impl ProductRow {
    fn into_domain(self) -> Product {
        Product {
            id: self.id,
            name: self.name,
            sku: self.sku,
            price: self.price,
            quantity: self.quantity,
            category: Category {
                id: self.category_id,
                name: self.category_name,
                description: self.category_description,
            },
        }
    }
}

/// Errors that can occur while operating on products.
#[derive(Debug, Error)]
pub enum ProductError {
    #[error("product references a missing category")]
    MissingCategory,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for ProductError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

/// Data required to append one entry to the stock history ledger.
pub struct NewStockHistory {
    pub product_id: i64,
    pub transition: StockTransition,
    pub created_at: DateTime<Utc>,
}

/// Repository for the append-only stock history ledger.
#[derive(Clone)]
pub struct StockHistoryRepository {
    pool: SqlitePool,
}

impl StockHistoryRepository {
    /// Appends one ledger entry inside the provided transaction.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewStockHistory,
    ) -> Result<(), StockHistoryError> {
        sqlx::query(
            "INSERT INTO stock_history \
             (product_id, previous_quantity, new_quantity, quantity_change, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.product_id)
        .bind(record.transition.previous)
        .bind(record.transition.new)
        .bind(record.transition.change())
        .bind(to_rfc3339(record.created_at))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Lists all entries for one product, most recent first.
    ///
    /// The id is a tie-breaker for entries written in the same millisecond.
    pub async fn list_for_product(
        &self,
        product_id: i64,
    ) -> Result<Vec<StockHistoryEntry>, StockHistoryError> {
        let rows = sqlx::query_as::<_, StockHistoryRow>(
            "SELECT id, product_id, previous_quantity, new_quantity, quantity_change, created_at \
               FROM stock_history WHERE product_id = ? \
              ORDER BY created_at DESC, id DESC",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StockHistoryRow::into_domain).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StockHistoryRow {
    id: i64,
    product_id: i64,
    previous_quantity: i64,
    new_quantity: i64,
    quantity_change: i64,
    created_at: DateTime<Utc>,
}

impl StockHistoryRow {
    fn into_domain(self) -> StockHistoryEntry {
        StockHistoryEntry {
            id: self.id,
            product_id: self.product_id,
            previous_quantity: self.previous_quantity,
            new_quantity: self.new_quantity,
            quantity_change: self.quantity_change,
            created_at: self.created_at,
        }
    }
}

/// Errors that can occur while reading or appending stock history.
#[derive(Debug, Error)]
pub enum StockHistoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
