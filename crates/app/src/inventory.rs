use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;

use stockroom_core::stock::StockTransition;
use stockroom_core::types::{
    LowStockMeta, LowStockReport, NewProduct, Product, ProductFilter, ProductPage, ProductPatch,
    StockHistoryEntry,
};
use stockroom_storage::{
    CategoryError, Database, NewStockHistory, ProductError, ProductRecord, StockHistoryError,
};

pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 5;

/// Orchestrates product reads and writes together with the stock history
/// ledger. A quantity-affecting write and its audit entry commit in one
/// transaction.
#[derive(Clone)]
pub struct InventoryService {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl InventoryService {
    pub fn new(database: Database, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        Self { database, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Filtered, paginated listing with the total match count in the meta.
    pub async fn find_all(&self, filter: &ProductFilter) -> Result<ProductPage, InventoryError> {
        let (data, total) = self.database.products().search(filter).await?;
        Ok(ProductPage {
            data,
            meta: filter.paging.meta(total),
        })
    }

    /// Products with quantity strictly below the threshold, ascending.
    pub async fn find_low_stock(&self, threshold: i64) -> Result<LowStockReport, InventoryError> {
        let data = self.database.products().list_low_stock(threshold).await?;
        let meta = LowStockMeta {
            total: data.len() as i64,
            threshold,
        };
        Ok(LowStockReport { data, meta })
    }

    pub async fn find_one(&self, id: i64) -> Result<Product, InventoryError> {
        self.database
            .products()
            .fetch(id)
            .await?
            .ok_or(InventoryError::ProductNotFound(id))
    }

    /// Creates a product and appends its initial stock history entry
    /// (previous quantity zero) in the same transaction.
    pub async fn create(&self, input: NewProduct) -> Result<Product, InventoryError> {
        let category = self
            .database
            .categories()
            .fetch(input.category_id)
            .await?
            .ok_or(InventoryError::CategoryNotFound(input.category_id))?;

        let created_at = self.now();
        let products = self.database.products();
        let history = self.database.stock_history();

        let mut tx = self.database.begin().await?;
        let id = products.insert(&mut tx, &input).await.map_err(|err| match err {
            ProductError::MissingCategory => InventoryError::CategoryNotFound(input.category_id),
            other => InventoryError::Product(other),
        })?;
        history
            .append(
                &mut tx,
                &NewStockHistory {
                    product_id: id,
                    transition: StockTransition::initial(input.quantity),
                    created_at,
                },
            )
            .await?;
        tx.commit().await?;

        counter!("stock_history_appends_total", "reason" => "create").increment(1);

        Ok(Product {
            id,
            name: input.name,
            sku: input.sku,
            price: input.price,
            quantity: input.quantity,
            category,
        })
    }

    /// Applies a partial update. A history entry is appended iff the patch
    /// carried an explicit quantity, including the zero-delta case.
    pub async fn update(&self, id: i64, patch: ProductPatch) -> Result<Product, InventoryError> {
        let mut product = self.find_one(id).await?;

        if let Some(category_id) = patch.category_id {
            product.category = self
                .database
                .categories()
                .fetch(category_id)
                .await?
                .ok_or(InventoryError::CategoryNotFound(category_id))?;
        }

        let previous_quantity = product.quantity;
        if let Some(name) = patch.name {
            product.name = name;
        }
        if let Some(sku) = patch.sku {
            product.sku = sku;
        }
        if let Some(price) = patch.price {
            product.price = price;
        }
        let transition = patch.quantity.map(|quantity| {
            product.quantity = quantity;
            StockTransition {
                previous: previous_quantity,
                new: quantity,
            }
        });

        let record = ProductRecord::from_domain(&product);
        let products = self.database.products();
        let history = self.database.stock_history();

        let mut tx = self.database.begin().await?;
        let affected = products.update(&mut tx, &record).await.map_err(|err| match err {
            ProductError::MissingCategory => InventoryError::CategoryNotFound(record.category_id),
            other => InventoryError::Product(other),
        })?;
        if affected == 0 {
            // Dropping the transaction rolls it back.
            return Err(InventoryError::ProductNotFound(id));
        }
        if let Some(transition) = transition {
            history
                .append(
                    &mut tx,
                    &NewStockHistory {
                        product_id: id,
                        transition,
                        created_at: self.now(),
                    },
                )
                .await?;
        }
        tx.commit().await?;

        if let Some(transition) = transition {
            let reason = if transition.is_noop() { "noop" } else { "update" };
            counter!("stock_history_appends_total", "reason" => reason).increment(1);
        }

        Ok(product)
    }

    /// Deletes the product; its stock history cascades away with it.
    pub async fn remove(&self, id: i64) -> Result<(), InventoryError> {
        let affected = self.database.products().delete(id).await?;
        if affected == 0 {
            return Err(InventoryError::ProductNotFound(id));
        }
        Ok(())
    }

    /// All history entries for one product, most recent first.
    pub async fn stock_history(
        &self,
        product_id: i64,
    ) -> Result<Vec<StockHistoryEntry>, InventoryError> {
        self.find_one(product_id).await?;
        let entries = self
            .database
            .stock_history()
            .list_for_product(product_id)
            .await?;
        Ok(entries)
    }
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Product with ID {0} not found")]
    ProductNotFound(i64),
    #[error("Category with ID {0} not found")]
    CategoryNotFound(i64),
    #[error("product error: {0}")]
    Product(#[from] ProductError),
    #[error("category error: {0}")]
    Category(#[from] CategoryError),
    #[error("stock history error: {0}")]
    StockHistory(#[from] StockHistoryError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
