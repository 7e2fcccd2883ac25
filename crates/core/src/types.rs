use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paging::Paging;

/// A product category persisted in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A product with its category resolved, as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub sku: String,
    pub price: f64,
    pub quantity: i64,
    pub category: Category,
}

/// An immutable audit record of one quantity transition for a product.
///
/// Field names match the persisted columns so serialized entries read the
/// same as the underlying ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockHistoryEntry {
    pub id: i64,
    pub product_id: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub quantity_change: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a category.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCategory {
    pub name: String,
    pub description: Option<String>,
}

/// Partial update for a category; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Input for creating a product.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub name: String,
    pub sku: String,
    pub price: f64,
    pub quantity: i64,
    pub category_id: i64,
}

/// Partial update for a product; `None` fields keep their current value.
///
/// A present `quantity` is what triggers a stock-history entry, even when the
/// new value equals the old one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub sku: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<i64>,
    pub category_id: Option<i64>,
}

/// Filter for the paginated product listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductFilter {
    /// Substring matched against product name OR sku.
    pub query: Option<String>,
    /// Restricts results to a single category.
    pub category_id: Option<i64>,
    pub paging: Paging,
}

/// Pagination metadata attached to a product page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    #[serde(rename = "totalPages")]
    pub total_pages: u32,
}

/// One page of products plus the pagination metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPage {
    pub data: Vec<Product>,
    pub meta: PageMeta,
}

/// Metadata for the low-stock report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockMeta {
    pub total: i64,
    pub threshold: i64,
}

/// Low-stock products ordered by quantity ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowStockReport {
    pub data: Vec<Product>,
    pub meta: LowStockMeta,
}
