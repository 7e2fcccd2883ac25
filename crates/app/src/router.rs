use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use stockroom_core::paging::{Paging, DEFAULT_LIMIT, DEFAULT_PAGE};
use stockroom_core::types::{CategoryPatch, NewCategory, NewProduct, ProductFilter, ProductPatch};
use stockroom_storage::Database;

use crate::category::CategoryService;
use crate::inventory::{InventoryService, DEFAULT_LOW_STOCK_THRESHOLD};
use crate::problem::ProblemResponse;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    inventory: InventoryService,
    categories: CategoryService,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, database: Database) -> Self {
        let inventory = InventoryService::new(database.clone(), Arc::new(Utc::now));
        let categories = CategoryService::new(database);
        Self {
            metrics,
            inventory,
            categories,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn inventory(&self) -> &InventoryService {
        &self.inventory
    }

    pub fn categories(&self) -> &CategoryService {
        &self.categories
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/products", get(list_products).post(create_product))
        .route("/products/search", get(list_products))
        .route("/products/low-stock", get(low_stock))
        .route(
            "/products/:id",
            get(get_product).put(update_product).delete(delete_product),
        )
        .route("/products/:id/stock-history", get(product_stock_history))
        .route("/categories", get(list_categories).post(create_category))
        .route("/categories/empty", get(empty_categories))
        .route(
            "/categories/:id",
            get(get_category).put(update_category).delete(delete_category),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: Option<String>,
    #[serde(default, rename = "categoryId")]
    category_id: Option<i64>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LowStockQuery {
    #[serde(default)]
    threshold: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProductBody {
    name: String,
    sku: String,
    price: f64,
    quantity: i64,
    category_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProductBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    quantity: Option<i64>,
    #[serde(default)]
    category_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CreateCategoryBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateCategoryBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

fn positive(name: &'static str, value: Option<i64>, default: i64) -> Result<i64, ProblemResponse> {
    let value = value.unwrap_or(default);
    if value < 1 {
        return Err(ProblemResponse::validation(format!(
            "{name} must be a positive integer"
        )));
    }
    Ok(value)
}

fn page_param(
    name: &'static str,
    value: Option<i64>,
    default: u32,
) -> Result<u32, ProblemResponse> {
    let Some(value) = value else {
        return Ok(default);
    };
    if value < 1 {
        return Err(ProblemResponse::validation(format!(
            "{name} must be a positive integer"
        )));
    }
    u32::try_from(value)
        .map_err(|_| ProblemResponse::validation(format!("{name} is out of range")))
}

fn require_text(field: &'static str, value: &str) -> Result<(), ProblemResponse> {
    if value.trim().is_empty() {
        return Err(ProblemResponse::validation(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn require_price(price: f64) -> Result<(), ProblemResponse> {
    if !price.is_finite() || price < 0.0 {
        return Err(ProblemResponse::validation(
            "price must be a non-negative number",
        ));
    }
    Ok(())
}

fn require_quantity(quantity: i64) -> Result<(), ProblemResponse> {
    if quantity < 0 {
        return Err(ProblemResponse::validation(
            "quantity must be a non-negative integer",
        ));
    }
    Ok(())
}

async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ProblemResponse> {
    counter!("api_requests_total", "resource" => "products").increment(1);
    let page = page_param("page", query.page, DEFAULT_PAGE)?;
    let limit = page_param("limit", query.limit, DEFAULT_LIMIT)?;

    let filter = ProductFilter {
        query: query.query,
        category_id: query.category_id,
        paging: Paging::new(page, limit),
    };
    let result = state.inventory().find_all(&filter).await?;
    Ok(Json(result))
}

async fn low_stock(
    State(state): State<AppState>,
    Query(query): Query<LowStockQuery>,
) -> Result<impl IntoResponse, ProblemResponse> {
    counter!("api_requests_total", "resource" => "products").increment(1);
    let threshold = positive("threshold", query.threshold, DEFAULT_LOW_STOCK_THRESHOLD)?;
    let report = state.inventory().find_low_stock(threshold).await?;
    Ok(Json(report))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let product = state.inventory().find_one(id).await?;
    Ok(Json(product))
}

async fn create_product(
    State(state): State<AppState>,
    Json(body): Json<CreateProductBody>,
) -> Result<impl IntoResponse, ProblemResponse> {
    require_text("name", &body.name)?;
    require_text("sku", &body.sku)?;
    require_price(body.price)?;
    require_quantity(body.quantity)?;

    let product = state
        .inventory()
        .create(NewProduct {
            name: body.name,
            sku: body.sku,
            price: body.price,
            quantity: body.quantity,
            category_id: body.category_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateProductBody>,
) -> Result<impl IntoResponse, ProblemResponse> {
    if let Some(name) = &body.name {
        require_text("name", name)?;
    }
    if let Some(sku) = &body.sku {
        require_text("sku", sku)?;
    }
    if let Some(price) = body.price {
        require_price(price)?;
    }
    if let Some(quantity) = body.quantity {
        require_quantity(quantity)?;
    }

    let product = state
        .inventory()
        .update(
            id,
            ProductPatch {
                name: body.name,
                sku: body.sku,
                price: body.price,
                quantity: body.quantity,
                category_id: body.category_id,
            },
        )
        .await?;
    Ok(Json(product))
}

async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ProblemResponse> {
    state.inventory().remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn product_stock_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let entries = state.inventory().stock_history(id).await?;
    Ok(Json(entries))
}

async fn list_categories(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ProblemResponse> {
    counter!("api_requests_total", "resource" => "categories").increment(1);
    let categories = state.categories().find_all().await?;
    Ok(Json(categories))
}

async fn empty_categories(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let categories = state.categories().find_empty().await?;
    Ok(Json(categories))
}

async fn get_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ProblemResponse> {
    let category = state.categories().find_one(id).await?;
    Ok(Json(category))
}

async fn create_category(
    State(state): State<AppState>,
    Json(body): Json<CreateCategoryBody>,
) -> Result<impl IntoResponse, ProblemResponse> {
    require_text("name", &body.name)?;
    let category = state
        .categories()
        .create(NewCategory {
            name: body.name,
            description: body.description,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn update_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateCategoryBody>,
) -> Result<impl IntoResponse, ProblemResponse> {
    if let Some(name) = &body.name {
        require_text("name", name)?;
    }
    let category = state
        .categories()
        .update(
            id,
            CategoryPatch {
                name: body.name,
                description: body.description,
            },
        )
        .await?;
    Ok(Json(category))
}

async fn delete_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ProblemResponse> {
    state.categories().remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    static DB_SEQ: AtomicUsize = AtomicUsize::new(0);

    async fn setup_state() -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let seq = DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let url = format!("sqlite:file:stockroom-router-{seq}?mode=memory&cache=shared");
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");
        AppState::new(metrics, database)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = match body {
            Some(value) => Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&value).expect("serialize")))
                .expect("request"),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        };

        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn create_category(app: &Router, name: &str) -> i64 {
        let (status, body) = send(
            app,
            Method::POST,
            "/categories",
            Some(json!({ "name": name })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().expect("category id")
    }

    async fn create_product(app: &Router, name: &str, sku: &str, quantity: i64, category_id: i64) -> i64 {
        let (status, body) = send(
            app,
            Method::POST,
            "/products",
            Some(json!({
                "name": name,
                "sku": sku,
                "price": 999.99,
                "quantity": quantity,
                "categoryId": category_id,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().expect("product id")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(setup_state().await);
        let (status, _) = send(&app, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(setup_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn product_lifecycle_tracks_stock_history() {
        let app = app_router(setup_state().await);
        let category_id = create_category(&app, "Electronics").await;
        let product_id = create_product(&app, "Laptop", "L1", 10, category_id).await;

        let (status, product) =
            send(&app, Method::GET, &format!("/products/{product_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(product["quantity"], 10);
        assert_eq!(product["category"]["name"], "Electronics");

        let (status, updated) = send(
            &app,
            Method::PUT,
            &format!("/products/{product_id}"),
            Some(json!({ "quantity": 7 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["quantity"], 7);

        let (status, history) = send(
            &app,
            Method::GET,
            &format!("/products/{product_id}/stock-history"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let entries = history.as_array().expect("history array");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["previous_quantity"], 10);
        assert_eq!(entries[0]["new_quantity"], 7);
        assert_eq!(entries[0]["quantity_change"], -3);
        assert_eq!(entries[1]["previous_quantity"], 0);
        assert_eq!(entries[1]["quantity_change"], 10);

        let (status, low) = send(&app, Method::GET, "/products/low-stock?threshold=8", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(low["meta"]["total"], 1);
        assert_eq!(low["data"][0]["id"], product_id);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("/products/{product_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, problem) =
            send(&app, Method::GET, &format!("/products/{product_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            problem["detail"],
            format!("Product with ID {product_id} not found")
        );
    }

    #[tokio::test]
    async fn search_returns_pagination_meta() {
        let app = app_router(setup_state().await);
        let category_id = create_category(&app, "Cables").await;
        for n in 0..7 {
            create_product(&app, &format!("Cable {n}"), &format!("C-{n}"), n, category_id).await;
        }

        let (status, page) = send(
            &app,
            Method::GET,
            &format!("/products?query=Cable&categoryId={category_id}&page=2&limit=3"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["meta"]["total"], 7);
        assert_eq!(page["meta"]["page"], 2);
        assert_eq!(page["meta"]["limit"], 3);
        assert_eq!(page["meta"]["totalPages"], 3);
        assert_eq!(page["data"].as_array().expect("data").len(), 3);
        assert_eq!(page["data"][0]["name"], "Cable 3");

        // The /products/search alias serves the same listing.
        let (status, alias) = send(&app, Method::GET, "/products/search?query=C-6", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(alias["meta"]["total"], 1);
        assert_eq!(alias["data"][0]["sku"], "C-6");
    }

    #[tokio::test]
    async fn boundary_rejects_invalid_input() {
        let app = app_router(setup_state().await);
        let category_id = create_category(&app, "Misc").await;

        let (status, problem) = send(
            &app,
            Method::POST,
            "/products",
            Some(json!({
                "name": "Widget",
                "sku": "W-1",
                "price": 1.0,
                "quantity": -2,
                "categoryId": category_id,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(problem["type"], "validation_failure");

        let (status, _) = send(&app, Method::GET, "/products?page=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Values beyond u32 range must be rejected, not wrapped onto page 1.
        let (status, problem) = send(
            &app,
            Method::GET,
            "/products?page=4294967297",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(problem["type"], "validation_failure");
        assert_eq!(problem["detail"], "page is out of range");

        let (status, _) = send(&app, Method::GET, "/products?limit=4294967297", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::GET, "/products/low-stock?threshold=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, problem) = send(
            &app,
            Method::POST,
            "/products",
            Some(json!({
                "name": "Ghost",
                "sku": "G-1",
                "price": 5.0,
                "quantity": 1,
                "categoryId": 4242,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(problem["detail"], "Category with ID 4242 not found");
    }

    #[tokio::test]
    async fn category_routes_cover_empty_view_and_restrict_delete() {
        let app = app_router(setup_state().await);
        let used = create_category(&app, "Used").await;
        let empty = create_category(&app, "Empty").await;
        create_product(&app, "Widget", "W-1", 4, used).await;

        let (status, list) = send(&app, Method::GET, "/categories", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().expect("categories").len(), 2);

        let (status, empties) = send(&app, Method::GET, "/categories/empty", None).await;
        assert_eq!(status, StatusCode::OK);
        let empties = empties.as_array().expect("empty categories");
        assert_eq!(empties.len(), 1);
        assert_eq!(empties[0]["id"], empty);

        let (status, problem) =
            send(&app, Method::DELETE, &format!("/categories/{used}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(problem["type"], "category_in_use");

        let (status, updated) = send(
            &app,
            Method::PUT,
            &format!("/categories/{empty}"),
            Some(json!({ "description": "spare shelf" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Empty");
        assert_eq!(updated["description"], "spare shelf");

        let (status, _) = send(&app, Method::DELETE, &format!("/categories/{empty}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, problem) =
            send(&app, Method::GET, &format!("/categories/{empty}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            problem["detail"],
            format!("Category with ID {empty} not found")
        );
    }
}
