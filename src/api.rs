//! HTTP API for the Lounge Engine.
//!
//! This module exposes the [`LoungeService`] operations as a small
//! JSON API using the [`axum`](https://crates.io/crates/axum)
//! framework.  Successful calls return an [`Outcome`]; failures return
//! `{"success": false, "message": ..., "reason": ...}` with a status
//! code matching the error category.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Request, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use uuid::Uuid;

use crate::config::{Catalog, Settings};
use crate::engine::LiveQuote;
use crate::error::LoungeError;
use crate::models::Device;
use crate::notify::LogNotifier;
use crate::rates::RateTable;
use crate::reconcile::ReconcileReport;
use crate::service::{CostView, LoungeService, Outcome, StartSession, SystemClock};
use crate::store::InMemoryStore;
use crate::tables::StaticTableRegistry;

/// Application state shared across requests.
pub struct AppState {
    pub service: LoungeService,
}

type ApiResult<T> = std::result::Result<Json<T>, LoungeError>;

impl LoungeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LoungeError::Validation(_) => StatusCode::BAD_REQUEST,
            LoungeError::NotFound { .. } => StatusCode::NOT_FOUND,
            LoungeError::StateConflict(_) => StatusCode::CONFLICT,
            LoungeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LoungeError {
    fn into_response(self) -> Response {
        if let LoungeError::Store(err) = &self {
            tracing::error!(error = %err, "request failed in storage");
        }
        let body = Json(serde_json::json!({
            "success": false,
            "message": self.to_string(),
            "reason": self.reason(),
        }));
        (self.status_code(), body).into_response()
    }
}

/// JSON body whose rejections answer with the error envelope.
struct ApiJson<T>(T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = LoungeError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| LoungeError::validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Path parameters whose rejections answer with the error envelope.
struct ApiPath<T>(T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = LoungeError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| LoungeError::validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControllersBody {
    controllers: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartTimeBody {
    start_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscountBody {
    discount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveBody {
    bill_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableBody {
    table_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentBody {
    amount: Decimal,
    method: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustBody {
    #[serde(default)]
    discount: Option<Decimal>,
    #[serde(default)]
    tax: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeBody {
    source_bill_id: Uuid,
}

/// Build the API router around an existing service.
pub fn build_router(service: LoungeService) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState { service });
    let router = Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/sessions", post(start_session))
        .route("/api/sessions/:id/controllers", post(update_controllers))
        .route("/api/sessions/:id/end", post(end_session))
        .route("/api/sessions/:id/start-time", post(correct_start_time))
        .route("/api/sessions/:id/discount", post(set_discount))
        .route("/api/sessions/:id/cost", get(session_cost))
        .route("/api/sessions/:id/move", post(move_session))
        .route("/api/sessions/:id/table", post(link_table).delete(unlink_table))
        .route("/api/bills/:id/payments", post(record_payment))
        .route("/api/bills/:id/adjust", post(adjust_bill))
        .route("/api/bills/:id/merge", post(merge_bill))
        .route("/api/organizations/:org/live", get(live_board))
        .route("/api/organizations/:org/reconcile", post(reconcile))
        .with_state(state.clone());
    (router, state)
}

/// Build a service from settings: load the catalog, seed an in-memory
/// store with its devices and wire the default collaborators.
pub fn build_service(settings: &Settings) -> Result<LoungeService> {
    let catalog = Catalog::from_settings(settings)?;
    tracing::info!(
        devices = catalog.devices.len(),
        tables = catalog.tables.len(),
        "catalog loaded"
    );
    let store = Arc::new(InMemoryStore::with_devices(catalog.devices));
    let service = LoungeService::new(
        store,
        RateTable::new(catalog.default_rates),
        Arc::new(LogNotifier),
        Arc::new(StaticTableRegistry::new(catalog.tables)),
        Arc::new(SystemClock),
    )
    .with_reconcile_after_moves(settings.reconcile_after_moves);
    Ok(service)
}

async fn list_devices(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Device>> {
    state.service.devices().await.map(Json)
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<StartSession>,
) -> ApiResult<Outcome> {
    state.service.start_session(request).await.map(Json)
}

async fn update_controllers(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<ControllersBody>,
) -> ApiResult<Outcome> {
    state.service.update_controllers(id, body.controllers).await.map(Json)
}

async fn end_session(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Outcome> {
    state.service.end_session(id).await.map(Json)
}

async fn correct_start_time(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<StartTimeBody>,
) -> ApiResult<Outcome> {
    state.service.correct_start_time(id, body.start_time).await.map(Json)
}

async fn set_discount(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<DiscountBody>,
) -> ApiResult<Outcome> {
    state.service.set_session_discount(id, body.discount).await.map(Json)
}

async fn session_cost(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<CostView> {
    state.service.session_cost(id).await.map(Json)
}

async fn move_session(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<MoveBody>,
) -> ApiResult<Outcome> {
    state.service.move_session_to_bill(id, body.bill_id).await.map(Json)
}

async fn link_table(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<TableBody>,
) -> ApiResult<Outcome> {
    state.service.link_session_to_table(id, &body.table_id).await.map(Json)
}

async fn unlink_table(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Outcome> {
    state.service.unlink_session_from_table(id).await.map(Json)
}

async fn record_payment(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<PaymentBody>,
) -> ApiResult<Outcome> {
    state.service.record_payment(id, body.amount, &body.method).await.map(Json)
}

async fn adjust_bill(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<AdjustBody>,
) -> ApiResult<Outcome> {
    state.service.adjust_bill(id, body.discount, body.tax).await.map(Json)
}

/// Merges the bill named in the body into the bill in the path.
async fn merge_bill(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<MergeBody>,
) -> ApiResult<Outcome> {
    state.service.merge_bills(body.source_bill_id, id).await.map(Json)
}

async fn live_board(State(state): State<Arc<AppState>>, ApiPath(org): ApiPath<String>) -> ApiResult<Vec<LiveQuote>> {
    state.service.live_board(&org).await.map(Json)
}

async fn reconcile(
    State(state): State<Arc<AppState>>,
    ApiPath(org): ApiPath<String>,
) -> ApiResult<ReconcileReport> {
    state.service.reconcile(&org).await.map(Json)
}

/// Launch the API server.  Builds the service from `settings`, binds
/// to the configured address and runs until the server stops.
pub async fn serve(settings: Settings) -> Result<()> {
    let service = build_service(&settings)?;
    let (router, _state) = build_router(service);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (LoungeError::validation("bad"), StatusCode::BAD_REQUEST),
            (LoungeError::not_found("Session", "x"), StatusCode::NOT_FOUND),
            (LoungeError::conflict("ended"), StatusCode::CONFLICT),
            (
                LoungeError::from(StoreError::Backend("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn service_builds_from_default_settings() {
        let service = build_service(&Settings::default()).unwrap();
        let (_router, state) = build_router(service);
        assert!(Arc::strong_count(&state) >= 2);
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let req = axum::http::Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(r#"{"controllers": 300}"#))
            .unwrap();
        let err = ApiJson::<ControllersBody>::from_request(req, &()).await.err().unwrap();
        assert!(matches!(err, LoungeError::Validation(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let req = axum::http::Request::builder()
            .method("POST")
            .body(axum::body::Body::from("not json"))
            .unwrap();
        let err = ApiJson::<ControllersBody>::from_request(req, &()).await.err().unwrap();
        assert_eq!(err.reason(), "validation");
    }

    #[tokio::test]
    async fn unusable_path_params_are_validation_errors() {
        let (mut parts, _) = axum::http::Request::builder()
            .uri("/api/sessions/not-a-uuid/end")
            .body(())
            .unwrap()
            .into_parts();
        let err = ApiPath::<Uuid>::from_request_parts(&mut parts, &()).await.err().unwrap();
        assert!(matches!(err, LoungeError::Validation(_)));
    }

    #[test]
    fn request_bodies_use_camel_case() {
        let body: MergeBody =
            serde_json::from_str(r#"{"sourceBillId": "67e55044-10b1-426f-9247-bb680e5fe0c8"}"#).unwrap();
        assert_eq!(body.source_bill_id.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
        let body: AdjustBody = serde_json::from_str(r#"{"tax": 2}"#).unwrap();
        assert!(body.discount.is_none());
    }
}
