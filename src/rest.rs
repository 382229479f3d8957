//! REST API layer for jsondrop using Axum.
//!
//! Thin adapter over the catalog, document store and broadcaster:
//! - capability-key authentication (`Authorization: Bearer <key>` or `?key=`)
//! - JSON request/response bodies, errors as `{error, message}`
//! - Server-Sent Events for live change streams
//! - CORS per configured origins, with preflight short-circuit

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::documents::DocumentStore;
use crate::error::{DbError, ErrorKind};
use crate::events::{format_connected, format_ping, format_sse, Delivery, Listener};
use crate::keygen;
use crate::models::{DocumentData, Tenant};
use crate::validation::Filters;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Shared app state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    documents: DocumentStore,
    cors_origins: Arc<Vec<String>>,
}

impl AppState {
    fn catalog(&self) -> &Arc<Catalog> {
        self.documents.catalog()
    }
}

type Params = Query<Vec<(String, String)>>;

/// Error body returned for every failed request.
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "unauthorized",
            message: message.to_string(),
        }
    }

    fn forbidden(message: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            error: "forbidden",
            message: message.to_string(),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::InvalidIdentifier | ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::GenerationFailure => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, "request failed");
        }
        Self {
            status,
            error: kind.as_str(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ErrorKind::ValidationFailed.as_str(),
            message: format!("invalid request body: {}", rejection.body_text()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Create Axum router with every jsondrop endpoint.
pub fn create_router(documents: DocumentStore, cors_origins: Vec<String>) -> Router {
    let state = AppState {
        documents,
        cors_origins: Arc::new(cors_origins),
    };

    let api = Router::new()
        .route("/databases", post(create_database_handler))
        .route(
            "/databases/:id",
            get(get_database_handler).delete(delete_database_handler),
        )
        .route("/databases/:id/events", get(database_events_handler))
        .route("/databases/:id/schemas", get(list_schemas_handler))
        .route(
            "/databases/:id/schemas/:name",
            post(create_schema_handler)
                .get(get_schema_handler)
                .delete(delete_schema_handler),
        )
        .route(
            "/databases/:id/:collection",
            get(query_documents_handler).post(insert_document_handler),
        )
        .route(
            "/databases/:id/:collection/events",
            get(collection_events_handler),
        )
        .route(
            "/databases/:id/:collection/:doc_id",
            get(get_document_handler)
                .put(update_document_handler)
                .delete(delete_document_handler),
        );

    Router::new()
        .nest("/api", api)
        .route("/health", get(health_handler))
        .layer(middleware::from_fn_with_state(state.clone(), cors_middleware))
        .with_state(state)
}

async fn cors_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let preflight = req.method() == Method::OPTIONS;

    let mut response = if preflight {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };

    let allowed = if state.cors_origins.len() == 1 && state.cors_origins[0] == "*" {
        Some("*".to_string())
    } else {
        origin.filter(|o| state.cors_origins.iter().any(|allowed| allowed == o))
    };
    if let Some(value) = allowed.and_then(|o| HeaderValue::from_str(&o).ok()) {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("3600"),
        );
    }
    response
}

/// Capability key from the bearer header, falling back to `?key=`.
fn capability_key(headers: &HeaderMap, params: &[(String, String)]) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim().to_string())
        .filter(|key| !key.is_empty());
    from_header.or_else(|| {
        params
            .iter()
            .find(|(name, _)| name == "key")
            .map(|(_, value)| value.clone())
    })
}

/// Resolve the caller's key against the database in the path. Successful
/// resolution records an access.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    params: &[(String, String)],
    database_id: &str,
    needs_write: bool,
) -> ApiResult<Tenant> {
    let key = capability_key(headers, params)
        .ok_or_else(|| ApiError::unauthorized("missing API key"))?;
    if !key.starts_with(keygen::WRITE_KEY_PREFIX) && !key.starts_with(keygen::READ_KEY_PREFIX) {
        return Err(ApiError::unauthorized("invalid API key format"));
    }

    let resolved = state.catalog().resolve(&key).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ApiError::unauthorized("invalid API key"),
        _ => ApiError::from(e),
    })?;
    if resolved.tenant.id != database_id {
        return Err(ApiError::forbidden("database ID mismatch"));
    }
    if needs_write && !resolved.capability.can_write() {
        return Err(ApiError::forbidden("write key required"));
    }

    state.catalog().touch(&resolved.tenant.id);
    Ok(resolved.tenant)
}

async fn create_database_handler(
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let created = state.catalog().create_tenant()?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_database_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, false)?;
    Ok(Json(state.catalog().info(&id)?))
}

async fn delete_database_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    authorize(&state, &headers, &params, &id, true)?;
    state.catalog().delete_tenant(&id)?;
    info!(tenant = %id, "database deleted on request");
    Ok(StatusCode::NO_CONTENT)
}

async fn database_events_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<Response> {
    authorize(&state, &headers, &params, &id, false)?;
    let listener = state.catalog().broadcaster().subscribe(&id);
    Ok(sse_response(listener, format_connected(&id, None)))
}

async fn collection_events_handler(
    State(state): State<AppState>,
    Path((id, collection)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<Response> {
    authorize(&state, &headers, &params, &id, false)?;
    state.catalog().get_schema(&id, &collection)?;
    let listener = state
        .catalog()
        .broadcaster()
        .subscribe_collection(&id, &collection);
    Ok(sse_response(
        listener,
        format_connected(&id, Some(&collection)),
    ))
}

/// Stream a listener as `text/event-stream`. The listener is dropped, and so
/// unsubscribed, when the client goes away.
fn sse_response(listener: Listener, connected: String) -> Response {
    let greeting = stream::once(async move { Ok::<_, Infallible>(connected) });
    let deliveries = stream::unfold(listener, |mut listener| async move {
        let frame = match listener.recv().await? {
            Delivery::Change(event) => format_sse(&event),
            Delivery::Heartbeat => format_ping().to_string(),
        };
        Some((Ok::<_, Infallible>(frame), listener))
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(greeting.chain(deliveries)),
    )
        .into_response()
}

async fn list_schemas_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, false)?;
    Ok(Json(state.catalog().list_schemas(&id)?))
}

#[derive(Deserialize, Serialize)]
pub struct CreateSchemaRest {
    pub fields: BTreeMap<String, String>,
}

async fn create_schema_handler(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
    payload: Result<Json<CreateSchemaRest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, true)?;
    let Json(payload) = payload?;
    let schema = state.catalog().create_schema(&id, &name, &payload.fields)?;
    Ok((StatusCode::CREATED, Json(schema)))
}

async fn get_schema_handler(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, false)?;
    Ok(Json(state.catalog().get_schema(&id, &name)?))
}

async fn delete_schema_handler(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    authorize(&state, &headers, &params, &id, true)?;
    state.catalog().delete_schema(&id, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body for insert and update: `{"data": {...}}`.
#[derive(Deserialize, Serialize)]
pub struct DocumentRest {
    pub data: Value,
}

impl DocumentRest {
    fn into_data(self) -> ApiResult<DocumentData> {
        match self.data {
            Value::Object(map) => Ok(map),
            _ => Err(DbError::ValidationFailed(
                "document data must be a JSON object".to_string(),
            )
            .into()),
        }
    }
}

/// Split query parameters into pagination and field filters. Malformed or
/// out-of-range `limit`/`offset` values fall back to their defaults.
fn page_and_filters(params: Vec<(String, String)>) -> (usize, usize, Filters) {
    let mut limit = DEFAULT_PAGE_SIZE;
    let mut offset = 0;
    let mut filters = Filters::new();
    for (name, value) in params {
        match name.as_str() {
            "limit" => {
                if let Ok(n) = value.parse::<usize>() {
                    if n > 0 {
                        limit = n.min(MAX_PAGE_SIZE);
                    }
                }
            }
            "offset" => {
                if let Ok(n) = value.parse::<usize>() {
                    offset = n;
                }
            }
            "key" => {}
            _ => filters.entry(name).or_default().push(value),
        }
    }
    (limit, offset, filters)
}

async fn query_documents_handler(
    State(state): State<AppState>,
    Path((id, collection)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, false)?;
    let (limit, offset, filters) = page_and_filters(params);
    let documents = state
        .documents
        .query(&id, &collection, limit, offset, &filters)?;
    Ok(Json(documents))
}

async fn insert_document_handler(
    State(state): State<AppState>,
    Path((id, collection)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
    payload: Result<Json<DocumentRest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, true)?;
    let Json(payload) = payload?;
    let document = state
        .documents
        .insert(&id, &collection, payload.into_data()?)?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn get_document_handler(
    State(state): State<AppState>,
    Path((id, collection, doc_id)): Path<(String, String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, false)?;
    Ok(Json(state.documents.get(&id, &collection, &doc_id)?))
}

async fn update_document_handler(
    State(state): State<AppState>,
    Path((id, collection, doc_id)): Path<(String, String, String)>,
    Query(params): Params,
    headers: HeaderMap,
    payload: Result<Json<DocumentRest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &params, &id, true)?;
    let Json(payload) = payload?;
    let document = state
        .documents
        .update(&id, &collection, &doc_id, payload.into_data()?)?;
    Ok(Json(document))
}

async fn delete_document_handler(
    State(state): State<AppState>,
    Path((id, collection, doc_id)): Path<(String, String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    authorize(&state, &headers, &params, &id, true)?;
    state.documents.delete(&id, &collection, &doc_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Health check handler
async fn health_handler() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
