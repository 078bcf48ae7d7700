//! REST endpoints for triage and ingestion.
//!
//! Authentication happens upstream; the gateway forwards the caller's
//! organization and user in `x-organization-*` / `x-user-*` headers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use super::service::{
    AnalyzeRequest, BatchRequest, RequestContext, ServiceError, ShieldStatusRequest, StatsQuery,
    TriageService,
};
use crate::error::{Outcome, ValidationError};
use crate::pipeline::InboundComment;
use crate::triage::types::{Organization, Role, UserContext};

pub const HEADER_ORGANIZATION_ID: &str = "x-organization-id";
pub const HEADER_ORGANIZATION_PLAN: &str = "x-organization-plan";
pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_ROLE: &str = "x-user-role";
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";

/// Shared state for triage routes.
#[derive(Clone)]
pub struct TriageRouteState {
    pub service: Arc<TriageService>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self.error.outcome() {
            Outcome::RejectedInvalid => StatusCode::BAD_REQUEST,
            Outcome::Forbidden => StatusCode::FORBIDDEN,
            Outcome::RetryLater { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Outcome::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = self.body();
        let retry_after = body.retry_after;
        let mut response = (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": body,
                "correlation_id": self.correlation_id,
            })),
        )
            .into_response();

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn success<T: Serialize>(data: T) -> Response {
    Json(serde_json::json!({ "success": true, "data": data })).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build the caller context from gateway headers.
fn request_context(headers: &HeaderMap) -> Result<RequestContext, ServiceError> {
    let correlation_id = header_str(headers, HEADER_CORRELATION_ID)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let organization_id = header_str(headers, HEADER_ORGANIZATION_ID).ok_or_else(|| {
        ServiceError::new(
            &correlation_id,
            ValidationError::MissingField {
                field: HEADER_ORGANIZATION_ID.into(),
            },
        )
    })?;

    let role = match header_str(headers, HEADER_USER_ROLE) {
        Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
        _ => Role::Member,
    };

    let organization = Organization {
        id: organization_id.to_string(),
        // Unknown or missing plans resolve to the fail-closed policy
        plan: header_str(headers, HEADER_ORGANIZATION_PLAN)
            .unwrap_or_default()
            .to_string(),
    };
    let user = UserContext {
        id: header_str(headers, HEADER_USER_ID)
            .unwrap_or("anonymous")
            .to_string(),
        role,
        preferences: serde_json::Value::Null,
    };

    Ok(RequestContext::new(organization, user).with_correlation_id(correlation_id))
}

fn bad_body(ctx: &RequestContext, rejection: JsonRejection) -> ServiceError {
    tracing::debug!(
        correlation_id = %ctx.correlation_id,
        error = %rejection,
        "Rejected request body"
    );
    ServiceError::new(
        &ctx.correlation_id,
        ValidationError::InvalidContent {
            field: "body".into(),
        },
    )
}

/// GET /health
async fn health(State(state): State<TriageRouteState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "cache": state.service.engine().cache().stats(),
    }))
}

/// POST /api/triage/analyze
async fn analyze(
    State(state): State<TriageRouteState>,
    headers: HeaderMap,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let ctx = request_context(&headers)?;
    let Json(request) = body.map_err(|e| bad_body(&ctx, e))?;
    let response = state.service.analyze(&ctx, request).await?;
    Ok(success(response))
}

/// GET /api/triage/stats?time_range=24h&include_cache=true
async fn stats(
    State(state): State<TriageRouteState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ServiceError> {
    let ctx = request_context(&headers)?;
    let response = state.service.stats(&ctx, query).await?;
    Ok(success(response))
}

/// POST /api/triage/batch
async fn batch(
    State(state): State<TriageRouteState>,
    headers: HeaderMap,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let ctx = request_context(&headers)?;
    let Json(request) = body.map_err(|e| bad_body(&ctx, e))?;
    let response = state.service.batch(&ctx, request).await?;
    Ok(success(response))
}

/// POST /api/triage/cache/clear (admin only)
async fn clear_cache(
    State(state): State<TriageRouteState>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let ctx = request_context(&headers)?;
    let response = state.service.clear_cache(&ctx).await?;
    Ok(success(response))
}

/// POST /api/shield/actions/{id}/status (admin only)
async fn shield_status(
    State(state): State<TriageRouteState>,
    headers: HeaderMap,
    Path(action_id): Path<Uuid>,
    body: Result<Json<ShieldStatusRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let ctx = request_context(&headers)?;
    let Json(request) = body.map_err(|e| bad_body(&ctx, e))?;
    let response = state
        .service
        .report_shield_status(&ctx, action_id, request)
        .await?;
    Ok(success(response))
}

/// POST /api/comments/ingest
async fn ingest(
    State(state): State<TriageRouteState>,
    headers: HeaderMap,
    body: Result<Json<InboundComment>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let ctx = request_context(&headers)?;
    let Json(inbound) = body.map_err(|e| bad_body(&ctx, e))?;
    let response = state.service.ingest(&ctx, inbound).await?;
    Ok((StatusCode::ACCEPTED, success(response)).into_response())
}

/// Build the triage REST routes.
pub fn triage_routes(service: Arc<TriageService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/triage/analyze", post(analyze))
        .route("/api/triage/stats", get(stats))
        .route("/api/triage/batch", post(batch))
        .route("/api/triage/cache/clear", post(clear_cache))
        .route("/api/comments/ingest", post(ingest))
        .route("/api/shield/actions/{id}/status", post(shield_status))
        .layer(CorsLayer::permissive())
        .with_state(TriageRouteState { service })
}
