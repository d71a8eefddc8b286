use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use super::ApiState;
use crate::context::RequestContext;
use crate::error::AppError;
use crate::middleware::error::get_request_id_from_headers;

/// POST /webhooks/{provider}
///
/// The body is taken as raw bytes: the provider signs exactly what it sent.
pub async fn handle_webhook(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let mut ctx = RequestContext::new(state.clock.clone());
    if let Some(request_id) = get_request_id_from_headers(&headers) {
        ctx.request_id = request_id;
    }

    info!(provider = %provider, request_id = %ctx.request_id, "Received webhook");

    let header_name = state
        .processor
        .signature_header(&provider)
        .map_err(|e| AppError::from(e).with_request_id(ctx.request_id.clone()))?;
    let signature = headers.get(header_name).and_then(|v| v.to_str().ok());

    let transaction = state
        .processor
        .process_webhook(&ctx, &provider, signature, &body)
        .await
        .map_err(|e| {
            AppError::from(e)
                .with_request_id(ctx.request_id.clone())
                .with_context(format!("{} webhook", provider))
        })?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "transaction_number": transaction.transaction_number,
            "transaction_status": transaction.status.as_str(),
        })),
    )
        .into_response())
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let ctx = RequestContext::new(state.clock.clone());
    let status = state.health.check_health(&ctx).await;
    let code = match status.status {
        crate::health::HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(status))
}
