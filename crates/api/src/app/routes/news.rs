use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::{error, info, instrument};

use newsflow_core::{Job, NewRecord, RecordId};

use crate::app::{AppState, dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_news))
        .route("/:id", get(get_news))
}

/// Insert the record, then queue it for indexing.
#[instrument(skip_all)]
pub async fn create_news(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<dto::CreateNewsRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_body",
                rejection.body_text(),
            );
        }
    };

    let new_record = match NewRecord::from(body).validated() {
        Ok(r) => r,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let record = match state.store.insert(new_record).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to store record");
            return errors::internal_error();
        }
    };

    if let Err(e) = state.publisher.publish_job(&Job::new(record.id)).await {
        error!(record_id = %record.id, error = %e, "record stored but not queued");
        return errors::internal_error();
    }

    info!(record_id = %record.id, "record stored and queued");
    (StatusCode::CREATED, Json(dto::CreateNewsResponse::queued(&record))).into_response()
}

pub async fn get_news(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: RecordId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match state.store.find_by_id(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "news not found"),
        Err(e) => {
            error!(record_id = %id, error = %e, "record lookup failed");
            errors::internal_error()
        }
    }
}
