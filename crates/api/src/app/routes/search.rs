use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;

use newsflow_infra::search::SearchIndexError;

use crate::app::{AppState, dto, errors};

pub async fn search(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<dto::SearchQuery>,
) -> axum::response::Response {
    let query = params.query.as_deref().map(str::trim).unwrap_or_default();
    if query.is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "query parameter is required",
        );
    }

    match state.search.search(&state.index_name, query).await {
        Ok(hits) => Json(hits).into_response(),
        // Nothing has been indexed yet.
        Err(SearchIndexError::MissingIndex(_)) => {
            Json(Vec::<serde_json::Value>::new()).into_response()
        }
        Err(e) => {
            error!(error = %e, "search failed");
            errors::internal_error()
        }
    }
}
