//! HTTP API application wiring (Axum router + shared state).
//!
//! - `routes/`: HTTP handlers (one file per area)
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use newsflow_events::Publisher;
use newsflow_infra::record_store::RecordStore;
use newsflow_infra::search::SearchIndex;

pub mod dto;
pub mod errors;
pub mod routes;

/// Everything the handlers need; shared behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub publisher: Publisher,
    pub search: Arc<dyn SearchIndex>,
    pub index_name: String,
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/api", routes::router())
        .layer(
            ServiceBuilder::new().layer(Extension(Arc::new(state))),
        )
}
