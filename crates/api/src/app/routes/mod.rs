use axum::{Router, routing::get};

pub mod news;
pub mod search;
pub mod system;

/// Router for everything under `/api`.
pub fn router() -> Router {
    Router::new()
        .nest("/news", news::router())
        .route("/search", get(search::search))
}
