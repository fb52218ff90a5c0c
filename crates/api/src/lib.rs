//! HTTP producer API: store records, queue them for indexing, search.

pub mod app;

pub use app::{AppState, build_app};
