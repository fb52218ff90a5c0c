use serde::{Deserialize, Serialize};

use newsflow_core::{NewRecord, Record};

/// Body of `POST /api/news`.
///
/// Fields are optional here so a missing field is reported the same way as a
/// blank one.
#[derive(Debug, Default, Deserialize)]
pub struct CreateNewsRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl From<CreateNewsRequest> for NewRecord {
    fn from(req: CreateNewsRequest) -> Self {
        NewRecord {
            title: req.title.unwrap_or_default(),
            content: req.content.unwrap_or_default(),
            author: req.author.unwrap_or_default(),
            source: req.source.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateNewsResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub id: i64,
}

impl CreateNewsResponse {
    pub fn queued(record: &Record) -> Self {
        Self {
            status: "ok",
            message: "News stored and queued",
            id: record.id.as_i64(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
}
