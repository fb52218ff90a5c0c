use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;

use newsflow_api::{AppState, build_app};
use newsflow_core::{ATTEMPTS_HEADER, IndexDocument, Job, Record, RecordId};
use newsflow_events::{BrokerConnection, ConnectionSettings, InMemoryBroker, Publisher, RetryPolicy};
use newsflow_infra::record_store::InMemoryRecordStore;
use newsflow_infra::search::{InMemorySearchIndex, IndexSchema, SearchIndex};

const QUEUE: &str = "news.index";
const INDEX: &str = "news";

struct TestServer {
    base_url: String,
    broker: InMemoryBroker,
    store: Arc<InMemoryRecordStore>,
    index: Arc<InMemorySearchIndex>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with_broker(InMemoryBroker::new(), 3).await
    }

    async fn spawn_with_broker(broker: InMemoryBroker, connect_attempts: u32) -> Self {
        let store = Arc::new(InMemoryRecordStore::new());
        let index = Arc::new(InMemorySearchIndex::new());
        let connection = BrokerConnection::new(
            Arc::new(broker.clone()),
            ConnectionSettings {
                queue: QUEUE.to_string(),
                retry: RetryPolicy::linear(connect_attempts, Duration::from_millis(10)),
            },
        );

        // Same router as prod, but in-memory adapters and an ephemeral port.
        let app = build_app(AppState {
            store: store.clone(),
            publisher: Publisher::new(connection),
            search: index.clone(),
            index_name: INDEX.to_string(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            broker,
            store,
            index,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn article() -> serde_json::Value {
    json!({
        "title": "Rates held",
        "content": "The central bank kept rates unchanged.",
        "author": "J. Doe",
        "source": "wire",
    })
}

#[tokio::test]
async fn health_is_ok() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_stores_record_and_queues_job() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/api/news"))
        .json(&article())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["message"], "News stored and queued");
    let id = body["id"].as_i64().unwrap();

    assert_eq!(server.store.len(), 1);
    let published = server.broker.published(QUEUE);
    assert_eq!(published.len(), 1);
    let job = Job::decode(&published[0].body, published[0].header(ATTEMPTS_HEADER)).unwrap();
    assert_eq!(job, Job::new(RecordId::new(id)));
    assert!(published[0].persistent);
}

#[tokio::test]
async fn create_rejects_blank_or_missing_fields() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut blank = article();
    blank["title"] = json!("   ");
    let missing = json!({ "title": "Only a title" });

    for body in [blank, missing] {
        let res = client
            .post(server.url("/api/news"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let err: serde_json::Value = res.json().await.unwrap();
        assert_eq!(err["status"], "error");
        assert!(err["message"].is_string());
    }

    assert!(server.store.is_empty());
    assert!(server.broker.published(QUEUE).is_empty());
}

#[tokio::test]
async fn create_rejects_overlong_title() {
    let server = TestServer::spawn().await;
    let mut body = article();
    body["title"] = json!("x".repeat(256));

    let res = reqwest::Client::new()
        .post(server.url("/api/news"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_reports_internal_error_when_broker_is_down() {
    let broker = InMemoryBroker::new();
    broker.fail_next_opens(10);
    let server = TestServer::spawn_with_broker(broker, 2).await;

    let res = reqwest::Client::new()
        .post(server.url("/api/news"))
        .json(&article())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let err: serde_json::Value = res.json().await.unwrap();
    assert_eq!(err["message"], "Internal server error");
}

#[tokio::test]
async fn get_by_id_returns_record_or_404() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(server.url("/api/news"))
        .json(&article())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();

    let res = client
        .get(server.url(&format!("/api/news/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let record: serde_json::Value = res.json().await.unwrap();
    assert_eq!(record["id"], id);
    assert_eq!(record["title"], "Rates held");

    let res = client.get(server.url("/api/news/9999")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(server.url("/api/news/abc")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_requires_a_query() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for path in ["/api/search", "/api/search?query=", "/api/search?query=%20%20"] {
        let res = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{path}");
    }
}

#[tokio::test]
async fn search_returns_matching_documents() {
    let server = TestServer::spawn().await;
    server
        .index
        .create_index(INDEX, &IndexSchema::news())
        .await
        .unwrap();
    let record = Record {
        id: RecordId::new(7),
        title: "Rates held".to_string(),
        content: "Unchanged".to_string(),
        author: "J. Doe".to_string(),
        source: "wire".to_string(),
        created_at: Utc::now(),
    };
    server
        .index
        .upsert_document(INDEX, &IndexDocument::from_record(&record))
        .await
        .unwrap();

    let hits: serde_json::Value = reqwest::get(server.url("/api/search?query=rates"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], "7");
    assert_eq!(hits[0]["document"]["title"], "Rates held");
}

#[tokio::test]
async fn search_before_any_indexing_is_empty() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(server.url("/api/search?query=anything")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let hits: serde_json::Value = res.json().await.unwrap();
    assert_eq!(hits, json!([]));
}
