//! Indexing worker: consumes jobs from the broker and writes documents to the
//! search index until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use newsflow_events::{BrokerConnection, Publisher};
use newsflow_infra::Settings;
use newsflow_infra::broker::{RedisStreamsSettings, RedisStreamsTransport};
use newsflow_infra::jobs::{Consumer, JobHandler, RetryScheduler};
use newsflow_infra::record_store::PostgresRecordStore;
use newsflow_infra::search::{ElasticsearchIndex, IndexEnsurer, IndexSchema, SearchIndex};

/// Upper bound on waiting for in-flight jobs at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    newsflow_observability::init();

    if let Err(err) = run().await {
        error!(error = format!("{err:#}"), "worker failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;

    let store = PostgresRecordStore::connect(&settings.database_url)
        .await
        .context("record store unreachable")?;

    let result = serve(&settings, store.clone()).await;
    store.close().await;
    result
}

/// Run the consumer until a shutdown signal or a fatal broker error. The
/// broker session is closed on every path out of here.
async fn serve(settings: &Settings, store: PostgresRecordStore) -> anyhow::Result<()> {
    let index: Arc<dyn SearchIndex> = Arc::new(
        ElasticsearchIndex::new(&settings.search.url).context("invalid search url")?,
    );
    let ensurer = IndexEnsurer::new(index.clone(), &settings.search.index, IndexSchema::news());
    let outcome = ensurer
        .ensure_index()
        .await
        .context("search index setup failed")?;
    info!(index = %settings.search.index, ?outcome, "search index ready");

    let transport = RedisStreamsTransport::new(
        &settings.broker.url,
        RedisStreamsSettings::new(
            &settings.broker.group,
            &settings.broker.consumer,
            &settings.broker.connection_name,
        ),
    )
    .context("invalid broker url")?;
    let connection =
        BrokerConnection::new(Arc::new(transport), settings.broker.connection_settings());

    let handler = JobHandler::new(Arc::new(store), index, &settings.search.index);
    let retry = RetryScheduler::new(
        Publisher::new(connection.clone()),
        settings.worker.retry_policy(),
    );
    let consumer = Consumer::new(
        connection.clone(),
        handler,
        retry,
        Some(ensurer),
        settings.worker.consumer_settings(),
    );
    if let Err(err) = consumer.start().await {
        stop(&consumer, &connection).await;
        return Err(err).context("consumer failed to start");
    }

    let fatal = tokio::select! {
        _ = shutdown_signal() => None,
        err = consumer.fatal_error() => Some(err),
    };

    stop(&consumer, &connection).await;
    match fatal {
        Some(err) => Err(err).context("broker connection lost for good"),
        None => Ok(()),
    }
}

async fn stop(consumer: &Consumer, connection: &BrokerConnection) {
    if tokio::time::timeout(SHUTDOWN_GRACE, consumer.shutdown())
        .await
        .is_err()
    {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "in-flight jobs still running, leaving them to the broker"
        );
    }
    if let Err(err) = connection.close().await {
        warn!(error = %err, "broker close failed");
    }

    let stats = consumer.stats();
    info!(
        indexed = stats.indexed,
        skipped = stats.skipped,
        requeued = stats.requeued,
        discarded = stats.discarded,
        restarts = stats.restarts,
        "worker stopped"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
