use std::sync::Arc;

use anyhow::Context;

use newsflow_api::{AppState, build_app};
use newsflow_events::{BrokerConnection, Publisher};
use newsflow_infra::Settings;
use newsflow_infra::broker::{RedisStreamsSettings, RedisStreamsTransport};
use newsflow_infra::record_store::PostgresRecordStore;
use newsflow_infra::search::ElasticsearchIndex;

#[tokio::main]
async fn main() {
    newsflow_observability::init();

    if let Err(err) = run().await {
        tracing::error!(error = format!("{err:#}"), "api failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;

    let store = PostgresRecordStore::connect(&settings.database_url)
        .await
        .context("record store unreachable")?;
    if settings.is_production() {
        tracing::info!("production environment, skipping schema sync");
    } else {
        store.ensure_schema().await.context("schema sync failed")?;
    }

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
    connection.connect().await.context("broker unreachable")?;

    let search = ElasticsearchIndex::new(&settings.search.url).context("invalid search url")?;

    let app = build_app(AppState {
        store: Arc::new(store),
        publisher: Publisher::new(connection.clone()),
        search: Arc::new(search),
        index_name: settings.search.index.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&settings.api_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.api_bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Err(err) = connection.close().await {
        tracing::warn!(error = %err, "broker close failed");
    }
    tracing::info!("api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
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
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
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
    tracing::info!("shutdown signal received");
}
