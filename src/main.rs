use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chatd::api;
use chatd::config::AppConfig;
use chatd::llm::ConfigModelResolver;
use chatd::processor::{Processor, ProcessorDeps};
use chatd::store::{ChatStore, LibSqlBackend};
use chatd::stream::StreamManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to read configuration")?;

    // stderr always, plus a daily file when CHATD_LOG_DIR is set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "chatd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("chatd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api/chats", config.http_port);
    eprintln!("   Stream: ws://0.0.0.0:{}/ws/chats/{{id}}", config.http_port);

    // ── Database ────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store: Arc<dyn ChatStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Processor ───────────────────────────────────────────────────
    let processor = Arc::new(Processor::new(
        config.processor.clone(),
        ProcessorDeps {
            store,
            model_resolver: Arc::new(ConfigModelResolver::new(
                config.anthropic_api_key.clone(),
                config.model.clone(),
            )),
            streams: StreamManager::new(),
            agent_connector: None,
            workspace_creator: None,
        },
    ));

    // ── HTTP ────────────────────────────────────────────────────────
    let app = api::routes(Arc::clone(&processor));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Chat API server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Chat API server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutting down");

    // Release in-flight chats before the server and its streams go away.
    processor.close().await;
    server.abort();
    Ok(())
}
