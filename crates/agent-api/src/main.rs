use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vidchat_agent_api::{
    agent::{Agent, GroqAgent},
    build_router,
    config::Config,
    mcp::McpClient,
    registry::{spawn_sweeper, TaskRegistry},
    AppState,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    init_tracing(&config);

    std::fs::create_dir_all(&config.upload_dir).with_context(|| {
        format!(
            "failed to create UPLOAD_DIR at {}",
            config.upload_dir.display()
        )
    })?;

    if config.agent.api_key.is_empty() {
        warn!("GROQ_API_KEY is not set; /chat requests will fail");
    }

    let mcp = Arc::new(
        McpClient::new(config.mcp_server.clone(), config.mcp_timeout)
            .context("failed to build MCP client")?,
    );
    let agent = Arc::new(GroqAgent::new(config.agent.clone(), Some(Arc::clone(&mcp))));
    let registry = Arc::new(TaskRegistry::new());

    let state = AppState::new(
        Arc::clone(&registry),
        mcp,
        agent.clone(),
        config.upload_dir.clone(),
        config.max_upload_bytes,
    );

    let sweeper_cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(
        registry,
        config.task_ttl,
        config.sweep_interval,
        sweeper_cancel.clone(),
    );

    let app = build_router(state.clone(), &config.cors_origins);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid BIND_ADDRESS {}", config.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(
        %addr,
        mcp_server = %config.mcp_server,
        upload_dir = %config.upload_dir.display(),
        "agent api listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("agent api failed")?;

    state.processor.shutdown(SHUTDOWN_GRACE).await;
    sweeper_cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "task sweeper exited abnormally");
    }
    agent.reset_memory().await;

    info!("agent api stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::try_new(&config.log_level).unwrap_or_else(|e| {
            eprintln!(
                "WARN: LOG_LEVEL='{}' is not a valid filter ({e}); falling back to 'info'",
                config.log_level
            );
            tracing_subscriber::EnvFilter::new("info")
        })
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
