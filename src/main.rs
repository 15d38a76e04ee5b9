use std::sync::Arc;

use tokio::task::JoinHandle;

use tradehook::config::Config;
use tradehook::db::SignalStore;
use tradehook::dispatch::Dispatcher;
use tradehook::exchange::BybitClient;
use tradehook::server::{self, AppState};
use tradehook::Result;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 tradehook starting");

    let config = Config::from_env()?;

    let store = Arc::new(SignalStore::connect(&config.database_url).await?);

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Bind: {}", config.bind_addr);
    tracing::info!("  Webhook rate limit: {}/min per IP", config.rate_limit_rpm);
    tracing::info!("  DB timeout: {:?}", config.db_timeout);
    tracing::info!(
        "  Dispatch: every {:?}, batch {}, dedup window {}s",
        config.dispatch.interval,
        config.dispatch.batch_size,
        config.dispatch.dedup_window_secs
    );
    tracing::info!(
        "  Exchange: {}",
        config
            .exchange
            .as_ref()
            .map(|e| e.base_url.as_str())
            .unwrap_or("not configured")
    );

    // HTTP ingestion loop
    let server_task = {
        let state = AppState::new(store.clone(), &config);
        let bind_addr = config.bind_addr;
        tokio::spawn(async move {
            if let Err(e) = server::serve(state, bind_addr).await {
                tracing::error!("HTTP server error: {}", e);
            }
        })
    };

    // Dispatcher loop, only with exchange credentials; otherwise signals
    // stay pending for whoever consumes them
    let dispatch_task = match config.exchange.clone() {
        Some(exchange) => {
            let client = BybitClient::new(&exchange.base_url, &exchange.api_key, &exchange.api_secret);
            if let Err(e) = client.sync_time().await {
                tracing::warn!("Exchange clock sync failed ({}), using local time", e);
            }

            let dispatcher = Dispatcher::new(
                store.clone(),
                client,
                config.risk.clone(),
                config.dispatch.clone(),
            );
            Some(tokio::spawn(dispatcher.run()))
        }
        None => {
            tracing::info!("Dispatcher disabled (no exchange credentials)");
            None
        }
    };

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!("\nPress Ctrl+C to stop...\n");

    // Wait for Ctrl+C or task failure
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = server_task => {
            tracing::error!("HTTP server exited: {:?}", result);
        }
        result = wait_dispatch(dispatch_task) => {
            tracing::error!("Dispatcher exited: {:?}", result);
        }
    }

    tracing::info!("👋 tradehook stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradehook=info".into()),
        )
        .init();
}

async fn wait_dispatch(task: Option<JoinHandle<()>>) -> std::result::Result<(), tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
