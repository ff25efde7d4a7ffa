use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;

use patter_core::config::Config;
use patter_core::dialog::DialogManager;
use patter_core::store::Store;
use patter_telegram::TelegramAdapter;

mod intake;
mod scheduler;
mod worker;

/// One enqueued webhook delivery, acked before any scenario work runs.
pub struct WebhookJob {
    pub bot_id: String,
    pub raw: serde_json::Value,
}

/// Shared server state: the engine, the store, the per-bot adapters, and
/// the intake queue feeding the worker pool.
pub struct AppState {
    pub store: Arc<Store>,
    pub manager: Arc<DialogManager>,
    pub adapters: ArcSwap<HashMap<String, Arc<TelegramAdapter>>>,
    pub queue: mpsc::Sender<WebhookJob>,
    pub config: Config,
}

#[derive(Parser)]
#[command(name = "patter-server")]
struct Cli {
    /// Path to the config file
    #[arg(long, default_value = "patter.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let store = Arc::new(
        Store::open(Path::new(&config.storage.database)).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }),
    );
    let manager = Arc::new(DialogManager::new(store.clone(), config.engine.clone()));

    let (queue_tx, queue_rx) = mpsc::channel(config.engine.queue_size.max(1));
    let state = Arc::new(AppState {
        store,
        manager,
        adapters: ArcSwap::from_pointee(HashMap::new()),
        queue: queue_tx,
        config: config.clone(),
    });

    scheduler::rebuild_adapters(&state);

    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
    for n in 0..config.engine.workers.max(1) {
        tokio::spawn(worker::run(n, state.clone(), queue_rx.clone()));
    }
    tokio::spawn(scheduler::run(state.clone()));

    let app = intake::router(state);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to bind to {bind_addr}: {e}");
            std::process::exit(1);
        });

    println!("patter-server listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: server error: {e}");
            std::process::exit(1);
        });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("Received Ctrl+C, shutting down"),
        () = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}
