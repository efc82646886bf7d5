//! HTTP server for the auction engine.
//!
//! Endpoints: health, request submission, per-session bid/offer operations, failure
//! reports, session views and the `/ws/events` stream. Configuration comes from the
//! environment (see [`EngineConfig::from_env`]) plus `PORT`, `ARCHIVE_DIR` and
//! `PROVIDERS_FILE` (JSON array of provider profiles; a seeded synthetic fleet otherwise).

use dispatch_auction_engine::{
    api, EngineConfig, FileArchive, Generator, GeneratorConfig, InMemoryDirectory, ProviderProfile, SessionManager,
    StdoutAuditSink,
};
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;

fn load_providers() -> Result<Vec<ProviderProfile>, String> {
    match std::env::var("PROVIDERS_FILE") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
            serde_json::from_str(&raw).map_err(|e| format!("{path}: {e}"))
        }
        Err(_) => {
            let seed = std::env::var("SIM_SEED").ok().and_then(|s| s.parse().ok()).unwrap_or(0);
            Ok(Generator::new(GeneratorConfig {
                seed,
                ..Default::default()
            })
            .providers())
        }
    }
}

async fn run() -> Result<(), String> {
    let config = EngineConfig::from_env().map_err(|e| e.to_string())?;
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let providers = load_providers()?;
    info!("provider directory loaded providers={}", providers.len());
    let directory = Arc::new(InMemoryDirectory::new(providers));

    let mut builder = SessionManager::builder(config, directory).audit(Arc::new(StdoutAuditSink));
    if let Ok(dir) = std::env::var("ARCHIVE_DIR") {
        let archive = FileArchive::new(&dir).map_err(|e| e.to_string())?;
        info!("archiving sessions under {}", dir);
        builder = builder.archive(Arc::new(archive));
    }
    let manager = builder.build().map_err(|e| e.to_string())?;

    let app = api::create_router(manager);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| format!("bind {addr}: {e}"))?;
    info!("listening on http://{}", addr);
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let _ = env_logger::try_init();
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}
