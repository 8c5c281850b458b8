//! Standalone qreadout server
//!
//! Starts the Axum server with a real engine thread. Acquisitions are fed by
//! the synthetic packet source, so every endpoint works without hardware.

use qreadout_server::{AppState, EngineHandle, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("qreadout=info,qreadout_core=info,qreadout_server=debug")),
        )
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(ServerConfig::default().port);
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());

    let engine = EngineHandle::spawn();
    let config = ServerConfig { port, bind_addr };
    let state = AppState::new(engine, config);

    if let Ok(ip) = local_ip_address::local_ip() {
        tracing::info!(url = %format!("http://{}:{}", ip, port), "Remote access");
    }
    tracing::info!(port, version = qreadout_core::VERSION, "Qreadout server starting");

    if let Err(e) = qreadout_server::start_server(state).await {
        tracing::error!(error = %e, "Server error");
        return Err(e);
    }
    Ok(())
}
