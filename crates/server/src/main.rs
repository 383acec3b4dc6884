use skylark_server::app::App;
use skylark_server::config;
use std::env;
use std::path::Path;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("SKYLARK_CONFIG").unwrap_or_else(|_| "skylark.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let app = App::init(config).await.expect("realtime core");
        info!(node = %app.state().node_id, "skylark node running");
        // The core is transport-agnostic; connection front-ends run as
        // separate services and drive on_connect/on_disconnect. Keep the
        // workers alive until the process is asked to stop.
        tokio::signal::ctrl_c().await.expect("signal handler");
        info!("shutdown requested");
    });
}
