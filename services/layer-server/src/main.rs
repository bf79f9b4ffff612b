//! The `layer-server` binary: serves layers from the storage backend selected by
//! the environment.

use eyre::WrapErr as _;
use layer_server::Config;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_error::ErrorLayer::default())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            let setting = error.setting();
            tracing::error!(
                option = setting.name,
                description = setting.description,
                "{error}"
            );
            std::process::exit(1);
        }
    };

    tracing::info!(
        port = config.port,
        flake = %config.flake,
        timeout = ?config.timeout,
        backend = %config.backend,
        "starting layer server"
    );

    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("failed to initialise storage backend")?;
    tracing::info!(backend = storage.name(), "initialised storage backend");

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .wrap_err_with(|| format!("failed to bind port {}", config.port))?;

    tracing::info!("layer server listening on :{}", config.port);
    axum::serve(listener, layer_server::router(storage)).await?;

    Ok(())
}
