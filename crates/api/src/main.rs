use anyhow::Context;

use assetflow_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the process environment still applies.
    let _ = dotenvy::dotenv();
    assetflow_observability::init();

    let config = AppConfig::from_env().context("loading configuration")?;
    let services = std::sync::Arc::new(assetflow_api::app::services::build_services(&config).await?);
    let background = services.spawn_background(tokio::runtime::Handle::current())?;

    let app = assetflow_api::app::build_app(std::sync::Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    for handle in background {
        let name = handle.name();
        tokio::task::spawn_blocking(move || handle.shutdown()).await?;
        tracing::info!(worker = name, "background worker stopped");
    }
    Ok(())
}
