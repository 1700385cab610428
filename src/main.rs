use admission_gateway::{AdmissionFilter, Args, PeerConnection, TrackedListener, handlers, state::AppState};
use clap::Parser; // for cli
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = args.limiter_config()?;
    let filter = Arc::new(AdmissionFilter::new(config)?);

    // creating shared state
    let state = Arc::new(AppState::new(args.upstream.clone(), filter.clone()));
    let app = handlers::router(state.clone());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TrackedListener::bind(&addr).await?;

    info!("Gateway running on http://localhost:{}", args.port);
    info!("Forwarding to {}", state.upstream);
    info!(
        "Limits: {} requests per {}ms, {} connections, {} failures, refresh {}ms",
        filter.config().limit,
        filter.config().interval.as_millis(),
        filter.config().connections,
        filter.config().failure_limit,
        filter.config().refresh_interval.as_millis()
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<PeerConnection>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    filter.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
