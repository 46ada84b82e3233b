use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use pagecast::logging::init_logging;
use pagecast::{api, Config, SessionHandle, StreamCoordinator};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let _logging_guards = init_logging(config.log_dir.as_deref());

    tracing::info!(
        target: "system",
        bind = %config.bind_addr,
        chrome = %config.chrome_host,
        frame_rate = config.frame_rate,
        "pagecast starting"
    );

    let bind_addr = config.bind_addr.clone();
    let (coordinator, handle) = StreamCoordinator::new(config);
    tokio::spawn(coordinator.run());

    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(target: "system", "failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };

    let app = api::router(handle.clone());
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(handle))
        .await
    {
        tracing::error!(target: "system", "server error: {e}");
    }

    tracing::info!(target: "system", "pagecast stopped");
}

/// Waits for SIGINT/SIGTERM, then stops any running stream so the encoder
/// gets its two-phase termination before the process exits.
async fn shutdown_signal(handle: SessionHandle) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(target: "system", "failed to install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    tracing::info!(target: "system", "termination signal received, stopping stream");
    if let Err(e) = handle.stop().await {
        tracing::debug!(target: "system", "no stream to stop: {e}");
    }
}
