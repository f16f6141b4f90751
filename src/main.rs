use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use cubby::{Config, Server, Shutdown};

#[tokio::main]
async fn main() -> ExitCode {
    // Config path: first argument, then CUBBY_CONFIG, then ./config.toml
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CUBBY_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".to_string());

    let mut config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();

    if let Err(e) = cubby::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        cubby::logging::init_console_only(&config.logging.level);
    }

    info!("Cubby file storage server");
    info!("Server configured on {}", config.bind_addr());

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn(forward_signals(server.shutdown_handle()));

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Trigger shutdown on every SIGINT or SIGTERM. Repeats are harmless.
async fn forward_signals(shutdown: Arc<Shutdown>) {
    #[cfg(unix)]
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    loop {
        #[cfg(unix)]
        let term = async {
            match terminate.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }
            _ = term => {}
        }

        if !shutdown.trigger() {
            info!("Shutdown already in progress");
        }
    }
}
