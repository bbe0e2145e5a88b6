use anyhow::Result;
use capguard_daemon::{
    collector::LinuxSampler,
    config::Config,
    control::Controller,
    executor::SignalEnforcer,
    notifier::Notifier,
    service::{Monitor, MonitorOptions},
    socket::{handle_client, SocketServer},
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn spawn_notifications(monitor: &Monitor, notifier: Notifier) {
    let mut events = monitor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if Notifier::message(&event).is_some() {
                        tokio::task::spawn_blocking(move || notifier.notify(&event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Notification listener missed {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,capguard_daemon=info")),
        )
        .init();
    info!("CapGuard daemon starting...");

    // Load configuration. A file that fails to parse is never overwritten.
    let config_path = Config::config_path();
    let (config, persist) = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(config) => (config, true),
            Err(e) => {
                warn!("Failed to load config: {}, using defaults", e);
                (Config::default(), false)
            }
        }
    } else {
        info!("No config file found, using defaults");
        (Config::default(), true)
    };
    info!(
        "Loaded {} rules ({} enabled)",
        config.settings.rules.len(),
        config.settings.enabled_rules().count()
    );

    let monitor = Monitor::spawn(
        config.settings.clone(),
        Arc::new(LinuxSampler::new()),
        Arc::new(SignalEnforcer::new(config.kill_grace())),
        MonitorOptions {
            interval_seconds: config.general.sample_interval_seconds,
            ..MonitorOptions::default()
        },
    );
    spawn_notifications(&monitor, Notifier::new(config.general.notify_on_kill));

    let controller = Arc::new(Controller::new(
        monitor.clone(),
        config.general.clone(),
        persist.then(|| config_path.clone()),
    ));

    let server = SocketServer::bind(&SocketServer::socket_path()).await?;

    if config.general.start_monitoring {
        monitor.start().await?;
    }

    info!("Daemon ready, listening for connections...");

    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok(stream) => {
                    let controller = Arc::clone(&controller);
                    let events = monitor.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, events, controller).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("Terminated, shutting down");
                break;
            }
        }
    }

    monitor.stop().await?;
    if persist {
        let config = controller.current_config().await?;
        match config.save(&config_path) {
            Ok(()) => info!("Settings saved to {:?}", config_path),
            Err(e) => error!("Failed to save settings: {}", e),
        }
    }
    Ok(())
}
