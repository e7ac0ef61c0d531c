//! AOA-Forward host: entry point.
//!
//! # What happens at startup
//!
//! 1. CLI arguments are parsed with `clap`.
//! 2. The TOML config is loaded (or defaults used) and CLI overrides applied.
//! 3. `tracing_subscriber` is initialised.  `RUST_LOG` wins; otherwise the
//!    configured log level is used.
//! 4. Ctrl+C (and SIGTERM on Unix) cancels the root `CancellationToken`.
//! 5. The session supervisor runs until that token is cancelled: find a
//!    phone, switch it into accessory mode, forward sockets, and start over
//!    when the device goes away.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aoa_core::DeviceFilter;
use aoa_forward::application::supervisor::{SessionSupervisor, SupervisorSettings};
use aoa_forward::cli::{validate_device_ids, Cli};
use aoa_forward::infrastructure::sockets::RegistryConfig;
use aoa_forward::infrastructure::storage::config::{load_config, render_config, AppConfig};
use aoa_forward::infrastructure::usb::{
    Negotiator, NegotiatorConfig, NusbHotplug, UsbAccessoryAcquirer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("failed to load config")?;
    cli.apply_to(&mut config)?;

    if cli.print_config {
        print!("{}", render_config(&config)?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    let filter = device_filter(&config)?;
    info!(
        "AOA-Forward starting: device={filter}, forwarding to {}:{}",
        config.forward.host, config.forward.default_port
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let acquirer = UsbAccessoryAcquirer::new(
        Negotiator::new(NegotiatorConfig::from_app_config(&config)),
        config.transport.clone(),
    );
    let mut supervisor = SessionSupervisor::new(acquirer, filter, supervisor_settings(&config));
    if config.supervisor.use_hotplug {
        match NusbHotplug::new() {
            Ok(watcher) => supervisor = supervisor.with_watcher(Box::new(watcher)),
            Err(e) => warn!(
                "hotplug unavailable ({e}), retrying every {:?}",
                config.supervisor.retry_interval()
            ),
        }
    }

    let sessions = supervisor.run(shutdown).await;
    info!("AOA-Forward stopped after {sessions} session(s)");
    Ok(())
}

/// Device filter from the effective config, checked the same way as the
/// positional CLI ids.
fn device_filter(config: &AppConfig) -> anyhow::Result<DeviceFilter> {
    match config.device.filter() {
        DeviceFilter::Exact(wanted) => Ok(validate_device_ids(wanted.vendor_id, wanted.product_id)?),
        DeviceFilter::AnyCompatible => {
            if config.device.vendor_id.is_some() || config.device.product_id.is_some() {
                warn!("[device] needs both vendor_id and product_id; using any compatible device");
            }
            Ok(DeviceFilter::AnyCompatible)
        }
    }
}

fn supervisor_settings(config: &AppConfig) -> SupervisorSettings {
    SupervisorSettings {
        default_port: config.forward.default_port,
        registry: RegistryConfig {
            host: config.forward.host.clone(),
            connect_timeout: config.forward.connect_timeout(),
        },
        poll_timeout: config.transport.poll_timeout(),
        grace_period: config.supervisor.grace_period(),
        retry_interval: config.supervisor.retry_interval(),
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("failed to listen for Ctrl+C: {e}");
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for Ctrl+C: {e}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
        }
    }

    info!("shutdown signal received");
    shutdown.cancel();
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_settings_follow_config() {
        // Arrange
        let mut config = AppConfig::default();
        config.forward.default_port = 8080;
        config.forward.host = "127.0.0.1".to_string();
        config.supervisor.grace_period_ms = 250;

        // Act
        let settings = supervisor_settings(&config);

        // Assert
        assert_eq!(settings.default_port, 8080);
        assert_eq!(settings.registry.host, "127.0.0.1");
        assert_eq!(settings.grace_period, Duration::from_millis(250));
        assert_eq!(settings.retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_config_file_ids_are_validated() {
        let mut config = AppConfig::default();
        config.device.vendor_id = Some(0x1234);
        config.device.product_id = Some(0x2D00);
        assert!(device_filter(&config).is_err());
    }

    #[test]
    fn test_half_a_device_filter_falls_back_to_any() {
        let mut config = AppConfig::default();
        config.device.vendor_id = Some(0x04E8);
        assert_eq!(device_filter(&config).unwrap(), DeviceFilter::AnyCompatible);
    }
}
