use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use serial_router::{cli, config::Config, logging, router::Router};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };

    if let Some(command) = cli.command {
        return cli::handle_command(command, &config);
    }

    if let Some(incoming) = cli.incoming {
        config.incoming_port = incoming;
    }

    let level = config.log_level.into();
    logging::init(level, config.log_dir.clone().map(|dir| (level, dir))).await;

    match &cli.config {
        Some(config_path) => debug!(?config_path, "Config from path"),
        None => debug!("Default config"),
    }

    let routed = route(&config, cli.status_interval).await;
    if let Err(e) = &routed {
        error!("Routing failed: {e}");
    }

    logging::shutdown();

    routed
}

/// Route until told to quit.
async fn route(config: &Config, status_interval: u64) -> Result<()> {
    let mut router = Router::serial();
    router.start(config.router_config()?)?;

    let mut status_interval = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    // The first tick completes right away.
    status_interval.tick().await;

    #[cfg(unix)]
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        #[cfg(unix)]
        let hung_up = hangup.recv();
        #[cfg(not(unix))]
        let hung_up = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting");
                break;
            }
            _ = hung_up => {
                info!("Told to hang up, quitting");
                break;
            }
            _ = status_interval.tick() => {
                for worker in router.status().workers {
                    info!("{worker}");
                }
            }
        }
    }

    router.stop().await;

    Ok(())
}
