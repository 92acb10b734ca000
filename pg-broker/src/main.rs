//! `pg-broker`: terminates the PostgreSQL wire protocol on `:5432`,
//! resolves each connection to a backend through `godemand-core`, then
//! proxies bytes while tracking activity for heartbeats.

mod client;
mod heartbeat;
mod session;
mod wire;

use client::GodemandClient;
use common_lib::config::ConfigHandle;
use std::sync::Arc;
use structopt::StructOpt;
use tokio::net::TcpListener;

#[derive(Debug, StructOpt)]
#[structopt(name = utils::package_description!(), version = utils::version_info_str!())]
struct CliArgs {
    /// Path to the JSON pool/database-map config, reloaded every `config-reload-period`.
    #[structopt(long, env = "CONFIG_PATH", default_value = "/etc/godemand/config.json")]
    config_path: String,

    /// How often the config file is re-read for changes.
    #[structopt(long, default_value = utils::CONFIG_RELOAD_PERIOD)]
    config_reload_period: humantime::Duration,

    /// Base URL of the control-plane HTTP API.
    #[structopt(long, env = "GODEMAND_ADDR", default_value = "http://godemand")]
    godemand_addr: String,

    /// Address the broker listens for PostgreSQL wire-protocol clients on.
    #[structopt(long, default_value = "0.0.0.0:5432")]
    listen_addr: String,

    /// How long in-flight sessions are given to drain once shutdown is requested.
    #[structopt(long, default_value = "5s")]
    shutdown_grace: humantime::Duration,
}

#[tokio::main]
async fn main() {
    let cli_args = CliArgs::from_args();
    utils::print_package_info!();
    utils::init_tracing("pg-broker");
    tracing::info!(?cli_args, "starting");

    if let Err(err) = run(cli_args).await {
        tracing::error!(%err, "fatal startup error");
        std::process::exit(1);
    }
}

#[derive(Debug, snafu::Snafu)]
enum StartupError {
    #[snafu(display("failed to load initial config: {}", source))]
    Config { source: common_lib::config::ConfigError },
    #[snafu(display("failed to bind {}: {}", addr, source))]
    Bind { addr: String, source: std::io::Error },
}

async fn run(cli_args: CliArgs) -> Result<(), StartupError> {
    let shutdown = shutdown::Shutdown::new();
    shutdown.on_signal();

    let config = ConfigHandle::from_path(&cli_args.config_path)
        .await
        .map_err(|source| StartupError::Config { source })?;

    config.spawn_reloader(cli_args.config_path.clone(), cli_args.config_reload_period.into(), shutdown.clone(), |_config| {});

    let api = Arc::new(GodemandClient::new(cli_args.godemand_addr.clone()));
    let listener = TcpListener::bind(&cli_args.listen_addr).await.map_err(|source| StartupError::Bind { addr: cli_args.listen_addr.clone(), source })?;
    tracing::info!(addr = %cli_args.listen_addr, "listening for PostgreSQL clients");

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => {
                let (stream, client_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept connection");
                        continue;
                    }
                };
                let api = api.clone();
                let config = config.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    session::handle_connection(stream, client_addr, api, config, shutdown).await;
                });
            }
        }
    }

    tracing::info!("no longer accepting connections, draining in-flight sessions");
    let grace: std::time::Duration = cli_args.shutdown_grace.into();
    let _ = shutdown::with_grace_period(tokio::time::sleep(grace), grace).await;
    tracing::info!("shutdown complete");
    Ok(())
}
