//! `godemand-core`: loads the pool config, opens the persistent store,
//! then runs the syncer and the HTTP API side by side until a shutdown
//! signal drains both.

mod api;
mod registry;
mod syncer;

use common_lib::config::ConfigHandle;
use common_lib::store::EtcdResourceStore;
use controller::cloud::{GceAdapter, RetryingAdapter};
use registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use syncer::Syncer;

#[derive(Debug, StructOpt)]
#[structopt(name = utils::package_description!(), version = utils::version_info_str!())]
struct CliArgs {
    /// Path to the JSON pool/database-map config, reloaded every `config-reload-period`.
    #[structopt(long, env = "CONFIG_PATH", default_value = "/etc/godemand/config.json")]
    config_path: String,

    /// How often the config file is re-read for changes.
    #[structopt(long, default_value = utils::CONFIG_RELOAD_PERIOD)]
    config_reload_period: humantime::Duration,

    /// etcd endpoint backing the persistent `ResourceStore`.
    #[structopt(long, env = "REDIS_ARRD", default_value = "http://localhost:2379")]
    redis_arrd: String,

    /// Lease TTL for a pool's exclusive lock.
    #[structopt(long, default_value = utils::STORE_LEASE_LOCK_TTL)]
    store_lease_ttl: humantime::Duration,

    /// Period between syncer ticks.
    #[structopt(long, default_value = utils::SYNC_TICK_PERIOD)]
    sync_tick_period: humantime::Duration,

    /// Maximum number of pools synced concurrently per tick.
    #[structopt(long, default_value = "8")]
    sync_concurrency: usize,

    /// Bearer token used to authenticate against the GCE Compute API.
    #[structopt(long, env = "GCE_BEARER_TOKEN", default_value = "")]
    gce_bearer_token: String,

    /// Address the HTTP API listens on.
    #[structopt(long, default_value = utils::DEFAULT_API_ADDR)]
    api_addr: String,

    /// How long in-flight syncer ticks and HTTP requests are given to
    /// finish once shutdown is requested.
    #[structopt(long, default_value = "5s")]
    shutdown_grace: humantime::Duration,
}

#[tokio::main]
async fn main() {
    let cli_args = CliArgs::from_args();
    utils::print_package_info!();
    utils::init_tracing("godemand-core");
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

    #[snafu(display("failed to connect to the persistent store: {}", source))]
    Store { source: common_lib::store::StoreError },

    #[snafu(display("failed to build pool registry: {}", source))]
    Registry { source: registry::RegistryError },

    #[snafu(display("HTTP server failed: {}", source))]
    Server { source: std::io::Error },
}

async fn run(cli_args: CliArgs) -> Result<(), StartupError> {
    let shutdown = shutdown::Shutdown::new();
    shutdown.on_signal();

    let config = ConfigHandle::from_path(&cli_args.config_path)
        .await
        .map_err(|source| StartupError::Config { source })?;

    let store = Arc::new(
        EtcdResourceStore::connect(&cli_args.redis_arrd, cli_args.store_lease_ttl.into())
            .await
            .map_err(|source| StartupError::Store { source })?,
    );

    let adapter = Arc::new(RetryingAdapter::new(GceAdapter::new(reqwest::Client::new(), cli_args.gce_bearer_token.clone())));

    let registry = Registry::new(config.clone(), store, adapter).map_err(|source| StartupError::Registry { source })?;

    config.spawn_reloader(cli_args.config_path.clone(), cli_args.config_reload_period.into(), shutdown.clone(), {
        let registry = registry.clone();
        move |_config| registry.refresh_controllers()
    });

    let syncer = Syncer::new(registry.clone(), cli_args.sync_tick_period.into(), cli_args.sync_concurrency);
    let syncer_shutdown = shutdown.clone();
    let grace: Duration = cli_args.shutdown_grace.into();
    let syncer_handle = tokio::spawn(async move { syncer.run(syncer_shutdown, grace).await });

    api::run(registry, &cli_args.api_addr, shutdown, grace)
        .await
        .map_err(|source| StartupError::Server { source })?;

    let _ = syncer_handle.await;
    tracing::info!("shutdown complete");
    Ok(())
}
