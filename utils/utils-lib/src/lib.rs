//! Small ambient helpers shared by every `godemand` binary: version/CLI
//! banner macros and `tracing` initialisation.

/// Default TCP listen address for the control-plane HTTP API.
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
/// Default poll period for config hot-reload.
pub const CONFIG_RELOAD_PERIOD: &str = "5s";
/// Default per-resource sync tick period.
pub const SYNC_TICK_PERIOD: &str = "1s";
/// Default timeout applied to a single store operation.
pub const STORE_OP_TIMEOUT: &str = "5s";
/// Default lease TTL for a pool's exclusive lock.
pub const STORE_LEASE_LOCK_TTL: &str = "30s";

/// Prints `<name> <version>` the same way `structopt`-based binaries in
/// this workspace render their `--version` banner.
#[macro_export]
macro_rules! package_description {
    () => {
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
    };
}

/// Returns the crate version string used in the `structopt` `version`
/// attribute.
#[macro_export]
macro_rules! version_info_str {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

/// Print the package description to stdout; called at the top of every
/// binary's `main()`.
#[macro_export]
macro_rules! print_package_info {
    () => {
        println!("{}", $crate::package_description!())
    };
}

/// Initialise a `tracing` subscriber reading its filter from `RUST_LOG`
/// (defaulting to `info`). Every binary in this workspace calls this
/// once at startup instead of reaching for `env_logger`/`println!`.
pub fn init_tracing(process_name: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    tracing::info!(process = process_name, "tracing initialised");
}
