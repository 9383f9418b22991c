//! Command line interface of the controller, built with `clap`.
//!
//! Every option can also be set through the environment, which is how the
//! deployment configures the controller.
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser};

use crate::{
    constants::{DECKHOUSE_NAMESPACE, LEGACY_CONFIG_MAP_NAME, PLATFORM_SERVICE_ACCOUNT},
    logging::LogFormat,
};

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(name = "deckhouse-controller", author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Format of the log lines written to stdout.
    #[arg(long, env = "DECKHOUSE_CONTROLLER_LOG_FORMAT", default_value_t, global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, PartialEq, Eq, clap::Subcommand)]
pub enum Command {
    /// Print the ModuleConfig CRD.
    Crd,

    /// Print the initial hook runtime configuration as JSON.
    InitialConfig(ModuleSourceOptions),

    /// Run the controller.
    Run(RunArguments),
}

/// Where module definitions and configuration come from.
#[derive(Debug, PartialEq, Eq, Args)]
pub struct ModuleSourceOptions {
    /// Namespace of the deployment and its ConfigMaps.
    #[arg(long, env = "DECKHOUSE_NAMESPACE", default_value = DECKHOUSE_NAMESPACE)]
    pub namespace: String,

    /// ConfigMap the deployment currently reads its configuration from.
    #[arg(long, env = "ADDON_OPERATOR_CONFIG_MAP", default_value = LEGACY_CONFIG_MAP_NAME)]
    pub config_map: String,

    /// Colon separated list of directories holding `NNN-module-name` entries.
    #[arg(long, env = "MODULES_DIR", value_delimiter = ':', required = true)]
    pub modules_dir: Vec<PathBuf>,

    /// Values schema of `global`, defaults to the `global-hooks` directory
    /// next to the first modules directory.
    #[arg(long, env = "GLOBAL_SCHEMA")]
    pub global_schema: Option<PathBuf>,

    /// Bundle whose `values-<bundle>.yaml` decides the default enablement.
    #[arg(long, env = "DECKHOUSE_BUNDLE", default_value = "Default")]
    pub bundle: String,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(long_about = "")]
pub struct RunArguments {
    #[arg(long, env = "WEBHOOK_BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub webhook_bind_address: IpAddr,

    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 9651)]
    pub webhook_port: u16,

    /// PEM certificate of the admission webhook server.
    #[arg(long, env = "TLS_CERT_PATH", default_value = "/certs/tls.crt")]
    pub tls_cert_path: PathBuf,

    #[arg(long, env = "TLS_KEY_PATH", default_value = "/certs/tls.key")]
    pub tls_key_path: PathBuf,

    /// How often all statuses are recomputed, e.g. `15s` or `1m`.
    #[arg(
        long,
        env = "STATUS_REFRESH_INTERVAL",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub status_refresh_interval: Duration,

    /// The only user allowed to write Module resources and the active ConfigMap.
    #[arg(long, env = "PLATFORM_SERVICE_ACCOUNT", default_value = PLATFORM_SERVICE_ACCOUNT)]
    pub platform_service_account: String,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub source: ModuleSourceOptions,
}
