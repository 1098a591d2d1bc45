//! Command line of the `fanout-operator` binary.
//!
//! Every `run` flag can also be set through the upper snake case environment variable of the
//! same name, e.g. `WATCH_NAMESPACE`.

use clap::Parser;

use crate::{OPERATOR_NAME, fanout::shim::DEFAULT_SHIM_IMAGE, namespace::WatchNamespace, time::Duration};

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(name = "fanout-operator", author, version, about)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Image of the init container that resolves the item of each pod
    #[arg(long, env, default_value = DEFAULT_SHIM_IMAGE)]
    pub shim_image: String,

    /// Field manager used for every write to the API server
    #[arg(long, env, default_value = OPERATOR_NAME)]
    pub field_manager: String,

    /// Timeout of a single request of an API source
    #[arg(long, env, default_value = "30s")]
    pub http_timeout: Duration,

    /// Timeout for connecting to the database of a SQL source
    #[arg(long, env, default_value = "10s")]
    pub sql_connect_timeout: Duration,

    /// Delay before retrying a failed reconciliation
    #[arg(long, env, default_value = "30s")]
    pub error_requeue: Duration,
}
