use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "mtdd",
    about = "Moving target defense controller: periodically migrates services between availability zones",
    long_about = None
)]
pub struct Cli {
    /// Document holding settings, tracked services and the cloud section.
    #[arg(long, global = true, default_value = "config.yaml")]
    pub config: PathBuf,

    /// YAML inventory seeding the in-memory cloud.
    #[arg(long, global = true)]
    pub inventory: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reconcile, open tunnels, then migrate one service per cycle until Ctrl-C.
    Run,
    /// Run one reconciliation pass and print the result.
    Reconcile,
    /// Reconcile, then migrate one service.
    Migrate {
        /// Service id to migrate instead of the selected one.
        #[arg(long)]
        service: Option<String>,
    },
    /// Print the tracked services.
    Services,
    /// Send a single command to a proxy control endpoint.
    Proxy {
        /// Control address, `entry_ip:management_port`.
        #[arg(long)]
        control: SocketAddr,

        #[command(subcommand)]
        action: ProxyAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProxyAction {
    Status,
    Create {
        #[arg(long)]
        incoming_port: u16,
        /// Backend address, `ip:port`.
        #[arg(long)]
        destination: SocketAddr,
        #[arg(long)]
        id: String,
    },
    Modify {
        #[arg(long)]
        destination: SocketAddr,
        #[arg(long)]
        id: String,
    },
    Delete {
        #[arg(long)]
        id: String,
    },
}
