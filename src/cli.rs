//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::coordinator::{Operation, OperationSet};

/// Certificate authentication gateway - exchanges TLS client certificates
/// for signed security tokens
#[derive(Parser, Debug)]
#[command(name = "certauth-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CERTAUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CERTAUTH_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CERTAUTH_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CERTAUTH_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CERTAUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the auth endpoint (default)
    Serve,

    /// Authenticate a certificate against the security service and print
    /// the resulting variables
    Check {
        /// Path to the PEM client certificate
        #[arg(long, required = true)]
        cert: PathBuf,

        /// Operations to run
        #[arg(long, value_delimiter = ',', default_values = ["user_info", "user_json"])]
        operations: Vec<Operation>,
    },

    /// Print a signed token request for a principal
    SignRequest {
        /// Subject distinguished name
        #[arg(long, required = true)]
        subject: String,

        /// Issuer distinguished name
        #[arg(long, default_value = "")]
        issuer: String,

        /// Build a proxy token request instead of a plain token request
        #[arg(long)]
        proxy: bool,
    },
}

impl Command {
    /// Operation set requested by `check`
    #[must_use]
    pub fn check_operations(operations: &[Operation]) -> OperationSet {
        operations.iter().copied().collect()
    }
}
