//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Secure Relay - forwards commands to a partner API over mutual TLS
#[derive(Parser, Debug)]
#[command(name = "secure-relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SECURE_RELAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SECURE_RELAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SECURE_RELAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "SECURE_RELAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SECURE_RELAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the relay server (default)
    Serve,

    /// Decode a PKCS#12 bundle and print the identity it carries
    Inspect {
        /// Path to the PFX / P12 file
        #[arg(required = true)]
        file: PathBuf,

        /// Bundle passphrase
        #[arg(long, env = "SECURE_RELAY_PFX_PASSWORD", hide_env_values = true)]
        password: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}
