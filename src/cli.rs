//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::server::ServeMode;

/// MCP aggregator - one endpoint multiplexing many MCP servers
#[derive(Parser, Debug)]
#[command(name = "magg")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory (holds config.json and the auth keypair)
    #[arg(long, env = "MAGG_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MAGG_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MAGG_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level verbs.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the aggregator server
    Serve {
        /// Serve Streamable HTTP only
        #[arg(long, conflicts_with_all = ["stdio", "hybrid"])]
        http: bool,
        /// Serve stdio only (default)
        #[arg(long, conflicts_with_all = ["http", "hybrid"])]
        stdio: bool,
        /// Serve both stdio and HTTP
        #[arg(long, conflicts_with_all = ["http", "stdio"])]
        hybrid: bool,
        /// HTTP port
        #[arg(short, long, default_value_t = 8686, env = "MAGG_PORT")]
        port: u16,
        /// HTTP bind host
        #[arg(long, default_value = "127.0.0.1", env = "MAGG_HOST")]
        host: String,
    },
    /// Manage the bearer-auth keypair and tokens
    Auth {
        /// Auth operation
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Show the catalog and mount configuration
    Status,
    /// List configured servers
    ListServers,
    /// Add a server to the catalog
    AddServer {
        /// Unique server name
        name: String,
        /// Shell command line for a stdio backend
        #[arg(long, conflicts_with = "uri")]
        command: Option<String>,
        /// HTTP endpoint for a remote backend
        #[arg(long)]
        uri: Option<String>,
        /// Namespace prefix (defaults to the name)
        #[arg(long)]
        prefix: Option<String>,
        /// Operator notes
        #[arg(long)]
        notes: Option<String>,
        /// Add disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Remove a server from the catalog
    RemoveServer {
        /// Server name
        name: String,
    },
}

/// `auth` subcommands.
#[derive(Subcommand, Debug)]
pub enum AuthCommands {
    /// Generate an RSA keypair
    Init,
    /// Issue a bearer token
    Token {
        /// Subject claim
        #[arg(long, default_value = "cli")]
        sub: String,
        /// Lifetime in seconds (default one day)
        #[arg(long)]
        ttl: Option<u64>,
        /// Informational scopes
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
    /// Report whether auth is enabled
    Status,
    /// Print the public key PEM
    PublicKey,
    /// Print the private key path
    PrivateKey,
}

impl Commands {
    /// Resolve the serve mode flags (stdio is the default).
    #[must_use]
    pub fn serve_mode(http: bool, stdio: bool, hybrid: bool) -> ServeMode {
        match (http, stdio, hybrid) {
            (true, _, _) => ServeMode::Http,
            (_, _, true) => ServeMode::Hybrid,
            _ => ServeMode::Stdio,
        }
    }
}
