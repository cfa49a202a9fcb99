//! MCP Aggregator Library
//!
//! Speaks the Model Context Protocol to clients while acting as a client to
//! many downstream MCP servers, multiplexing their tools, resources, and
//! prompts behind one endpoint.
//!
//! # Features
//!
//! - **Mount engine**: one managed connection per backend with dynamic
//!   reconfiguration and namespaced aggregation
//! - **Proxy tool**: list/info/call over tools, resources, and prompts with
//!   a typed wire contract
//! - **Notification coordinator**: coalesced, de-duplicated fan-out of
//!   backend notifications to every client session
//! - **Kits**: bundles of server configs with shared-ownership semantics
//! - **Hot reload**: file watcher, poll fallback, SIGHUP, and admin-tool
//!   reload over one debounced path

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod kit;
pub mod mount;
pub mod proxy;
pub mod server;
pub mod settings;
pub mod transport;
pub mod watcher;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Stdout carries the MCP stdio transport; logs must stay on stderr.
    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
