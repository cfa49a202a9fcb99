//! Transport selection for backend connections
//!
//! Maps a catalog entry onto one of a closed set of client transports:
//! a stdio child process, a Streamable HTTP endpoint, or the reserved
//! in-process loopback the aggregator uses to introspect itself. All
//! transports present the same rmcp client interface once connected.

use std::collections::HashMap;
use std::process::Stdio;

use rmcp::service::RunningService;
use rmcp::transport::{ConfigureCommandExt, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use crate::config::ServerConfig;
use crate::{Error, Result};

/// The closed set of backend transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Child process speaking MCP over stdio.
    Stdio,
    /// Remote Streamable HTTP endpoint.
    Http,
    /// Reserved loopback used by the aggregator itself.
    InProcess,
}

impl TransportKind {
    /// Short name used in status output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::InProcess => "in-process",
        }
    }
}

/// Environment inheritance for stdio subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvMode {
    /// Child sees only the configured mapping (plus PATH/HOME so commands
    /// still resolve).
    #[default]
    ExplicitOnly,
    /// Child inherits the aggregator's environment with the configured
    /// mapping overlaid. Opt-in via `transport.env_inherit`.
    InheritOverlay,
}

/// Choose the concrete transport for a catalog entry.
///
/// # Errors
///
/// Returns a validation error when neither/both transport fields are set or
/// the URI scheme is not HTTP(S).
pub fn select(name: &str, config: &ServerConfig) -> Result<TransportKind> {
    let has_command = config.command.as_deref().is_some_and(|c| !c.is_empty());
    if has_command {
        return Ok(TransportKind::Stdio);
    }
    if let Some(uri) = config.uri.as_deref().filter(|u| !u.is_empty()) {
        let parsed = Url::parse(uri)
            .map_err(|e| Error::Validation(format!("server {name:?}: invalid uri: {e}")))?;
        return match parsed.scheme() {
            "http" | "https" => Ok(TransportKind::Http),
            other => Err(Error::Validation(format!(
                "server {name:?}: unsupported uri scheme {other:?}"
            ))),
        };
    }
    Err(Error::Validation(format!(
        "server {name:?}: exactly one of command or uri is required"
    )))
}

/// Environment mode for a catalog entry (`transport.env_inherit`).
#[must_use]
pub fn env_mode(config: &ServerConfig) -> EnvMode {
    match config.transport_value("env_inherit").and_then(serde_json::Value::as_bool) {
        Some(true) => EnvMode::InheritOverlay,
        _ => EnvMode::ExplicitOnly,
    }
}

/// Split a shell-style command string plus explicit args into argv.
///
/// # Errors
///
/// Returns a validation error for unbalanced quoting or an empty command.
pub fn build_argv(name: &str, config: &ServerConfig) -> Result<(String, Vec<String>)> {
    let command = config
        .command
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("server {name:?}: missing command")))?;

    let mut parts = shlex::split(command)
        .ok_or_else(|| Error::Validation(format!("server {name:?}: unparseable command quoting")))?;
    if parts.is_empty() {
        return Err(Error::Validation(format!("server {name:?}: empty command")));
    }

    let program = parts.remove(0);
    if let Some(args) = &config.args {
        parts.extend(args.iter().cloned());
    }
    Ok((program, parts))
}

/// Connect a backend, returning the running client service.
///
/// # Errors
///
/// Returns a transport error when the process cannot be spawned or the
/// endpoint refuses the connection/handshake.
pub async fn connect<H: ClientHandler>(
    name: &str,
    config: &ServerConfig,
    handler: H,
    show_stderr: bool,
) -> Result<RunningService<RoleClient, H>> {
    match select(name, config)? {
        TransportKind::Stdio => connect_stdio(name, config, handler, show_stderr).await,
        TransportKind::Http => connect_http(name, config, handler).await,
        TransportKind::InProcess => Err(Error::Internal(
            "in-process transport is constructed by the server, not selected from a catalog entry"
                .to_string(),
        )),
    }
}

async fn connect_stdio<H: ClientHandler>(
    name: &str,
    config: &ServerConfig,
    handler: H,
    show_stderr: bool,
) -> Result<RunningService<RoleClient, H>> {
    let (program, args) = build_argv(name, config)?;
    let env: HashMap<String, String> = config.env.clone().unwrap_or_default();
    let cwd = config.cwd.clone();
    let mode = env_mode(config);

    info!(backend = %name, program = %program, mode = ?mode, "Spawning stdio backend");

    let transport = TokioChildProcess::new(Command::new(&program).configure(move |cmd| {
        cmd.args(&args).kill_on_drop(true);

        if mode == EnvMode::ExplicitOnly {
            // PATH and HOME survive the wipe; the child could not resolve
            // interpreters or caches without them.
            let keep: Vec<(String, String)> = ["PATH", "HOME"]
                .iter()
                .filter_map(|k| std::env::var(k).ok().map(|v| ((*k).to_string(), v)))
                .collect();
            cmd.env_clear().envs(keep);
        }
        cmd.envs(&env);

        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        cmd.stderr(if show_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
    }))
    .map_err(|e| Error::Transport(format!("failed to spawn {program:?}: {e}")))?;

    let service = handler
        .serve(transport)
        .await
        .map_err(|e| Error::Transport(format!("stdio handshake with {name:?} failed: {e}")))?;

    debug!(backend = %name, peer = ?service.peer_info(), "Stdio backend connected");
    Ok(service)
}

async fn connect_http<H: ClientHandler>(
    name: &str,
    config: &ServerConfig,
    handler: H,
) -> Result<RunningService<RoleClient, H>> {
    let uri = config
        .uri
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("server {name:?}: missing uri")))?;

    info!(backend = %name, uri = %uri, "Connecting HTTP backend");

    // HTTP transports never inherit process environment.
    let transport = StreamableHttpClientTransport::from_uri(uri.to_string());
    let service = handler
        .serve(transport)
        .await
        .map_err(|e| Error::Transport(format!("HTTP handshake with {name:?} failed: {e}")))?;

    debug!(backend = %name, peer = ?service.peer_info(), "HTTP backend connected");
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio(command: &str) -> ServerConfig {
        ServerConfig {
            command: Some(command.to_string()),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn select_picks_stdio_for_command() {
        assert_eq!(select("calc", &stdio("npx -y calc-mcp")).unwrap(), TransportKind::Stdio);
    }

    #[test]
    fn select_picks_http_for_http_uri() {
        let cfg = ServerConfig {
            uri: Some("https://example.com/mcp".into()),
            ..ServerConfig::default()
        };
        assert_eq!(select("web", &cfg).unwrap(), TransportKind::Http);
    }

    #[test]
    fn select_rejects_non_http_scheme() {
        let cfg = ServerConfig {
            uri: Some("ftp://example.com/mcp".into()),
            ..ServerConfig::default()
        };
        assert!(select("web", &cfg).is_err());
    }

    #[test]
    fn select_rejects_missing_transport() {
        assert!(select("empty", &ServerConfig::default()).is_err());
    }

    #[test]
    fn build_argv_splits_shell_style_commands() {
        let (program, args) = build_argv("calc", &stdio("npx -y calc-mcp")).unwrap();
        assert_eq!(program, "npx");
        assert_eq!(args, ["-y", "calc-mcp"]);
    }

    #[test]
    fn build_argv_appends_explicit_args() {
        let cfg = ServerConfig {
            args: Some(vec!["--verbose".into()]),
            ..stdio("python server.py")
        };
        let (program, args) = build_argv("py", &cfg).unwrap();
        assert_eq!(program, "python");
        assert_eq!(args, ["server.py", "--verbose"]);
    }

    #[test]
    fn build_argv_honours_quoting() {
        let (program, args) = build_argv("q", &stdio(r#"run "a b" c"#)).unwrap();
        assert_eq!(program, "run");
        assert_eq!(args, ["a b", "c"]);
    }

    #[test]
    fn build_argv_rejects_unbalanced_quotes() {
        assert!(build_argv("q", &stdio(r#"run "oops"#)).is_err());
    }

    #[test]
    fn env_mode_defaults_to_explicit_only() {
        assert_eq!(env_mode(&stdio("npx calc")), EnvMode::ExplicitOnly);

        let mut transport = serde_json::Map::new();
        transport.insert("env_inherit".into(), serde_json::Value::Bool(true));
        let cfg = ServerConfig {
            transport: Some(transport),
            ..stdio("npx calc")
        };
        assert_eq!(env_mode(&cfg), EnvMode::InheritOverlay);
    }
}
