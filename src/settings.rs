//! Process-level settings
//!
//! Everything the aggregator reads from the environment lives here, under the
//! `MAGG_` prefix: reload behaviour, read-only mode, auth material, and the
//! self-prefix / separator used for emitted tool names. The catalog itself is
//! a separate file (see [`crate::config`]); these knobs only shape how the
//! process runs.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Watchdog mode for the config watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogMode {
    /// Always use file-system notifications.
    On,
    /// Never use file-system notifications; poll only.
    Off,
    /// Use notifications when the platform watcher starts, else poll.
    #[default]
    Auto,
}

/// Settings resolved from the `MAGG_*` environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Enable the config watcher.
    pub auto_reload: bool,
    /// Poll interval for the mtime fallback, in seconds.
    pub reload_poll_interval: f64,
    /// File-system notification mode.
    pub reload_use_watchdog: WatchdogMode,
    /// Refuse catalog writes (in-memory reload still allowed).
    pub read_only: bool,
    /// PEM private key material; overrides the key file.
    pub private_key: Option<String>,
    /// Client-side bearer token.
    pub jwt: Option<String>,
    /// Prefix for built-in admin tools.
    pub self_prefix: String,
    /// Separator between prefix and local capability name.
    pub prefix_sep: String,
    /// Capture subprocess stderr into the log instead of discarding it.
    pub stderr_show: bool,
    /// Directory holding `config.json` and the auth keypair.
    pub config_dir: Option<PathBuf>,
    /// Directory holding kit bundles. Defaults to `<config-dir>/kit.d`.
    pub kit_dir: Option<PathBuf>,
    /// Log-kind notifications forwarded per second per backend.
    pub log_rate_per_second: u32,
    /// Health probe timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// Seconds between background health probes per backend.
    pub probe_interval: u64,
    /// Reconnect attempts before a backend is parked in `Failed`.
    pub reconnect_budget: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_reload: true,
            reload_poll_interval: 1.0,
            reload_use_watchdog: WatchdogMode::Auto,
            read_only: false,
            private_key: None,
            jwt: None,
            self_prefix: "magg".to_string(),
            prefix_sep: "_".to_string(),
            stderr_show: false,
            config_dir: None,
            kit_dir: None,
            log_rate_per_second: 10,
            probe_timeout_ms: 500,
            probe_interval: 30,
            reconnect_budget: 8,
        }
    }
}

impl Settings {
    /// Load settings from the environment (`MAGG_` prefix).
    ///
    /// # Errors
    ///
    /// Returns a validation error when an env var fails to parse or the
    /// prefix policy is violated.
    pub fn load() -> Result<Self> {
        let settings: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("MAGG_"))
            .extract()
            .map_err(|e| Error::Validation(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the separator policy: the self-prefix must be a legal
    /// identifier and must not contain the separator.
    pub fn validate(&self) -> Result<()> {
        if self.prefix_sep.is_empty() {
            return Err(Error::Validation("prefix separator must not be empty".into()));
        }
        if !is_valid_prefix(&self.self_prefix, &self.prefix_sep) {
            return Err(Error::Validation(format!(
                "self prefix {:?} is not a valid identifier under separator {:?}",
                self.self_prefix, self.prefix_sep
            )));
        }
        Ok(())
    }

    /// Resolved configuration directory (`~/.magg` by default).
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".magg")
        })
    }

    /// Path of the catalog file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("config.json")
    }

    /// Directory scanned for kit bundles.
    #[must_use]
    pub fn kit_dir(&self) -> PathBuf {
        self.kit_dir
            .clone()
            .unwrap_or_else(|| self.config_dir().join("kit.d"))
    }

    /// Path of the RSA private key file.
    #[must_use]
    pub fn private_key_path(&self) -> PathBuf {
        self.config_dir().join("magg.key")
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reload_poll_interval.max(0.1))
    }

    /// Health probe timeout.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Interval between background health probes.
    #[must_use]
    pub fn probe_interval_duration(&self) -> Duration {
        Duration::from_secs(self.probe_interval.max(1))
    }
}

/// A prefix is valid when it is empty or matches `[A-Za-z_][A-Za-z0-9_-]*`
/// and does not contain the active separator.
#[must_use]
pub fn is_valid_prefix(prefix: &str, sep: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if prefix.contains(sep) && sep != "_" {
        return false;
    }
    // With the default "_" separator an underscore inside the prefix would
    // make aggregated names ambiguous to split, so it is rejected there too.
    if sep == "_" && prefix.contains('_') {
        return false;
    }
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}
