//! Catalog management
//!
//! The catalog is the authoritative set of backend definitions, kept in
//! memory as an immutable snapshot and on disk as `config.json`. All
//! mutations go through [`ConfigStore`]: a catalog either validates as a
//! whole and becomes current, or is rejected as a whole. Partial application
//! is forbidden.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::settings::is_valid_prefix;
use crate::{Error, Result};

/// Declarative definition of one backend server.
///
/// The unique name is the catalog map key, not a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Informational URI of origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Namespace prepended to every contributed name. `None` defaults to the
    /// server name; the empty string contributes names verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Shell-style command line producing a stdio MCP child process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Extra argv appended after the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// HTTP/streamable endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Environment for the child process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Working directory for the child process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Transport-specific settings (`timeout_ms`, `env_inherit`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<serde_json::Map<String, Value>>,
    /// Opaque operator notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Whether the backend should be mounted.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Kits that own this entry (shared-ownership semantics).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kits: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Effective namespace prefix: the configured prefix, or the server name.
    #[must_use]
    pub fn effective_prefix<'a>(&'a self, name: &'a str) -> &'a str {
        self.prefix.as_deref().unwrap_or(name)
    }

    /// Validate one entry against the separator policy.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid name or prefix, or when the
    /// transport fields are not exactly one of `command` / `uri`.
    pub fn validate(&self, name: &str, sep: &str) -> Result<()> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!("invalid server name {name:?}")));
        }

        let prefix = self.effective_prefix(name);
        if !is_valid_prefix(prefix, sep) {
            return Err(Error::Validation(format!(
                "server {name:?}: prefix {prefix:?} is not a valid identifier under separator {sep:?}"
            )));
        }

        let has_command = self.command.as_deref().is_some_and(|c| !c.is_empty());
        let has_uri = self.uri.as_deref().is_some_and(|u| !u.is_empty());
        match (has_command, has_uri) {
            (true, false) | (false, true) => Ok(()),
            (true, true) => Err(Error::Validation(format!(
                "server {name:?}: command and uri are mutually exclusive"
            ))),
            (false, false) => Err(Error::Validation(format!(
                "server {name:?}: exactly one of command or uri is required"
            ))),
        }
    }

    /// Per-backend transport knob lookup, e.g. `timeout_ms`.
    #[must_use]
    pub fn transport_value(&self, key: &str) -> Option<&Value> {
        self.transport.as_ref().and_then(|t| t.get(key))
    }

    /// Returns `true` when only cosmetic fields differ from `other`.
    ///
    /// `notes`, `source`, and `kits` are bookkeeping; changing them must not
    /// restart the backend.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        let strip = |c: &Self| Self {
            notes: None,
            source: None,
            kits: Vec::new(),
            ..c.clone()
        };
        strip(self) == strip(other)
    }
}

/// The server catalog. Iteration order is configuration order, which drives
/// collision priority.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    /// Backend definitions keyed by unique name.
    #[serde(default)]
    pub servers: IndexMap<String, ServerConfig>,
}

impl Catalog {
    /// Parse a catalog from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns a JSON error for malformed input.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Serialize to the JSON wire form (pretty, trailing newline).
    ///
    /// # Errors
    ///
    /// Returns a JSON error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    /// Validate the whole catalog. Total: either every entry passes or the
    /// catalog is rejected.
    ///
    /// Duplicate prefixes across servers are legal here; per-capability
    /// collisions are resolved at mount time.
    ///
    /// # Errors
    ///
    /// Returns the first entry-level validation error.
    pub fn validate(&self, sep: &str) -> Result<()> {
        for (name, server) in &self.servers {
            server.validate(name, sep)?;
        }
        Ok(())
    }

    /// Enabled entries in configuration order.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers.iter().filter(|(_, s)| s.enabled)
    }
}

/// Structural diff between two catalog snapshots.
///
/// The four sets are disjoint; `toggled` captures entries where only the
/// `enabled` flag flipped, `updated` everything else non-cosmetic.
#[derive(Debug, Default, Clone)]
pub struct CatalogDiff {
    /// Names present in `new` but not in `old`.
    pub added: Vec<String>,
    /// Names present in `old` but not in `new`.
    pub removed: Vec<String>,
    /// Names whose non-cosmetic definition changed.
    pub updated: Vec<String>,
    /// Names whose `enabled` flag flipped, with the new value.
    pub toggled: Vec<(String, bool)>,
}

impl CatalogDiff {
    /// Returns `true` when no mount-relevant change was detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.toggled.is_empty()
    }

    /// One-line human summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("added: [{}]", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed: [{}]", self.removed.join(", ")));
        }
        if !self.updated.is_empty() {
            parts.push(format!("updated: [{}]", self.updated.join(", ")));
        }
        if !self.toggled.is_empty() {
            let names: Vec<String> = self
                .toggled
                .iter()
                .map(|(n, on)| format!("{n}({})", if *on { "on" } else { "off" }))
                .collect();
            parts.push(format!("toggled: [{}]", names.join(", ")));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Compute the structural diff between two catalogs.
///
/// Pure function; the caller applies the result through the mount engine.
#[must_use]
pub fn compute_diff(old: &Catalog, new: &Catalog) -> CatalogDiff {
    let mut diff = CatalogDiff::default();

    for (name, cfg) in &new.servers {
        match old.servers.get(name) {
            None => diff.added.push(name.clone()),
            Some(old_cfg) => {
                if old_cfg.same_shape(cfg) {
                    // Cosmetic-only changes fall through silently.
                } else if only_enabled_flipped(old_cfg, cfg) {
                    diff.toggled.push((name.clone(), cfg.enabled));
                } else {
                    diff.updated.push(name.clone());
                }
            }
        }
    }

    for name in old.servers.keys() {
        if !new.servers.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }

    diff
}

fn only_enabled_flipped(old: &ServerConfig, new: &ServerConfig) -> bool {
    old.enabled != new.enabled
        && old.same_shape(&ServerConfig {
            enabled: old.enabled,
            ..new.clone()
        })
}

/// Authoritative catalog store: in-memory snapshot + serialized form on disk.
///
/// Readers clone an `Arc<Catalog>`; writers swap the pointer atomically, so
/// the snapshot is always internally consistent.
pub struct ConfigStore {
    path: PathBuf,
    sep: String,
    read_only: bool,
    current: RwLock<Arc<Catalog>>,
}

impl ConfigStore {
    /// Create a store over `path`. No I/O happens until [`Self::load`].
    #[must_use]
    pub fn new(path: PathBuf, sep: &str, read_only: bool) -> Self {
        Self {
            path,
            sep: sep.to_string(),
            read_only,
            current: RwLock::new(Arc::new(Catalog::default())),
        }
    }

    /// The catalog file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether catalog writes are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current catalog snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<Catalog> {
        Arc::clone(&self.current.read())
    }

    /// Read, parse, and validate the catalog file; on success the snapshot is
    /// swapped and returned. A missing file yields an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns a validation error (whole-catalog rejection) or an IO/JSON
    /// error; the previous snapshot stays current on failure.
    pub async fn load(&self) -> Result<Arc<Catalog>> {
        let catalog = if self.path.exists() {
            let data = tokio::fs::read_to_string(&self.path).await?;
            Catalog::from_json(&data)?
        } else {
            debug!(path = %self.path.display(), "Catalog file missing, starting empty");
            Catalog::default()
        };

        catalog.validate(&self.sep)?;

        let arc = Arc::new(catalog);
        *self.current.write() = Arc::clone(&arc);
        Ok(arc)
    }

    /// Validate and persist a new catalog: write to a temp file in the same
    /// directory, then rename over the target. The in-memory snapshot is
    /// swapped after the rename succeeds.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` in read-only mode, a validation error for a bad
    /// catalog, or an IO error from the write/rename.
    pub async fn save(&self, catalog: Catalog) -> Result<Arc<Catalog>> {
        catalog.validate(&self.sep)?;

        if self.read_only {
            return Err(Error::ReadOnly(format!(
                "refusing to write {}",
                self.path.display()
            )));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, catalog.to_json()?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        let arc = Arc::new(catalog);
        *self.current.write() = Arc::clone(&arc);
        info!(path = %self.path.display(), servers = arc.servers.len(), "Catalog saved");
        Ok(arc)
    }

    /// Apply `mutate` to a copy of the current catalog, validate, persist,
    /// and swap. The single entry point for admin-tool catalog edits.
    ///
    /// # Errors
    ///
    /// Propagates validation, read-only, and IO errors from [`Self::save`].
    pub async fn mutate<F>(&self, mutate: F) -> Result<Arc<Catalog>>
    where
        F: FnOnce(&mut Catalog) -> Result<()>,
    {
        let mut next = (*self.current()).clone();
        mutate(&mut next)?;
        self.save(next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stdio_server(command: &str) -> ServerConfig {
        ServerConfig {
            command: Some(command.to_string()),
            ..ServerConfig::default()
        }
    }

    fn http_server(uri: &str) -> ServerConfig {
        ServerConfig {
            uri: Some(uri.to_string()),
            ..ServerConfig::default()
        }
    }

    fn catalog(entries: Vec<(&str, ServerConfig)>) -> Catalog {
        Catalog {
            servers: entries
                .into_iter()
                .map(|(n, c)| (n.to_string(), c))
                .collect(),
        }
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    #[test]
    fn validate_requires_exactly_one_transport() {
        let both = ServerConfig {
            command: Some("npx calc".into()),
            uri: Some("http://localhost:3000/mcp".into()),
            ..ServerConfig::default()
        };
        assert!(both.validate("calc", "_").is_err());

        let neither = ServerConfig::default();
        assert!(neither.validate("calc", "_").is_err());

        assert!(stdio_server("npx calc").validate("calc", "_").is_ok());
        assert!(http_server("http://localhost:3000/mcp")
            .validate("calc", "_")
            .is_ok());
    }

    #[test]
    fn validate_rejects_prefix_containing_separator() {
        let cfg = ServerConfig {
            prefix: Some("my_calc".into()),
            ..stdio_server("npx calc")
        };
        assert!(cfg.validate("calc", "_").is_err());
    }

    #[test]
    fn validate_allows_empty_prefix() {
        let cfg = ServerConfig {
            prefix: Some(String::new()),
            ..stdio_server("npx calc")
        };
        assert!(cfg.validate("calc", "_").is_ok());
    }

    #[test]
    fn catalog_with_duplicate_prefixes_passes_load_validation() {
        // Per-capability collisions are a mount-time concern.
        let cat = catalog(vec![
            (
                "a",
                ServerConfig {
                    prefix: Some("x".into()),
                    ..stdio_server("npx a")
                },
            ),
            (
                "b",
                ServerConfig {
                    prefix: Some("x".into()),
                    ..stdio_server("npx b")
                },
            ),
        ]);
        assert!(cat.validate("_").is_ok());
    }

    // -------------------------------------------------------------------------
    // Round trip
    // -------------------------------------------------------------------------

    #[test]
    fn catalog_round_trips_through_json() {
        let cat = catalog(vec![
            (
                "calc",
                ServerConfig {
                    prefix: Some("calc".into()),
                    args: Some(vec!["-y".into(), "calc-mcp".into()]),
                    notes: Some("a calculator".into()),
                    kits: vec!["math".into()],
                    ..stdio_server("npx")
                },
            ),
            ("web", http_server("https://example.com/mcp")),
        ]);

        let json = cat.to_json().unwrap();
        let parsed = Catalog::from_json(&json).unwrap();
        assert_eq!(parsed, cat);
    }

    #[test]
    fn parse_preserves_configuration_order() {
        let json = r#"{"servers": {"zeta": {"command": "z"}, "alpha": {"command": "a"}}}"#;
        let cat = Catalog::from_json(json).unwrap();
        let names: Vec<&String> = cat.servers.keys().collect();
        assert_eq!(names, ["zeta", "alpha"]);
    }

    #[test]
    fn enabled_defaults_to_true() {
        let cat = Catalog::from_json(r#"{"servers": {"calc": {"command": "npx calc"}}}"#).unwrap();
        assert!(cat.servers["calc"].enabled);
    }

    // -------------------------------------------------------------------------
    // Diff classification
    // -------------------------------------------------------------------------

    #[test]
    fn diff_identical_catalogs_is_empty() {
        let cat = catalog(vec![("calc", stdio_server("npx calc"))]);
        let diff = compute_diff(&cat, &cat.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.summary(), "no changes");
    }

    #[test]
    fn diff_classifies_added_and_removed() {
        let old = catalog(vec![("a", stdio_server("npx a"))]);
        let new = catalog(vec![("b", stdio_server("npx b"))]);
        let diff = compute_diff(&old, &new);
        assert_eq!(diff.added, ["b"]);
        assert_eq!(diff.removed, ["a"]);
        assert!(diff.updated.is_empty());
        assert!(diff.toggled.is_empty());
    }

    #[test]
    fn diff_toggle_only_lands_in_toggled() {
        let old = catalog(vec![("a", stdio_server("npx a"))]);
        let mut disabled = stdio_server("npx a");
        disabled.enabled = false;
        let new = catalog(vec![("a", disabled)]);

        let diff = compute_diff(&old, &new);
        assert_eq!(diff.toggled, [("a".to_string(), false)]);
        assert!(diff.updated.is_empty());
    }

    #[test]
    fn diff_command_change_is_updated() {
        let old = catalog(vec![("a", stdio_server("npx a"))]);
        let new = catalog(vec![("a", stdio_server("npx a-v2"))]);
        let diff = compute_diff(&old, &new);
        assert_eq!(diff.updated, ["a"]);
    }

    #[test]
    fn diff_prefix_change_is_updated() {
        // Downstream treatment (teardown + bring-up) equals remove-plus-add.
        let old = catalog(vec![("a", stdio_server("npx a"))]);
        let new = catalog(vec![(
            "a",
            ServerConfig {
                prefix: Some("other".into()),
                ..stdio_server("npx a")
            },
        )]);
        let diff = compute_diff(&old, &new);
        assert_eq!(diff.updated, ["a"]);
    }

    #[test]
    fn diff_ignores_cosmetic_changes() {
        let old = catalog(vec![("a", stdio_server("npx a"))]);
        let new = catalog(vec![(
            "a",
            ServerConfig {
                notes: Some("tweaked".into()),
                source: Some("https://example.com".into()),
                kits: vec!["k1".into()],
                ..stdio_server("npx a")
            },
        )]);
        let diff = compute_diff(&old, &new);
        assert!(diff.is_empty(), "got: {}", diff.summary());
    }

    #[test]
    fn diff_toggle_plus_edit_is_updated_not_toggled() {
        let old = catalog(vec![("a", stdio_server("npx a"))]);
        let new = catalog(vec![(
            "a",
            ServerConfig {
                enabled: false,
                ..stdio_server("npx a-v2")
            },
        )]);
        let diff = compute_diff(&old, &new);
        assert_eq!(diff.updated, ["a"]);
        assert!(diff.toggled.is_empty());
    }

    // -------------------------------------------------------------------------
    // Store
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn store_load_missing_file_yields_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"), "_", false);
        let cat = store.load().await.unwrap();
        assert!(cat.servers.is_empty());
    }

    #[tokio::test]
    async fn store_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"), "_", false);

        let cat = catalog(vec![("calc", stdio_server("npx -y calc-mcp"))]);
        store.save(cat.clone()).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(*loaded, cat);
        // No temp file left behind.
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[tokio::test]
    async fn store_save_rejected_in_read_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"), "_", true);

        let err = store
            .save(catalog(vec![("calc", stdio_server("npx calc"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert!(!dir.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn store_rejects_invalid_catalog_as_a_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{"servers": {"ok": {"command": "npx ok"}, "bad": {}}}"#,
        )
        .await
        .unwrap();

        let store = ConfigStore::new(path, "_", false);
        assert!(store.load().await.is_err());
        // Previous (empty) snapshot remains current.
        assert!(store.current().servers.is_empty());
    }
}
