//! Kit bundles
//!
//! A kit is a named JSON file bundling server configurations that load and
//! unload together. Ownership is shared: every server contributed by a kit
//! records the kit in its `kits` set, and unloading removes only servers
//! whose set becomes empty. Servers the operator added by hand (empty `kits`
//! set) are never touched by kit operations.

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{Catalog, ConfigStore, ServerConfig};
use crate::{Error, Result};

/// A kit bundle as stored in `<kit-dir>/<name>.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Kit {
    /// Kit name; must match the file stem.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Author attribution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Bundle version string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Search keywords.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Related links (`homepage`, `repository`, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub links: HashMap<String, String>,
    /// Contributed servers, same shape as catalog entries without `kits`.
    #[serde(default)]
    pub servers: IndexMap<String, ServerConfig>,
}

impl Kit {
    /// Parse and sanity-check a kit file body.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed JSON, a name mismatch, or a
    /// server entry that smuggles in a `kits` field.
    pub fn parse(name: &str, data: &str) -> Result<Self> {
        let kit: Self = serde_json::from_str(data)
            .map_err(|e| Error::Validation(format!("kit {name:?}: {e}")))?;

        if !kit.name.is_empty() && kit.name != name {
            return Err(Error::Validation(format!(
                "kit file {name:?} declares mismatched name {:?}",
                kit.name
            )));
        }
        for (server, cfg) in &kit.servers {
            if !cfg.kits.is_empty() {
                return Err(Error::Validation(format!(
                    "kit {name:?}: server {server:?} must not set kits"
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            ..kit
        })
    }

    /// Metadata summary without the server bodies.
    #[must_use]
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "author": self.author,
            "version": self.version,
            "keywords": self.keywords,
            "links": self.links,
            "servers": self.servers.keys().collect::<Vec<_>>(),
        })
    }
}

/// Loads and unloads kit bundles against the catalog store.
///
/// Concurrent load/unload calls are serialized; each operation is a single
/// catalog mutation (atomic save).
pub struct KitLoader {
    kit_dir: PathBuf,
    lock: Mutex<()>,
}

impl KitLoader {
    /// Create a loader scanning `kit_dir` for bundles.
    #[must_use]
    pub fn new(kit_dir: PathBuf) -> Self {
        Self {
            kit_dir,
            lock: Mutex::new(()),
        }
    }

    /// Read and parse `<kit-dir>/<name>.json`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing file and validation errors from
    /// [`Kit::parse`].
    pub async fn read(&self, name: &str) -> Result<Kit> {
        let path = self.kit_dir.join(format!("{name}.json"));
        if !path.exists() {
            return Err(Error::NotFound(format!("kit {name:?}")));
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Kit::parse(name, &data)
    }

    /// Names of all kit files on disk.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the kit directory cannot be scanned.
    pub async fn available(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.kit_dir.exists() {
            return Ok(names);
        }
        let mut entries = tokio::fs::read_dir(&self.kit_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Merge a kit's servers into the catalog.
    ///
    /// New servers are inserted with `kits = {name}`. Servers already owned
    /// by other kits gain this kit in their set. Servers the operator added
    /// directly (empty `kits`) are left untouched.
    ///
    /// # Errors
    ///
    /// Propagates kit parse errors and catalog save errors.
    pub async fn load(&self, name: &str, store: &ConfigStore) -> Result<Kit> {
        let _guard = self.lock.lock().await;
        let kit = self.read(name).await?;

        store
            .mutate(|catalog| {
                for (server, cfg) in &kit.servers {
                    merge_kit_server(catalog, name, server, cfg);
                }
                Ok(())
            })
            .await?;

        info!(kit = %name, servers = kit.servers.len(), "Kit loaded");
        Ok(kit)
    }

    /// Remove a kit from the catalog.
    ///
    /// The kit is dropped from every server's `kits` set; servers whose set
    /// becomes empty (and were kit-introduced) are removed. Servers shared
    /// with other kits survive.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no server references the kit, plus catalog
    /// save errors.
    pub async fn unload(&self, name: &str, store: &ConfigStore) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;

        let mut removed = Vec::new();
        store
            .mutate(|catalog| {
                let mut touched = false;
                let mut to_remove = Vec::new();

                for (server, cfg) in &mut catalog.servers {
                    let before = cfg.kits.len();
                    cfg.kits.retain(|k| k != name);
                    if cfg.kits.len() != before {
                        touched = true;
                        if cfg.kits.is_empty() {
                            to_remove.push(server.clone());
                        }
                    }
                }

                if !touched {
                    return Err(Error::NotFound(format!("kit {name:?} is not loaded")));
                }

                for server in to_remove {
                    catalog.servers.shift_remove(&server);
                    removed.push(server);
                }
                Ok(())
            })
            .await?;

        info!(kit = %name, removed = removed.len(), "Kit unloaded");
        Ok(removed)
    }

    /// Kits currently referenced by the catalog, with their servers.
    #[must_use]
    pub fn loaded(&self, catalog: &Catalog) -> IndexMap<String, Vec<String>> {
        let mut loaded: IndexMap<String, Vec<String>> = IndexMap::new();
        for (server, cfg) in &catalog.servers {
            for kit in &cfg.kits {
                loaded.entry(kit.clone()).or_default().push(server.clone());
            }
        }
        loaded
    }
}

fn merge_kit_server(catalog: &mut Catalog, kit: &str, server: &str, cfg: &ServerConfig) {
    match catalog.servers.get_mut(server) {
        Some(existing) if existing.kits.is_empty() => {
            // Operator-owned entry; the kit does not take ownership.
            warn!(
                server = %server,
                kit = %kit,
                "Kit skips server already present outside kits"
            );
        }
        Some(existing) => {
            if !existing.kits.iter().any(|k| k == kit) {
                existing.kits.push(kit.to_string());
            }
        }
        None => {
            let mut entry = cfg.clone();
            entry.kits = vec![kit.to_string()];
            catalog.servers.insert(server.to_string(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kit_json(name: &str, servers: &[&str]) -> String {
        let servers: serde_json::Map<String, serde_json::Value> = servers
            .iter()
            .map(|s| {
                (
                    (*s).to_string(),
                    serde_json::json!({"command": format!("npx {s}")}),
                )
            })
            .collect();
        serde_json::json!({
            "name": name,
            "description": "test kit",
            "servers": servers,
        })
        .to_string()
    }

    async fn loader_with_kits(dir: &std::path::Path, kits: &[(&str, &[&str])]) -> KitLoader {
        for (name, servers) in kits {
            tokio::fs::write(dir.join(format!("{name}.json")), kit_json(name, servers))
                .await
                .unwrap();
        }
        KitLoader::new(dir.to_path_buf())
    }

    #[test]
    fn parse_rejects_name_mismatch_and_embedded_kits() {
        assert!(Kit::parse("math", &kit_json("other", &["s"])).is_err());

        let smuggled = serde_json::json!({
            "name": "math",
            "servers": {"s": {"command": "npx s", "kits": ["x"]}},
        })
        .to_string();
        assert!(Kit::parse("math", &smuggled).is_err());
    }

    #[tokio::test]
    async fn load_inserts_servers_with_kit_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with_kits(dir.path(), &[("math", &["calc"])]).await;
        let store = ConfigStore::new(dir.path().join("config.json"), "_", false);

        loader.load("math", &store).await.unwrap();

        let catalog = store.current();
        assert_eq!(catalog.servers["calc"].kits, ["math"]);
    }

    #[tokio::test]
    async fn shared_ownership_survives_partial_unload() {
        // GIVEN: two kits both defining server `s`
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with_kits(dir.path(), &[("k1", &["s"]), ("k2", &["s"])]).await;
        let store = ConfigStore::new(dir.path().join("config.json"), "_", false);

        loader.load("k1", &store).await.unwrap();
        loader.load("k2", &store).await.unwrap();
        assert_eq!(store.current().servers["s"].kits, ["k1", "k2"]);

        // WHEN: k1 is unloaded
        let removed = loader.unload("k1", &store).await.unwrap();

        // THEN: s survives, owned by k2 alone
        assert!(removed.is_empty());
        assert_eq!(store.current().servers["s"].kits, ["k2"]);

        // WHEN: k2 is unloaded too
        let removed = loader.unload("k2", &store).await.unwrap();

        // THEN: s is gone
        assert_eq!(removed, ["s"]);
        assert!(!store.current().servers.contains_key("s"));
    }

    #[tokio::test]
    async fn unload_unknown_kit_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = KitLoader::new(dir.path().to_path_buf());
        let store = ConfigStore::new(dir.path().join("config.json"), "_", false);

        let err = loader.unload("ghost", &store).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn kit_never_claims_operator_added_server() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with_kits(dir.path(), &[("math", &["calc"])]).await;
        let store = ConfigStore::new(dir.path().join("config.json"), "_", false);

        // Operator adds `calc` by hand first.
        store
            .mutate(|catalog| {
                catalog.servers.insert(
                    "calc".into(),
                    ServerConfig {
                        command: Some("npx my-calc".into()),
                        ..ServerConfig::default()
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        loader.load("math", &store).await.unwrap();

        // The operator's definition and ownership are untouched.
        let catalog = store.current();
        assert_eq!(catalog.servers["calc"].command.as_deref(), Some("npx my-calc"));
        assert!(catalog.servers["calc"].kits.is_empty());

        // And unloading the kit cannot remove it.
        let err = loader.unload("math", &store).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.current().servers.contains_key("calc"));
    }

    #[tokio::test]
    async fn available_lists_json_stems_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader_with_kits(dir.path(), &[("zeta", &["z"]), ("alpha", &["a"])]).await;
        tokio::fs::write(dir.path().join("README.md"), "not a kit")
            .await
            .unwrap();

        assert_eq!(loader.available().await.unwrap(), ["alpha", "zeta"]);
    }
}
