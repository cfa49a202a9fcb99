//! Mount engine
//!
//! Keeps the authoritative `name → BackendConnection` map and the derived
//! aggregated capability index. The engine is the only writer of both; every
//! reader gets an immutable `Arc` snapshot swapped in one pointer store, so
//! between two successful `apply` calls the index is always the pre-image or
//! the post-image, never a mixture.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use rmcp::model::{Prompt, Resource, ResourceTemplate, Tool};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendCall, BackendConnection, BackendOptions, BackendReply, BackendState, BackendStatus,
    CapabilitySnapshot, SnapshotChanged,
};
use crate::config::{Catalog, CatalogDiff, ConfigStore};
use crate::coordinator::{NotificationCoordinator, NotificationEnvelope, NotificationKind};
use crate::settings::Settings;
use crate::{Error, Result};

/// Source tag used on synthetic envelopes the engine publishes.
const SELF_SOURCE: &str = "magg";

/// The kind of capability a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// A tool, addressed by aggregated name.
    Tool,
    /// A resource (or template), addressed by URI.
    Resource,
    /// A prompt, addressed by aggregated name.
    Prompt,
}

impl CapabilityKind {
    /// Wire name used by the proxy tool.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        }
    }
}

/// Where an aggregated name points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedEntry {
    /// Owning backend.
    pub backend: String,
    /// The backend-local name (or URI).
    pub local: String,
}

/// A blocked backend and the name that blocked it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollisionReport {
    /// Backend that lost the name.
    pub backend: String,
    /// The contested aggregated name.
    pub name: String,
    /// Backend that keeps serving it.
    pub holder: String,
}

/// Immutable aggregated capability index.
#[derive(Debug, Default)]
pub struct AggregateIndex {
    /// Aggregated tool name → entry, tool rendered under its aggregated name.
    pub tools: IndexMap<String, (AggregatedEntry, Tool)>,
    /// Aggregated prompt name → entry.
    pub prompts: IndexMap<String, (AggregatedEntry, Prompt)>,
    /// Resource URI → entry; URIs are never prefixed.
    pub resources: IndexMap<String, (AggregatedEntry, Resource)>,
    /// Resource template URI → entry.
    pub resource_templates: IndexMap<String, (AggregatedEntry, ResourceTemplate)>,
    /// Backends blocked by name collisions in this image.
    pub collisions: Vec<CollisionReport>,
}

impl AggregateIndex {
    /// Look up an aggregated name for one capability kind.
    #[must_use]
    pub fn resolve(&self, kind: CapabilityKind, name: &str) -> Option<&AggregatedEntry> {
        match kind {
            CapabilityKind::Tool => self.tools.get(name).map(|(e, _)| e),
            CapabilityKind::Prompt => self.prompts.get(name).map(|(e, _)| e),
            CapabilityKind::Resource => self
                .resources
                .get(name)
                .map(|(e, _)| e)
                .or_else(|| self.resource_templates.get(name).map(|(e, _)| e)),
        }
    }

    /// Which notification kinds differ between two index images.
    fn changed_kinds(&self, other: &Self) -> Vec<NotificationKind> {
        let mut kinds = Vec::new();
        if !same_keys(&self.tools, &other.tools) {
            kinds.push(NotificationKind::ToolsChanged);
        }
        if !same_keys(&self.resources, &other.resources)
            || !same_keys(&self.resource_templates, &other.resource_templates)
        {
            kinds.push(NotificationKind::ResourcesChanged);
        }
        if !same_keys(&self.prompts, &other.prompts) {
            kinds.push(NotificationKind::PromptsChanged);
        }
        kinds
    }
}

fn same_keys<V>(a: &IndexMap<String, V>, b: &IndexMap<String, V>) -> bool {
    a.len() == b.len() && a.keys().eq(b.keys())
}

/// Input to the pure index builder: one mounted backend's contribution.
pub struct IndexInput {
    /// Backend name.
    pub backend: String,
    /// Effective namespace prefix (may be empty).
    pub prefix: String,
    /// Capability snapshot to publish.
    pub snapshot: Arc<CapabilitySnapshot>,
}

/// Build the aggregated index from backend contributions.
///
/// Contributions are walked in configuration order; a backend whose names
/// intersect the image so far is excluded entirely and reported; the
/// earlier backend keeps serving.
#[must_use]
pub fn build_index(inputs: &[IndexInput], sep: &str) -> AggregateIndex {
    let mut index = AggregateIndex::default();

    for input in inputs {
        let aggregate = |local: &str| -> String {
            if input.prefix.is_empty() {
                local.to_string()
            } else {
                format!("{}{}{}", input.prefix, sep, local)
            }
        };

        // First pass: every name this backend would publish must be free.
        let mut blocked: Option<CollisionReport> = None;
        for tool in &input.snapshot.tools {
            let name = aggregate(&tool.name);
            if let Some((holder, _)) = index.tools.get(&name) {
                blocked = Some(CollisionReport {
                    backend: input.backend.clone(),
                    name,
                    holder: holder.backend.clone(),
                });
                break;
            }
        }
        if blocked.is_none() {
            for prompt in &input.snapshot.prompts {
                let name = aggregate(&prompt.name);
                if let Some((holder, _)) = index.prompts.get(&name) {
                    blocked = Some(CollisionReport {
                        backend: input.backend.clone(),
                        name,
                        holder: holder.backend.clone(),
                    });
                    break;
                }
            }
        }
        if blocked.is_none() {
            for resource in &input.snapshot.resources {
                if let Some((holder, _)) = index.resources.get(&resource.uri) {
                    blocked = Some(CollisionReport {
                        backend: input.backend.clone(),
                        name: resource.uri.clone(),
                        holder: holder.backend.clone(),
                    });
                    break;
                }
            }
        }

        if let Some(report) = blocked {
            index.collisions.push(report);
            continue;
        }

        // Second pass: publish under aggregated names.
        for tool in &input.snapshot.tools {
            let name = aggregate(&tool.name);
            let mut renamed = tool.clone();
            renamed.name = name.clone().into();
            index.tools.insert(
                name,
                (
                    AggregatedEntry {
                        backend: input.backend.clone(),
                        local: tool.name.to_string(),
                    },
                    renamed,
                ),
            );
        }
        for prompt in &input.snapshot.prompts {
            let name = aggregate(&prompt.name);
            let mut renamed = prompt.clone();
            renamed.name = name.clone().into();
            index.prompts.insert(
                name,
                (
                    AggregatedEntry {
                        backend: input.backend.clone(),
                        local: prompt.name.to_string(),
                    },
                    renamed,
                ),
            );
        }
        for resource in &input.snapshot.resources {
            index.resources.insert(
                resource.uri.clone(),
                (
                    AggregatedEntry {
                        backend: input.backend.clone(),
                        local: resource.uri.clone(),
                    },
                    resource.clone(),
                ),
            );
        }
        for template in &input.snapshot.resource_templates {
            index.resource_templates.insert(
                template.uri_template.clone(),
                (
                    AggregatedEntry {
                        backend: input.backend.clone(),
                        local: template.uri_template.clone(),
                    },
                    template.clone(),
                ),
            );
        }
    }

    index
}

/// The mount engine.
pub struct MountEngine {
    store: Arc<ConfigStore>,
    settings: Arc<Settings>,
    coordinator: Arc<NotificationCoordinator>,
    backends: RwLock<IndexMap<String, Arc<BackendConnection>>>,
    index: RwLock<Arc<AggregateIndex>>,
    apply_lock: tokio::sync::Mutex<()>,
    index_tx: mpsc::UnboundedSender<SnapshotChanged>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl MountEngine {
    /// Create the engine and spawn its re-index task.
    #[must_use]
    pub fn new(
        store: Arc<ConfigStore>,
        settings: Arc<Settings>,
        coordinator: Arc<NotificationCoordinator>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (index_tx, mut index_rx) = mpsc::unbounded_channel::<SnapshotChanged>();

        let engine = Arc::new(Self {
            store,
            settings,
            coordinator,
            backends: RwLock::new(IndexMap::new()),
            index: RwLock::new(Arc::new(AggregateIndex::default())),
            apply_lock: tokio::sync::Mutex::new(()),
            index_tx,
            generation: AtomicU64::new(0),
            shutdown: shutdown.clone(),
        });

        let listener = Arc::clone(&engine);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = index_rx.recv() => {
                        let Some(changed) = maybe else { break };
                        debug!(backend = %changed.backend, "Snapshot changed, re-indexing");
                        listener.reindex();
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });

        engine
    }

    /// Bring up every enabled backend of the current catalog. Called once at
    /// startup; later changes go through [`Self::apply`].
    pub async fn start(&self) {
        let catalog = self.store.current();
        let diff = CatalogDiff {
            added: catalog.servers.keys().cloned().collect(),
            ..CatalogDiff::default()
        };
        self.apply(&diff).await;
    }

    /// Transactional reconfigure: teardown removed, teardown updated, bring
    /// up toggled-on and added, re-index. Serialized with itself; in-flight
    /// calls to a removed backend fail with "backend gone".
    pub async fn apply(&self, diff: &CatalogDiff) {
        let _guard = self.apply_lock.lock().await;
        let catalog = self.store.current();

        info!(changes = %diff.summary(), "Applying catalog diff");

        // (1) teardown removed
        for name in &diff.removed {
            self.teardown(name).await;
        }

        // (2) teardown updated and toggled-off
        for name in &diff.updated {
            self.teardown(name).await;
        }
        for (name, enabled) in &diff.toggled {
            if !enabled {
                self.teardown(name).await;
            }
        }

        // (3) bring up toggled-on, added, and updated, in catalog order
        let mut bring_up: Vec<&String> = diff
            .added
            .iter()
            .chain(diff.updated.iter())
            .chain(diff.toggled.iter().filter(|(_, on)| *on).map(|(n, _)| n))
            .collect();
        bring_up.sort_by_key(|name| catalog.servers.get_index_of(name.as_str()));

        for name in bring_up {
            let Some(config) = catalog.servers.get(name.as_str()) else {
                continue;
            };
            if !config.enabled {
                continue;
            }
            match BackendConnection::spawn(
                name,
                config.clone(),
                self.options(),
                self.coordinator.publisher(),
                self.index_tx.clone(),
            ) {
                Ok(connection) => {
                    self.backends.write().insert(name.clone(), connection);
                }
                Err(e) => {
                    // Recorded; the catalog stays valid and other backends
                    // are unaffected.
                    warn!(backend = %name, error = %e, "Bring-up failed");
                }
            }
        }

        // Keep the map in catalog order so collision priority follows it.
        self.reorder(&catalog);

        // (4) re-index and surface the new image.
        self.reindex();
    }

    async fn teardown(&self, name: &str) {
        let connection = self.backends.write().shift_remove(name);
        if let Some(connection) = connection {
            connection.shutdown().await;
        }
    }

    fn reorder(&self, catalog: &Catalog) {
        let mut backends = self.backends.write();
        let order: Vec<String> = catalog
            .servers
            .keys()
            .filter(|n| backends.contains_key(n.as_str()))
            .cloned()
            .collect();
        let mut reordered = IndexMap::with_capacity(backends.len());
        for name in order {
            if let Some(connection) = backends.shift_remove(&name) {
                reordered.insert(name, connection);
            }
        }
        // Anything left has no catalog entry (mid-removal); keep it at the
        // end so in-flight teardown stays reachable.
        for (name, connection) in backends.drain(..) {
            reordered.insert(name, connection);
        }
        *backends = reordered;
    }

    /// Rebuild the aggregated index from mounted backends and swap it in.
    /// Synthetic list-change notifications go out for every kind whose
    /// rendered set actually changed.
    pub fn reindex(&self) {
        // Collision-parked backends stay in the input set so they can
        // re-mount once the contested name frees up.
        let inputs: Vec<IndexInput> = {
            let backends = self.backends.read();
            backends
                .iter()
                .filter(|(_, c)| c.is_running() || c.is_collision_parked())
                .map(|(name, c)| IndexInput {
                    backend: name.clone(),
                    prefix: c.config.effective_prefix(name).to_string(),
                    snapshot: c.snapshot(),
                })
                .collect()
        };

        let next = build_index(&inputs, &self.settings.prefix_sep);

        // Park losers; the earlier holder keeps serving. Unpark anything
        // whose collision has resolved.
        {
            let backends = self.backends.read();
            for report in &next.collisions {
                if let Some(connection) = backends.get(&report.backend) {
                    let reason = collision_reason(report);
                    if connection.state() != BackendState::Failed(reason.clone()) {
                        connection.mark_failed(&reason);
                    }
                }
            }
            for input in &inputs {
                let still_blocked = next.collisions.iter().any(|c| c.backend == input.backend);
                if !still_blocked {
                    if let Some(connection) = backends.get(&input.backend) {
                        connection.clear_collision();
                    }
                }
            }
        }

        let previous = self.index();
        let changed = previous.changed_kinds(&next);
        *self.index.write() = Arc::new(next);
        self.generation.fetch_add(1, Ordering::Relaxed);

        for kind in changed {
            self.coordinator
                .publish(NotificationEnvelope::new(SELF_SOURCE, kind, Value::Null));
        }
    }

    /// Current index snapshot.
    #[must_use]
    pub fn index(&self) -> Arc<AggregateIndex> {
        Arc::clone(&self.index.read())
    }

    /// Monotonic re-index counter; two equal generations imply the same
    /// index image.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Resolve an aggregated name to its owning backend connection.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names and `Transport` when the owning
    /// backend has been unmounted since indexing.
    pub fn resolve(
        &self,
        kind: CapabilityKind,
        name: &str,
    ) -> Result<(Arc<BackendConnection>, String)> {
        let index = self.index();
        let entry = index
            .resolve(kind, name)
            .ok_or_else(|| Error::NotFound(format!("{} {name:?}", kind.as_str())))?;

        let connection = self
            .backends
            .read()
            .get(&entry.backend)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("backend {:?} gone", entry.backend)))?;

        Ok((connection, entry.local.clone()))
    }

    /// Route a call to the owning backend's request queue.
    ///
    /// # Errors
    ///
    /// Propagates resolution failures and the backend's own errors verbatim.
    pub async fn call(
        &self,
        kind: CapabilityKind,
        name: &str,
        args: Option<serde_json::Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Result<BackendReply> {
        let (connection, local) = self.resolve(kind, name)?;
        let call = match kind {
            CapabilityKind::Tool => BackendCall::CallTool { name: local, args },
            CapabilityKind::Resource => BackendCall::ReadResource { uri: local },
            CapabilityKind::Prompt => BackendCall::GetPrompt { name: local, args },
        };
        connection.call(call, cancel).await
    }

    /// Status rows for every known backend, in catalog order.
    #[must_use]
    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.backends
            .read()
            .values()
            .map(|c| c.status())
            .collect()
    }

    /// One backend's status row.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<BackendStatus> {
        self.backends.read().get(name).map(|c| c.status())
    }

    /// Probe every backend concurrently; returns `(name, result)` pairs.
    pub async fn check(&self) -> Vec<(String, Result<std::time::Duration>)> {
        let connections: Vec<Arc<BackendConnection>> =
            self.backends.read().values().cloned().collect();

        let probes = connections.iter().map(|c| {
            let connection = Arc::clone(c);
            async move { (connection.name.clone(), connection.probe().await) }
        });
        futures::future::join_all(probes).await
    }

    /// Tear down every backend (process shutdown).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let names: Vec<String> = self.backends.read().keys().cloned().collect();
        for name in names {
            self.teardown(&name).await;
        }
    }

    fn options(&self) -> BackendOptions {
        BackendOptions {
            probe_timeout: self.settings.probe_timeout(),
            probe_interval: self.settings.probe_interval_duration(),
            reconnect_budget: self.settings.reconnect_budget,
            stderr_show: self.settings.stderr_show,
        }
    }
}

fn collision_reason(report: &CollisionReport) -> String {
    Error::Collision {
        name: report.name.clone(),
        holder: report.holder.clone(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            format!("{name} tool"),
            Arc::new(serde_json::Map::new()),
        )
    }

    fn snapshot(tools: &[&str]) -> Arc<CapabilitySnapshot> {
        Arc::new(CapabilitySnapshot {
            tools: tools.iter().map(|n| tool(n)).collect(),
            ..CapabilitySnapshot::default()
        })
    }

    fn input(backend: &str, prefix: &str, tools: &[&str]) -> IndexInput {
        IndexInput {
            backend: backend.to_string(),
            prefix: prefix.to_string(),
            snapshot: snapshot(tools),
        }
    }

    // -------------------------------------------------------------------------
    // build_index: aggregation
    // -------------------------------------------------------------------------

    #[test]
    fn index_applies_prefix_and_separator() {
        let index = build_index(&[input("calc", "calc", &["add", "sub"])], "_");
        assert!(index.tools.contains_key("calc_add"));
        assert!(index.tools.contains_key("calc_sub"));
        assert_eq!(index.tools["calc_add"].0.local, "add");
        assert_eq!(index.tools["calc_add"].1.name, "calc_add");
    }

    #[test]
    fn empty_prefix_publishes_names_verbatim() {
        let index = build_index(&[input("raw", "", &["echo"])], "_");
        assert!(index.tools.contains_key("echo"));
    }

    #[test]
    fn index_resolves_back_to_backend_and_local() {
        let index = build_index(&[input("calc", "calc", &["add"])], "_");
        let entry = index.resolve(CapabilityKind::Tool, "calc_add").unwrap();
        assert_eq!(entry.backend, "calc");
        assert_eq!(entry.local, "add");
        assert!(index.resolve(CapabilityKind::Tool, "calc_mul").is_none());
    }

    // -------------------------------------------------------------------------
    // build_index: collision policy
    // -------------------------------------------------------------------------

    #[test]
    fn later_backend_with_colliding_name_is_blocked_entirely() {
        // GIVEN: a and b both publish x_foo; a comes first in config order
        let index = build_index(
            &[
                input("a", "x", &["foo", "bar"]),
                input("b", "x", &["foo", "baz"]),
            ],
            "_",
        );

        // THEN: exactly one x_foo, owned by a; b contributes nothing
        assert_eq!(index.tools.len(), 2);
        assert_eq!(index.tools["x_foo"].0.backend, "a");
        assert!(index.tools.contains_key("x_bar"));
        assert!(!index.tools.contains_key("x_baz"));

        assert_eq!(index.collisions.len(), 1);
        assert_eq!(index.collisions[0].backend, "b");
        assert_eq!(index.collisions[0].name, "x_foo");
        assert_eq!(index.collisions[0].holder, "a");
    }

    #[test]
    fn disjoint_backends_with_same_prefix_coexist() {
        let index = build_index(
            &[input("a", "x", &["foo"]), input("b", "x", &["bar"])],
            "_",
        );
        assert_eq!(index.tools.len(), 2);
        assert!(index.collisions.is_empty());
    }

    #[test]
    fn aggregated_name_sets_are_disjoint() {
        // Uniqueness invariant: no aggregated name maps to two backends.
        let index = build_index(
            &[
                input("a", "x", &["foo"]),
                input("b", "x", &["foo"]),
                input("c", "y", &["foo"]),
            ],
            "_",
        );
        let mut owners: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
        for (name, (entry, _)) in &index.tools {
            let previous = owners.insert(name.as_str(), entry.backend.as_str());
            assert!(previous.is_none(), "{name} owned twice");
        }
    }

    #[test]
    fn resource_uris_are_not_prefixed_but_collide_by_uri() {
        let res = |uri: &str| rmcp::model::RawResource::new(uri, uri.to_string()).no_annotation();

        let a = IndexInput {
            backend: "a".into(),
            prefix: "a".into(),
            snapshot: Arc::new(CapabilitySnapshot {
                resources: vec![res("file:///shared.txt")],
                ..CapabilitySnapshot::default()
            }),
        };
        let b = IndexInput {
            backend: "b".into(),
            prefix: "b".into(),
            snapshot: Arc::new(CapabilitySnapshot {
                resources: vec![res("file:///shared.txt")],
                ..CapabilitySnapshot::default()
            }),
        };

        let index = build_index(&[a, b], "_");
        assert_eq!(index.resources.len(), 1);
        assert_eq!(index.resources["file:///shared.txt"].0.backend, "a");
        assert_eq!(index.collisions.len(), 1);
    }

    // -------------------------------------------------------------------------
    // changed_kinds
    // -------------------------------------------------------------------------

    #[test]
    fn changed_kinds_reports_only_affected_lists() {
        let before = build_index(&[input("calc", "calc", &["add"])], "_");
        let after = build_index(&[input("calc", "calc", &["add", "sub"])], "_");

        let kinds = before.changed_kinds(&after);
        assert_eq!(kinds, [NotificationKind::ToolsChanged]);

        let unchanged = build_index(&[input("calc", "calc", &["add"])], "_");
        assert!(before.changed_kinds(&unchanged).is_empty());
    }
}
