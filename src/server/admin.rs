//! Built-in admin tools
//!
//! Every tool lives under the configurable self-prefix (default `magg`):
//! catalog edits, lifecycle control, kit management, reload, status, and
//! the sampling-backed configuration helpers. Mutating operations go
//! through the config store (atomic save) and are then applied by the
//! mount engine; in read-only mode they fail with a read-only error.

use std::sync::Arc;

use rmcp::model::{CallToolResult, Content, CreateMessageRequestParam, Tool};
use rmcp::service::{RequestContext, RoleServer};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::{compute_diff, CatalogDiff, ConfigStore, ServerConfig};
use crate::kit::KitLoader;
use crate::mount::MountEngine;
use crate::settings::Settings;
use crate::watcher;
use crate::{Error, Result};

/// Shared state the admin tools operate on.
pub struct AdminContext {
    /// Process settings.
    pub settings: Arc<Settings>,
    /// Catalog store.
    pub store: Arc<ConfigStore>,
    /// Mount engine.
    pub engine: Arc<MountEngine>,
    /// Kit loader.
    pub kits: Arc<KitLoader>,
}

/// Admin tool suffixes, in display order.
const ADMIN_TOOLS: &[(&str, &str)] = &[
    ("add_server", "Add a backend server to the catalog and mount it"),
    ("remove_server", "Remove a backend server and unmount it"),
    ("enable_server", "Enable a disabled backend server"),
    ("disable_server", "Disable a backend server without removing it"),
    ("list_servers", "List configured servers with their mount status"),
    ("search_servers", "Search external registries for servers (discovery collaborator)"),
    ("smart_configure", "Derive a server config from a URI using client-side sampling"),
    ("analyze_servers", "Analyze the current catalog using client-side sampling"),
    ("reload_config", "Reload the catalog file and apply the diff"),
    ("status", "Aggregator status: servers, sessions, index"),
    ("check", "Health-probe every backend"),
    ("load_kit", "Load a kit bundle into the catalog"),
    ("unload_kit", "Unload a kit bundle (shared ownership respected)"),
    ("list_kits", "List loaded and available kits"),
    ("kit_info", "Metadata for one kit bundle"),
];

/// Whether `suffix` names an admin tool.
#[must_use]
pub fn is_admin_tool(suffix: &str) -> bool {
    ADMIN_TOOLS.iter().any(|(name, _)| *name == suffix)
}

/// Tool definitions published under `<self_prefix><sep><suffix>`.
#[must_use]
pub fn tool_definitions(self_prefix: &str, sep: &str) -> Vec<Tool> {
    ADMIN_TOOLS
        .iter()
        .map(|(suffix, description)| {
            tool(
                &format!("{self_prefix}{sep}{suffix}"),
                description,
                schema_for(suffix),
            )
        })
        .collect()
}

/// Dispatch one admin call by suffix.
///
/// # Errors
///
/// Propagates validation, read-only, not-found, and transport errors from
/// the individual operations.
pub async fn dispatch(
    ctx: &AdminContext,
    suffix: &str,
    args: Option<Map<String, Value>>,
    rc: &RequestContext<RoleServer>,
) -> Result<CallToolResult> {
    let args = args.unwrap_or_default();
    match suffix {
        "add_server" => add_server(ctx, &args).await,
        "remove_server" => remove_server(ctx, &args).await,
        "enable_server" => set_enabled(ctx, &args, true).await,
        "disable_server" => set_enabled(ctx, &args, false).await,
        "list_servers" => list_servers(ctx),
        "search_servers" => search_servers(&args),
        "smart_configure" => smart_configure(ctx, &args, rc).await,
        "analyze_servers" => analyze_servers(ctx, rc).await,
        "reload_config" => reload_config(ctx).await,
        "status" => status(ctx),
        "check" => check(ctx).await,
        "load_kit" => load_kit(ctx, &args).await,
        "unload_kit" => unload_kit(ctx, &args).await,
        "list_kits" => list_kits(ctx).await,
        "kit_info" => kit_info(ctx, &args).await,
        other => Err(Error::NotFound(format!("admin tool {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Catalog edits
// ---------------------------------------------------------------------------

async fn add_server(ctx: &AdminContext, args: &Map<String, Value>) -> Result<CallToolResult> {
    let name = required_str(args, "name")?.to_string();

    let config = ServerConfig {
        source: optional_str(args, "source"),
        prefix: optional_str(args, "prefix"),
        command: optional_str(args, "command"),
        args: args
            .get("args")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| Error::Validation(format!("invalid args: {e}")))?,
        uri: optional_str(args, "uri"),
        env: args
            .get("env")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| Error::Validation(format!("invalid env: {e}")))?,
        cwd: optional_str(args, "cwd").map(Into::into),
        transport: args.get("transport").and_then(Value::as_object).cloned(),
        notes: optional_str(args, "notes"),
        enabled: args.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        kits: Vec::new(),
    };
    config.validate(&name, &ctx.settings.prefix_sep)?;

    ctx.store
        .mutate(|catalog| {
            if catalog.servers.contains_key(&name) {
                return Err(Error::Validation(format!("server {name:?} already exists")));
            }
            catalog.servers.insert(name.clone(), config.clone());
            Ok(())
        })
        .await?;

    ctx.engine
        .apply(&CatalogDiff {
            added: vec![name.clone()],
            ..CatalogDiff::default()
        })
        .await;

    info!(server = %name, "Server added");
    ok_json(json!({"added": name, "enabled": config.enabled}))
}

async fn remove_server(ctx: &AdminContext, args: &Map<String, Value>) -> Result<CallToolResult> {
    let name = required_str(args, "name")?.to_string();

    ctx.store
        .mutate(|catalog| {
            if catalog.servers.shift_remove(&name).is_none() {
                return Err(Error::NotFound(format!("server {name:?}")));
            }
            Ok(())
        })
        .await?;

    ctx.engine
        .apply(&CatalogDiff {
            removed: vec![name.clone()],
            ..CatalogDiff::default()
        })
        .await;

    info!(server = %name, "Server removed");
    ok_json(json!({"removed": name}))
}

async fn set_enabled(
    ctx: &AdminContext,
    args: &Map<String, Value>,
    enabled: bool,
) -> Result<CallToolResult> {
    let name = required_str(args, "name")?.to_string();

    let mut changed = false;
    ctx.store
        .mutate(|catalog| {
            let server = catalog
                .servers
                .get_mut(&name)
                .ok_or_else(|| Error::NotFound(format!("server {name:?}")))?;
            changed = server.enabled != enabled;
            server.enabled = enabled;
            Ok(())
        })
        .await?;

    if changed {
        ctx.engine
            .apply(&CatalogDiff {
                toggled: vec![(name.clone(), enabled)],
                ..CatalogDiff::default()
            })
            .await;
    }

    ok_json(json!({"server": name, "enabled": enabled, "changed": changed}))
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

fn list_servers(ctx: &AdminContext) -> Result<CallToolResult> {
    let catalog = ctx.store.current();
    let servers: Vec<Value> = catalog
        .servers
        .iter()
        .map(|(name, cfg)| {
            let status = ctx.engine.status_of(name);
            json!({
                "name": name,
                "prefix": cfg.effective_prefix(name),
                "enabled": cfg.enabled,
                "kits": cfg.kits,
                "notes": cfg.notes,
                "status": status,
            })
        })
        .collect();
    ok_json(json!({"servers": servers}))
}

fn search_servers(args: &Map<String, Value>) -> Result<CallToolResult> {
    let query = required_str(args, "query")?;
    // Registry discovery is an external collaborator; without one
    // configured this stays an empty, well-formed answer.
    ok_json(json!({
        "query": query,
        "results": [],
        "note": "no discovery collaborator configured",
    }))
}

fn status(ctx: &AdminContext) -> Result<CallToolResult> {
    let index = ctx.engine.index();
    ok_json(json!({
        "read_only": ctx.store.is_read_only(),
        "config_path": ctx.store.path().display().to_string(),
        "servers": ctx.engine.statuses(),
        "index": {
            "generation": ctx.engine.generation(),
            "tools": index.tools.len(),
            "resources": index.resources.len() + index.resource_templates.len(),
            "prompts": index.prompts.len(),
            "collisions": index.collisions,
        },
    }))
}

async fn check(ctx: &AdminContext) -> Result<CallToolResult> {
    let results: Vec<Value> = ctx
        .engine
        .check()
        .await
        .into_iter()
        .map(|(name, outcome)| match outcome {
            Ok(latency) => json!({
                "server": name,
                "ok": true,
                "latency_ms": latency.as_millis() as u64,
            }),
            Err(e) => json!({"server": name, "ok": false, "error": e.to_string()}),
        })
        .collect();
    ok_json(json!({"checks": results}))
}

async fn reload_config(ctx: &AdminContext) -> Result<CallToolResult> {
    let summary = watcher::reload_once(&ctx.store, &ctx.engine).await?;
    ok_json(json!({"reloaded": true, "changes": summary}))
}

// ---------------------------------------------------------------------------
// Kits
// ---------------------------------------------------------------------------

async fn load_kit(ctx: &AdminContext, args: &Map<String, Value>) -> Result<CallToolResult> {
    let name = required_str(args, "name")?.to_string();

    let before = ctx.store.current();
    let kit = ctx.kits.load(&name, &ctx.store).await?;
    let diff = compute_diff(&before, &ctx.store.current());
    ctx.engine.apply(&diff).await;

    ok_json(json!({
        "loaded": name,
        "servers": kit.servers.keys().collect::<Vec<_>>(),
        "changes": diff.summary(),
    }))
}

async fn unload_kit(ctx: &AdminContext, args: &Map<String, Value>) -> Result<CallToolResult> {
    let name = required_str(args, "name")?.to_string();

    let before = ctx.store.current();
    let removed = ctx.kits.unload(&name, &ctx.store).await?;
    let diff = compute_diff(&before, &ctx.store.current());
    ctx.engine.apply(&diff).await;

    ok_json(json!({"unloaded": name, "removed_servers": removed}))
}

async fn list_kits(ctx: &AdminContext) -> Result<CallToolResult> {
    let loaded = ctx.kits.loaded(&ctx.store.current());
    let available = ctx.kits.available().await?;
    ok_json(json!({"loaded": loaded, "available": available}))
}

async fn kit_info(ctx: &AdminContext, args: &Map<String, Value>) -> Result<CallToolResult> {
    let name = required_str(args, "name")?;
    let kit = ctx.kits.read(name).await?;
    ok_json(kit.info())
}

// ---------------------------------------------------------------------------
// Sampling-backed helpers
// ---------------------------------------------------------------------------

async fn smart_configure(
    ctx: &AdminContext,
    args: &Map<String, Value>,
    rc: &RequestContext<RoleServer>,
) -> Result<CallToolResult> {
    let uri = required_str(args, "uri")?.to_string();
    let reply = sample(
        rc,
        &format!(
            "Produce an MCP server configuration for the server at {uri:?}. \
             Respond with a single JSON object with fields: name (short identifier), \
             and exactly one of command (shell command line) or uri (HTTP endpoint); \
             optional fields: prefix, args, env, notes. No prose, JSON only."
        ),
    )
    .await?;

    let config_json = extract_json(&reply).ok_or_else(|| {
        Error::Validation("sampling reply did not contain a JSON object".to_string())
    })?;
    let name = config_json
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("sampling reply missing 'name'".to_string()))?
        .to_string();

    let mut entry: Map<String, Value> = config_json.as_object().cloned().unwrap_or_default();
    entry.remove("name");
    entry
        .entry("source".to_string())
        .or_insert_with(|| json!(uri));

    let config: ServerConfig = serde_json::from_value(Value::Object(entry))
        .map_err(|e| Error::Validation(format!("sampled config invalid: {e}")))?;
    config.validate(&name, &ctx.settings.prefix_sep)?;

    ctx.store
        .mutate(|catalog| {
            if catalog.servers.contains_key(&name) {
                return Err(Error::Validation(format!("server {name:?} already exists")));
            }
            catalog.servers.insert(name.clone(), config.clone());
            Ok(())
        })
        .await?;
    ctx.engine
        .apply(&CatalogDiff {
            added: vec![name.clone()],
            ..CatalogDiff::default()
        })
        .await;

    info!(server = %name, uri = %uri, "Server configured via sampling");
    ok_json(json!({"added": name, "config": serde_json::to_value(&config)?}))
}

async fn analyze_servers(
    ctx: &AdminContext,
    rc: &RequestContext<RoleServer>,
) -> Result<CallToolResult> {
    let statuses = serde_json::to_value(ctx.engine.statuses())?;
    let reply = sample(
        rc,
        &format!(
            "You are reviewing an MCP aggregator's backend catalog. Current \
             status: {statuses}. Point out unhealthy backends, redundant \
             entries, and configuration risks. Be brief."
        ),
    )
    .await?;

    Ok(CallToolResult {
        content: vec![Content::text(reply)],
        structured_content: None,
        is_error: Some(false),
        meta: None,
    })
}

/// Run one sampling round-trip on the initiating session.
async fn sample(rc: &RequestContext<RoleServer>, prompt: &str) -> Result<String> {
    let supports_sampling = rc
        .peer
        .peer_info()
        .is_some_and(|info| info.capabilities.sampling.is_some());
    if !supports_sampling {
        return Err(Error::Validation(
            "client session does not support sampling".to_string(),
        ));
    }

    // Built via serde so optional sampling fields keep their defaults.
    let params: CreateMessageRequestParam = serde_json::from_value(json!({
        "messages": [{
            "role": "user",
            "content": {"type": "text", "text": prompt},
        }],
        "maxTokens": 1000,
    }))?;

    let result = rc
        .peer
        .create_message(params)
        .await
        .map_err(|e| Error::Internal(format!("sampling request failed: {e}")))?;

    // Read the reply text structurally; non-text replies are a validation
    // failure of the sampling contract.
    let value = serde_json::to_value(&result)?;
    value
        .get("content")
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Validation("sampling reply was not text".to_string()))
}

/// Pull the first JSON object out of a model reply (tolerates code fences).
fn extract_json(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Validation(format!("missing required parameter {key:?}")))
}

fn optional_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn ok_json(value: Value) -> Result<CallToolResult> {
    let text = serde_json::to_string_pretty(&value)?;
    Ok(CallToolResult {
        content: vec![Content::text(text)],
        structured_content: None,
        is_error: Some(false),
        meta: None,
    })
}

fn tool(name: &str, description: &str, schema: Value) -> Tool {
    let Value::Object(schema) = schema else {
        unreachable!("schema literal is an object");
    };
    Tool::new(name.to_string(), description.to_string(), Arc::new(schema))
}

fn schema_for(suffix: &str) -> Value {
    match suffix {
        "add_server" => json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Unique server name"},
                "command": {"type": "string", "description": "Shell command for a stdio backend"},
                "uri": {"type": "string", "description": "HTTP endpoint for a remote backend"},
                "prefix": {"type": "string", "description": "Namespace prefix (defaults to name)"},
                "args": {"type": "array", "items": {"type": "string"}},
                "env": {"type": "object"},
                "cwd": {"type": "string"},
                "transport": {"type": "object"},
                "notes": {"type": "string"},
                "source": {"type": "string"},
                "enabled": {"type": "boolean", "default": true}
            },
            "required": ["name"]
        }),
        "remove_server" | "enable_server" | "disable_server" => json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Server name"}
            },
            "required": ["name"]
        }),
        "search_servers" => json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search keywords"},
                "limit": {"type": "integer", "default": 10}
            },
            "required": ["query"]
        }),
        "smart_configure" => json!({
            "type": "object",
            "properties": {
                "uri": {"type": "string", "description": "Where the server lives (URL, package, repo)"}
            },
            "required": ["uri"]
        }),
        "load_kit" | "unload_kit" | "kit_info" => json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Kit name"}
            },
            "required": ["name"]
        }),
        _ => json!({
            "type": "object",
            "properties": {},
            "required": []
        }),
    }
}
