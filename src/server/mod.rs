//! The outward-facing MCP server
//!
//! [`MaggServer`] is the per-session rmcp handler: it publishes the admin
//! tools, the proxy tool, and the aggregated capability surface, and routes
//! tool calls either locally or through the mount engine. [`Aggregator`]
//! wires the whole process together (store, watcher, engine, coordinator)
//! and serves over stdio, Streamable HTTP, or both.

pub mod admin;

use std::sync::Arc;

use axum::Router;
use parking_lot::RwLock;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    AnnotateAble, CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    Implementation, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, PaginatedRequestParam, ProtocolVersion, RawResource,
    ReadResourceRequestParam, ReadResourceResult, Resource, ResourceContents,
    ServerCapabilities, ServerInfo, SubscribeRequestParam, Tool, UnsubscribeRequestParam,
};
use rmcp::service::{NotificationContext, RequestContext, RoleServer};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::{ErrorData as McpError, ServiceExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::backend::{BackendCall, BackendReply};
use crate::config::ConfigStore;
use crate::coordinator::{ClientSession, NotificationCoordinator};
use crate::kit::KitLoader;
use crate::mount::{CapabilityKind, MountEngine};
use crate::proxy;
use crate::settings::Settings;
use crate::watcher::ConfigWatcher;
use crate::{Error, Result};

use self::admin::AdminContext;

/// URI scheme for the aggregator's own resources.
const SELF_SCHEME: &str = "magg://";

/// How the aggregator is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// MCP over the process's stdio.
    Stdio,
    /// Streamable HTTP on a TCP listener.
    Http,
    /// Both at once.
    Hybrid,
}

/// Why serving stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The transport closed normally.
    Completed,
    /// The operator interrupted the process.
    Interrupted,
}

/// One client session's view of the aggregator.
///
/// The HTTP session manager constructs one instance per session; all
/// instances share the same [`AdminContext`] and coordinator.
pub struct MaggServer {
    ctx: Arc<AdminContext>,
    coordinator: Arc<NotificationCoordinator>,
    session: RwLock<Option<Arc<ClientSession>>>,
}

impl MaggServer {
    /// Create a session handler over shared aggregator state.
    #[must_use]
    pub fn new(ctx: Arc<AdminContext>, coordinator: Arc<NotificationCoordinator>) -> Self {
        Self {
            ctx,
            coordinator,
            session: RwLock::new(None),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.id.clone())
    }

    /// Tool-call dispatch order: admin tool, proxy tool, aggregated name.
    async fn dispatch_tool(
        &self,
        request: CallToolRequestParam,
        rc: RequestContext<RoleServer>,
    ) -> Result<CallToolResult> {
        let name = request.name.to_string();
        let settings = &self.ctx.settings;

        self.register_progress_token(&rc);

        let admin_prefix = format!("{}{}", settings.self_prefix, settings.prefix_sep);
        if let Some(suffix) = name.strip_prefix(&admin_prefix) {
            if admin::is_admin_tool(suffix) {
                return admin::dispatch(&self.ctx, suffix, request.arguments, &rc).await;
            }
        }

        if name == proxy::PROXY_TOOL {
            return proxy::handle(&self.ctx.engine, request.arguments, rc.ct.child_token()).await;
        }

        match self
            .ctx
            .engine
            .call(
                CapabilityKind::Tool,
                &name,
                request.arguments,
                rc.ct.child_token(),
            )
            .await?
        {
            BackendReply::Tool(result) => Ok(result),
            _ => Err(Error::Internal("unexpected reply kind for tool call".into())),
        }
    }

    /// Remember which session issued the request's progress token so the
    /// coordinator can route progress notifications back to it.
    fn register_progress_token(&self, rc: &RequestContext<RoleServer>) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        if let Ok(meta) = serde_json::to_value(&rc.meta) {
            if let Some(token) = meta.get("progressToken") {
                self.coordinator
                    .register_progress_token(&token.to_string(), &session_id);
            }
        }
    }

    /// The aggregator's own resources: per-server metadata plus the whole
    /// catalog snapshot.
    fn self_resources(&self) -> Vec<Resource> {
        let catalog = self.ctx.store.current();
        let mut resources = vec![RawResource::new(
            format!("{SELF_SCHEME}servers/all"),
            "servers/all".to_string(),
        )
        .no_annotation()];
        for name in catalog.servers.keys() {
            resources.push(
                RawResource::new(format!("{SELF_SCHEME}server/{name}"), format!("server/{name}"))
                    .no_annotation(),
            );
        }
        resources
    }

    fn read_self_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let catalog = self.ctx.store.current();
        let body: Value = if uri == format!("{SELF_SCHEME}servers/all") {
            json!({
                "servers": serde_json::to_value(&catalog.servers)?,
                "statuses": self.ctx.engine.statuses(),
            })
        } else if let Some(name) = uri.strip_prefix(&format!("{SELF_SCHEME}server/")) {
            let config = catalog
                .servers
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("server {name:?}")))?;
            json!({
                "name": name,
                "config": serde_json::to_value(config)?,
                "status": self.ctx.engine.status_of(name),
            })
        } else {
            return Err(Error::NotFound(format!("resource {uri:?}")));
        };

        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: uri.to_string(),
                mime_type: Some("application/json".to_string()),
                text: body.to_string(),
                meta: None,
            }],
        })
    }
}

impl ServerHandler for MaggServer {
    fn get_info(&self) -> ServerInfo {
        let settings = &self.ctx.settings;
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .enable_resources_subscribe()
                .enable_resources_list_changed()
                .enable_prompts()
                .enable_prompts_list_changed()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(format!(
                "MCP aggregator: backend capabilities are exposed under \
                 <prefix>{}<name>. Use the {} tool for list/info/call across \
                 tools, resources, and prompts, and the {}{}* tools to manage \
                 backend servers and kits.",
                settings.prefix_sep,
                proxy::PROXY_TOOL,
                settings.self_prefix,
                settings.prefix_sep,
            )),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        let settings = &self.ctx.settings;
        let mut tools: Vec<Tool> =
            admin::tool_definitions(&settings.self_prefix, &settings.prefix_sep);
        tools.push(proxy::tool_definition());

        let index = self.ctx.engine.index();
        tools.extend(index.tools.values().map(|(_, tool)| tool.clone()));

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        self.dispatch_tool(request, context)
            .await
            .map_err(Error::to_mcp_owned)
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListResourcesResult, McpError> {
        let mut resources = self.self_resources();
        let index = self.ctx.engine.index();
        resources.extend(index.resources.values().map(|(_, r)| r.clone()));

        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
            meta: None,
        })
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListResourceTemplatesResult, McpError> {
        let index = self.ctx.engine.index();
        Ok(ListResourceTemplatesResult {
            resource_templates: index
                .resource_templates
                .values()
                .map(|(_, t)| t.clone())
                .collect(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<ReadResourceResult, McpError> {
        let uri = request.uri.to_string();
        if uri.starts_with(SELF_SCHEME) {
            return self.read_self_resource(&uri).map_err(Error::to_mcp_owned);
        }

        match self
            .ctx
            .engine
            .call(CapabilityKind::Resource, &uri, None, context.ct.child_token())
            .await
            .map_err(Error::to_mcp_owned)?
        {
            BackendReply::Resource(result) => Ok(result),
            _ => Err(McpError::internal_error(
                "unexpected reply kind for resource read",
                None,
            )),
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListPromptsResult, McpError> {
        let index = self.ctx.engine.index();
        Ok(ListPromptsResult {
            prompts: index.prompts.values().map(|(_, p)| p.clone()).collect(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<GetPromptResult, McpError> {
        match self
            .ctx
            .engine
            .call(
                CapabilityKind::Prompt,
                &request.name,
                request.arguments,
                context.ct.child_token(),
            )
            .await
            .map_err(Error::to_mcp_owned)?
        {
            BackendReply::Prompt(result) => Ok(result),
            _ => Err(McpError::internal_error(
                "unexpected reply kind for prompt",
                None,
            )),
        }
    }

    async fn subscribe(
        &self,
        request: SubscribeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<(), McpError> {
        let uri = request.uri.to_string();
        if let Some(session_id) = self.session_id() {
            self.coordinator.subscribe(&session_id, &uri);
        }

        // Self resources update only via catalog changes; nothing to
        // forward downstream for them.
        if !uri.starts_with(SELF_SCHEME) {
            if let Ok((connection, local)) =
                self.ctx.engine.resolve(CapabilityKind::Resource, &uri)
            {
                connection
                    .call(BackendCall::Subscribe { uri: local }, context.ct.child_token())
                    .await
                    .map_err(Error::to_mcp_owned)?;
            }
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        request: UnsubscribeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> std::result::Result<(), McpError> {
        let uri = request.uri.to_string();
        if let Some(session_id) = self.session_id() {
            self.coordinator.unsubscribe(&session_id, &uri);
        }
        if !uri.starts_with(SELF_SCHEME) {
            if let Ok((connection, local)) =
                self.ctx.engine.resolve(CapabilityKind::Resource, &uri)
            {
                connection
                    .call(
                        BackendCall::Unsubscribe { uri: local },
                        context.ct.child_token(),
                    )
                    .await
                    .map_err(Error::to_mcp_owned)?;
            }
        }
        Ok(())
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        let session = self.coordinator.attach_session(context.peer.clone());
        info!(session = %session.id, "Client initialized");
        *self.session.write() = Some(session);
    }
}

impl Drop for MaggServer {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            self.coordinator.detach_session(&session.id);
        }
    }
}

/// Process-wide aggregator state: store, engine, coordinator, watcher.
pub struct Aggregator {
    ctx: Arc<AdminContext>,
    coordinator: Arc<NotificationCoordinator>,
    auth: Option<Arc<Authenticator>>,
    _watcher: Option<ConfigWatcher>,
    shutdown: CancellationToken,
}

impl Aggregator {
    /// Load the catalog, bring up backends, and start the watcher.
    ///
    /// # Errors
    ///
    /// A catalog that fails to read or validate at startup is fatal, as is
    /// an unusable key file when auth material is present.
    pub async fn new(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);
        let shutdown = CancellationToken::new();

        let store = Arc::new(ConfigStore::new(
            settings.config_path(),
            &settings.prefix_sep,
            settings.read_only,
        ));
        store.load().await?;

        let auth = Authenticator::from_settings(&settings)?.map(Arc::new);
        if auth.is_none() {
            info!("No private key found, bearer auth disabled");
        }

        let coordinator =
            NotificationCoordinator::new(settings.log_rate_per_second, shutdown.clone());
        let engine = MountEngine::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            Arc::clone(&coordinator),
            shutdown.clone(),
        );
        engine.start().await;

        let kits = Arc::new(KitLoader::new(settings.kit_dir()));
        let ctx = Arc::new(AdminContext {
            settings: Arc::clone(&settings),
            store: Arc::clone(&store),
            engine: Arc::clone(&engine),
            kits,
        });

        let watcher = if settings.auto_reload {
            Some(ConfigWatcher::start(
                store,
                engine,
                &settings,
                shutdown.clone(),
            )?)
        } else {
            None
        };

        Ok(Self {
            ctx,
            coordinator,
            auth,
            _watcher: watcher,
            shutdown,
        })
    }

    /// A fresh per-session handler.
    #[must_use]
    pub fn server(&self) -> MaggServer {
        MaggServer::new(Arc::clone(&self.ctx), Arc::clone(&self.coordinator))
    }

    /// Serve until the transport closes or the operator interrupts.
    ///
    /// # Errors
    ///
    /// Returns transport errors (failure to bind is fatal for HTTP modes).
    pub async fn run(&self, mode: ServeMode, host: &str, port: u16) -> Result<RunOutcome> {
        let outcome = match mode {
            ServeMode::Stdio => self.run_stdio().await?,
            ServeMode::Http => self.run_http(host, port).await?,
            ServeMode::Hybrid => {
                let http = self.run_http(host, port);
                let stdio = self.run_stdio();
                tokio::select! {
                    outcome = http => outcome?,
                    outcome = stdio => outcome?,
                }
            }
        };

        self.shutdown().await;
        Ok(outcome)
    }

    async fn run_stdio(&self) -> Result<RunOutcome> {
        info!("Serving MCP over stdio");
        let service = self
            .server()
            .serve(rmcp::transport::stdio())
            .await
            .map_err(|e| Error::Transport(format!("stdio serve failed: {e}")))?;

        tokio::select! {
            result = service.waiting() => {
                result.map_err(|e| Error::Transport(format!("stdio session failed: {e}")))?;
                Ok(RunOutcome::Completed)
            }
            _ = tokio::signal::ctrl_c() => Ok(RunOutcome::Interrupted),
        }
    }

    async fn run_http(&self, host: &str, port: u16) -> Result<RunOutcome> {
        let ctx = Arc::clone(&self.ctx);
        let coordinator = Arc::clone(&self.coordinator);

        let service = StreamableHttpService::new(
            move || Ok(MaggServer::new(Arc::clone(&ctx), Arc::clone(&coordinator))),
            LocalSessionManager::default().into(),
            Default::default(),
        );

        let mut router = Router::new().nest_service("/mcp", service);
        if let Some(auth) = self.auth.clone() {
            router = router.layer(axum::middleware::from_fn(
                move |req: axum::extract::Request, next: axum::middleware::Next| {
                    let auth = Arc::clone(&auth);
                    async move {
                        let header = req
                            .headers()
                            .get(axum::http::header::AUTHORIZATION)
                            .and_then(|v| v.to_str().ok());
                        match auth.authorize(header) {
                            Ok(_) => next.run(req).await,
                            Err(e) => {
                                warn!(error = %e, "Rejected unauthenticated request");
                                axum::response::Response::builder()
                                    .status(axum::http::StatusCode::UNAUTHORIZED)
                                    .body(axum::body::Body::from("unauthorized"))
                                    .unwrap_or_default()
                            }
                        }
                    }
                },
            ));
        }

        let addr = format!("{host}:{port}");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Transport(format!("cannot bind {addr}: {e}")))?;
        info!(addr = %addr, auth = self.auth.is_some(), "Serving MCP over Streamable HTTP");

        let shutdown = self.shutdown.clone();
        let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        flag.store(true, std::sync::atomic::Ordering::Relaxed);
                    }
                    () = shutdown.cancelled() => {}
                }
            })
            .await
            .map_err(|e| Error::Transport(format!("HTTP serve failed: {e}")))?;

        if interrupted.load(std::sync::atomic::Ordering::Relaxed) {
            Ok(RunOutcome::Interrupted)
        } else {
            Ok(RunOutcome::Completed)
        }
    }

    /// Tear down backends and background tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.ctx.engine.shutdown().await;
        info!("Aggregator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_aggregator() -> (tempfile::TempDir, Aggregator) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            config_dir: Some(dir.path().to_path_buf()),
            auto_reload: false,
            ..Settings::default()
        };
        let aggregator = Aggregator::new(settings).await.unwrap();
        (dir, aggregator)
    }

    #[tokio::test]
    async fn empty_catalog_serves_builtin_tools_only() {
        let (_dir, aggregator) = test_aggregator().await;
        let server = aggregator.server();

        let index = server.ctx.engine.index();
        assert!(index.tools.is_empty());

        // The surface still carries the admin tools and the proxy tool.
        let tools = admin::tool_definitions("magg", "_");
        assert!(!tools.is_empty());
        assert_eq!(proxy::tool_definition().name, "proxy");

        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn self_resources_cover_catalog_entries() {
        let (_dir, aggregator) = test_aggregator().await;
        let server = aggregator.server();

        server
            .ctx
            .store
            .mutate(|catalog| {
                catalog.servers.insert(
                    "calc".into(),
                    crate::config::ServerConfig {
                        command: Some("npx calc".into()),
                        ..Default::default()
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        let resources = server.self_resources();
        let uris: Vec<String> = resources.iter().map(|r| r.uri.clone()).collect();
        assert!(uris.contains(&"magg://servers/all".to_string()));
        assert!(uris.contains(&"magg://server/calc".to_string()));

        let read = server.read_self_resource("magg://server/calc").unwrap();
        assert_eq!(read.contents.len(), 1);
        match &read.contents[0] {
            ResourceContents::TextResourceContents { mime_type, text, .. } => {
                assert_eq!(mime_type.as_deref(), Some("application/json"));
                let body: Value = serde_json::from_str(text).unwrap();
                assert_eq!(body["name"], "calc");
            }
            ResourceContents::BlobResourceContents { .. } => panic!("expected text"),
        }

        assert!(server.read_self_resource("magg://server/ghost").is_err());
        aggregator.shutdown().await;
    }
}
