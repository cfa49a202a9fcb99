//! Backend connections
//!
//! One [`BackendConnection`] per configured server. Each connection is
//! driven by exactly one owning task that serializes all transport I/O:
//! external callers enqueue [`BackendCall`]s through an mpsc queue and get
//! their reply on a oneshot channel. The capability snapshot is
//! copy-on-write: readers clone an `Arc` and never observe a half-updated
//! view.
//!
//! State machine:
//!
//! ```text
//! CONFIGURED ──enable──▶ CONNECTING ──ok──▶ RUNNING
//!                              │               │
//!                              │ err           │ disconnect
//!                              ▼               ▼
//!                          FAILED ◀──retry── DEGRADED
//!                              │               │
//!                              └───── disable ─┴──▶ DISABLED
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientInfo, GetPromptRequestParam, GetPromptResult,
    PaginatedRequestParam, Prompt, ReadResourceRequestParam, ReadResourceResult, Resource,
    ResourceTemplate, SubscribeRequestParam, Tool, UnsubscribeRequestParam,
};
use rmcp::service::{Peer, RunningService};
use rmcp::{ClientHandler, RoleClient};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::coordinator::{NotificationEnvelope, NotificationKind};
use crate::transport::{self, TransportKind};
use crate::{Error, Result};

/// Default per-request budget; overridable via `transport.timeout_ms`.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial reconnect backoff; doubles per attempt with jitter.
const RECONNECT_INITIAL: Duration = Duration::from_millis(100);

/// Reconnect backoff ceiling.
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Grace period between cancel and hard task abort at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of one backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "detail")]
pub enum BackendState {
    /// Known but not yet started.
    Configured,
    /// Transport being established.
    Connecting,
    /// Handshake done, capabilities fetched, serving requests.
    Running,
    /// Transport lost; reconnecting with backoff.
    Degraded,
    /// Reconnect budget exhausted or blocked by a name collision.
    Failed(String),
    /// Disabled by config or removed.
    Disabled,
}

/// Immutable capability snapshot fetched from a backend.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySnapshot {
    /// Tools under their local names.
    pub tools: Vec<Tool>,
    /// Resources under their original URIs.
    pub resources: Vec<Resource>,
    /// Resource templates.
    pub resource_templates: Vec<ResourceTemplate>,
    /// Prompts under their local names.
    pub prompts: Vec<Prompt>,
    /// When the snapshot was fetched.
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A request routed to the backend's owning task.
#[derive(Debug)]
pub enum BackendCall {
    /// tools/call with local name.
    CallTool {
        /// Local tool name.
        name: String,
        /// Call arguments.
        args: Option<serde_json::Map<String, Value>>,
    },
    /// resources/read by original URI.
    ReadResource {
        /// Resource URI.
        uri: String,
    },
    /// prompts/get with local name.
    GetPrompt {
        /// Local prompt name.
        name: String,
        /// Prompt arguments.
        args: Option<serde_json::Map<String, Value>>,
    },
    /// resources/subscribe by original URI.
    Subscribe {
        /// Resource URI.
        uri: String,
    },
    /// resources/unsubscribe by original URI.
    Unsubscribe {
        /// Resource URI.
        uri: String,
    },
}

/// Reply from a backend call.
#[derive(Debug)]
pub enum BackendReply {
    /// Result of tools/call.
    Tool(CallToolResult),
    /// Result of resources/read.
    Resource(ReadResourceResult),
    /// Result of prompts/get.
    Prompt(GetPromptResult),
    /// Subscription acknowledged.
    Ack,
}

enum Command {
    Call {
        call: BackendCall,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<BackendReply>>,
    },
    Probe {
        reply: oneshot::Sender<Result<Duration>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Events flowing from the client handler into the owning task.
enum DriverEvent {
    Notification(NotificationEnvelope),
}

/// Emitted to the mount engine when the aggregated index must be rebuilt.
#[derive(Debug, Clone)]
pub struct SnapshotChanged {
    /// Backend whose snapshot changed.
    pub backend: String,
    /// Which list kinds changed.
    pub kinds: Vec<NotificationKind>,
}

/// Tuning knobs shared by every connection (derived from settings).
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Health probe timeout.
    pub probe_timeout: Duration,
    /// Interval between background health probes.
    pub probe_interval: Duration,
    /// Reconnect attempts before parking in `Failed`.
    pub reconnect_budget: u32,
    /// Show subprocess stderr.
    pub stderr_show: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(500),
            probe_interval: Duration::from_secs(30),
            reconnect_budget: 8,
            stderr_show: false,
        }
    }
}

/// Handle to one backend connection, exclusively owned by the mount engine.
pub struct BackendConnection {
    /// Backend name (catalog key).
    pub name: String,
    /// Configuration this connection was built from.
    pub config: ServerConfig,
    transport_kind: TransportKind,
    state: RwLock<BackendState>,
    snapshot: RwLock<Arc<CapabilitySnapshot>>,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_health: RwLock<Option<DateTime<Utc>>>,
    request_count: AtomicU64,
    request_timeout: Duration,
}

impl BackendConnection {
    /// Spawn the owning task for `config` and return the handle.
    ///
    /// The connection starts in `Connecting`; capability fetch failures and
    /// transport errors surface through the state, not through this call.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the transport cannot be selected.
    pub fn spawn(
        name: &str,
        config: ServerConfig,
        options: BackendOptions,
        notifications: mpsc::UnboundedSender<NotificationEnvelope>,
        index_events: mpsc::UnboundedSender<SnapshotChanged>,
    ) -> Result<Arc<Self>> {
        let transport_kind = transport::select(name, &config)?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let request_timeout = config
            .transport_value("timeout_ms")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);

        let connection = Arc::new(Self {
            name: name.to_string(),
            config,
            transport_kind,
            state: RwLock::new(BackendState::Configured),
            snapshot: RwLock::new(Arc::new(CapabilitySnapshot::default())),
            cmd_tx,
            cancel: cancel.clone(),
            task: Mutex::new(None),
            last_health: RwLock::new(None),
            request_count: AtomicU64::new(0),
            request_timeout,
        });

        let driver = Driver {
            connection: Arc::clone(&connection),
            options,
            notifications,
            index_events,
        };
        let handle = tokio::spawn(driver.run(cmd_rx));
        *connection.task.lock() = Some(handle);

        Ok(connection)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BackendState {
        self.state.read().clone()
    }

    /// Whether the connection serves requests right now.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state(), BackendState::Running)
    }

    /// Immutable capability snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Park the connection in `Failed` (collision handling).
    pub fn mark_failed(&self, reason: &str) {
        *self.state.write() = BackendState::Failed(reason.to_string());
        warn!(backend = %self.name, reason = %reason, "Backend marked failed");
    }

    /// Whether the connection is parked on a name collision. The owning
    /// task keeps serving underneath; only the mount engine blocks it.
    #[must_use]
    pub fn is_collision_parked(&self) -> bool {
        matches!(self.state(), BackendState::Failed(reason) if reason.starts_with("Name collision"))
    }

    /// Lift a collision park once the contested name is free again.
    pub fn clear_collision(&self) {
        let mut state = self.state.write();
        if matches!(&*state, BackendState::Failed(reason) if reason.starts_with("Name collision")) {
            *state = BackendState::Running;
            info!(backend = %self.name, "Collision cleared, backend mounted");
        }
    }

    /// Route a call through the owning task's queue.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the backend is gone, `Cancelled`/`Timeout`
    /// per the request's budget, and downstream errors verbatim.
    pub async fn call(&self, call: BackendCall, cancel: CancellationToken) -> Result<BackendReply> {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                call,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Transport(format!("backend {:?} gone", self.name)))?;

        reply_rx
            .await
            .map_err(|_| Error::Transport(format!("backend {:?} gone", self.name)))?
    }

    /// Cheap health probe: zero-arg tools/list with a tight timeout.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the probe budget is exceeded or a transport
    /// error when the backend is unreachable.
    pub async fn probe(&self) -> Result<Duration> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Probe { reply: reply_tx })
            .await
            .map_err(|_| Error::Transport(format!("backend {:?} gone", self.name)))?;
        reply_rx
            .await
            .map_err(|_| Error::Transport(format!("backend {:?} gone", self.name)))?
    }

    /// Force a capability refetch.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from the refetch.
    pub async fn refresh(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Refresh { reply: reply_tx })
            .await
            .map_err(|_| Error::Transport(format!("backend {:?} gone", self.name)))?;
        reply_rx
            .await
            .map_err(|_| Error::Transport(format!("backend {:?} gone", self.name)))?
    }

    /// Tear the connection down: graceful cancel, then bounded hard abort.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(mut handle) = task {
            tokio::select! {
                _ = &mut handle => {}
                () = tokio::time::sleep(SHUTDOWN_GRACE) => {
                    warn!(backend = %self.name, "Backend task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        *self.state.write() = BackendState::Disabled;
        info!(backend = %self.name, "Backend shut down");
    }

    /// Status summary for admin tooling.
    #[must_use]
    pub fn status(&self) -> BackendStatus {
        let snapshot = self.snapshot();
        BackendStatus {
            name: self.name.clone(),
            state: self.state(),
            transport: self.transport_kind.as_str().to_string(),
            prefix: self
                .config
                .effective_prefix(&self.name)
                .to_string(),
            tools: snapshot.tools.len(),
            resources: snapshot.resources.len() + snapshot.resource_templates.len(),
            prompts: snapshot.prompts.len(),
            last_health: *self.last_health.read(),
            request_count: self.request_count.load(Ordering::Relaxed),
        }
    }
}

/// Serializable status row for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    /// Backend name.
    pub name: String,
    /// Lifecycle state.
    #[serde(flatten)]
    pub state: BackendState,
    /// Transport kind.
    pub transport: String,
    /// Effective namespace prefix.
    pub prefix: String,
    /// Tool count in the snapshot.
    pub tools: usize,
    /// Resource + template count in the snapshot.
    pub resources: usize,
    /// Prompt count in the snapshot.
    pub prompts: usize,
    /// Last successful health probe.
    pub last_health: Option<DateTime<Utc>>,
    /// Requests routed through this connection.
    pub request_count: u64,
}

/// Client handler attached to every backend service: tags inbound
/// notifications with the backend name and publishes envelopes to the
/// owning task (no back-pointers; pure message passing).
#[derive(Clone)]
struct BackendClientHandler {
    backend: String,
    events: mpsc::UnboundedSender<DriverEvent>,
}

impl BackendClientHandler {
    fn forward(&self, kind: NotificationKind, payload: Value) {
        let envelope = NotificationEnvelope::new(&self.backend, kind, payload);
        let _ = self.events.send(DriverEvent::Notification(envelope));
    }
}

impl ClientHandler for BackendClientHandler {
    fn get_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name = format!("magg/{}", self.backend);
        info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        info
    }

    fn on_tool_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(NotificationKind::ToolsChanged, Value::Null);
        std::future::ready(())
    }

    fn on_resource_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(NotificationKind::ResourcesChanged, Value::Null);
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(NotificationKind::PromptsChanged, Value::Null);
        std::future::ready(())
    }

    fn on_resource_updated(
        &self,
        params: rmcp::model::ResourceUpdatedNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(
            NotificationKind::ResourceUpdated,
            serde_json::to_value(params).unwrap_or(Value::Null),
        );
        std::future::ready(())
    }

    fn on_progress(
        &self,
        params: rmcp::model::ProgressNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(
            NotificationKind::Progress,
            serde_json::to_value(params).unwrap_or(Value::Null),
        );
        std::future::ready(())
    }

    fn on_logging_message(
        &self,
        params: rmcp::model::LoggingMessageNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(
            NotificationKind::Log,
            serde_json::to_value(params).unwrap_or(Value::Null),
        );
        std::future::ready(())
    }

    fn on_cancelled(
        &self,
        params: rmcp::model::CancelledNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(
            NotificationKind::Cancelled,
            serde_json::to_value(params).unwrap_or(Value::Null),
        );
        std::future::ready(())
    }
}

/// The owning task: connects, serves the queue, reconnects with backoff.
struct Driver {
    connection: Arc<BackendConnection>,
    options: BackendOptions,
    notifications: mpsc::UnboundedSender<NotificationEnvelope>,
    index_events: mpsc::UnboundedSender<SnapshotChanged>,
}

impl Driver {
    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut attempts: u32 = 0;
        let mut delays = reconnect_backoff(true);

        loop {
            if self.connection.cancel.is_cancelled() {
                break;
            }

            self.set_state(BackendState::Connecting);
            let handler = BackendClientHandler {
                backend: self.connection.name.clone(),
                events: event_tx.clone(),
            };

            let service = match transport::connect(
                &self.connection.name,
                &self.connection.config,
                handler,
                self.options.stderr_show,
            )
            .await
            {
                Ok(service) => service,
                Err(e) => {
                    warn!(backend = %self.connection.name, error = %e, "Connect failed");
                    match self.backoff(&mut attempts, &mut delays, &e).await {
                        Backoff::Retry => continue,
                        Backoff::Park => {
                            self.park(&mut cmd_rx).await;
                            break;
                        }
                        Backoff::Exit => break,
                    }
                }
            };

            if let Err(e) = self.refresh_snapshot(service.peer(), None).await {
                warn!(backend = %self.connection.name, error = %e, "Initial capability fetch failed");
                let _ = service.cancel().await;
                match self.backoff(&mut attempts, &mut delays, &e).await {
                    Backoff::Retry => continue,
                    Backoff::Park => {
                        self.park(&mut cmd_rx).await;
                        break;
                    }
                    Backoff::Exit => break,
                }
            }

            attempts = 0;
            delays = reconnect_backoff(true);
            self.set_state(BackendState::Running);
            info!(backend = %self.connection.name, "Backend running");

            // Serve until the transport dies or we are cancelled.
            let outcome = self.serve(&service, &mut cmd_rx, &mut event_rx).await;
            let _ = service.cancel().await;

            match outcome {
                ServeOutcome::Cancelled => break,
                ServeOutcome::TransportLost(reason) => {
                    self.set_state(BackendState::Degraded);
                    // Drop out of the aggregated index until reconnected.
                    let _ = self.index_events.send(SnapshotChanged {
                        backend: self.connection.name.clone(),
                        kinds: vec![
                            NotificationKind::ToolsChanged,
                            NotificationKind::ResourcesChanged,
                            NotificationKind::PromptsChanged,
                        ],
                    });
                    warn!(backend = %self.connection.name, reason = %reason, "Backend degraded");
                    match self
                        .backoff(&mut attempts, &mut delays, &Error::Transport(reason))
                        .await
                    {
                        Backoff::Retry => {}
                        Backoff::Park => {
                            self.park(&mut cmd_rx).await;
                            break;
                        }
                        Backoff::Exit => break,
                    }
                }
            }
        }

        self.set_state(BackendState::Disabled);
        // Fail any callers still queued.
        cmd_rx.close();
        while let Some(cmd) = cmd_rx.recv().await {
            Self::reject(cmd, || {
                Error::Transport(format!("backend {:?} gone", self.connection.name))
            });
        }
    }

    async fn serve(
        &self,
        service: &RunningService<RoleClient, BackendClientHandler>,
        cmd_rx: &mut mpsc::Receiver<Command>,
        event_rx: &mut mpsc::UnboundedReceiver<DriverEvent>,
    ) -> ServeOutcome {
        let mut probe_ticker = tokio::time::interval(self.options.probe_interval);
        probe_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        probe_ticker.reset();

        loop {
            tokio::select! {
                maybe = cmd_rx.recv() => {
                    let Some(cmd) = maybe else {
                        return ServeOutcome::Cancelled;
                    };
                    if let Some(lost) = self.handle_command(service.peer(), cmd).await {
                        return ServeOutcome::TransportLost(lost);
                    }
                }
                maybe = event_rx.recv() => {
                    if let Some(DriverEvent::Notification(envelope)) = maybe {
                        self.handle_notification(service.peer(), envelope).await;
                    }
                }
                _ = probe_ticker.tick() => {
                    if let Err(e) = self.probe_once(service.peer()).await {
                        return ServeOutcome::TransportLost(e.to_string());
                    }
                }
                () = self.connection.cancel.cancelled() => {
                    return ServeOutcome::Cancelled;
                }
            }
        }
    }

    /// Background liveness probe; failure degrades the connection.
    async fn probe_once(&self, peer: &Peer<RoleClient>) -> Result<()> {
        match tokio::time::timeout(self.options.probe_timeout, peer.list_tools(None)).await {
            Ok(Ok(_)) => {
                *self.connection.last_health.write() = Some(Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(Error::from_service(e)),
            Err(_) => Err(Error::Timeout("health probe".to_string())),
        }
    }

    /// Dispatch one queued command. Returns `Some(reason)` when the
    /// transport is gone and the driver must reconnect.
    async fn handle_command(&self, peer: &Peer<RoleClient>, cmd: Command) -> Option<String> {
        match cmd {
            Command::Call {
                call,
                cancel,
                reply,
            } => {
                let result = self.execute(peer, call, &cancel).await;
                let lost = match &result {
                    Err(e) if e.is_transport_failure() && !matches!(e, Error::Timeout(_)) => {
                        Some(e.to_string())
                    }
                    _ => None,
                };
                let _ = reply.send(result);
                lost
            }
            Command::Probe { reply } => {
                let started = std::time::Instant::now();
                let outcome = self
                    .probe_once(peer)
                    .await
                    .map(|()| started.elapsed());
                let lost = match &outcome {
                    Err(e) if matches!(e, Error::Transport(_)) => Some(e.to_string()),
                    _ => None,
                };
                let _ = reply.send(outcome);
                lost
            }
            Command::Refresh { reply } => {
                let result = self.refresh_snapshot(peer, None).await;
                let lost = result.as_ref().err().and_then(|e| {
                    e.is_transport_failure().then(|| e.to_string())
                });
                let _ = reply.send(result);
                lost
            }
        }
    }

    /// Run one downstream call under the request's cancellation scope and
    /// timeout budget.
    async fn execute(
        &self,
        peer: &Peer<RoleClient>,
        call: BackendCall,
        cancel: &CancellationToken,
    ) -> Result<BackendReply> {
        let fut = async {
            match call {
                BackendCall::CallTool { name, args } => peer
                    .call_tool(CallToolRequestParam {
                        name: name.into(),
                        arguments: args,
                    })
                    .await
                    .map(BackendReply::Tool)
                    .map_err(Error::from_service),
                BackendCall::ReadResource { uri } => peer
                    .read_resource(ReadResourceRequestParam { uri })
                    .await
                    .map(BackendReply::Resource)
                    .map_err(Error::from_service),
                BackendCall::GetPrompt { name, args } => peer
                    .get_prompt(GetPromptRequestParam {
                        name,
                        arguments: args,
                    })
                    .await
                    .map(BackendReply::Prompt)
                    .map_err(Error::from_service),
                BackendCall::Subscribe { uri } => peer
                    .subscribe(SubscribeRequestParam { uri })
                    .await
                    .map(|()| BackendReply::Ack)
                    .map_err(Error::from_service),
                BackendCall::Unsubscribe { uri } => peer
                    .unsubscribe(UnsubscribeRequestParam { uri })
                    .await
                    .map(|()| BackendReply::Ack)
                    .map_err(Error::from_service),
            }
        };

        tokio::select! {
            result = fut => result,
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(self.connection.request_timeout) => {
                Err(Error::Timeout(format!("backend {:?} request", self.connection.name)))
            }
        }
    }

    /// Forward a backend notification to the coordinator; list-change kinds
    /// additionally refresh the affected part of the snapshot and ping the
    /// mount engine to re-index.
    async fn handle_notification(&self, peer: &Peer<RoleClient>, envelope: NotificationEnvelope) {
        let kind = envelope.kind;
        let _ = self.notifications.send(envelope);

        if kind.is_list_change() {
            if let Err(e) = self.refresh_snapshot(peer, Some(kind)).await {
                warn!(backend = %self.connection.name, error = %e, "Snapshot refresh failed");
            }
        }
    }

    /// Fetch capability lists (all of them, or just the changed kind) and
    /// swap the snapshot pointer.
    async fn refresh_snapshot(
        &self,
        peer: &Peer<RoleClient>,
        only: Option<NotificationKind>,
    ) -> Result<()> {
        let previous = self.connection.snapshot();
        let mut next = (*previous).clone();
        let mut kinds = Vec::new();

        if matches!(only, None | Some(NotificationKind::ToolsChanged)) {
            next.tools = list_tools(peer).await?;
            kinds.push(NotificationKind::ToolsChanged);
        }
        if matches!(only, None | Some(NotificationKind::ResourcesChanged)) {
            next.resources = list_resources(peer).await?;
            next.resource_templates = list_resource_templates(peer).await?;
            kinds.push(NotificationKind::ResourcesChanged);
        }
        if matches!(only, None | Some(NotificationKind::PromptsChanged)) {
            next.prompts = list_prompts(peer).await?;
            kinds.push(NotificationKind::PromptsChanged);
        }
        next.fetched_at = Some(Utc::now());

        debug!(
            backend = %self.connection.name,
            tools = next.tools.len(),
            resources = next.resources.len(),
            prompts = next.prompts.len(),
            "Capability snapshot refreshed"
        );
        *self.connection.snapshot.write() = Arc::new(next);

        let _ = self.index_events.send(SnapshotChanged {
            backend: self.connection.name.clone(),
            kinds,
        });
        Ok(())
    }

    /// Sleep through one backoff step, or decide to park once the budget is
    /// exhausted.
    async fn backoff(
        &self,
        attempts: &mut u32,
        delays: &mut impl Iterator<Item = Duration>,
        error: &Error,
    ) -> Backoff {
        *attempts += 1;
        if *attempts > self.options.reconnect_budget {
            self.set_state(BackendState::Failed(error.to_string()));
            warn!(
                backend = %self.connection.name,
                attempts = *attempts,
                "Reconnect budget exhausted"
            );
            return Backoff::Park;
        }

        let delay = delays.next().unwrap_or(RECONNECT_MAX);
        debug!(
            backend = %self.connection.name,
            attempt = *attempts,
            delay_ms = delay.as_millis(),
            "Reconnecting after backoff"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => Backoff::Retry,
            () = self.connection.cancel.cancelled() => Backoff::Exit,
        }
    }

    /// `Failed` terminal loop: the backend stays visible to admin tooling
    /// but rejects all queued work until explicitly shut down.
    async fn park(&self, cmd_rx: &mut mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                () = self.connection.cancel.cancelled() => return,
                maybe = cmd_rx.recv() => {
                    let Some(cmd) = maybe else { return };
                    Self::reject(cmd, || {
                        Error::Transport(format!(
                            "backend {:?} failed: reconnect budget exhausted",
                            self.connection.name
                        ))
                    });
                }
            }
        }
    }

    fn set_state(&self, state: BackendState) {
        *self.connection.state.write() = state;
    }

    fn reject(cmd: Command, err: impl Fn() -> Error) {
        match cmd {
            Command::Call { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Command::Probe { reply } => {
                let _ = reply.send(Err(err()));
            }
            Command::Refresh { reply } => {
                let _ = reply.send(Err(err()));
            }
        }
    }
}

enum Backoff {
    Retry,
    Park,
    Exit,
}

enum ServeOutcome {
    Cancelled,
    TransportLost(String),
}

/// Bounded exponential backoff: 100 ms, 200 ms, 400 ms, ... capped at 30 s,
/// with jitter in production use.
fn reconnect_backoff(jitter: bool) -> impl Iterator<Item = Duration> {
    let mut builder = ExponentialBuilder::default()
        .with_min_delay(RECONNECT_INITIAL)
        .with_max_delay(RECONNECT_MAX)
        .with_factor(2.0)
        .without_max_times();
    if jitter {
        builder = builder.with_jitter();
    }
    builder.build()
}

async fn list_tools(peer: &Peer<RoleClient>) -> Result<Vec<Tool>> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = match peer
            .list_tools(cursor.take().map(|c| PaginatedRequestParam {
                cursor: Some(c),
                meta: None,
            }))
            .await
        {
            Ok(page) => page,
            Err(e) => return absent_as_empty(e).map(|()| tools),
        };
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(tools),
        }
    }
}

async fn list_resources(peer: &Peer<RoleClient>) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = match peer
            .list_resources(cursor.take().map(|c| PaginatedRequestParam {
                cursor: Some(c),
                meta: None,
            }))
            .await
        {
            Ok(page) => page,
            Err(e) => return absent_as_empty(e).map(|()| resources),
        };
        resources.extend(page.resources);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(resources),
        }
    }
}

async fn list_resource_templates(peer: &Peer<RoleClient>) -> Result<Vec<ResourceTemplate>> {
    let mut templates = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = match peer
            .list_resource_templates(cursor.take().map(|c| PaginatedRequestParam {
                cursor: Some(c),
                meta: None,
            }))
            .await
        {
            Ok(page) => page,
            Err(e) => return absent_as_empty(e).map(|()| templates),
        };
        templates.extend(page.resource_templates);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(templates),
        }
    }
}

async fn list_prompts(peer: &Peer<RoleClient>) -> Result<Vec<Prompt>> {
    let mut prompts = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = match peer
            .list_prompts(cursor.take().map(|c| PaginatedRequestParam {
                cursor: Some(c),
                meta: None,
            }))
            .await
        {
            Ok(page) => page,
            Err(e) => return absent_as_empty(e).map(|()| prompts),
        };
        prompts.extend(page.prompts);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(prompts),
        }
    }
}

/// Backends without a capability respond method-not-found; that is an empty
/// list, not a failure.
fn absent_as_empty(err: rmcp::ServiceError) -> Result<()> {
    match Error::from_service(err) {
        Error::Backend { code: -32601, .. } => Ok(()),
        other => Err(other),
    }
}
