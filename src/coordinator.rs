//! Notification coordinator
//!
//! The message bus between backends and connected client sessions. Backends
//! (and admin tools) publish [`NotificationEnvelope`]s into an ingest
//! channel; the coordinator task classifies them, coalesces list-change
//! bursts, de-duplicates identical payloads within the window, and fans out
//! to per-session outbound queues. Each session drains its own queue on a
//! dedicated send loop, so a slow client never blocks other clients or a
//! backend task.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use rmcp::model::{
    CancelledNotificationParam, LoggingMessageNotificationParam, ProgressNotificationParam,
    ResourceUpdatedNotificationParam,
};
use rmcp::service::{Peer, RoleServer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long list-change bursts are collected before one coalesced
/// notification per kind goes out.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Per-session outbound queue threshold; above it the oldest list-change
/// entries are dropped first (they are idempotent).
const SESSION_QUEUE_LIMIT: usize = 256;

/// Notification kinds the coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A backend's tool list changed.
    ToolsChanged,
    /// A backend's resource list changed.
    ResourcesChanged,
    /// A backend's prompt list changed.
    PromptsChanged,
    /// A subscribed resource changed.
    ResourceUpdated,
    /// Progress on a long-running request.
    Progress,
    /// A log message from a backend.
    Log,
    /// A request was cancelled downstream.
    Cancelled,
}

impl NotificationKind {
    /// Whether this kind is coalesced rather than forwarded 1:1.
    #[must_use]
    pub fn is_list_change(self) -> bool {
        matches!(
            self,
            Self::ToolsChanged | Self::ResourcesChanged | Self::PromptsChanged
        )
    }

    /// Stable name used in digests and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolsChanged => "tools_changed",
            Self::ResourcesChanged => "resources_changed",
            Self::PromptsChanged => "prompts_changed",
            Self::ResourceUpdated => "resource_updated",
            Self::Progress => "progress",
            Self::Log => "log",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A tagged notification flowing from a backend (or admin tool) toward
/// client sessions.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NotificationEnvelope {
    /// Backend the notification originated at (`magg` for synthetic ones).
    pub source_server: String,
    /// Classified kind.
    pub kind: NotificationKind,
    /// Raw notification parameters.
    pub payload: Value,
    /// Arrival timestamp.
    pub received_at: DateTime<Utc>,
}

impl NotificationEnvelope {
    /// Build an envelope stamped now.
    #[must_use]
    pub fn new(source: &str, kind: NotificationKind, payload: Value) -> Self {
        Self {
            source_server: source.to_string(),
            kind,
            payload,
            received_at: Utc::now(),
        }
    }

    fn digest(&self) -> (NotificationKind, String) {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.payload.to_string().as_bytes());
        (self.kind, hex::encode(hasher.finalize()))
    }
}

/// One queued outbound item for a session.
#[derive(Debug, Clone)]
enum Outbound {
    ListChanged(NotificationKind),
    ResourceUpdated(ResourceUpdatedNotificationParam),
    Progress(ProgressNotificationParam),
    Cancelled(CancelledNotificationParam),
    Log(LoggingMessageNotificationParam),
}

impl Outbound {
    fn droppable(&self) -> bool {
        matches!(self, Self::ListChanged(_))
    }
}

/// One attached client session: its peer handle, subscriptions, and
/// outbound queue (single producer: the coordinator; single consumer: the
/// session's send loop).
pub struct ClientSession {
    /// Session identifier.
    pub id: String,
    peer: Peer<RoleServer>,
    subscriptions: Mutex<HashSet<String>>,
    queue: Mutex<VecDeque<Outbound>>,
    wake: Notify,
    closed: CancellationToken,
}

impl ClientSession {
    fn push(&self, item: Outbound) {
        let dropped = {
            let mut queue = self.queue.lock();
            enqueue_bounded(&mut queue, item, SESSION_QUEUE_LIMIT)
        };
        if dropped {
            debug!(session = %self.id, "Dropped oldest list-change notification (backpressure)");
        }
        self.wake.notify_one();
    }

    fn pop(&self) -> Option<Outbound> {
        self.queue.lock().pop_front()
    }

    fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions.lock().contains(uri)
    }
}

/// Push under the backpressure policy: above the limit the oldest
/// list-change entry is evicted first (a later coalesced one supersedes
/// it); targeted entries are never dropped, the queue just grows. Returns
/// whether an entry was evicted.
fn enqueue_bounded(queue: &mut VecDeque<Outbound>, item: Outbound, limit: usize) -> bool {
    let mut dropped = false;
    if queue.len() >= limit {
        if let Some(pos) = queue.iter().position(Outbound::droppable) {
            queue.remove(pos);
            dropped = true;
        }
    }
    queue.push_back(item);
    dropped
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Routes inbound notification envelopes to attached client sessions.
pub struct NotificationCoordinator {
    ingest_tx: mpsc::UnboundedSender<NotificationEnvelope>,
    sessions: DashMap<String, Arc<ClientSession>>,
    progress_tokens: DashMap<String, String>,
    log_limiter: KeyedLimiter,
    shutdown: CancellationToken,
}

impl NotificationCoordinator {
    /// Create the coordinator and spawn its routing task.
    #[must_use]
    pub fn new(log_rate_per_second: u32, shutdown: CancellationToken) -> Arc<Self> {
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();

        let rate = NonZeroU32::new(log_rate_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = rate.saturating_mul(NonZeroU32::new(2).unwrap_or(NonZeroU32::MIN));

        let coordinator = Arc::new(Self {
            ingest_tx,
            sessions: DashMap::new(),
            progress_tokens: DashMap::new(),
            log_limiter: RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst)),
            shutdown: shutdown.clone(),
        });

        let task = Arc::clone(&coordinator);
        tokio::spawn(async move {
            task.route(ingest_rx).await;
        });

        coordinator
    }

    /// Handle backends use to publish envelopes.
    #[must_use]
    pub fn publisher(&self) -> mpsc::UnboundedSender<NotificationEnvelope> {
        self.ingest_tx.clone()
    }

    /// Publish one envelope (admin tools, mount engine).
    pub fn publish(&self, envelope: NotificationEnvelope) {
        let _ = self.ingest_tx.send(envelope);
    }

    /// Attach a client session and start its send loop.
    pub fn attach_session(self: &Arc<Self>, peer: Peer<RoleServer>) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession {
            id: format!("magg-{}", Uuid::new_v4()),
            peer,
            subscriptions: Mutex::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            closed: self.shutdown.child_token(),
        });

        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        info!(session = %session.id, sessions = self.sessions.len(), "Client session attached");

        let coordinator = Arc::clone(self);
        let looped = Arc::clone(&session);
        tokio::spawn(async move {
            coordinator.session_send_loop(looped).await;
        });

        session
    }

    /// Detach a session; its queue is abandoned.
    pub fn detach_session(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            info!(session = %id, "Client session detached");
        }
        self.progress_tokens.retain(|_, session| session != id);
    }

    /// Number of attached sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Record a resource subscription for targeted `resource_updated` routing.
    pub fn subscribe(&self, session_id: &str, uri: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.subscriptions.lock().insert(uri.to_string());
        }
    }

    /// Drop a resource subscription.
    pub fn unsubscribe(&self, session_id: &str, uri: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.subscriptions.lock().remove(uri);
        }
    }

    /// Remember which session issued a progress token.
    pub fn register_progress_token(&self, token: &str, session_id: &str) {
        self.progress_tokens
            .insert(token.to_string(), session_id.to_string());
    }

    /// The routing task: classify, coalesce, de-duplicate, dispatch.
    async fn route(&self, mut ingest_rx: mpsc::UnboundedReceiver<NotificationEnvelope>) {
        let mut pending: HashSet<NotificationKind> = HashSet::new();
        let mut seen: HashSet<(NotificationKind, String)> = HashSet::new();
        let mut flush_at: Option<tokio::time::Instant> = None;

        loop {
            // Deadline is Copy; capture by value so the arm bodies can
            // reschedule it.
            let window = async move {
                match flush_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                maybe = ingest_rx.recv() => {
                    let Some(envelope) = maybe else { break };

                    // Open a dedup window on the first event of a burst.
                    if flush_at.is_none() {
                        flush_at = Some(tokio::time::Instant::now() + COALESCE_WINDOW);
                    }
                    if !seen.insert(envelope.digest()) {
                        debug!(source = %envelope.source_server, kind = %envelope.kind.as_str(),
                               "Duplicate notification suppressed");
                        continue;
                    }

                    if envelope.kind.is_list_change() {
                        pending.insert(envelope.kind);
                    } else {
                        self.dispatch_targeted(&envelope);
                    }
                }
                () = window => {
                    for kind in pending.drain() {
                        for session in &self.sessions {
                            session.push(Outbound::ListChanged(kind));
                        }
                    }
                    seen.clear();
                    flush_at = None;
                }
                () = self.shutdown.cancelled() => break,
            }
        }
    }

    /// Forward a targeted/log envelope to the right sessions immediately.
    fn dispatch_targeted(&self, envelope: &NotificationEnvelope) {
        match envelope.kind {
            NotificationKind::ResourceUpdated => {
                let Ok(param) = serde_json::from_value::<ResourceUpdatedNotificationParam>(
                    envelope.payload.clone(),
                ) else {
                    warn!(source = %envelope.source_server, "Unparseable resource_updated payload");
                    return;
                };
                for session in &self.sessions {
                    if session.is_subscribed(&param.uri) {
                        session.push(Outbound::ResourceUpdated(param.clone()));
                    }
                }
            }
            NotificationKind::Progress => {
                let Ok(param) =
                    serde_json::from_value::<ProgressNotificationParam>(envelope.payload.clone())
                else {
                    warn!(source = %envelope.source_server, "Unparseable progress payload");
                    return;
                };
                let token = serde_json::to_value(&param.progress_token)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                match self.progress_tokens.get(&token) {
                    Some(owner) => {
                        if let Some(session) = self.sessions.get(owner.value()) {
                            session.push(Outbound::Progress(param));
                        }
                    }
                    // Unknown issuer: targeted notifications are never
                    // dropped, so fall back to every session.
                    None => {
                        for session in &self.sessions {
                            session.push(Outbound::Progress(param.clone()));
                        }
                    }
                }
            }
            NotificationKind::Cancelled => {
                let Ok(param) =
                    serde_json::from_value::<CancelledNotificationParam>(envelope.payload.clone())
                else {
                    warn!(source = %envelope.source_server, "Unparseable cancelled payload");
                    return;
                };
                for session in &self.sessions {
                    session.push(Outbound::Cancelled(param.clone()));
                }
            }
            NotificationKind::Log => {
                if self
                    .log_limiter
                    .check_key(&envelope.source_server)
                    .is_err()
                {
                    debug!(source = %envelope.source_server, "Log notification rate-limited");
                    return;
                }
                let Ok(param) = serde_json::from_value::<LoggingMessageNotificationParam>(
                    envelope.payload.clone(),
                ) else {
                    warn!(source = %envelope.source_server, "Unparseable log payload");
                    return;
                };
                for session in &self.sessions {
                    session.push(Outbound::Log(param.clone()));
                }
            }
            // List-change kinds are handled by the coalescing path.
            _ => {}
        }
    }

    /// Per-session consumer: drains the queue in order and writes to the
    /// peer. A send failure detaches the session.
    async fn session_send_loop(&self, session: Arc<ClientSession>) {
        loop {
            while let Some(item) = session.pop() {
                let sent = match item {
                    Outbound::ListChanged(NotificationKind::ToolsChanged) => {
                        session.peer.notify_tool_list_changed().await
                    }
                    Outbound::ListChanged(NotificationKind::ResourcesChanged) => {
                        session.peer.notify_resource_list_changed().await
                    }
                    Outbound::ListChanged(NotificationKind::PromptsChanged) => {
                        session.peer.notify_prompt_list_changed().await
                    }
                    Outbound::ListChanged(_) => Ok(()),
                    Outbound::ResourceUpdated(param) => {
                        session.peer.notify_resource_updated(param).await
                    }
                    Outbound::Progress(param) => session.peer.notify_progress(param).await,
                    Outbound::Cancelled(param) => session.peer.notify_cancelled(param).await,
                    Outbound::Log(param) => session.peer.notify_logging_message(param).await,
                };

                if let Err(e) = sent {
                    warn!(session = %session.id, error = %e, "Notification send failed, detaching session");
                    self.detach_session(&session.id);
                    return;
                }
            }

            tokio::select! {
                () = session.wake.notified() => {}
                () = session.closed.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kind: NotificationKind, payload: Value) -> NotificationEnvelope {
        NotificationEnvelope::new("backend-a", kind, payload)
    }

    #[test]
    fn digest_distinguishes_kind_and_payload() {
        let a = envelope(NotificationKind::ToolsChanged, serde_json::json!({}));
        let b = envelope(NotificationKind::PromptsChanged, serde_json::json!({}));
        let c = envelope(NotificationKind::ToolsChanged, serde_json::json!({"x": 1}));

        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }

    #[test]
    fn list_change_classification() {
        assert!(NotificationKind::ToolsChanged.is_list_change());
        assert!(NotificationKind::ResourcesChanged.is_list_change());
        assert!(NotificationKind::PromptsChanged.is_list_change());
        assert!(!NotificationKind::ResourceUpdated.is_list_change());
        assert!(!NotificationKind::Progress.is_list_change());
        assert!(!NotificationKind::Log.is_list_change());
        assert!(!NotificationKind::Cancelled.is_list_change());
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(NotificationKind::ToolsChanged).unwrap(),
            serde_json::json!("tools_changed")
        );
        assert_eq!(NotificationKind::ResourceUpdated.as_str(), "resource_updated");
    }

    #[tokio::test]
    async fn coordinator_starts_and_counts_sessions() {
        let shutdown = CancellationToken::new();
        let coordinator = NotificationCoordinator::new(10, shutdown.clone());
        assert_eq!(coordinator.session_count(), 0);

        coordinator.publish(envelope(NotificationKind::ToolsChanged, serde_json::json!({})));
        // No sessions attached; the envelope is coalesced away harmlessly.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(coordinator.session_count(), 0);
        shutdown.cancel();
    }

    #[test]
    fn backpressure_drops_oldest_list_change_first() {
        let mut queue = VecDeque::new();
        for _ in 0..SESSION_QUEUE_LIMIT {
            enqueue_bounded(
                &mut queue,
                Outbound::ListChanged(NotificationKind::ToolsChanged),
                SESSION_QUEUE_LIMIT,
            );
        }

        let dropped = enqueue_bounded(
            &mut queue,
            Outbound::ResourceUpdated(ResourceUpdatedNotificationParam {
                uri: "file:///x".into(),
            }),
            SESSION_QUEUE_LIMIT,
        );

        // Queue stayed at the limit: one list-change was evicted, the
        // targeted entry survived at the back.
        assert!(dropped);
        assert_eq!(queue.len(), SESSION_QUEUE_LIMIT);
        assert!(matches!(
            queue.back(),
            Some(Outbound::ResourceUpdated(_))
        ));
    }

    #[test]
    fn backpressure_never_drops_targeted_entries() {
        let mut queue = VecDeque::new();
        for _ in 0..SESSION_QUEUE_LIMIT {
            enqueue_bounded(
                &mut queue,
                Outbound::ResourceUpdated(ResourceUpdatedNotificationParam {
                    uri: "file:///x".into(),
                }),
                SESSION_QUEUE_LIMIT,
            );
        }

        let dropped = enqueue_bounded(
            &mut queue,
            Outbound::ResourceUpdated(ResourceUpdatedNotificationParam {
                uri: "file:///y".into(),
            }),
            SESSION_QUEUE_LIMIT,
        );

        // Nothing droppable: the queue grows past the threshold instead.
        assert!(!dropped);
        assert_eq!(queue.len(), SESSION_QUEUE_LIMIT + 1);
    }
}
