//! Notification coordinator integration tests over an in-memory MCP pair:
//! coalescing, de-duplication, and per-session fan-out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use magg::coordinator::{NotificationCoordinator, NotificationEnvelope, NotificationKind};
use rmcp::handler::server::ServerHandler;
use rmcp::model::{ClientInfo, ServerInfo};
use rmcp::service::{NotificationContext, RoleClient};
use rmcp::{ClientHandler, ServiceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Counts list-change notifications arriving at the client side.
#[derive(Clone, Default)]
struct CountingClient {
    tools_changed: Arc<AtomicUsize>,
    prompts_changed: Arc<AtomicUsize>,
}

impl ClientHandler for CountingClient {
    fn get_info(&self) -> ClientInfo {
        ClientInfo::default()
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.tools_changed.fetch_add(1, Ordering::SeqCst);
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.prompts_changed.fetch_add(1, Ordering::SeqCst);
        std::future::ready(())
    }
}

/// Minimal server: default handlers are enough for the handshake.
#[derive(Clone)]
struct EchoServer;

impl ServerHandler for EchoServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::default()
    }
}

/// Wire a server and a counting client over an in-memory duplex, returning
/// the server-side peer (what the coordinator writes to) plus the counters.
async fn connected_pair() -> (
    rmcp::service::RunningService<rmcp::RoleServer, EchoServer>,
    rmcp::service::RunningService<RoleClient, CountingClient>,
    CountingClient,
) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let (client_read, client_write) = tokio::io::split(client_io);

    let server = tokio::spawn(async move { EchoServer.serve((server_read, server_write)).await });

    let counting = CountingClient::default();
    let client = counting
        .clone()
        .serve((client_read, client_write))
        .await
        .expect("client handshake");

    let server = server.await.expect("join").expect("server handshake");
    (server, client, counting)
}

#[tokio::test]
async fn burst_of_list_changes_coalesces_to_one_per_kind_per_window() {
    let shutdown = CancellationToken::new();
    let coordinator = NotificationCoordinator::new(50, shutdown.clone());

    let (server, _client, counting) = connected_pair().await;
    coordinator.attach_session(server.peer().clone());

    // A storm: five backends all report tools changed, two report prompts.
    for backend in ["a", "b", "c", "d", "e"] {
        coordinator.publish(NotificationEnvelope::new(
            backend,
            NotificationKind::ToolsChanged,
            json!(null),
        ));
    }
    for backend in ["a", "b"] {
        coordinator.publish(NotificationEnvelope::new(
            backend,
            NotificationKind::PromptsChanged,
            json!(null),
        ));
    }

    // Well past the 50 ms window plus delivery.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(counting.tools_changed.load(Ordering::SeqCst), 1);
    assert_eq!(counting.prompts_changed.load(Ordering::SeqCst), 1);

    // A second burst in a fresh window yields exactly one more.
    coordinator.publish(NotificationEnvelope::new(
        "a",
        NotificationKind::ToolsChanged,
        json!(null),
    ));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(counting.tools_changed.load(Ordering::SeqCst), 2);

    shutdown.cancel();
}

#[tokio::test]
async fn detached_sessions_receive_nothing_further() {
    let shutdown = CancellationToken::new();
    let coordinator = NotificationCoordinator::new(50, shutdown.clone());

    let (server, _client, counting) = connected_pair().await;
    let session = coordinator.attach_session(server.peer().clone());
    assert_eq!(coordinator.session_count(), 1);

    coordinator.detach_session(&session.id);
    assert_eq!(coordinator.session_count(), 0);

    coordinator.publish(NotificationEnvelope::new(
        "a",
        NotificationKind::ToolsChanged,
        json!(null),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(counting.tools_changed.load(Ordering::SeqCst), 0);
    shutdown.cancel();
}
