//! WebSocket listener and frame dispatch.
//!
//! Adapters connect to `/ws` and exchange framed JSON. Each connection
//! gets a writer task fed by an unbounded outbound channel (stored in the
//! node registry so any component can push frames to a node), while the
//! read loop dispatches inbound frames. A reaper task drops connections
//! that stop pinging.
//!
//! Request driving is single-path: every activation (immediate admission,
//! queue pop, debounce expiry) arrives on the router's promotions channel
//! and is spawned from there, with its abort handle registered for
//! cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use clara_engine::{GatewayRequest, NodeView, Processor, ProcessorEvent};
use clara_tools::plugin::{PluginManager, parse_install_source};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{AdapterFrame, CoreFrame, codes, parse_adapter_frame};
use crate::registry::{ConnId, NodeRegistry};
use crate::router::{Admission, CancelOutcome, ChannelRouter, QueuedRequest, RouterConfig};

/// Connections silent past this many seconds are reaped.
const READ_TIMEOUT_SECS: i64 = 90;

/// How often the reaper scans for silent connections.
const REAPER_INTERVAL_SECS: u64 = 30;

/// Shared state behind every connection handler.
pub struct GatewayState {
    pub registry: NodeRegistry,
    pub router: ChannelRouter,
    pub processor: Arc<Processor>,
    pub plugins: Arc<PluginManager>,
    started_at: Instant,
    next_conn: AtomicU64,
}

/// The gateway server: owns the shared state and the driving tasks.
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Wire up the server. Spawns the promotions driver and the
    /// keepalive reaper onto the current runtime.
    pub fn new(
        processor: Arc<Processor>,
        plugins: Arc<PluginManager>,
        router_config: RouterConfig,
    ) -> Self {
        let (router, mut promotions) = ChannelRouter::new(router_config);
        let state = Arc::new(GatewayState {
            registry: NodeRegistry::new(),
            router,
            processor,
            plugins,
            started_at: Instant::now(),
            next_conn: AtomicU64::new(1),
        });

        // Promotions driver: one spawned task per activated request.
        let driver_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(promoted) = promotions.recv().await {
                spawn_request(Arc::clone(&driver_state), promoted);
            }
        });

        // Keepalive reaper.
        let reaper_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(REAPER_INTERVAL_SECS));
            loop {
                interval.tick().await;
                for conn in reaper_state
                    .registry
                    .stale_connections(chrono::Duration::seconds(READ_TIMEOUT_SECS))
                {
                    warn!(conn, "reaping silent connection");
                    reaper_state.router.cancel_by_conn(conn);
                    reaper_state.registry.unregister(conn);
                }
            }
        });

        Self { state }
    }

    /// The shared state (for tests and the binary's shutdown path).
    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    /// Build the axum application.
    pub fn app(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthz", get(healthz))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve on the given listener until the task is aborted.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> GatewayResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Transport {
                reason: e.to_string(),
            })?;
        info!(%addr, "gateway listening");
        axum::serve(listener, self.app())
            .await
            .map_err(|e| GatewayError::Transport {
                reason: e.to_string(),
            })
    }
}

async fn healthz(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let (active, queued) = state.router.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "nodes": state.registry.connected_count(),
        "active_requests": active,
        "queue_length": queued,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Process a single WebSocket connection until it closes.
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<CoreFrame>();

    // Writer task: serializes outbound frames onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    info!(conn, "adapter connected");

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        handle_frame(&state, conn, &tx, &text).await;
    }

    // Disconnect cancels all in-flight requests bound to this handle.
    state.router.cancel_by_conn(conn);
    state.registry.unregister(conn);
    drop(tx);
    let _ = writer.await;
    info!(conn, "adapter disconnected");
}

/// Decode and dispatch one inbound frame.
async fn handle_frame(
    state: &Arc<GatewayState>,
    conn: ConnId,
    tx: &mpsc::UnboundedSender<CoreFrame>,
    text: &str,
) {
    let frame = match parse_adapter_frame(text) {
        Ok(frame) => frame,
        Err((code, message)) => {
            warn!(conn, code, "unparseable frame");
            let _ = tx.send(CoreFrame::error(None, code, message, true));
            return;
        }
    };

    match frame {
        AdapterFrame::Register {
            node_id,
            platform,
            capabilities,
            metadata,
        } => {
            let (session_id, is_reconnect) = state.registry.register(
                conn,
                tx.clone(),
                &node_id,
                &platform,
                capabilities,
                metadata,
            );
            let action = if is_reconnect { "reconnected" } else { "registered" };
            info!(node_id = %node_id, platform = %platform, "node {}", action);
            let _ = tx.send(CoreFrame::Registered {
                node_id,
                session_id,
            });
        }

        AdapterFrame::Ping => {
            state.registry.update_ping(conn);
            let _ = tx.send(CoreFrame::Pong);
        }

        AdapterFrame::Message(request) => {
            handle_message(state, conn, tx, request);
        }

        AdapterFrame::Cancel { request_id } => {
            match state.router.cancel(&request_id) {
                CancelOutcome::CancelledActive | CancelOutcome::CancelledQueued => {
                    let _ = tx.send(CoreFrame::Cancelled { request_id });
                }
                CancelOutcome::NotFound => {
                    let _ = tx.send(CoreFrame::error(
                        Some(request_id),
                        codes::NOT_FOUND,
                        "Request not found or already completed",
                        true,
                    ));
                }
            }
        }

        AdapterFrame::Status => {
            let (active, queued) = state.router.stats();
            let _ = tx.send(CoreFrame::Status {
                active_requests: active,
                queue_length: queued,
                uptime_seconds: Some(state.started_at.elapsed().as_secs()),
            });
        }

        AdapterFrame::McpList { request_id } => {
            let servers = state.plugins.statuses().await;
            let _ = tx.send(CoreFrame::McpListResponse {
                request_id,
                success: true,
                servers,
                error: None,
            });
        }

        AdapterFrame::McpInstall {
            request_id,
            source,
            name,
            requested_by,
            env,
        } => {
            let frame = match parse_install_source(&source, name.as_deref()) {
                Ok(mut config) => {
                    config.env = env;
                    config.installed_by = requested_by;
                    let server_name = config.name.clone();
                    match state.plugins.install(config).await {
                        Ok(tool_count) => CoreFrame::McpInstallResponse {
                            request_id,
                            success: true,
                            server_name: Some(server_name),
                            tools_discovered: Some(tool_count),
                            error: None,
                        },
                        Err(e) => CoreFrame::McpInstallResponse {
                            request_id,
                            success: false,
                            server_name: Some(server_name),
                            tools_discovered: None,
                            error: Some(e.to_string()),
                        },
                    }
                }
                Err(e) => CoreFrame::McpInstallResponse {
                    request_id,
                    success: false,
                    server_name: None,
                    tools_discovered: None,
                    error: Some(e.to_string()),
                },
            };
            let _ = tx.send(frame);
        }

        AdapterFrame::McpUninstall {
            request_id,
            server_name,
        } => {
            let frame = match state.plugins.uninstall(&server_name).await {
                Ok(true) => CoreFrame::McpUninstallResponse {
                    request_id,
                    success: true,
                    error: None,
                },
                Ok(false) => CoreFrame::McpUninstallResponse {
                    request_id,
                    success: false,
                    error: Some(format!("server '{server_name}' is not installed")),
                },
                Err(e) => CoreFrame::McpUninstallResponse {
                    request_id,
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            let _ = tx.send(frame);
        }

        AdapterFrame::McpStatus {
            request_id,
            server_name,
        } => {
            let statuses = state.plugins.statuses().await;
            let total_servers = statuses.len();
            let connected_servers = statuses.iter().filter(|s| s.connected).count();
            let enabled_servers = statuses.iter().filter(|s| s.enabled).count();

            let frame = match server_name {
                Some(name) => match state.plugins.status_of(&name).await {
                    Some(server) => CoreFrame::McpStatusResponse {
                        request_id,
                        success: true,
                        server: Some(server),
                        total_servers,
                        connected_servers,
                        enabled_servers,
                        error: None,
                    },
                    None => CoreFrame::McpStatusResponse {
                        request_id,
                        success: false,
                        server: None,
                        total_servers,
                        connected_servers,
                        enabled_servers,
                        error: Some(format!("server '{name}' not found")),
                    },
                },
                None => CoreFrame::McpStatusResponse {
                    request_id,
                    success: true,
                    server: None,
                    total_servers,
                    connected_servers,
                    enabled_servers,
                    error: None,
                },
            };
            let _ = tx.send(frame);
        }

        AdapterFrame::McpRestart {
            request_id,
            server_name,
        } => {
            let frame = match state.plugins.restart(&server_name).await {
                Ok(_) => CoreFrame::McpRestartResponse {
                    request_id,
                    success: true,
                    error: None,
                },
                Err(e) => CoreFrame::McpRestartResponse {
                    request_id,
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            let _ = tx.send(frame);
        }

        AdapterFrame::McpEnable {
            request_id,
            server_name,
            enabled,
        } => {
            let frame = match state.plugins.set_enabled(&server_name, enabled).await {
                Ok(()) => CoreFrame::McpEnableResponse {
                    request_id,
                    success: true,
                    enabled,
                    error: None,
                },
                Err(e) => CoreFrame::McpEnableResponse {
                    request_id,
                    success: false,
                    enabled: !enabled,
                    error: Some(e.to_string()),
                },
            };
            let _ = tx.send(frame);
        }
    }
}

/// Admit a user message into the router.
fn handle_message(
    state: &Arc<GatewayState>,
    conn: ConnId,
    tx: &mpsc::UnboundedSender<CoreFrame>,
    mut request: GatewayRequest,
) {
    let Some(node) = state.registry.get_by_connection(conn) else {
        let _ = tx.send(CoreFrame::error(
            Some(request.id),
            codes::NOT_REGISTERED,
            "Node not registered",
            true,
        ));
        return;
    };

    if request.content.trim().is_empty() && request.attachments.is_empty() {
        let _ = tx.send(CoreFrame::error(
            Some(request.id),
            codes::INVALID_MESSAGE,
            "empty message with no attachments",
            true,
        ));
        return;
    }

    // The router keys channels by platform; fill it in from the node when
    // the adapter did not.
    if !request.metadata.contains_key("platform") {
        request
            .metadata
            .insert("platform".to_owned(), node.platform.clone().into());
    }

    let request_id = request.id.clone();
    match state.router.submit(request, conn, node.node_id) {
        // The promotions driver picks these up.
        Admission::Acquired | Admission::Debouncing => {}
        Admission::Queued(position) => {
            debug!(request_id = %request_id, position, "request queued");
            let _ = tx.send(CoreFrame::Status {
                active_requests: 1,
                queue_length: position,
                uptime_seconds: None,
            });
        }
        Admission::Rejected => {
            let _ = tx.send(CoreFrame::error(
                Some(request_id),
                codes::QUEUE_FULL,
                "channel queue is full, try again later",
                true,
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Request driving
// ---------------------------------------------------------------------------

/// Spawn the processing task for an activated request and register its
/// abort handle for cancellation.
fn spawn_request(state: Arc<GatewayState>, queued: QueuedRequest) {
    let request_id = queued.request.id.clone();
    let router = state.router.clone();
    let handle = tokio::spawn(drive_request(state, queued));
    router.register_task(&request_id, handle.abort_handle());
}

/// Run one request to its terminal event and release the channel.
async fn drive_request(state: Arc<GatewayState>, queued: QueuedRequest) {
    let request_id = queued.request.id.clone();

    let sender = state
        .registry
        .get(&queued.node_id)
        .and_then(|node| node.sender.clone());
    let Some(sender) = sender else {
        debug!(request_id = %request_id, "node vanished before processing");
        state.router.complete(&request_id);
        return;
    };
    let node = state.registry.get(&queued.node_id).expect("sender implies node");
    let node_view = NodeView {
        platform: node.platform.clone(),
        capabilities: node.capabilities.clone(),
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_events(events_rx, sender.clone()));

    let result = state
        .processor
        .process(&queued.request, &node_view, &events_tx)
        .await;
    drop(events_tx);
    let _ = forwarder.await;

    if let Err(e) = result {
        error!(request_id = %request_id, error = %e, "request processing failed");
        let _ = sender.send(CoreFrame::error(
            Some(request_id.clone()),
            codes::PROCESSING_ERROR,
            e.to_string(),
            true,
        ));
    }

    state.router.complete(&request_id);
}

/// Map engine lifecycle events onto wire frames.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<ProcessorEvent>,
    sender: mpsc::UnboundedSender<CoreFrame>,
) {
    while let Some(event) = events.recv().await {
        if sender.send(frame_of(event)).is_err() {
            break;
        }
    }
}

fn frame_of(event: ProcessorEvent) -> CoreFrame {
    match event {
        ProcessorEvent::Start {
            response_id,
            request_id,
            tier,
        } => CoreFrame::ResponseStart {
            id: response_id,
            request_id,
            model_tier: tier,
        },
        ProcessorEvent::Chunk {
            response_id,
            request_id,
            chunk,
            accumulated,
        } => CoreFrame::ResponseChunk {
            id: response_id,
            request_id,
            chunk,
            accumulated,
        },
        ProcessorEvent::ToolStart {
            response_id,
            request_id,
            tool_name,
            step,
        } => {
            let emoji = Some(tool_emoji(&tool_name).to_owned());
            CoreFrame::ToolStart {
                id: response_id,
                request_id,
                tool_name,
                step,
                emoji,
            }
        }
        ProcessorEvent::ToolResult {
            response_id,
            request_id,
            tool_name,
            success,
            output_preview,
        } => CoreFrame::ToolResult {
            id: response_id,
            request_id,
            tool_name,
            success,
            output_preview,
        },
        ProcessorEvent::End {
            response_id,
            request_id,
            full_text,
            files,
            file_data,
            tool_count,
        } => CoreFrame::ResponseEnd {
            id: response_id,
            request_id,
            full_text,
            files,
            file_data,
            tool_count,
        },
    }
}

/// Adapter-facing emoji hint for a tool.
fn tool_emoji(tool_name: &str) -> &'static str {
    match tool_name {
        "execute_python" => "🐍",
        "install_package" => "📦",
        "read_file" | "read_local_file" => "📖",
        "write_file" | "save_to_local" => "💾",
        "list_files" | "list_local_files" => "📁",
        "run_shell" => "💻",
        "web_search" => "🔍",
        "delete_local_file" => "🗑️",
        "send_local_file" => "📤",
        "send_file" => "📎",
        "add_reaction" => "✅",
        "send_embed" => "🎨",
        "create_thread" => "🧵",
        "edit_message" => "✏️",
        "send_buttons" => "🔘",
        _ => "⚙️",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_mapping_keeps_ids() {
        let frame = frame_of(ProcessorEvent::Start {
            response_id: "resp-1".into(),
            request_id: "r1".into(),
            tier: None,
        });
        match frame {
            CoreFrame::ResponseStart { id, request_id, .. } => {
                assert_eq!(id, "resp-1");
                assert_eq!(request_id, "r1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn tool_start_carries_emoji() {
        let frame = frame_of(ProcessorEvent::ToolStart {
            response_id: "resp-1".into(),
            request_id: "r1".into(),
            tool_name: "execute_python".into(),
            step: 1,
        });
        match frame {
            CoreFrame::ToolStart { emoji, .. } => assert_eq!(emoji.as_deref(), Some("🐍")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_tools_get_default_emoji() {
        assert_eq!(tool_emoji("github__list_issues"), "⚙️");
    }
}
