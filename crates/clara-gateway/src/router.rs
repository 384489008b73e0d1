//! Per-channel request router.
//!
//! Each channel carries a serialization token: at most one request is
//! active per channel, later arrivals queue (mentions and DMs with
//! priority), and non-mention traffic on shared channels is absorbed into
//! a debounce window and coalesced into one consolidated request.
//!
//! Promotion is channel-based: whenever a request becomes active without
//! a caller waiting on it (queue pop, debounce expiry), it is sent down
//! the promotions channel for the server to drive. Within one channel,
//! terminal events are therefore delivered in submission order; across
//! channels, ordering is independent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use clara_engine::{ChannelKind, GatewayRequest};

use crate::registry::ConnId;

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Debounce window for batchable traffic.
    pub debounce: Duration,
    /// Maximum queued requests per channel beyond the active one.
    pub queue_cap: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            queue_cap: 8,
        }
    }
}

/// A request waiting in (or admitted through) the router.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request: GatewayRequest,
    pub conn: ConnId,
    pub node_id: String,
    pub priority: bool,
}

/// Outcome of submitting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The channel was free; the caller drives the request now.
    Acquired,
    /// Queued behind the active request at this position (1-based).
    Queued(usize),
    /// Absorbed into the channel's debounce window.
    Debouncing,
    /// The channel queue is full.
    Rejected,
}

/// Outcome of a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The in-flight task was aborted and the channel released.
    CancelledActive,
    /// Removed from a queue or debounce window before running.
    CancelledQueued,
    /// Unknown or already terminated. Idempotent.
    NotFound,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    platform: String,
    channel_id: String,
    kind: ChannelKind,
}

struct ActiveRequest {
    request_id: String,
    conn: ConnId,
    abort: Option<AbortHandle>,
}

struct DebounceState {
    consolidated: QueuedRequest,
    generation: u64,
}

#[derive(Default)]
struct ChannelState {
    active: Option<ActiveRequest>,
    queue: VecDeque<QueuedRequest>,
    debounce: Option<DebounceState>,
}

impl ChannelState {
    fn is_empty(&self) -> bool {
        self.active.is_none() && self.queue.is_empty() && self.debounce.is_none()
    }

    /// Pop the next waiter: priority entries first, FIFO within a class.
    fn pop_next(&mut self) -> Option<QueuedRequest> {
        if let Some(pos) = self.queue.iter().position(|q| q.priority) {
            return self.queue.remove(pos);
        }
        self.queue.pop_front()
    }
}

#[derive(Default)]
struct RouterInner {
    channels: HashMap<ChannelKey, ChannelState>,
    /// request id → owning channel, for cancel/complete lookups.
    index: HashMap<String, ChannelKey>,
}

struct RouterShared {
    state: Mutex<RouterInner>,
    config: RouterConfig,
    promotions: mpsc::UnboundedSender<QueuedRequest>,
    generation: AtomicU64,
}

/// The per-channel scheduler. Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct ChannelRouter {
    shared: Arc<RouterShared>,
}

impl ChannelRouter {
    /// Create a router. The receiver yields every request that becomes
    /// active (immediate admissions, queue pops, debounce expiries); the
    /// server must drive each one.
    pub fn new(config: RouterConfig) -> (Self, mpsc::UnboundedReceiver<QueuedRequest>) {
        let (promotions, rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(RouterShared {
                    state: Mutex::new(RouterInner::default()),
                    config,
                    promotions,
                    generation: AtomicU64::new(0),
                }),
            },
            rx,
        )
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Submit a request for its channel.
    pub fn submit(&self, request: GatewayRequest, conn: ConnId, node_id: String) -> Admission {
        let key = key_of(&request);
        let is_mention = request.is_mention();
        let is_dm = request.is_dm();
        let batchable =
            !is_mention && matches!(request.channel.kind, ChannelKind::Group | ChannelKind::Server);
        let priority = is_mention || is_dm;

        let mut guard = self.shared.state.lock().expect("router lock poisoned");
        let RouterInner { channels, index } = &mut *guard;
        let state = channels.entry(key.clone()).or_default();

        // Batchable traffic always rides the debounce window so bursts
        // collapse into one consolidated request.
        if batchable {
            let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(debounce) = &mut state.debounce {
                debug!(request_id = %request.id, "coalescing into pending batch");
                debounce.consolidated.request.coalesce(request);
                debounce.generation = generation;
            } else {
                index.insert(request.id.clone(), key.clone());
                state.debounce = Some(DebounceState {
                    consolidated: QueuedRequest {
                        request,
                        conn,
                        node_id,
                        priority: false,
                    },
                    generation,
                });
            }
            self.spawn_debounce_timer(key, generation);
            return Admission::Debouncing;
        }

        if state.active.is_none() {
            state.active = Some(ActiveRequest {
                request_id: request.id.clone(),
                conn,
                abort: None,
            });
            index.insert(request.id.clone(), key);
            // Every activation flows through the promotions channel so the
            // server has exactly one driving path.
            let _ = self.shared.promotions.send(QueuedRequest {
                request,
                conn,
                node_id,
                priority,
            });
            return Admission::Acquired;
        }

        if state.queue.len() >= self.shared.config.queue_cap {
            warn!(request_id = %request.id, "channel queue full, rejecting");
            return Admission::Rejected;
        }

        let id = request.id.clone();
        state.queue.push_back(QueuedRequest {
            request,
            conn,
            node_id,
            priority,
        });
        let position = state.queue.len();
        index.insert(id, key);
        Admission::Queued(position)
    }

    fn spawn_debounce_timer(&self, key: ChannelKey, generation: u64) {
        let router = self.clone();
        let delay = self.shared.config.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            router.fire_debounce(&key, generation);
        });
    }

    /// Debounce expiry: promote the consolidated request if the window was
    /// not extended in the meantime.
    fn fire_debounce(&self, key: &ChannelKey, generation: u64) {
        let mut inner = self.shared.state.lock().expect("router lock poisoned");
        let Some(state) = inner.channels.get_mut(key) else {
            return;
        };
        let current = state
            .debounce
            .as_ref()
            .map(|d| d.generation)
            .unwrap_or_default();
        if current != generation {
            // A later arrival extended the window; its timer will fire.
            return;
        }
        let consolidated = state.debounce.take().expect("generation matched").consolidated;

        if state.active.is_none() {
            state.active = Some(ActiveRequest {
                request_id: consolidated.request.id.clone(),
                conn: consolidated.conn,
                abort: None,
            });
            debug!(request_id = %consolidated.request.id, "debounce expired, promoting");
            let _ = self.shared.promotions.send(consolidated);
        } else {
            debug!(request_id = %consolidated.request.id, "debounce expired, channel busy, queueing");
            state.queue.push_back(consolidated);
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Associate the processing task with the active request so `cancel`
    /// can abort it.
    pub fn register_task(&self, request_id: &str, abort: AbortHandle) {
        let mut inner = self.shared.state.lock().expect("router lock poisoned");
        let Some(key) = inner.index.get(request_id).cloned() else {
            return;
        };
        if let Some(state) = inner.channels.get_mut(&key)
            && let Some(active) = &mut state.active
            && active.request_id == request_id
        {
            active.abort = Some(abort);
        }
    }

    /// Mark the active request terminated and promote the next waiter.
    ///
    /// Idempotent: completing an unknown or already-completed id is a
    /// no-op.
    pub fn complete(&self, request_id: &str) {
        let mut inner = self.shared.state.lock().expect("router lock poisoned");
        let Some(key) = inner.index.remove(request_id) else {
            return;
        };
        let Some(state) = inner.channels.get_mut(&key) else {
            return;
        };
        if state
            .active
            .as_ref()
            .map(|a| a.request_id == request_id)
            .unwrap_or(false)
        {
            state.active = None;
            self.promote_next(state);
        }
        if state.is_empty() {
            inner.channels.remove(&key);
        }
    }

    fn promote_next(&self, state: &mut ChannelState) {
        if let Some(next) = state.pop_next() {
            state.active = Some(ActiveRequest {
                request_id: next.request.id.clone(),
                conn: next.conn,
                abort: None,
            });
            debug!(request_id = %next.request.id, "promoting queued request");
            let _ = self.shared.promotions.send(next);
        }
    }

    /// Cancel a request wherever it is.
    pub fn cancel(&self, request_id: &str) -> CancelOutcome {
        let mut inner = self.shared.state.lock().expect("router lock poisoned");
        let Some(key) = inner.index.remove(request_id) else {
            return CancelOutcome::NotFound;
        };
        let Some(state) = inner.channels.get_mut(&key) else {
            return CancelOutcome::NotFound;
        };

        // Active: abort the task, release the channel, promote the next.
        if state
            .active
            .as_ref()
            .map(|a| a.request_id == request_id)
            .unwrap_or(false)
        {
            if let Some(abort) = state.active.take().and_then(|a| a.abort) {
                abort.abort();
            }
            info!(request_id, "active request cancelled");
            self.promote_next(state);
            if state.is_empty() {
                inner.channels.remove(&key);
            }
            return CancelOutcome::CancelledActive;
        }

        // Queued.
        if let Some(pos) = state.queue.iter().position(|q| q.request.id == request_id) {
            state.queue.remove(pos);
            info!(request_id, "queued request cancelled");
            if state.is_empty() {
                inner.channels.remove(&key);
            }
            return CancelOutcome::CancelledQueued;
        }

        // Debouncing (only the consolidated head id is addressable).
        if state
            .debounce
            .as_ref()
            .map(|d| d.consolidated.request.id == request_id)
            .unwrap_or(false)
        {
            state.debounce = None;
            info!(request_id, "debounced request cancelled");
            if state.is_empty() {
                inner.channels.remove(&key);
            }
            return CancelOutcome::CancelledQueued;
        }

        CancelOutcome::NotFound
    }

    /// Cancel everything bound to a disconnected connection. Returns the
    /// ids of in-flight requests that were aborted.
    pub fn cancel_by_conn(&self, conn: ConnId) -> Vec<String> {
        let mut guard = self.shared.state.lock().expect("router lock poisoned");
        let RouterInner { channels, index } = &mut *guard;
        let promotions = &self.shared.promotions;
        let mut aborted = Vec::new();

        channels.retain(|_key, state| {
            if state.active.as_ref().map(|a| a.conn == conn).unwrap_or(false) {
                let active = state.active.take().expect("checked above");
                if let Some(abort) = active.abort {
                    abort.abort();
                }
                index.remove(&active.request_id);
                aborted.push(active.request_id);

                // The next waiter may belong to another connection.
                if let Some(next) = state.pop_next() {
                    state.active = Some(ActiveRequest {
                        request_id: next.request.id.clone(),
                        conn: next.conn,
                        abort: None,
                    });
                    let _ = promotions.send(next);
                }
            }

            state.queue.retain(|q| {
                if q.conn == conn {
                    index.remove(&q.request.id);
                    false
                } else {
                    true
                }
            });

            if state
                .debounce
                .as_ref()
                .map(|d| d.consolidated.conn == conn)
                .unwrap_or(false)
            {
                let dropped = state.debounce.take().expect("checked above");
                index.remove(&dropped.consolidated.request.id);
            }

            !state.is_empty()
        });

        if !aborted.is_empty() {
            info!(conn, count = aborted.len(), "cancelled in-flight requests for connection");
        }
        aborted
    }

    /// Router statistics: `(active_channels, total_queued)`.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.shared.state.lock().expect("router lock poisoned");
        let active = inner
            .channels
            .values()
            .filter(|s| s.active.is_some())
            .count();
        let queued = inner
            .channels
            .values()
            .map(|s| s.queue.len() + usize::from(s.debounce.is_some()))
            .sum();
        (active, queued)
    }
}

fn key_of(request: &GatewayRequest) -> ChannelKey {
    ChannelKey {
        platform: request.platform().to_owned(),
        channel_id: request.channel.id.clone(),
        kind: request.channel.kind,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, channel_type: &str, content: &str, mention: bool) -> GatewayRequest {
        serde_json::from_value(json!({
            "id": id,
            "user": {"id": "u1", "name": "u1"},
            "channel": {"id": "c1", "type": channel_type},
            "content": content,
            "metadata": {"platform": "discord", "is_mention": mention},
        }))
        .unwrap()
    }

    fn router(debounce_ms: u64) -> (ChannelRouter, mpsc::UnboundedReceiver<QueuedRequest>) {
        ChannelRouter::new(RouterConfig {
            debounce: Duration::from_millis(debounce_ms),
            queue_cap: 3,
        })
    }

    #[tokio::test]
    async fn dm_acquires_free_channel() {
        let (router, _rx) = router(50);
        let admission = router.submit(request("r1", "dm", "hi", false), 1, "n1".into());
        assert_eq!(admission, Admission::Acquired);
    }

    #[tokio::test]
    async fn second_dm_queues_with_position() {
        let (router, _rx) = router(50);
        router.submit(request("r1", "dm", "a", false), 1, "n1".into());
        let admission = router.submit(request("r2", "dm", "b", false), 1, "n1".into());
        assert_eq!(admission, Admission::Queued(1));
    }

    #[tokio::test]
    async fn queue_cap_rejects() {
        let (router, _rx) = router(50);
        router.submit(request("r0", "dm", "x", false), 1, "n1".into());
        for i in 1..=3 {
            router.submit(request(&format!("r{i}"), "dm", "x", false), 1, "n1".into());
        }
        let admission = router.submit(request("r4", "dm", "x", false), 1, "n1".into());
        assert_eq!(admission, Admission::Rejected);
    }

    #[tokio::test]
    async fn burst_coalesces_into_one_promotion() {
        let (router, mut rx) = router(50);

        for (id, content) in [("r1", "a"), ("r2", "b"), ("r3", "c")] {
            let admission = router.submit(request(id, "server", content, false), 1, "n1".into());
            assert_eq!(admission, Admission::Debouncing);
        }

        let promoted = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("debounce should fire")
            .expect("promotion");
        assert_eq!(promoted.request.id, "r1");
        assert_eq!(promoted.request.content, "a\nb\nc");

        // No second promotion pending.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mention_bypasses_debounce() {
        let (router, _rx) = router(500);
        let admission = router.submit(request("r1", "server", "hey clara", true), 1, "n1".into());
        assert_eq!(admission, Admission::Acquired);
    }

    #[tokio::test]
    async fn completion_promotes_priority_first() {
        let (router, mut rx) = router(50);
        router.submit(request("r1", "dm", "a", false), 1, "n1".into());
        assert_eq!(rx.recv().await.unwrap().request.id, "r1");

        // Two waiters on the same channel; both are DMs, so both are
        // priority and FIFO order applies within the class.
        router.submit(request("r2", "dm", "b", false), 1, "n1".into());
        router.submit(request("r3", "dm", "c", true), 1, "n1".into());

        router.complete("r1");
        let promoted = rx.recv().await.unwrap();
        assert_eq!(promoted.request.id, "r2");
    }

    #[tokio::test]
    async fn cancel_queued_removes_it() {
        let (router, mut rx) = router(50);
        router.submit(request("r1", "dm", "a", false), 1, "n1".into());
        assert_eq!(rx.recv().await.unwrap().request.id, "r1");
        router.submit(request("r2", "dm", "b", false), 1, "n1".into());

        assert_eq!(router.cancel("r2"), CancelOutcome::CancelledQueued);
        router.complete("r1");
        // Nothing left to promote.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_active_aborts_and_promotes() {
        let (router, mut rx) = router(50);
        router.submit(request("r1", "dm", "a", false), 1, "n1".into());
        assert_eq!(rx.recv().await.unwrap().request.id, "r1");
        router.submit(request("r2", "dm", "b", false), 1, "n1".into());

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        router.register_task("r1", task.abort_handle());

        assert_eq!(router.cancel("r1"), CancelOutcome::CancelledActive);
        assert!(task.await.unwrap_err().is_cancelled());

        let promoted = rx.recv().await.unwrap();
        assert_eq!(promoted.request.id, "r2");
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (router, _rx) = router(50);
        router.submit(request("r1", "dm", "a", false), 1, "n1".into());
        router.complete("r1");

        assert_eq!(router.cancel("r1"), CancelOutcome::NotFound);
        assert_eq!(router.cancel("r1"), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn debounce_cancel_prevents_promotion() {
        let (router, mut rx) = router(50);
        router.submit(request("r1", "server", "a", false), 1, "n1".into());
        assert_eq!(router.cancel("r1"), CancelOutcome::CancelledQueued);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stats_reflect_state() {
        let (router, _rx) = router(5_000);
        router.submit(request("r1", "dm", "a", false), 1, "n1".into());
        router.submit(request("r2", "dm", "b", false), 1, "n1".into());
        router.submit(request("r3", "server", "c", false), 1, "n1".into());

        let (active, queued) = router.stats();
        assert_eq!(active, 1);
        assert_eq!(queued, 2); // one queued + one debouncing
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let (router, _rx) = router(50);
        router.submit(request("r1", "dm", "a", false), 1, "n1".into());

        let other: GatewayRequest = serde_json::from_value(json!({
            "id": "r2",
            "user": {"id": "u2", "name": "u2"},
            "channel": {"id": "c2", "type": "dm"},
            "content": "b",
            "metadata": {"platform": "discord"},
        }))
        .unwrap();
        assert_eq!(router.submit(other, 2, "n2".into()), Admission::Acquired);
    }
}
