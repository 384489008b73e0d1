//! Adapter-facing gateway for Clara.
//!
//! Platform adapters connect over WebSocket, register themselves, and
//! submit user messages; the gateway admits and serializes them per
//! channel and streams response lifecycle events back:
//!
//! - **[`protocol`]** -- The framed JSON wire protocol in both directions.
//! - **[`registry`]** -- Connected-node tracking with resumable reconnect.
//! - **[`router`]** -- Per-channel serialization, debounce coalescing,
//!   queueing, and cancellation.
//! - **[`server`]** -- The WebSocket listener and frame dispatch.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use error::{GatewayError, GatewayResult};
pub use protocol::{AdapterFrame, CoreFrame};
pub use registry::{Node, NodeRegistry};
pub use router::{Admission, CancelOutcome, ChannelRouter, RouterConfig};
pub use server::{GatewayServer, GatewayState};
