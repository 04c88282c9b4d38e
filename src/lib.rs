//! HTTP reverse proxy that forwards each inbound request to a primary
//! upstream and concurrently mirrors it to a dynamically managed set of
//! secondary upstreams whose responses are discarded.
//!
//! The core is three tightly coupled subsystems: the [`reflector`], which
//! owns the live mirror set and fans requests out to it; the per-mirror
//! [`breaker`], which isolates a failing target and optionally evicts it
//! after persistent failure; and the per-mirror [`queue`] together with the
//! [`tracker`], which together replay mirrored requests in an order that
//! preserves the parallelism observed at intake rather than flattening
//! everything into strict sequential replay.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use trafficmirror::mirror::ReqwestOutboundClient;
//! use trafficmirror::reflector::{MirrorSettings, Reflector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Arc::new(ReqwestOutboundClient::new()?);
//!     let settings = MirrorSettings {
//!         max_queued_requests: 500,
//!         persistent_failure_timeout: Duration::from_secs(30 * 60),
//!         retry_after: Duration::from_secs(60),
//!     };
//!     let reflector = Reflector::new(settings, client);
//!     reflector.add_mirrors(&["http://localhost:9001".to_string()], true);
//!     tokio::spawn(reflector.clone().run());
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod mirror;
pub mod proxy;
pub mod queue;
pub mod reflector;
pub mod request;
pub mod tracker;

pub use breaker::{BreakerState, CircuitBreaker, MirrorStatusSink};
pub use config::{Cli, Credentials, ProxyConfig};
pub use error::{MirrorError, Result};
pub use mirror::{Mirror, MirrorStatus};
pub use proxy::AppState;
pub use queue::SendQueue;
pub use reflector::{MirrorSettings, Reflector};
pub use request::MirrorRequest;
pub use tracker::{Epoch, RequestTracker};
