//! Couples one mirror target with its send queue and circuit breaker, and
//! does the actual outbound HTTP work of replaying a request to it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{instrument, warn};

use crate::breaker::{BreakerOpen, CircuitBreaker, MirrorStatusSink};
use crate::queue::SendQueue;
use crate::request::MirrorRequest;

/// Per-attempt timeout for every outbound mirror call.
pub const MIRROR_CLIENT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Alive,
    Retrying,
    Failing,
}

#[derive(Debug, Clone)]
pub struct MirrorStatus {
    pub url: String,
    pub state: MirrorState,
    pub failing_since: Option<Instant>,
    pub queued: usize,
    pub watermark: u64,
}

/// Abstracts the outbound HTTP call a mirror makes, so execution can be
/// tested without a real socket.
#[async_trait]
pub trait OutboundClient: Send + Sync {
    async fn send(&self, request: &MirrorRequest, target_url: &str) -> Result<(), reqwest::Error>;
}

/// Production client: replays method, path+query, headers and body onto
/// `target_url`, then drains and discards the response body so the
/// connection can be reused.
pub struct ReqwestOutboundClient {
    client: reqwest::Client,
}

impl ReqwestOutboundClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(MIRROR_CLIENT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OutboundClient for ReqwestOutboundClient {
    #[instrument(skip(self, request), fields(epoch = request.epoch, target_url))]
    async fn send(&self, request: &MirrorRequest, target_url: &str) -> Result<(), reqwest::Error> {
        let url = format!("{target_url}{}", request.uri);
        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;
        // Drain the body but discard it: lets the connection be reused even
        // though nobody reads this response.
        let _ = response.bytes().await?;
        Ok(())
    }
}

/// Test double recording every call it receives without touching the
/// network; `outcomes` is consumed in order, one `Result` per call.
#[cfg(test)]
pub struct MockOutboundClient {
    pub outcomes: parking_lot::Mutex<std::collections::VecDeque<Result<(), ()>>>,
    pub calls: parking_lot::Mutex<Vec<(u64, String)>>,
    /// Every call's epoch alongside the active-snapshot it carried, so tests
    /// can assert on discovered-parallelism bookkeeping without reaching
    /// into the queue internals.
    pub snapshots: parking_lot::Mutex<Vec<(u64, std::collections::HashSet<u64>)>>,
}

#[cfg(test)]
impl MockOutboundClient {
    pub fn new(outcomes: Vec<Result<(), ()>>) -> Self {
        Self {
            outcomes: parking_lot::Mutex::new(outcomes.into()),
            calls: parking_lot::Mutex::new(Vec::new()),
            snapshots: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl OutboundClient for MockOutboundClient {
    async fn send(&self, request: &MirrorRequest, target_url: &str) -> Result<(), reqwest::Error> {
        self.calls
            .lock()
            .push((request.epoch, target_url.to_string()));
        self.snapshots
            .lock()
            .push((request.epoch, request.active_snapshot.clone()));
        match self.outcomes.lock().pop_front() {
            Some(Ok(())) | None => Ok(()),
            Some(Err(())) => {
                // Synthesize a reqwest::Error cheaply: an http:// URL with
                // no host fails to parse, which is good enough as a
                // breaker-failure signal without touching the network.
                Err(reqwest::Client::new().get("http://").build().unwrap_err())
            }
        }
    }
}

/// One mirror target: its URL, its send queue, and its breaker.
pub struct Mirror {
    pub target_url: String,
    pub persistent: bool,
    queue: SendQueue,
    breaker: CircuitBreaker,
    client: Arc<dyn OutboundClient>,
}

impl Mirror {
    pub fn new(
        target_url: String,
        persistent: bool,
        capacity: usize,
        initial_watermark: u64,
        retry_after: Duration,
        sink: Box<dyn MirrorStatusSink>,
        client: Arc<dyn OutboundClient>,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(target_url.clone(), retry_after, sink),
            queue: SendQueue::with_watermark(capacity, initial_watermark),
            target_url,
            persistent,
            client,
        }
    }

    /// Enqueues `request` and executes every request that becomes eligible,
    /// including this one if nothing blocks it.
    pub async fn reflect(self: &Arc<Self>, request: Arc<MirrorRequest>) {
        self.queue.add(request, &self.target_url);
        self.try_execute_next().await;
    }

    /// Drains every currently-eligible item from the queue and executes it
    /// concurrently, then re-drains once each finishes in case its
    /// completion unblocked something else.
    pub async fn try_execute_next(self: &Arc<Self>) {
        let ready = self.queue.next_execute_items();
        if ready.is_empty() {
            return;
        }
        let mut tasks = Vec::with_capacity(ready.len());
        for request in ready {
            let mirror = self.clone();
            tasks.push(tokio::spawn(async move {
                mirror.execute_one(request).await;
            }));
        }
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "mirror execution task panicked");
            }
        }
        // Executing these may have unblocked later pending items whose
        // predecessor just completed.
        Box::pin(self.try_execute_next()).await;
    }

    async fn execute_one(self: &Arc<Self>, request: Arc<MirrorRequest>) {
        match self.breaker.before_call() {
            Ok(()) => {
                let outcome = self.client.send(&request, &self.target_url).await;
                self.breaker.report(outcome.is_ok());
                if let Err(err) = outcome {
                    warn!(target = %self.target_url, epoch = request.epoch, error = %err, "mirror send failed");
                }
            }
            Err(BreakerOpen(_)) => {
                // Breaker open: silently skip, this is intentional isolation.
            }
        }
        self.queue.execution_completed(&request);
    }

    pub fn status(&self) -> MirrorStatus {
        use crate::breaker::BreakerState;
        let (watermark, queued) = self.queue.status();
        let state = match self.breaker.state() {
            BreakerState::Closed => MirrorState::Alive,
            BreakerState::HalfOpen => MirrorState::Retrying,
            BreakerState::Open => MirrorState::Failing,
        };
        MirrorStatus {
            url: self.target_url.clone(),
            state,
            failing_since: self.breaker.first_failure_time(),
            queued,
            watermark,
        }
    }
}
