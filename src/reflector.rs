//! Owns the live set of mirrors and fans inbound requests out to all of
//! them. Runs as a single background task so mirror-set mutation (add,
//! remove, eviction) never races a fan-out in progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::breaker::{AutoRemovingSink, MirrorStatusSink, PersistentSink};
use crate::mirror::{Mirror, MirrorStatus, OutboundClient};
use crate::queue::SendQueue;
use crate::request::MirrorRequest;

/// Settings shared by every mirror the reflector creates.
#[derive(Clone)]
pub struct MirrorSettings {
    pub max_queued_requests: usize,
    pub persistent_failure_timeout: Duration,
    pub retry_after: Duration,
}

enum Command {
    Reflect(Arc<MirrorRequest>),
    MirrorFailed(String),
}

/// Handle used by the proxy front-end to push work into the reflector's
/// event loop and to inspect/mutate the mirror set.
pub struct Reflector {
    mirrors: RwLock<HashMap<String, Arc<Mirror>>>,
    /// Mirrors every request ever seen, auto-draining on each add so its
    /// watermark always reflects "epochs seen so far"; used to seed a
    /// newly-joining mirror's queue so it never waits on epochs it will
    /// never receive.
    template_queue: SendQueue,
    settings: MirrorSettings,
    client: Arc<dyn OutboundClient>,
    tx: mpsc::Sender<Command>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<Command>>>,
}

impl Reflector {
    pub fn new(settings: MirrorSettings, client: Arc<dyn OutboundClient>) -> Arc<Self> {
        // Buffer of 1 is the closest a Rust mpsc channel (which requires a
        // capacity of at least one slot) gets to the original's unbuffered
        // `IncomingCh`: once that one slot is occupied, `submit` blocks until
        // the reflector loop drains it, reproducing the spec's inbound
        // channel send as a genuine backpressure point.
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            mirrors: RwLock::new(HashMap::new()),
            template_queue: SendQueue::new(settings.max_queued_requests),
            settings,
            client,
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
        })
    }

    /// Runs the reflector's event loop until the sender side is dropped.
    /// Spawn this once at startup; it never returns while any handle to
    /// `self` is alive.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("reflector::run called more than once");
        info!("reflector started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Reflect(request) => {
                    self.update_template_queue(&request);
                    self.send_to_mirrors(request).await;
                }
                Command::MirrorFailed(url) => {
                    warn!(url, "mirror has persistent failures, evicting");
                    self.remove_mirrors(std::slice::from_ref(&url));
                }
            }
        }
    }

    /// Enqueues `request` for fan-out. Blocks the caller when the reflector's
    /// loop is falling behind, the same backpressure the spec's unbuffered
    /// inbound channel applies to the front-end handler; delivery into the
    /// reflector's loop is the only synchronization point.
    pub async fn submit(&self, request: Arc<MirrorRequest>) {
        let _ = self.tx.send(Command::Reflect(request)).await;
    }

    fn update_template_queue(&self, request: &Arc<MirrorRequest>) {
        self.template_queue.add(request.clone(), "template");
        loop {
            let completed = self.template_queue.next_execute_items();
            if completed.is_empty() {
                break;
            }
            for request in completed {
                self.template_queue.execution_completed(&request);
            }
        }
    }

    async fn send_to_mirrors(&self, request: Arc<MirrorRequest>) {
        let mirrors: Vec<Arc<Mirror>> = self.mirrors.read().values().cloned().collect();
        for mirror in mirrors {
            let request = request.clone();
            tokio::spawn(async move {
                mirror.reflect(request).await;
            });
        }
    }

    /// Adds `urls` as new mirrors. `persistent` mirrors are never evicted
    /// for persistent failure; others are removed automatically once their
    /// breaker reports `persistentFailureTimeout` of continuous failure.
    pub fn add_mirrors(self: &Arc<Self>, urls: &[String], persistent: bool) {
        info!(?urls, persistent, "adding mirrors");
        let initial_watermark = self.template_queue.status().0;
        let mut mirrors = self.mirrors.write();
        for url in urls {
            let sink: Box<dyn MirrorStatusSink> = if persistent {
                Box::new(PersistentSink)
            } else {
                let reflector = self.clone();
                Box::new(AutoRemovingSink::new(
                    self.settings.persistent_failure_timeout,
                    move |target| {
                        // Fired synchronously from inside the breaker's lock,
                        // so this can't await; a full channel just drops the
                        // eviction notice rather than blocking the breaker.
                        let _ = reflector.tx.try_send(Command::MirrorFailed(target.to_string()));
                    },
                ))
            };
            let mirror = Arc::new(Mirror::new(
                url.clone(),
                persistent,
                self.settings.max_queued_requests,
                initial_watermark,
                self.settings.retry_after,
                sink,
                self.client.clone(),
            ));
            mirrors.insert(url.clone(), mirror);
        }
    }

    pub fn remove_mirrors(&self, urls: &[String]) {
        info!(?urls, "removing mirrors");
        let mut mirrors = self.mirrors.write();
        for url in urls {
            mirrors.remove(url);
        }
    }

    pub fn list_mirrors(&self) -> Vec<MirrorStatus> {
        self.mirrors.read().values().map(|m| m.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MockOutboundClient;
    use crate::tracker::RequestTracker;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn settings() -> MirrorSettings {
        MirrorSettings {
            max_queued_requests: 100,
            persistent_failure_timeout: Duration::from_secs(1800),
            retry_after: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_mirror() {
        let client = Arc::new(MockOutboundClient::new(vec![Ok(()), Ok(())]));
        let reflector = Reflector::new(settings(), client.clone());
        reflector.add_mirrors(&["http://a".to_string(), "http://b".to_string()], true);

        let tracker = RequestTracker::new();
        let (epoch, snapshot) = tracker.new_request();
        let request = Arc::new(MirrorRequest::new(
            Method::GET,
            "/x".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            epoch,
            snapshot,
        ));

        let handle = tokio::spawn(reflector.clone().run());
        reflector.submit(request).await;

        // Give the background loop a moment to fan out and execute.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let calls = client.calls.lock();
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn newly_added_mirror_starts_at_current_watermark() {
        let client = Arc::new(MockOutboundClient::new(vec![]));
        let reflector = Reflector::new(settings(), client);

        let tracker = RequestTracker::new();
        for _ in 0..3 {
            let (epoch, snapshot) = tracker.new_request();
            let request = Arc::new(MirrorRequest::new(
                Method::GET,
                "/x".to_string(),
                HeaderMap::new(),
                Bytes::new(),
                epoch,
                snapshot,
            ));
            reflector.update_template_queue(&request);
        }

        reflector.add_mirrors(&["http://late".to_string()], false);
        let statuses = reflector.list_mirrors();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].watermark, 3);
    }

    async fn drive_to_eviction_threshold(reflector: &Arc<Reflector>, tracker: &RequestTracker) {
        // 5 consecutive failures trip Closed -> Open and stamp first_failure_time.
        for _ in 0..5 {
            let (epoch, snapshot) = tracker.new_request();
            let request = Arc::new(MirrorRequest::new(
                Method::GET,
                "/x".to_string(),
                HeaderMap::new(),
                Bytes::new(),
                epoch,
                snapshot,
            ));
            reflector.submit(request).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Let first_failure_time age past both retry_after and the
        // persistent-failure timeout (both 5ms in `fast_eviction_settings`).
        tokio::time::sleep(Duration::from_millis(30)).await;

        // One more failure: Open -> HalfOpen (retry_after elapsed) -> Open
        // again, this time old enough to cross the persistent timeout.
        let (epoch, snapshot) = tracker.new_request();
        let request = Arc::new(MirrorRequest::new(
            Method::GET,
            "/x".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            epoch,
            snapshot,
        ));
        reflector.submit(request).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn fast_eviction_settings() -> MirrorSettings {
        MirrorSettings {
            max_queued_requests: 100,
            persistent_failure_timeout: Duration::from_millis(5),
            retry_after: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn non_persistent_mirror_evicted_after_persistent_failure() {
        let client = Arc::new(MockOutboundClient::new(vec![Err(()); 10]));
        let reflector = Reflector::new(fast_eviction_settings(), client);
        reflector.add_mirrors(&["http://always-fails".to_string()], false);
        let handle = tokio::spawn(reflector.clone().run());

        let tracker = RequestTracker::new();
        drive_to_eviction_threshold(&reflector, &tracker).await;
        handle.abort();

        assert!(reflector.list_mirrors().is_empty());
    }

    #[tokio::test]
    async fn persistent_mirror_survives_the_same_failure_pattern() {
        let client = Arc::new(MockOutboundClient::new(vec![Err(()); 10]));
        let reflector = Reflector::new(fast_eviction_settings(), client);
        reflector.add_mirrors(&["http://always-fails".to_string()], true);
        let handle = tokio::spawn(reflector.clone().run());

        let tracker = RequestTracker::new();
        drive_to_eviction_threshold(&reflector, &tracker).await;
        handle.abort();

        assert_eq!(reflector.list_mirrors().len(), 1);
    }
}
