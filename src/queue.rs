//! Per-mirror ordering buffer. A [`SendQueue`] holds requests that have been
//! fanned out to one target but not yet released for execution, and decides
//! when a pending request may run based on what else it was observed running
//! alongside at intake time.
//!
//! The queue never blocks a request on an epoch it has never heard of: if a
//! snapshot names an epoch this queue has no record of (never added, or
//! added to a different mirror before this one joined), that epoch is
//! treated as already resolved. The one epoch every request implicitly cares
//! about, even with an empty snapshot, is its own immediate predecessor
//! (`epoch - 1`): a request that observed no active predecessors still waits
//! for that predecessor to *finish*, not merely start, which is what keeps a
//! plain sequential stream strictly ordered.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::request::MirrorRequest;
use crate::tracker::Epoch;
use std::sync::Arc;

struct State {
    /// Ascending by epoch.
    pending: VecDeque<Arc<MirrorRequest>>,
    in_flight: HashSet<Epoch>,
    /// Epochs above `watermark` known complete, not yet contiguous with it.
    completed_above: HashSet<Epoch>,
    /// Every epoch `<= watermark` is complete.
    watermark: Epoch,
}

impl State {
    fn exists(&self, epoch: Epoch) -> bool {
        epoch <= self.watermark
            || self.completed_above.contains(&epoch)
            || self.in_flight.contains(&epoch)
            || self.pending.iter().any(|r| r.epoch == epoch)
    }

    fn is_complete(&self, epoch: Epoch) -> bool {
        epoch <= self.watermark || self.completed_above.contains(&epoch)
    }

    fn is_started(&self, epoch: Epoch) -> bool {
        self.is_complete(epoch) || self.in_flight.contains(&epoch)
    }

    /// Whether the pending request at epoch `e` with snapshot `snapshot` may
    /// be released given the queue's current state.
    fn eligible(&self, epoch: Epoch, snapshot: &HashSet<Epoch>) -> bool {
        if epoch > 1 {
            let prev = epoch - 1;
            if self.exists(prev) {
                let resolved = if snapshot.contains(&prev) {
                    self.is_started(prev)
                } else {
                    self.is_complete(prev)
                };
                if !resolved {
                    return false;
                }
            }
        }

        for &e in snapshot {
            if e == 0 || e >= epoch {
                continue;
            }
            if epoch > 1 && e == epoch - 1 {
                continue; // already checked above
            }
            if self.exists(e) && !self.is_started(e) {
                return false;
            }
        }

        true
    }

    /// Marks `epoch` resolved (complete), folding it into the watermark if
    /// it is contiguous, otherwise parking it in `completed_above` until the
    /// gap behind it closes.
    fn mark_complete(&mut self, epoch: Epoch) {
        if epoch <= self.watermark {
            return;
        }
        if epoch == self.watermark + 1 {
            self.watermark = epoch;
            while self.completed_above.remove(&(self.watermark + 1)) {
                self.watermark += 1;
            }
        } else {
            self.completed_above.insert(epoch);
        }
    }

    /// Total span of epochs this queue is currently tracking: pending work
    /// plus everything already accounted for as in-flight or complete-above
    /// the watermark.
    fn tracked_span(&self) -> usize {
        self.pending.len() + self.in_flight.len() + self.completed_above.len()
    }
}

/// Orders release of mirrored requests for a single target so that
/// concurrency observed at the proxy front door (two requests the tracker
/// saw running at once) is preserved, while sequential requests are
/// replayed sequentially.
pub struct SendQueue {
    capacity: usize,
    state: Mutex<State>,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_watermark(capacity, 0)
    }

    /// Builds a queue whose watermark starts at `watermark` instead of zero.
    /// Used when a mirror joins after other mirrors have already processed
    /// epochs 1..=watermark: those epochs will never arrive on this queue,
    /// but they must not be mistaken for ones still to come.
    pub fn with_watermark(capacity: usize, watermark: Epoch) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                pending: VecDeque::new(),
                in_flight: HashSet::new(),
                completed_above: HashSet::new(),
                watermark,
            }),
        }
    }

    /// Queues `request` for this target. If the queue is already at
    /// capacity, `request` is shed immediately (recorded as resolved without
    /// ever being released) rather than displacing older pending work.
    pub fn add(&self, request: Arc<MirrorRequest>, tag: &str) {
        let mut state = self.state.lock();
        if state.tracked_span() >= self.capacity {
            trace!(epoch = request.epoch, tag, "send queue at capacity, shedding");
            state.mark_complete(request.epoch);
            return;
        }
        let pos = state
            .pending
            .iter()
            .position(|r| r.epoch > request.epoch)
            .unwrap_or(state.pending.len());
        state.pending.insert(pos, request);
    }

    /// Returns every pending request that has just become eligible, marking
    /// each one in-flight. May release more than one request per call when
    /// later ones were observed running alongside earlier ones now starting.
    pub fn next_execute_items(&self) -> Vec<Arc<MirrorRequest>> {
        let mut state = self.state.lock();
        let mut released = Vec::new();
        let mut i = 0;
        while i < state.pending.len() {
            let (epoch, eligible) = {
                let req = &state.pending[i];
                (req.epoch, state.eligible(req.epoch, &req.active_snapshot))
            };
            if eligible {
                let req = state.pending.remove(i).expect("index in bounds");
                state.in_flight.insert(epoch);
                released.push(req);
            } else {
                i += 1;
            }
        }
        released
    }

    /// Marks a previously-released request's execution as finished,
    /// advancing the watermark if it closes a contiguous run.
    pub fn execution_completed(&self, request: &MirrorRequest) {
        let mut state = self.state.lock();
        state.in_flight.remove(&request.epoch);
        state.mark_complete(request.epoch);
    }

    /// Current watermark and count of still-pending requests, for status
    /// reporting.
    pub fn status(&self) -> (Epoch, usize) {
        let state = self.state.lock();
        (state.watermark, state.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn mk_request(epoch: Epoch, active: &[Epoch]) -> Arc<MirrorRequest> {
        Arc::new(MirrorRequest::new(
            Method::GET,
            "/".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            epoch,
            active.iter().copied().collect(),
        ))
    }

    #[test]
    fn sends_in_strict_order() {
        let q = SendQueue::new(5);
        let r1 = mk_request(1, &[]);
        let r2 = mk_request(2, &[]);
        let r3 = mk_request(3, &[]);
        let r4 = mk_request(4, &[]);

        // Added out of order; the queue sorts by epoch internally.
        q.add(r3.clone(), "url");
        q.add(r1.clone(), "url");
        q.add(r4.clone(), "url");
        q.add(r2.clone(), "url");

        assert_eq!(q.next_execute_items(), vec![r1.clone()]);
        assert!(q.next_execute_items().is_empty());

        q.execution_completed(&r1);
        assert_eq!(q.next_execute_items(), vec![r2.clone()]);

        q.execution_completed(&r2);
        assert_eq!(q.next_execute_items(), vec![r3.clone()]);

        q.execution_completed(&r3);
        assert_eq!(q.next_execute_items(), vec![r4]);
    }

    #[test]
    fn sends_parallel_when_part_of_active_snapshot() {
        let q = SendQueue::new(5);
        let r1 = mk_request(1, &[]);
        let r2 = mk_request(2, &[1]);

        q.add(r1.clone(), "url");
        q.add(r2.clone(), "url");

        // r2 observed r1 as active, so both release together.
        assert_eq!(q.next_execute_items(), vec![r1, r2]);
    }

    #[test]
    fn executed_when_active_and_completed() {
        let q = SendQueue::new(5);
        let r2 = mk_request(2, &[1]);
        let r3 = mk_request(3, &[1]);

        q.add(r2.clone(), "url");
        q.add(r3.clone(), "url");

        // r2's true predecessor (epoch 1) has never arrived on this queue,
        // so it's treated as resolved and r2 runs immediately. r3's
        // predecessor is r2 (in-flight, not yet complete), so it waits.
        assert_eq!(q.next_execute_items(), vec![r2.clone()]);
        assert!(q.next_execute_items().is_empty());

        q.execution_completed(&r2);

        assert_eq!(q.next_execute_items(), vec![r3]);
    }

    #[test]
    fn late_predecessor_still_advances_watermark() {
        let q = SendQueue::new(5);
        let r2 = mk_request(2, &[1]);
        let r3 = mk_request(3, &[1]);
        let r1 = mk_request(1, &[]);

        q.add(r2.clone(), "url");
        q.add(r3.clone(), "url");
        assert_eq!(q.next_execute_items(), vec![r2.clone()]);
        q.execution_completed(&r2);
        assert_eq!(q.next_execute_items(), vec![r3.clone()]);
        q.execution_completed(&r3);

        q.add(r1.clone(), "url");
        assert_eq!(q.next_execute_items(), vec![r1.clone()]);
        q.execution_completed(&r1);

        let (watermark, pending) = q.status();
        assert_eq!(watermark, 3);
        assert_eq!(pending, 0);
    }

    #[test]
    fn capacity_sheds_overflow_without_executing_it() {
        let q = SendQueue::new(1);
        let r1 = mk_request(1, &[]);
        let r2 = mk_request(2, &[1]);

        q.add(r1.clone(), "url");
        q.add(r2, "url"); // shed: queue already holds 1 item at capacity 1

        assert_eq!(q.next_execute_items(), vec![r1.clone()]);
        assert!(q.next_execute_items().is_empty());

        q.execution_completed(&r1);

        let (watermark, pending) = q.status();
        assert_eq!(watermark, 2);
        assert_eq!(pending, 0);
    }
}
