//! The value type mirrored to every target: an inbound request snapshotted
//! at intake time, together with the epoch bookkeeping the send queues need
//! to replay it in an order that preserves discovered parallelism.

use std::collections::HashSet;

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::tracker::Epoch;

/// An inbound request, captured once and shared (by reference) across every
/// mirror it is fanned out to. Immutable after construction so the same
/// buffered body can be replayed to N targets without re-reading anything.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRequest {
    pub method: Method,
    /// Path and query exactly as received, e.g. `/v1/widgets?color=red`.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub epoch: Epoch,
    /// Epochs that were still active (dispatched to the primary, not yet
    /// done) at the moment this request's epoch was assigned.
    pub active_snapshot: HashSet<Epoch>,
}

impl MirrorRequest {
    pub fn new(
        method: Method,
        uri: String,
        headers: HeaderMap,
        body: Bytes,
        epoch: Epoch,
        active_snapshot: HashSet<Epoch>,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            epoch,
            active_snapshot,
        }
    }
}
