//! Anti-entropy synchronizer over the rotating Bloom windows.
//!
//! Receiving a SYNC yields two candidate directions: *push* (local messages
//! the peer's filters don't show) and *pull* (ids we have heard of but do
//! not hold, which the peer's filters do show). Pulls go out as REQ frames
//! through the rate limiter; pushes are re-enqueued MSGs at demoted
//! priority.

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use tracing::debug;

use rfmp_shared::frames::SyncWindow;
use rfmp_shared::types::{Callsign, MessageId};

use crate::bloom::{remote_contains, RotatingWindows};
use crate::rate_limit::ReqLimiter;

/// Ids per REQ frame.
pub const REQ_CHUNK: usize = 32;

/// Bound on the heard-of-but-missing set.
const WANTED_CAP: usize = 256;

/// Suppress own SYNC emission this long after hearing someone else's.
const SYNC_SUPPRESS_MS: u64 = 5_000;

#[derive(Debug, Clone)]
struct Wanted {
    added_ms: u64,
}

#[derive(Debug)]
pub struct SyncEngine {
    windows: RotatingWindows,
    limiter: ReqLimiter,
    /// Ids referenced on air (fragments that timed out, REQs from others,
    /// replies to unknown messages) that the local store lacks.
    wanted: HashMap<MessageId, Wanted>,
    /// Pull candidates queued per peer, drained round-robin.
    pull_queues: HashMap<Callsign, VecDeque<MessageId>>,
    sync_interval_ms: u64,
    next_sync_due_ms: u64,
    last_sync_rx_ms: Option<u64>,
}

impl SyncEngine {
    pub fn new(windows: RotatingWindows, req_per_minute: u32, sync_interval_s: u64, now_ms: u64) -> Self {
        let sync_interval_ms = sync_interval_s * 1000;
        Self {
            windows,
            limiter: ReqLimiter::new(req_per_minute),
            wanted: HashMap::new(),
            pull_queues: HashMap::new(),
            sync_interval_ms,
            next_sync_due_ms: now_ms + jittered(sync_interval_ms),
            last_sync_rx_ms: None,
        }
    }

    pub fn windows(&self) -> &RotatingWindows {
        &self.windows
    }

    pub fn windows_mut(&mut self) -> &mut RotatingWindows {
        &mut self.windows
    }

    /// A message was accepted locally: index it and stop chasing it.
    pub fn insert_accepted(&mut self, id: &MessageId) {
        self.windows.insert(id);
        self.wanted.remove(id);
        self.limiter.mark_received(id);
    }

    /// Note an id we have heard referenced but do not hold.
    pub fn note_wanted(&mut self, id: MessageId, now_ms: u64) {
        if self.wanted.len() >= WANTED_CAP && !self.wanted.contains_key(&id) {
            // Drop the oldest entry to stay bounded.
            if let Some(oldest) = self
                .wanted
                .iter()
                .min_by_key(|(_, w)| w.added_ms)
                .map(|(k, _)| *k)
            {
                self.wanted.remove(&oldest);
            }
        }
        self.wanted
            .entry(id)
            .or_insert(Wanted { added_ms: now_ms });
    }

    pub fn is_wanted(&self, id: &MessageId) -> bool {
        self.wanted.contains_key(id)
    }

    /// Any frame from `peer` resets its REQ backoff.
    pub fn on_peer_frame(&mut self, peer: &Callsign) {
        self.limiter.note_peer_activity(peer);
    }

    /// Process a received SYNC.
    ///
    /// `local_ids_by_window` carries, per local window, the ids accepted
    /// during that window's time span (queried from the store). Returns the
    /// push candidates; pull candidates are queued internally for
    /// [`SyncEngine::drain_reqs`].
    pub fn on_sync(
        &mut self,
        peer: &Callsign,
        remote: &[SyncWindow],
        local_ids_by_window: &[(u32, Vec<MessageId>)],
        now_ms: u64,
    ) -> Vec<MessageId> {
        self.last_sync_rx_ms = Some(now_ms);

        let w = self.windows.window_secs() as u32;
        let mut pushes = Vec::new();

        for (opened_at, ids) in local_ids_by_window {
            // Match local and remote windows on opened_at rounded to the
            // nearest window duration; unmatched horizons are disjoint and
            // skipped entirely.
            let slot = round_to_window(*opened_at, w);
            let Some(matching) = remote.iter().find(|r| round_to_window(r.opened_at, w) == slot)
            else {
                continue;
            };

            for id in ids {
                if !remote_contains(matching, id) {
                    pushes.push(*id);
                }
            }
        }

        // Pull direction: wanted ids the peer's filters claim to hold.
        let mut pulls = Vec::new();
        for id in self.wanted.keys() {
            if remote.iter().any(|rw| remote_contains(rw, id)) {
                pulls.push(*id);
            }
        }
        if !pulls.is_empty() {
            let queue = self.pull_queues.entry(peer.clone()).or_default();
            for id in pulls {
                if !queue.contains(&id) {
                    queue.push_back(id);
                }
            }
        }

        debug!(
            peer = %peer,
            pushes = pushes.len(),
            "processed SYNC"
        );
        pushes
    }

    /// Whether to emit a SYNC now. Arms the next jittered deadline when it
    /// fires; suppression (queue pressure, recently heard SYNC) defers
    /// without rescheduling so the next call re-checks.
    pub fn should_emit_sync(&mut self, now_ms: u64, queue_depth: u64, high_water: u64) -> SyncDecision {
        if now_ms < self.next_sync_due_ms {
            return SyncDecision::NotDue;
        }
        if queue_depth > high_water {
            return SyncDecision::Suppressed;
        }
        if let Some(rx) = self.last_sync_rx_ms {
            if now_ms.saturating_sub(rx) < SYNC_SUPPRESS_MS {
                return SyncDecision::Suppressed;
            }
        }
        self.next_sync_due_ms = now_ms + jittered(self.sync_interval_ms);
        SyncDecision::Emit
    }

    /// Bloom windows for the SYNC frame, oldest first.
    pub fn sync_windows(&self) -> Vec<SyncWindow> {
        self.windows.to_sync_windows()
    }

    /// Drain REQ sends that the rate limiter allows right now.
    ///
    /// One chunk of at most [`REQ_CHUNK`] ids per peer per call; successive
    /// calls interleave peers round-robin.
    pub fn drain_reqs(&mut self, now_ms: u64) -> Vec<(Callsign, Vec<MessageId>)> {
        let mut out = Vec::new();
        let mut peers: Vec<Callsign> = self
            .pull_queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort_by_key(|p| p.to_string());

        for peer in peers {
            let Some(queue) = self.pull_queues.get_mut(&peer) else {
                continue;
            };

            // Only ids still missing and past their per-message backoff.
            let candidates: Vec<MessageId> = queue
                .iter()
                .copied()
                .filter(|id| self.wanted.contains_key(id))
                .collect();
            let requestable = self.limiter.filter_requestable(candidates, now_ms);
            if requestable.is_empty() {
                queue.retain(|id| self.wanted.contains_key(id));
                continue;
            }

            if !self.limiter.try_acquire(&peer, now_ms) {
                continue;
            }

            let chunk: Vec<MessageId> = requestable.into_iter().take(REQ_CHUNK).collect();
            self.limiter.record_request(&chunk, now_ms);
            if let Some(queue) = self.pull_queues.get_mut(&peer) {
                queue.retain(|id| !chunk.contains(id));
            }
            out.push((peer, chunk));
        }

        self.pull_queues.retain(|_, q| !q.is_empty());
        out
    }

    /// Housekeeping: expire stale wanted entries and limiter records.
    pub fn sweep(&mut self, now_ms: u64, wanted_ttl_ms: u64) {
        self.wanted
            .retain(|_, w| now_ms.saturating_sub(w.added_ms) < wanted_ttl_ms);
        self.limiter.sweep(now_ms);
    }
}

/// Outcome of the periodic emission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Emit,
    NotDue,
    Suppressed,
}

fn round_to_window(opened_at: u32, w: u32) -> u32 {
    if w == 0 {
        return opened_at;
    }
    (opened_at + w / 2) / w
}

/// Interval with ±20 % jitter.
fn jittered(interval_ms: u64) -> u64 {
    let factor: f64 = rand::thread_rng().gen_range(0.8..1.2);
    (interval_ms as f64 * factor) as u64
}
