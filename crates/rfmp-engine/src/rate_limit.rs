//! Rate limiting for REQ emission.
//!
//! Two layers: a global sliding-window limit capping REQ frames per minute,
//! and a per-peer exponential backoff that engages when the global limit is
//! hit. Underneath both, a per-message record limits how often one missing
//! id is re-requested. Deferral never discards a candidate permanently; the
//! wanted set keeps it for the next SYNC round.

use std::collections::HashMap;

use rfmp_shared::types::{Callsign, MessageId};

/// Initial per-peer backoff when the global limit is exhausted.
const PEER_BACKOFF_INITIAL_SECS: u64 = 30;

/// Per-peer backoff cap.
const PEER_BACKOFF_MAX_SECS: u64 = 600;

/// Per-message re-request backoff start / retry cap.
const MSG_BACKOFF_INITIAL_SECS: u64 = 30;
const MSG_BACKOFF_MAX_SECS: u64 = 600;
const MSG_MAX_RETRIES: u32 = 4;

const WINDOW_MS: u64 = 60_000;

/// Global limit: at most `capacity` grants in any sliding 60 s window.
#[derive(Debug, Clone)]
struct SlidingWindow {
    capacity: usize,
    grants_ms: Vec<u64>,
}

impl SlidingWindow {
    fn new(per_minute: u32) -> Self {
        Self {
            capacity: per_minute as usize,
            grants_ms: Vec::new(),
        }
    }

    fn try_consume(&mut self, now_ms: u64) -> bool {
        let cutoff = now_ms.saturating_sub(WINDOW_MS);
        self.grants_ms.retain(|&t| t > cutoff);

        if self.grants_ms.len() < self.capacity {
            self.grants_ms.push(now_ms);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
struct PeerBackoff {
    backoff_secs: u64,
    blocked_until_ms: u64,
}

#[derive(Debug, Clone)]
struct MessageRecord {
    attempts: u32,
    backoff_secs: u64,
    next_allowed_ms: u64,
}

#[derive(Debug)]
pub struct ReqLimiter {
    window: SlidingWindow,
    peers: HashMap<Callsign, PeerBackoff>,
    messages: HashMap<MessageId, MessageRecord>,
}

impl ReqLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            window: SlidingWindow::new(per_minute),
            peers: HashMap::new(),
            messages: HashMap::new(),
        }
    }

    /// Try to take a send slot for one REQ frame towards `peer`.
    ///
    /// Returns `false` when the peer is backing off or the global window is
    /// full; a full window starts (or doubles) the peer's backoff.
    pub fn try_acquire(&mut self, peer: &Callsign, now_ms: u64) -> bool {
        if let Some(backoff) = self.peers.get(peer) {
            if now_ms < backoff.blocked_until_ms {
                return false;
            }
        }

        if self.window.try_consume(now_ms) {
            return true;
        }

        let entry = self.peers.entry(peer.clone()).or_insert(PeerBackoff {
            backoff_secs: 0,
            blocked_until_ms: 0,
        });
        entry.backoff_secs = if entry.backoff_secs == 0 {
            PEER_BACKOFF_INITIAL_SECS
        } else {
            (entry.backoff_secs * 2).min(PEER_BACKOFF_MAX_SECS)
        };
        entry.blocked_until_ms = now_ms + entry.backoff_secs * 1000;
        false
    }

    /// Any received frame from `peer` resets its backoff.
    pub fn note_peer_activity(&mut self, peer: &Callsign) {
        self.peers.remove(peer);
    }

    /// Keep only ids whose per-message backoff allows another request now.
    pub fn filter_requestable(&mut self, ids: Vec<MessageId>, now_ms: u64) -> Vec<MessageId> {
        ids.into_iter()
            .filter(|id| match self.messages.get(id) {
                None => true,
                Some(rec) => rec.attempts < MSG_MAX_RETRIES && now_ms >= rec.next_allowed_ms,
            })
            .collect()
    }

    /// Record that the ids went out in a REQ, arming their backoff.
    pub fn record_request(&mut self, ids: &[MessageId], now_ms: u64) {
        for id in ids {
            let rec = self.messages.entry(*id).or_insert(MessageRecord {
                attempts: 0,
                backoff_secs: MSG_BACKOFF_INITIAL_SECS,
                next_allowed_ms: 0,
            });
            rec.attempts += 1;
            rec.next_allowed_ms = now_ms + rec.backoff_secs * 1000;
            rec.backoff_secs = (rec.backoff_secs * 2).min(MSG_BACKOFF_MAX_SECS);
        }
    }

    /// The id arrived; stop tracking it.
    pub fn mark_received(&mut self, id: &MessageId) {
        self.messages.remove(id);
    }

    /// Drop stale records; run from housekeeping.
    pub fn sweep(&mut self, now_ms: u64) {
        self.messages
            .retain(|_, rec| now_ms < rec.next_allowed_ms + 24 * 3600 * 1000);
        self.peers.retain(|_, b| now_ms < b.blocked_until_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Callsign {
        Callsign::parse("K7XYZ").unwrap()
    }

    #[test]
    fn burst_capped_at_capacity() {
        let mut limiter = ReqLimiter::new(6);
        let p = peer();
        let granted = (0..20).filter(|_| limiter.try_acquire(&p, 1)).count();
        assert_eq!(granted, 6);
    }

    #[test]
    fn any_sixty_second_window_holds_the_cap() {
        let mut limiter = ReqLimiter::new(6);
        // Many peers so per-peer backoff doesn't mask the global cap.
        let peers: Vec<Callsign> = (0..10).map(|i| Callsign::new("P", i).unwrap()).collect();

        let mut grant_times = Vec::new();
        for ms in (0..180_000u64).step_by(250) {
            for p in &peers {
                if limiter.try_acquire(p, ms) {
                    grant_times.push(ms);
                }
            }
        }

        for (i, &start) in grant_times.iter().enumerate() {
            let in_window = grant_times[i..]
                .iter()
                .take_while(|&&t| t < start + 60_000)
                .count();
            assert!(in_window <= 6, "{in_window} grants within 60 s of {start}");
        }
    }

    #[test]
    fn slots_free_up_as_the_window_slides() {
        let mut limiter = ReqLimiter::new(6);
        let p = peer();
        for _ in 0..6 {
            assert!(limiter.try_acquire(&p, 0));
        }
        assert!(!limiter.try_acquire(&p, 0)); // arms 30 s peer backoff

        // Peer blocked during its backoff even though time passes.
        assert!(!limiter.try_acquire(&p, 29_000));
        // After backoff and window expiry, grants flow again.
        assert!(limiter.try_acquire(&p, 61_000));
    }

    #[test]
    fn peer_backoff_doubles_and_resets() {
        let mut limiter = ReqLimiter::new(1);
        let p = peer();
        assert!(limiter.try_acquire(&p, 0));
        assert!(!limiter.try_acquire(&p, 1)); // window full -> 30 s backoff
        assert_eq!(limiter.peers.get(&p).unwrap().backoff_secs, 30);

        // The grant at t=0 is still inside the window at 30.5 s, so the next
        // failure doubles the backoff.
        assert!(!limiter.try_acquire(&p, 30_500));
        assert_eq!(limiter.peers.get(&p).unwrap().backoff_secs, 60);

        limiter.note_peer_activity(&p);
        assert!(!limiter.peers.contains_key(&p));
        assert!(limiter.try_acquire(&p, 120_000));
    }

    #[test]
    fn per_message_backoff_and_retry_cap() {
        let mut limiter = ReqLimiter::new(100);
        let id = MessageId([1; 6]);

        assert_eq!(limiter.filter_requestable(vec![id], 0), vec![id]);
        limiter.record_request(&[id], 0);

        // Blocked for 30 s after the first request.
        assert!(limiter.filter_requestable(vec![id], 10_000).is_empty());
        assert_eq!(limiter.filter_requestable(vec![id], 31_000), vec![id]);

        // Exhaust the retry budget.
        limiter.record_request(&[id], 31_000);
        limiter.record_request(&[id], 200_000);
        limiter.record_request(&[id], 500_000);
        assert!(limiter.filter_requestable(vec![id], 2_000_000).is_empty());

        limiter.mark_received(&id);
        assert_eq!(limiter.filter_requestable(vec![id], 2_000_000), vec![id]);
    }
}
