//! TX scheduling policy: CSMA-style deferral and retry backoff.
//!
//! The dequeue ordering itself (priority, then FIFO) lives in the store's
//! leased queue; this module decides *when* a leased frame may touch the
//! wire and how failures are deferred.

use std::time::Duration;

use rand::Rng;
use rfmp_net::CarrierSense;

/// Carrier considered busy if activity was seen within this window.
pub const CARRIER_WINDOW_MS: u64 = 500;

/// CSMA deferral bounds.
pub const CSMA_BACKOFF_MIN_MS: u64 = 100;
pub const CSMA_BACKOFF_MAX_MS: u64 = 400;

/// Listen attempts before the frame is dropped.
pub const CSMA_MAX_TRIES: u32 = 5;

/// Retry delay after a send failure: `2^attempts × 250 ms`, capped.
pub const NACK_BASE_MS: u64 = 250;
pub const NACK_CAP_MS: u64 = 30_000;

/// Attempts after which a frame is dropped permanently.
pub const MAX_TX_ATTEMPTS: u32 = 5;

/// Outcome of the CSMA listen phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    /// Channel idle; transmit now.
    Clear,
    /// Carrier never cleared within the try budget; drop the frame.
    Busy,
}

/// Listen before transmit: defer with random backoff while the carrier is
/// busy, up to [`CSMA_MAX_TRIES`] attempts.
pub async fn acquire_channel(carrier: &CarrierSense) -> ChannelDecision {
    for _ in 0..CSMA_MAX_TRIES {
        if !carrier.busy_within(CARRIER_WINDOW_MS) {
            return ChannelDecision::Clear;
        }
        let backoff = rand::thread_rng().gen_range(CSMA_BACKOFF_MIN_MS..=CSMA_BACKOFF_MAX_MS);
        tokio::time::sleep(Duration::from_millis(backoff)).await;
    }
    ChannelDecision::Busy
}

/// Deferral in milliseconds for a nacked frame, by attempt count.
pub fn nack_delay_ms(attempts: u32) -> u64 {
    NACK_BASE_MS
        .saturating_mul(1u64 << attempts.min(20))
        .min(NACK_CAP_MS)
}

/// True when a frame that just failed its `attempts`-th try is out of budget.
pub fn is_permanent_failure(attempts: u32) -> bool {
    attempts >= MAX_TX_ATTEMPTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_channel_passes_immediately() {
        let carrier = CarrierSense::new();
        assert_eq!(acquire_channel(&carrier).await, ChannelDecision::Clear);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_channel_exhausts_tries() {
        let carrier = CarrierSense::new();
        carrier.mark_activity();

        // With auto-advancing paused time, wall time never moves, so the
        // carrier stays "recent" and every listen attempt fails.
        let decision = acquire_channel(&carrier).await;
        assert_eq!(decision, ChannelDecision::Busy);
    }

    #[test]
    fn nack_delay_doubles_and_caps() {
        assert_eq!(nack_delay_ms(0), 250);
        assert_eq!(nack_delay_ms(1), 500);
        assert_eq!(nack_delay_ms(2), 1000);
        assert_eq!(nack_delay_ms(4), 4000);
        assert_eq!(nack_delay_ms(10), 30_000); // capped at 30 s
    }

    #[test]
    fn permanent_after_five_attempts() {
        assert!(!is_permanent_failure(4));
        assert!(is_permanent_failure(5));
    }
}
