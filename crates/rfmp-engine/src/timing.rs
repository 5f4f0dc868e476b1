//! Adaptive transmit timing.
//!
//! Enqueue delays spread transmissions by priority and random jitter, with a
//! congestion factor that grows on collision/retry events and decays on
//! clean sends. Shared RF is slow; the point is to keep two stations from
//! keying up in the same slot.

use rand::Rng;

/// Base scheduling slot.
pub const BASE_SLOT_MS: u64 = 500;

/// Minimum enforced gap between consecutive transmissions.
pub const MIN_INTER_FRAME_GAP_MS: u64 = 250;

const CONGESTION_MAX: f64 = 8.0;

#[derive(Debug)]
pub struct TxTiming {
    congestion: f64,
}

impl TxTiming {
    pub fn new() -> Self {
        Self { congestion: 0.0 }
    }

    /// Delay before a newly enqueued frame becomes eligible:
    /// `base_slot × (1 + priority) × (1 + uniform(0,1) × congestion)`.
    pub fn enqueue_delay_ms(&self, priority: u8) -> u64 {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let factor = (1.0 + priority as f64) * (1.0 + jitter * self.congestion);
        (BASE_SLOT_MS as f64 * factor) as u64
    }

    /// A collision or retry was observed; widen future spreads.
    pub fn on_collision(&mut self) {
        self.congestion = (self.congestion + 1.0).min(CONGESTION_MAX);
    }

    /// A frame went out cleanly; relax towards an idle channel.
    pub fn on_clean_send(&mut self) {
        self.congestion *= 0.75;
        if self.congestion < 0.05 {
            self.congestion = 0.0;
        }
    }

    pub fn congestion(&self) -> f64 {
        self.congestion
    }
}

impl Default for TxTiming {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_channel_delay_is_priority_scaled() {
        let timing = TxTiming::new();
        // With zero congestion the jitter term vanishes.
        assert_eq!(timing.enqueue_delay_ms(0), BASE_SLOT_MS);
        assert_eq!(timing.enqueue_delay_ms(3), BASE_SLOT_MS * 4);
    }

    #[test]
    fn congestion_widens_and_decays() {
        let mut timing = TxTiming::new();
        for _ in 0..20 {
            timing.on_collision();
        }
        assert_eq!(timing.congestion(), CONGESTION_MAX);

        // Congested delays stay within the algebraic bounds.
        for _ in 0..100 {
            let d = timing.enqueue_delay_ms(1);
            assert!(d >= BASE_SLOT_MS * 2);
            assert!(d <= (BASE_SLOT_MS as f64 * 2.0 * (1.0 + CONGESTION_MAX)) as u64);
        }

        while timing.congestion() > 0.0 {
            timing.on_clean_send();
        }
        assert_eq!(timing.enqueue_delay_ms(0), BASE_SLOT_MS);
    }
}
