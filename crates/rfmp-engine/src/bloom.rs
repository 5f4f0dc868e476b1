//! Rotating Bloom windows for anti-entropy sync.
//!
//! Three windows cover the last `3 × W` seconds of accepted message ids.
//! Each window carries a fresh random salt so two cooperating nodes never
//! collide on the same hash positions across windows. Bit positions are
//! derived from SipHash-2-4 keyed on `(salt, i)` for i in `0..k`.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use rfmp_shared::constants::SYNC_WINDOW_COUNT;
use rfmp_shared::frames::SyncWindow;
use rfmp_shared::types::MessageId;
use rfmp_store::BloomWindowRow;

/// Compute the `k` bit positions of `id` for a filter parameterised by
/// `(salt, k, m_log2)`. Shared between local inserts and membership tests
/// against remote windows.
pub fn bit_positions(id: &MessageId, salt: u32, k: u8, m_log2: u8) -> Vec<u32> {
    let m = 1u64 << m_log2;
    (0..k)
        .map(|i| {
            let mut hasher = SipHasher24::new_with_keys(salt as u64, i as u64);
            hasher.write(id.as_bytes());
            (hasher.finish() % m) as u32
        })
        .collect()
}

fn get_bit(bits: &[u8], pos: u32) -> bool {
    let byte = (pos / 8) as usize;
    let bit = pos % 8;
    byte < bits.len() && bits[byte] & (1 << bit) != 0
}

fn set_bit(bits: &mut [u8], pos: u32) {
    let byte = (pos / 8) as usize;
    let bit = pos % 8;
    if byte < bits.len() {
        bits[byte] |= 1 << bit;
    }
}

/// Test `id` against a window received in a SYNC frame, using the sender's
/// own parameters.
pub fn remote_contains(window: &SyncWindow, id: &MessageId) -> bool {
    bit_positions(id, window.salt, window.k, window.m_log2)
        .into_iter()
        .all(|pos| get_bit(&window.bits, pos))
}

/// One local Bloom window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub opened_at: u32,
    pub salt: u32,
    pub k: u8,
    pub m_log2: u8,
    pub bits: Vec<u8>,
    pub count: u32,
}

impl Window {
    fn fresh(opened_at: u32, k: u8, m_log2: u8) -> Self {
        Self {
            opened_at,
            salt: rand::random(),
            k,
            m_log2,
            bits: vec![0u8; (1usize << m_log2) / 8],
            count: 0,
        }
    }

    pub fn insert(&mut self, id: &MessageId) {
        for pos in bit_positions(id, self.salt, self.k, self.m_log2) {
            set_bit(&mut self.bits, pos);
        }
        self.count += 1;
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        bit_positions(id, self.salt, self.k, self.m_log2)
            .into_iter()
            .all(|pos| get_bit(&self.bits, pos))
    }

    pub fn to_sync_window(&self) -> SyncWindow {
        SyncWindow {
            opened_at: self.opened_at,
            salt: self.salt,
            k: self.k,
            m_log2: self.m_log2,
            bits: self.bits.clone(),
        }
    }
}

/// The three rotating windows plus the current index.
///
/// Rotation replaces the oldest window with a fresh one and moves the
/// current index onto it; callers hold the engine state lock, which is what
/// makes a rotation atomic with respect to concurrent inserts.
#[derive(Debug, Clone)]
pub struct RotatingWindows {
    windows: Vec<Window>,
    current: usize,
    window_secs: u64,
    k: u8,
    m_log2: u8,
}

impl RotatingWindows {
    pub fn new(now: u64, window_secs: u64, k: u8, m_log2: u8) -> Self {
        // Stagger opening times backwards so the three windows span the
        // expected 3×W horizon from the start.
        let windows = (0..SYNC_WINDOW_COUNT)
            .map(|i| {
                let age = (SYNC_WINDOW_COUNT - 1 - i) as u64 * window_secs;
                Window::fresh(now.saturating_sub(age) as u32, k, m_log2)
            })
            .collect();
        Self {
            windows,
            current: SYNC_WINDOW_COUNT - 1,
            window_secs,
            k,
            m_log2,
        }
    }

    /// Rebuild from persisted rows; rows older than the 3×W horizon are
    /// discarded and replaced with fresh windows.
    pub fn from_rows(rows: &[BloomWindowRow], now: u64, window_secs: u64, k: u8, m_log2: u8) -> Self {
        let mut state = Self::new(now, window_secs, k, m_log2);
        let horizon = now.saturating_sub(window_secs * SYNC_WINDOW_COUNT as u64);

        for row in rows {
            let index = row.window_index as usize;
            if index >= SYNC_WINDOW_COUNT || (row.opened_at as u64) < horizon {
                continue;
            }
            state.windows[index] = Window {
                opened_at: row.opened_at,
                salt: row.salt,
                k: row.k,
                m_log2: row.m_log2,
                bits: row.bits.clone(),
                count: row.count,
            };
        }

        // Current = most recently opened.
        state.current = state
            .windows
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| w.opened_at)
            .map(|(i, _)| i)
            .unwrap_or(0);
        state
    }

    pub fn to_rows(&self) -> Vec<BloomWindowRow> {
        self.windows
            .iter()
            .enumerate()
            .map(|(i, w)| BloomWindowRow {
                window_index: i as u8,
                opened_at: w.opened_at,
                salt: w.salt,
                k: w.k,
                m_log2: w.m_log2,
                bits: w.bits.clone(),
                count: w.count,
            })
            .collect()
    }

    /// Insert into the current window.
    pub fn insert(&mut self, id: &MessageId) {
        self.windows[self.current].insert(id);
    }

    /// Probabilistic membership across all three windows.
    pub fn contains_any(&self, id: &MessageId) -> bool {
        self.windows.iter().any(|w| w.contains(id))
    }

    pub fn needs_rotation(&self, now: u64) -> bool {
        now >= self.windows[self.current].opened_at as u64 + self.window_secs
    }

    /// Open a new current window in place of the oldest.
    pub fn rotate(&mut self, now: u64) {
        let next = (self.current + 1) % SYNC_WINDOW_COUNT;
        self.windows[next] = Window::fresh(now as u32, self.k, self.m_log2);
        self.current = next;
    }

    /// Windows in chronological order (oldest first) for SYNC emission.
    pub fn to_sync_windows(&self) -> Vec<SyncWindow> {
        let mut ordered: Vec<&Window> = self.windows.iter().collect();
        ordered.sort_by_key(|w| w.opened_at);
        ordered.into_iter().map(Window::to_sync_window).collect()
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn current_window(&self) -> &Window {
        &self.windows[self.current]
    }

    /// Total inserted ids across the three windows (double counting ids
    /// inserted into several windows is fine for a status figure).
    pub fn population(&self) -> u64 {
        self.windows.iter().map(|w| w.count as u64).sum()
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }
}
