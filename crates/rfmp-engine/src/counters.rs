//! Protocol counters, injected into the components that update them and
//! snapshotted into the status surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub struct Counters {
            $(pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of every counter.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct CounterSnapshot {
            $(pub $name: u64,)*
        }

        impl Counters {
            pub fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    frames_rx,
    frames_tx,
    framing_errors,
    rfmp_bad_magic,
    rfmp_bad_version,
    id_mismatch,
    reassembly_id_mismatch,
    duplicates_dropped,
    messages_accepted,
    syncs_sent,
    syncs_suppressed,
    reqs_sent,
    pushes_enqueued,
    rebroadcasts,
    csma_drops,
    tx_permanent_failures,
    backpressure_dropped,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
