//! Traffic counters kept by the driver.
//!
//! Counters are only ever incremented, from whichever context touches the queue,
//! and are read without locking to build a [`NicStatistics`] snapshot.

use core::sync::atomic::{AtomicU64, Ordering};
use network_interface_card::NicStatistics;

/// A monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Counter {
        Counter(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct TxStats {
    /// Packets the device reported as sent.
    pub packets: Counter,
    pub bytes: Counter,
    /// Packets refused because they could not be described in descriptors.
    pub errors: Counter,
    /// Packets that were accepted but thrown away, e.g., by a reset.
    pub drops: Counter,
    pub csum: Counter,
    pub tso: Counter,
}

#[derive(Debug, Default)]
pub struct RxStats {
    pub packets: Counter,
    pub bytes: Counter,
    pub drops: Counter,
    pub csum: Counter,
    pub csum_err: Counter,
    /// Times a receive buffer could not be obtained to refill a ring.
    pub alloc_failures: Counter,
}

/// Copies the current counter values into `out`.
pub fn fill_stats(tx: &TxStats, rx: &RxStats, out: &mut NicStatistics) {
    out.tx_packets = tx.packets.get();
    out.tx_bytes = tx.bytes.get();
    out.tx_errors = tx.errors.get();
    out.tx_drops = tx.drops.get();
    out.tx_csum = tx.csum.get();
    out.tx_tso = tx.tso.get();
    out.rx_packets = rx.packets.get();
    out.rx_bytes = rx.bytes.get();
    out.rx_drops = rx.drops.get();
    out.rx_csum = rx.csum.get();
    out.rx_csum_err = rx.csum_err.get();
}
