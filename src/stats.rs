use std::sync::atomic::{AtomicU64, Ordering};

/// Message and control-traffic counters of one layer instance.
#[derive(Default)]
pub struct UnicastStats {
    pub(crate) num_msgs_sent: AtomicU64,
    pub(crate) num_msgs_received: AtomicU64,
    pub(crate) num_acks_sent: AtomicU64,
    pub(crate) num_acks_received: AtomicU64,
    pub(crate) num_xmits: AtomicU64,
    pub(crate) xmit_reqs_sent: AtomicU64,
    pub(crate) xmit_reqs_received: AtomicU64,
    pub(crate) xmit_rsps_sent: AtomicU64,
}

/// Point-in-time copy of [`UnicastStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub num_msgs_sent: u64,
    pub num_msgs_received: u64,
    pub num_acks_sent: u64,
    pub num_acks_received: u64,
    pub num_xmits: u64,
    pub xmit_reqs_sent: u64,
    pub xmit_reqs_received: u64,
    pub xmit_rsps_sent: u64,
}

impl UnicastStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            num_msgs_sent: self.num_msgs_sent.load(Ordering::Relaxed),
            num_msgs_received: self.num_msgs_received.load(Ordering::Relaxed),
            num_acks_sent: self.num_acks_sent.load(Ordering::Relaxed),
            num_acks_received: self.num_acks_received.load(Ordering::Relaxed),
            num_xmits: self.num_xmits.load(Ordering::Relaxed),
            xmit_reqs_sent: self.xmit_reqs_sent.load(Ordering::Relaxed),
            xmit_reqs_received: self.xmit_reqs_received.load(Ordering::Relaxed),
            xmit_rsps_sent: self.xmit_rsps_sent.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.num_msgs_sent.store(0, Ordering::Relaxed);
        self.num_msgs_received.store(0, Ordering::Relaxed);
        self.num_acks_sent.store(0, Ordering::Relaxed);
        self.num_acks_received.store(0, Ordering::Relaxed);
        self.num_xmits.store(0, Ordering::Relaxed);
        self.xmit_reqs_sent.store(0, Ordering::Relaxed);
        self.xmit_reqs_received.store(0, Ordering::Relaxed);
        self.xmit_rsps_sent.store(0, Ordering::Relaxed);
    }
}
