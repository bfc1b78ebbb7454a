use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Counters shared by the reactor, the interface writer and every flow task.
///
/// Cloning is cheap; all clones observe the same counters.
#[derive(Clone, Default)]
pub struct StackStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    // Interface
    frames_rx_total: AtomicU64,
    bytes_rx_total: AtomicU64,
    frames_tx_total: AtomicU64,
    bytes_tx_total: AtomicU64,
    frames_dropped_total: AtomicU64,

    // Reassembly
    fragments_buffered_total: AtomicU64,
    datagrams_reassembled_total: AtomicU64,
    fragment_sets_expired_total: AtomicU64,

    // Flows
    tcp_flows_total: AtomicU64,
    tcp_flows_active: AtomicU64,
    udp_flows_total: AtomicU64,
    udp_flows_active: AtomicU64,
    tcp_resets_sent_total: AtomicU64,
    policy_denied_total: AtomicU64,
}

/// A point-in-time copy of [`StackStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_rx: u64,
    pub bytes_rx: u64,
    pub frames_tx: u64,
    pub bytes_tx: u64,
    pub frames_dropped: u64,
    pub fragments_buffered: u64,
    pub datagrams_reassembled: u64,
    pub fragment_sets_expired: u64,
    pub tcp_flows_opened: u64,
    pub tcp_flows_active: u64,
    pub udp_flows_opened: u64,
    pub udp_flows_active: u64,
    pub tcp_resets_sent: u64,
    pub policy_denied: u64,
}

impl StackStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_rx(&self, bytes: usize) {
        self.inner.frames_rx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_rx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_tx(&self, bytes: usize) {
        self.inner.frames_tx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_tx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) {
        self.inner
            .frames_dropped_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fragment_buffered(&self) {
        self.inner
            .fragments_buffered_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn datagram_reassembled(&self) {
        self.inner
            .datagrams_reassembled_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fragment_sets_expired(&self, count: usize) {
        self.inner
            .fragment_sets_expired_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn tcp_flow_opened(&self) {
        self.inner.tcp_flows_total.fetch_add(1, Ordering::Relaxed);
        self.inner.tcp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_flow_closed(&self) {
        self.inner.tcp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn udp_flow_opened(&self) {
        self.inner.udp_flows_total.fetch_add(1, Ordering::Relaxed);
        self.inner.udp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn udp_flow_closed(&self) {
        self.inner.udp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_reset_sent(&self) {
        self.inner
            .tcp_resets_sent_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn policy_denied(&self) {
        self.inner
            .policy_denied_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let i = &self.inner;
        StatsSnapshot {
            frames_rx: i.frames_rx_total.load(Ordering::Relaxed),
            bytes_rx: i.bytes_rx_total.load(Ordering::Relaxed),
            frames_tx: i.frames_tx_total.load(Ordering::Relaxed),
            bytes_tx: i.bytes_tx_total.load(Ordering::Relaxed),
            frames_dropped: i.frames_dropped_total.load(Ordering::Relaxed),
            fragments_buffered: i.fragments_buffered_total.load(Ordering::Relaxed),
            datagrams_reassembled: i.datagrams_reassembled_total.load(Ordering::Relaxed),
            fragment_sets_expired: i.fragment_sets_expired_total.load(Ordering::Relaxed),
            tcp_flows_opened: i.tcp_flows_total.load(Ordering::Relaxed),
            tcp_flows_active: i.tcp_flows_active.load(Ordering::Relaxed),
            udp_flows_opened: i.udp_flows_total.load(Ordering::Relaxed),
            udp_flows_active: i.udp_flows_active.load(Ordering::Relaxed),
            tcp_resets_sent: i.tcp_resets_sent_total.load(Ordering::Relaxed),
            policy_denied: i.policy_denied_total.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for StackStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let stats = StackStats::new();
        let other = stats.clone();
        other.frame_rx(60);
        other.frame_rx(40);
        stats.tcp_flow_opened();
        stats.tcp_flow_opened();
        other.tcp_flow_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_rx, 2);
        assert_eq!(snap.bytes_rx, 100);
        assert_eq!(snap.tcp_flows_opened, 2);
        assert_eq!(snap.tcp_flows_active, 1);
    }
}
