//! IPv4 fragment reassembly.
//!
//! Fragment sets are keyed by (source, destination, protocol, identification) and kept sorted by
//! offset. A set completes once the final fragment (more-fragments clear) is present and the
//! fragments cover every byte from offset zero up to it, so arrival order does not matter. Each set
//! carries a liveness counter that is reset whenever a fragment is added and decremented by
//! [`ReassemblyTable::sweep`]; sets reaching zero are discarded.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tun2socks_packetlib::packet::ipv4::MAX_DATAGRAM_LEN;
use tun2socks_packetlib::{Ipv4Flags, Ipv4Packet};

use crate::stats::StackStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
}

impl FragmentKey {
    pub fn of(packet: &Ipv4Packet) -> Self {
        Self {
            src: packet.src(),
            dst: packet.dst(),
            protocol: packet.protocol(),
            identification: packet.identification(),
        }
    }
}

struct FragmentSet {
    /// Sorted by fragment offset, no two with the same offset.
    fragments: Vec<Ipv4Packet>,
    ticks_left: u32,
}

enum Assembly {
    Pending,
    Complete(Ipv4Packet),
    Oversized(usize),
}

impl FragmentSet {
    fn try_assemble(&self) -> Assembly {
        let Some(last) = self.fragments.last() else {
            return Assembly::Pending;
        };
        if last.header.more_fragments() {
            return Assembly::Pending;
        }

        let end = last.header.fragment_byte_offset() + last.payload.len();
        let header_len = self.fragments[0].header.header_len();
        if header_len + end > MAX_DATAGRAM_LEN {
            return Assembly::Oversized(header_len + end);
        }

        let mut covered = 0usize;
        for frag in &self.fragments {
            let start = frag.header.fragment_byte_offset();
            if start > covered {
                return Assembly::Pending;
            }
            covered = covered.max(start + frag.payload.len());
        }

        let mut payload = Vec::with_capacity(end);
        for frag in &self.fragments {
            let start = frag.header.fragment_byte_offset();
            let stop = start + frag.payload.len();
            if stop <= payload.len() {
                continue;
            }
            // Overlapping prefix was already provided by an earlier fragment.
            payload.extend_from_slice(&frag.payload[payload.len() - start..]);
        }

        let mut header = last.header;
        header.flags = header.flags.without(Ipv4Flags::MORE_FRAGMENTS);
        header.fragment_offset = 0;
        Assembly::Complete(Ipv4Packet {
            header,
            options: self.fragments[0].options.clone(),
            payload,
        })
    }
}

/// Pending fragment sets of one stack instance.
pub struct ReassemblyTable {
    sets: Mutex<HashMap<FragmentKey, FragmentSet>>,
    ttl_ticks: u32,
}

impl ReassemblyTable {
    /// `ttl_ticks` is the number of [`ReassemblyTable::sweep`] calls an untouched set survives.
    pub fn new(ttl_ticks: u32) -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            ttl_ticks: ttl_ticks.max(1),
        }
    }

    /// Adds a fragment; returns the reassembled datagram once its set is complete.
    pub fn insert(&self, fragment: Ipv4Packet) -> Option<Ipv4Packet> {
        let key = FragmentKey::of(&fragment);
        let offset = fragment.header.fragment_byte_offset();
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let set = sets.entry(key).or_insert_with(|| FragmentSet {
            fragments: Vec::new(),
            ticks_left: self.ttl_ticks,
        });
        set.ticks_left = self.ttl_ticks;

        match set
            .fragments
            .binary_search_by_key(&offset, |f| f.header.fragment_byte_offset())
        {
            Ok(_) => {
                trace!(id = key.identification, offset, "duplicate fragment ignored");
                return None;
            }
            Err(pos) => set.fragments.insert(pos, fragment),
        }

        match set.try_assemble() {
            Assembly::Pending => None,
            Assembly::Complete(packet) => {
                sets.remove(&key);
                trace!(id = key.identification, len = packet.payload.len(), "datagram reassembled");
                Some(packet)
            }
            Assembly::Oversized(len) => {
                sets.remove(&key);
                debug!(id = key.identification, len, "reassembled datagram too large, dropping set");
                None
            }
        }
    }

    /// Ages every pending set by one tick and discards the ones that run out. Returns how many
    /// sets were discarded.
    pub fn sweep(&self) -> usize {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sets.len();
        sets.retain(|key, set| {
            set.ticks_left = set.ticks_left.saturating_sub(1);
            if set.ticks_left == 0 {
                warn!(
                    src = %key.src,
                    dst = %key.dst,
                    id = key.identification,
                    fragments = set.fragments.len(),
                    "incomplete fragment set expired"
                );
                return false;
            }
            true
        });
        before - sets.len()
    }

    pub fn len(&self) -> usize {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Calls [`ReassemblyTable::sweep`] every `interval` until `shutdown` fires.
pub(crate) async fn run_sweeper(
    table: Arc<ReassemblyTable>,
    interval: Duration,
    stats: StackStats,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = table.sweep();
                if expired > 0 {
                    stats.fragment_sets_expired(expired);
                }
            }
        }
    }
    table.clear();
}
