//! UDP flow relay.
//!
//! There is no handshake: the first datagram for an unseen flow key creates the flow and hands it
//! to the accept queue. Later datagrams queue up for the reader. A flow that sees no traffic for
//! the idle timeout is closed and deregistered.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::StackConfig;
use crate::error::StackError;
use crate::sink::FrameSink;
use crate::stats::StackStats;
use crate::table::{ConnectionTable, FlowEntry, FlowKey};

#[derive(Debug)]
pub(crate) enum UdpEvent {
    Datagram(Vec<u8>),
    Close,
}

pub(crate) struct UdpEntry {
    events: mpsc::Sender<UdpEvent>,
    cancel: CancellationToken,
}

impl UdpEntry {
    /// Queues a datagram payload for the flow task. Returns `false` if it had to be dropped.
    pub(crate) fn deliver(&self, payload: Vec<u8>) -> bool {
        self.events.try_send(UdpEvent::Datagram(payload)).is_ok()
    }
}

impl FlowEntry for UdpEntry {
    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub(crate) struct UdpContext {
    pub(crate) config: Arc<StackConfig>,
    pub(crate) table: Arc<ConnectionTable<UdpEntry>>,
    pub(crate) sink: FrameSink,
    pub(crate) stats: StackStats,
    pub(crate) accept: mpsc::Sender<UdpFlow>,
    pub(crate) shutdown: CancellationToken,
}

struct UdpShared {
    key: FlowKey,
    queue: Mutex<VecDeque<Vec<u8>>>,
    readable: Notify,
    cancel: CancellationToken,
}

impl UdpShared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registers a flow for `key`, queues `first` for it and hands it to the accept queue.
///
/// Returns `false` if the flow already exists or the accept queue cannot take it.
pub(crate) fn open(ctx: &UdpContext, key: FlowKey, first: Vec<u8>) -> bool {
    let cancel = ctx.shutdown.child_token();
    let (tx, rx) = mpsc::channel(ctx.config.flow_queue_depth);
    let entry = Arc::new(UdpEntry {
        events: tx.clone(),
        cancel: cancel.clone(),
    });
    if !ctx.table.insert(key, entry.clone()) {
        return false;
    }

    let shared = Arc::new(UdpShared {
        key,
        queue: Mutex::new(VecDeque::from([first])),
        readable: Notify::new(),
        cancel,
    });
    let flow = UdpFlow {
        shared: shared.clone(),
        events: tx,
        sink: ctx.sink.clone(),
        read_timeout: ctx.config.udp_read_timeout,
    };
    if ctx.accept.try_send(flow).is_err() {
        warn!(flow = %key, "udp accept queue full, dropping flow");
        ctx.table.remove_entry(&key, &entry);
        shared.cancel.cancel();
        return false;
    }

    ctx.stats.udp_flow_opened();
    debug!(flow = %key, "udp flow opened");
    tokio::spawn(run_flow(ctx.clone(), shared, entry, rx));
    true
}

async fn run_flow(
    ctx: UdpContext,
    shared: Arc<UdpShared>,
    entry: Arc<UdpEntry>,
    mut events: mpsc::Receiver<UdpEvent>,
) {
    let key = shared.key;
    loop {
        let event = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            event = tokio::time::timeout(ctx.config.udp_idle_timeout, events.recv()) => event,
        };
        match event {
            Ok(Some(UdpEvent::Datagram(payload))) => {
                let mut queue = shared.lock();
                if queue.len() >= ctx.config.udp_flow_queue_depth {
                    trace!(flow = %key, len = payload.len(), "udp flow backlog full, dropping datagram");
                    continue;
                }
                queue.push_back(payload);
                drop(queue);
                shared.readable.notify_waiters();
            }
            Ok(Some(UdpEvent::Close)) | Ok(None) => break,
            Err(_) => {
                debug!(flow = %key, "udp flow idle timeout");
                break;
            }
        }
    }

    ctx.table.remove_entry(&key, &entry);
    shared.cancel.cancel();
    shared.readable.notify_waiters();
    ctx.stats.udp_flow_closed();
    debug!(flow = %key, "udp flow finished");
}

/// A UDP conversation between a captured sender and one destination.
pub struct UdpFlow {
    shared: Arc<UdpShared>,
    events: mpsc::Sender<UdpEvent>,
    sink: FrameSink,
    read_timeout: Duration,
}

impl UdpFlow {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.shared.key.src
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.shared.key.dst
    }

    pub fn key(&self) -> FlowKey {
        self.shared.key
    }

    /// Copies the oldest queued datagram into `buf`, truncating it if `buf` is too small.
    ///
    /// Returns `Ok(0)` once the flow is closed and nothing is left to read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StackError> {
        let wait = async {
            loop {
                let notified = self.shared.readable.notified();
                let next = self.shared.lock().pop_front();
                if let Some(datagram) = next {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    return Ok(n);
                }
                if self.shared.cancel.is_cancelled() {
                    return Ok(0);
                }
                tokio::select! {
                    _ = notified => {}
                    _ = self.shared.cancel.cancelled() => {}
                }
            }
        };
        tokio::time::timeout(self.read_timeout, wait)
            .await
            .map_err(|_| StackError::Timeout)?
    }

    /// Sends `data` as one datagram back to the captured sender, fragmented to the MTU.
    pub async fn write(&self, data: &[u8]) -> Result<usize, StackError> {
        if self.shared.cancel.is_cancelled() {
            return Err(StackError::Closed);
        }
        self.sink.send_udp(&self.shared.key, data).await?;
        Ok(data.len())
    }

    pub async fn close(&self) {
        let _ = self.events.send(UdpEvent::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        let _ = self.events.try_send(UdpEvent::Close);
    }
}

impl fmt::Debug for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpFlow")
            .field("key", &self.shared.key)
            .field("queued", &self.shared.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
