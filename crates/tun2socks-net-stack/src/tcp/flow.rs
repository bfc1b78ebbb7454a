use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tun2socks_packetlib::{TcpFlags, TcpSegment};

use super::state::{TcpAction, TcpControlBlock, TcpState};
use crate::config::StackConfig;
use crate::error::StackError;
use crate::sink::FrameSink;
use crate::stats::StackStats;
use crate::table::{ConnectionTable, FlowEntry, FlowKey};

/// Messages for a flow task, in arrival order.
#[derive(Debug)]
pub(crate) enum FlowEvent {
    Segment(TcpSegment),
    /// The consumer asked for an active close.
    Close,
}

/// The reactor's view of a live TCP flow.
pub(crate) struct TcpEntry {
    events: mpsc::Sender<FlowEvent>,
    cancel: CancellationToken,
}

impl TcpEntry {
    /// Queues `segment` for the flow task. Returns `false` when the queue is full or the task is
    /// gone; the peer retransmits.
    pub(crate) fn deliver(&self, segment: TcpSegment) -> bool {
        self.events.try_send(FlowEvent::Segment(segment)).is_ok()
    }
}

impl FlowEntry for TcpEntry {
    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Everything a flow task needs from its stack.
#[derive(Clone)]
pub(crate) struct TcpContext {
    pub(crate) config: Arc<StackConfig>,
    pub(crate) table: Arc<ConnectionTable<TcpEntry>>,
    pub(crate) sink: FrameSink,
    pub(crate) stats: StackStats,
    pub(crate) accept: mpsc::Sender<TcpFlow>,
    pub(crate) shutdown: CancellationToken,
}

struct TcpShared {
    key: FlowKey,
    tcb: Mutex<TcpControlBlock>,
    readable: Notify,
    writable: Notify,
    /// Fires when the flow task is gone, for whatever reason.
    cancel: CancellationToken,
}

impl TcpShared {
    fn lock(&self) -> MutexGuard<'_, TcpControlBlock> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registers a new flow for `syn` and starts its task.
///
/// Returns `false` if a flow for `key` already exists.
pub(crate) fn open(ctx: &TcpContext, key: FlowKey, syn: TcpSegment) -> bool {
    let cancel = ctx.shutdown.child_token();
    let (tx, rx) = mpsc::channel(ctx.config.flow_queue_depth);
    let entry = Arc::new(TcpEntry {
        events: tx.clone(),
        cancel: cancel.clone(),
    });
    if !ctx.table.insert(key, entry.clone()) {
        return false;
    }

    let shared = Arc::new(TcpShared {
        key,
        tcb: Mutex::new(TcpControlBlock::new(key, rand::random(), &ctx.config)),
        readable: Notify::new(),
        writable: Notify::new(),
        cancel,
    });
    // The queue is fresh, so the SYN always fits.
    let _ = tx.try_send(FlowEvent::Segment(syn));

    let flow = TcpFlow {
        shared: shared.clone(),
        events: tx,
        sink: ctx.sink.clone(),
        write_lock: tokio::sync::Mutex::new(()),
        read_timeout: ctx.config.tcp_read_timeout,
        segment_limit: ctx.config.segment_payload_limit(),
    };
    ctx.stats.tcp_flow_opened();
    debug!(flow = %key, "tcp flow opened");
    tokio::spawn(run_flow(ctx.clone(), shared, entry, rx, flow));
    true
}

async fn run_flow(
    ctx: TcpContext,
    shared: Arc<TcpShared>,
    entry: Arc<TcpEntry>,
    mut events: mpsc::Receiver<FlowEvent>,
    flow: TcpFlow,
) {
    let key = shared.key;
    // Held until the handshake completes, then handed to the accept queue.
    let mut unaccepted = Some(flow);

    loop {
        let event = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            event = tokio::time::timeout(ctx.config.tcp_idle_timeout, events.recv()) => event,
        };
        let actions = {
            let mut tcb = shared.lock();
            match event {
                Ok(Some(FlowEvent::Segment(segment))) => tcb.on_segment(&segment),
                Ok(Some(FlowEvent::Close)) => tcb.close(),
                Ok(None) => break,
                Err(_) => {
                    debug!(flow = %key, state = %tcb.state(), "tcp flow idle timeout");
                    tcb.on_idle_timeout()
                }
            }
        };
        shared.writable.notify_waiters();
        if apply(&ctx, &shared, &mut unaccepted, actions).await {
            break;
        }
    }

    ctx.table.remove_entry(&key, &entry);
    shared.cancel.cancel();
    shared.readable.notify_waiters();
    shared.writable.notify_waiters();
    ctx.stats.tcp_flow_closed();
    debug!(flow = %key, state = %shared.lock().state(), "tcp flow finished");
}

/// Carries out `actions`; returns `true` once the flow is finished.
async fn apply(
    ctx: &TcpContext,
    shared: &TcpShared,
    unaccepted: &mut Option<TcpFlow>,
    actions: Vec<TcpAction>,
) -> bool {
    let mut queue = VecDeque::from(actions);
    let mut finished = false;
    while let Some(action) = queue.pop_front() {
        match action {
            TcpAction::Emit(segment) => {
                if segment.has(TcpFlags::RST) {
                    ctx.stats.tcp_reset_sent();
                }
                if let Err(err) = ctx.sink.send_tcp(&shared.key, &segment).await {
                    debug!(flow = %shared.key, error = %err, "interface gone, dropping flow");
                    return true;
                }
            }
            TcpAction::Accept => {
                let Some(flow) = unaccepted.take() else {
                    continue;
                };
                match ctx.accept.try_send(flow) {
                    Ok(()) => debug!(flow = %shared.key, "tcp flow established"),
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                        warn!(flow = %shared.key, "tcp accept queue full, resetting flow");
                        queue.extend(shared.lock().reset());
                    }
                }
            }
            TcpAction::WakeReader => shared.readable.notify_waiters(),
            TcpAction::Remove => finished = true,
        }
    }
    finished
}

/// An established TCP flow, as seen by the relay.
///
/// `local_addr` is the captured sender, `remote_addr` the destination it asked for. Dropping the
/// handle starts an active close.
pub struct TcpFlow {
    shared: Arc<TcpShared>,
    events: mpsc::Sender<FlowEvent>,
    sink: FrameSink,
    write_lock: tokio::sync::Mutex<()>,
    read_timeout: Duration,
    segment_limit: usize,
}

impl TcpFlow {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.shared.key.src
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.shared.key.dst
    }

    pub fn key(&self) -> FlowKey {
        self.shared.key
    }

    pub fn state(&self) -> TcpState {
        self.shared.lock().state()
    }

    /// Reads buffered payload into `buf`.
    ///
    /// Waits until data arrives, the peer closes its side (`Ok(0)`), the flow dies
    /// ([`StackError::Closed`]) or the read timeout passes ([`StackError::Timeout`]).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StackError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let wait = async {
            loop {
                let notified = self.shared.readable.notified();
                {
                    let mut tcb = self.shared.lock();
                    let n = tcb.take(buf);
                    if n > 0 {
                        return Ok(n);
                    }
                    if tcb.fin_received() {
                        return Ok(0);
                    }
                    if tcb.state().is_terminal() || self.shared.cancel.is_cancelled() {
                        return Err(StackError::Closed);
                    }
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

    /// Sends `data` as PSH+ACK segments no larger than the MTU allows.
    pub async fn write(&self, data: &[u8]) -> Result<usize, StackError> {
        if self.shared.cancel.is_cancelled() {
            return Err(StackError::Closed);
        }
        let _guard = self.write_lock.lock().await;
        let segments = self
            .shared
            .lock()
            .write_segments(data, self.segment_limit)
            .map_err(|state| StackError::NotConnected { state })?;
        for segment in &segments {
            self.sink.send_tcp(&self.shared.key, segment).await?;
        }
        Ok(data.len())
    }

    /// Waits until the peer's window is open and returns how much one write should carry (at most
    /// one segment).
    pub async fn writable(&self) -> Result<usize, StackError> {
        loop {
            let notified = self.shared.writable.notified();
            let writable = self.shared.lock().writable(self.segment_limit);
            match writable {
                Ok(Some(n)) => return Ok(n),
                Ok(None) => {}
                Err(state) => return Err(StackError::NotConnected { state }),
            }
            if self.shared.cancel.is_cancelled() {
                return Err(StackError::Closed);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shared.cancel.cancelled() => {}
            }
        }
    }

    /// Starts an orderly close: FIN now, the flow disappears once the peer finishes its side.
    pub async fn close(&self) {
        let _ = self.events.send(FlowEvent::Close).await;
    }
}

impl Drop for TcpFlow {
    fn drop(&mut self) {
        let _ = self.events.try_send(FlowEvent::Close);
    }
}

impl fmt::Debug for TcpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tcb = self.shared.lock();
        f.debug_struct("TcpFlow")
            .field("key", &self.shared.key)
            .field("state", &tcb.state())
            .field("send_next", &tcb.send_next())
            .field("recv_next", &tcb.recv_next())
            .field("last_ack", &tcb.last_ack())
            .field("send_window", &tcb.send_window())
            .field("buffered", &tcb.buffered())
            .finish()
    }
}
