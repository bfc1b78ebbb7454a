use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tun2socks_packetlib::packet::ipv4::{IPV4_VERSION, MAX_DATAGRAM_LEN};
use tun2socks_packetlib::{
    Ipv4Header, Ipv4Packet, TcpFlags, TcpSegment, UdpDatagram, IPPROTO_TCP, IPPROTO_UDP,
};

use crate::config::StackConfig;
use crate::error::StackError;
use crate::reassembly::{run_sweeper, ReassemblyTable};
use crate::sink::{run_writer, FrameSink};
use crate::stats::StackStats;
use crate::table::{ConnectionTable, FlowKey};
use crate::tcp::{self, reset_for, TcpContext, TcpEntry, TcpFlow};
use crate::udp::{self, UdpContext, UdpEntry, UdpFlow};

/// First byte of an out-of-band frame that stops the reader. Never a valid IPv4/IPv6 version
/// nibble.
pub const STOP_MARKER: u8 = 0xff;

/// A userspace TCP/IP stack terminating the traffic of one captured interface.
///
/// Flows show up through [`NetStack::accept_tcp`] and [`NetStack::accept_udp`]. Dropping the
/// stack without calling [`NetStack::shutdown`] aborts its tasks without flushing.
pub struct NetStack {
    config: Arc<StackConfig>,
    stats: StackStats,
    sink: FrameSink,
    tcp_table: Arc<ConnectionTable<TcpEntry>>,
    udp_table: Arc<ConnectionTable<UdpEntry>>,
    reassembly: Arc<ReassemblyTable>,
    tcp_accept: tokio::sync::Mutex<mpsc::Receiver<TcpFlow>>,
    udp_accept: tokio::sync::Mutex<mpsc::Receiver<UdpFlow>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetStack {
    /// Validates `config` and starts the interface reader, the interface writer and the fragment
    /// sweeper on the current tokio runtime.
    pub fn start<D>(device: D, config: StackConfig) -> Result<Self, StackError>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let config = Arc::new(config);
        let stats = StackStats::new();
        let shutdown = CancellationToken::new();
        let (reader, writer) = tokio::io::split(device);

        let (frames_tx, frames_rx) = mpsc::channel(config.write_queue_depth);
        let sink = FrameSink::new(frames_tx, config.ttl, config.mtu);
        let tcp_table = Arc::new(ConnectionTable::new());
        let udp_table = Arc::new(ConnectionTable::new());
        let reassembly = Arc::new(ReassemblyTable::new(config.fragment_ttl_ticks));
        let (tcp_accept_tx, tcp_accept_rx) = mpsc::channel(config.accept_backlog);
        let (udp_accept_tx, udp_accept_rx) = mpsc::channel(config.accept_backlog);

        let reactor = Reactor {
            config: config.clone(),
            stats: stats.clone(),
            sink: sink.clone(),
            reassembly: reassembly.clone(),
            tcp: TcpContext {
                config: config.clone(),
                table: tcp_table.clone(),
                sink: sink.clone(),
                stats: stats.clone(),
                accept: tcp_accept_tx,
                shutdown: shutdown.clone(),
            },
            udp: UdpContext {
                config: config.clone(),
                table: udp_table.clone(),
                sink: sink.clone(),
                stats: stats.clone(),
                accept: udp_accept_tx,
                shutdown: shutdown.clone(),
            },
        };

        let tasks = vec![
            tokio::spawn(run_reader(reader, reactor, shutdown.clone())),
            tokio::spawn(run_writer(writer, frames_rx, stats.clone())),
            tokio::spawn(run_sweeper(
                reassembly.clone(),
                config.fragment_sweep_interval,
                stats.clone(),
                shutdown.clone(),
            )),
        ];
        info!(mtu = config.mtu, window = config.window, mss = config.mss, "net stack started");

        Ok(Self {
            config,
            stats,
            sink,
            tcp_table,
            udp_table,
            reassembly,
            tcp_accept: tokio::sync::Mutex::new(tcp_accept_rx),
            udp_accept: tokio::sync::Mutex::new(udp_accept_rx),
            shutdown,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    /// Waits for the next TCP flow to complete its handshake.
    pub async fn accept_tcp(&self) -> Result<TcpFlow, StackError> {
        let mut rx = self.tcp_accept.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(StackError::Closed),
            flow = rx.recv() => flow.ok_or(StackError::Closed),
        }
    }

    /// Waits for the first datagram of a new UDP flow.
    pub async fn accept_udp(&self) -> Result<UdpFlow, StackError> {
        let mut rx = self.udp_accept.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(StackError::Closed),
            flow = rx.recv() => flow.ok_or(StackError::Closed),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn stats(&self) -> StackStats {
        self.stats.clone()
    }

    pub fn tcp_flows(&self) -> usize {
        self.tcp_table.len()
    }

    pub fn udp_flows(&self) -> usize {
        self.udp_table.len()
    }

    pub fn pending_fragment_sets(&self) -> usize {
        self.reassembly.len()
    }

    /// `false` once the stack is shutting down, whether through [`NetStack::shutdown`], a stop
    /// marker or the interface going away.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stops the stack: closes the accept queues, closes every flow, gives in-flight frames
    /// `shutdown_grace` to reach the interface and then releases it. Later calls return at once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping net stack");
        self.shutdown.cancel();
        let tcp = self.tcp_table.clear_all();
        let udp = self.udp_table.clear_all();
        debug!(tcp, udp, "flows closed");

        tokio::time::sleep(self.config.shutdown_grace).await;
        self.sink.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "net stack task failed");
            }
        }
        info!("net stack stopped");
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Outcome of pulling one frame out of a read.
#[derive(Debug, PartialEq, Eq)]
enum Framed<'a> {
    Frame(&'a [u8]),
    Stop,
}

/// Takes the next IPv4 datagram off the front of `chunk`, the bytes of a single device read.
///
/// A TUN read yields exactly one frame; splitting by total length also handles writes that a
/// stream device coalesced. Nothing is carried into the next read: a non-IPv4 prefix, a malformed
/// header or a frame shorter than its total length ends the read and is counted as dropped, and
/// so is whatever follows it in the same read.
fn next_frame<'a>(chunk: &mut &'a [u8], stats: &StackStats) -> Option<Framed<'a>> {
    let data: &'a [u8] = chunk;
    let &first = data.first()?;
    *chunk = &[];
    if first == STOP_MARKER {
        return Some(Framed::Stop);
    }
    if first >> 4 != IPV4_VERSION {
        trace!(version = first >> 4, len = data.len(), "non-IPv4 frame dropped");
        stats.frame_dropped();
        return None;
    }
    if data.len() < Ipv4Header::LEN {
        debug!(len = data.len(), "truncated IPv4 header, frame dropped");
        stats.frame_dropped();
        return None;
    }
    let header_len = usize::from(first & 0x0f) * 4;
    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if header_len < Ipv4Header::LEN || total_len < header_len {
        debug!(header_len, total_len, "malformed IPv4 header, frame dropped");
        stats.frame_dropped();
        return None;
    }
    if data.len() < total_len {
        debug!(total_len, len = data.len(), "IPv4 frame shorter than its total length, dropped");
        stats.frame_dropped();
        return None;
    }
    let (frame, rest) = data.split_at(total_len);
    *chunk = rest;
    Some(Framed::Frame(frame))
}

async fn run_reader<R>(mut device: R, reactor: Reactor, shutdown: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    'read: loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = device.read(&mut buf) => match res {
                Ok(0) => {
                    info!("interface closed");
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "interface read failed, stopping");
                    break;
                }
            },
        };
        let mut chunk = &buf[..n];
        while let Some(framed) = next_frame(&mut chunk, &reactor.stats) {
            match framed {
                Framed::Frame(frame) => reactor.handle_frame(frame.to_vec()).await,
                Framed::Stop => {
                    info!("stop marker received");
                    break 'read;
                }
            }
        }
    }
    shutdown.cancel();
    debug!("interface reader stopped");
}

/// Demultiplexes inbound frames onto flows. Owned by the reader task.
struct Reactor {
    config: Arc<StackConfig>,
    stats: StackStats,
    sink: FrameSink,
    reassembly: Arc<ReassemblyTable>,
    tcp: TcpContext,
    udp: UdpContext,
}

impl Reactor {
    async fn handle_frame(&self, frame: Vec<u8>) {
        self.stats.frame_rx(frame.len());
        let packet = match Ipv4Header::parse(&frame).and_then(|h| Ipv4Packet::parse_body(h, &frame)) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(error = %err, len = frame.len(), "malformed IPv4 frame dropped");
                self.stats.frame_dropped();
                return;
            }
        };

        let packet = if packet.is_fragment() {
            self.stats.fragment_buffered();
            match self.reassembly.insert(packet) {
                Some(packet) => {
                    self.stats.datagram_reassembled();
                    packet
                }
                None => return,
            }
        } else {
            packet
        };

        match packet.protocol() {
            IPPROTO_TCP => self.handle_tcp(packet).await,
            IPPROTO_UDP => self.handle_udp(packet),
            protocol => {
                trace!(protocol, src = %packet.src(), dst = %packet.dst(), "unsupported protocol dropped");
                self.stats.frame_dropped();
            }
        }
    }

    async fn handle_tcp(&self, packet: Ipv4Packet) {
        if !TcpSegment::checksum_valid_ipv4(packet.src(), packet.dst(), &packet.payload) {
            debug!(src = %packet.src(), dst = %packet.dst(), "bad TCP checksum, segment dropped");
            self.stats.frame_dropped();
            return;
        }
        let segment = match TcpSegment::parse(&packet.payload) {
            Ok(segment) => segment,
            Err(err) => {
                debug!(error = %err, "malformed TCP segment dropped");
                self.stats.frame_dropped();
                return;
            }
        };
        let key = FlowKey::new(
            SocketAddrV4::new(packet.src(), segment.src_port),
            SocketAddrV4::new(packet.dst(), segment.dst_port),
        );
        trace!(
            flow = %key,
            flags = %segment.flags,
            seq = segment.seq_number,
            ack = segment.ack_number,
            len = segment.payload.len(),
            "tcp in"
        );

        if let Some(entry) = self.tcp.table.get(&key) {
            if !entry.deliver(segment) {
                trace!(flow = %key, "tcp flow queue full, segment dropped");
                self.stats.frame_dropped();
            }
            return;
        }

        if segment.has(TcpFlags::RST) {
            trace!(flow = %key, "reset for unknown flow ignored");
            return;
        }
        if !segment.has(TcpFlags::SYN) || segment.has(TcpFlags::ACK) {
            debug!(flow = %key, flags = %segment.flags, "segment for unknown flow, resetting");
            self.send_reset(&key, &segment).await;
            return;
        }
        let limit = self.config.max_tcp_flows;
        if !self.config.policy.allows(key.dst) || (limit != 0 && self.tcp.table.len() >= limit) {
            debug!(flow = %key, "tcp flow refused");
            self.stats.policy_denied();
            self.send_reset(&key, &segment).await;
            return;
        }
        if !tcp::open(&self.tcp, key, segment) {
            debug!(flow = %key, "tcp flow already registered");
        }
    }

    async fn send_reset(&self, key: &FlowKey, segment: &TcpSegment) {
        let rst = reset_for(segment, self.config.window);
        self.stats.tcp_reset_sent();
        if let Err(err) = self.sink.send_tcp(key, &rst).await {
            debug!(flow = %key, error = %err, "failed to send reset");
        }
    }

    fn handle_udp(&self, packet: Ipv4Packet) {
        if !UdpDatagram::checksum_valid_ipv4(packet.src(), packet.dst(), &packet.payload) {
            debug!(src = %packet.src(), dst = %packet.dst(), "bad UDP checksum, datagram dropped");
            self.stats.frame_dropped();
            return;
        }
        let datagram = match UdpDatagram::parse(&packet.payload) {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!(error = %err, "malformed UDP datagram dropped");
                self.stats.frame_dropped();
                return;
            }
        };
        let key = FlowKey::new(
            SocketAddrV4::new(packet.src(), datagram.src_port),
            SocketAddrV4::new(packet.dst(), datagram.dst_port),
        );
        trace!(flow = %key, len = datagram.payload.len(), "udp in");

        if let Some(entry) = self.udp.table.get(&key) {
            if !entry.deliver(datagram.payload) {
                trace!(flow = %key, "udp flow queue full, datagram dropped");
                self.stats.frame_dropped();
            }
            return;
        }

        let limit = self.config.max_udp_flows;
        if !self.config.policy.allows(key.dst) || (limit != 0 && self.udp.table.len() >= limit) {
            debug!(flow = %key, "udp flow refused");
            self.stats.policy_denied();
            return;
        }
        if !udp::open(&self.udp, key, datagram.payload) {
            self.stats.frame_dropped();
        }
    }
}
