//! The per-flow TCP state machine.
//!
//! [`TcpControlBlock`] is synchronous and owns no I/O: it consumes inbound segments and consumer
//! requests and answers with [`TcpAction`]s that the flow task carries out. Sequence and
//! acknowledgment checks are exact matches against `recv_next` / `send_next`; there is no
//! reordering, retransmission or congestion control.

use std::fmt;

use tracing::debug;
use tun2socks_packetlib::{TcpFlags, TcpSegment};

use crate::config::StackConfig;
use crate::table::FlowKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

impl TcpState {
    /// `TIME_WAIT` is terminal here: there is no 2MSL wait, the flow is dropped immediately.
    pub fn is_terminal(self) -> bool {
        matches!(self, TcpState::TimeWait | TcpState::Closed)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynReceived => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Closed => "CLOSED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TcpAction {
    /// A segment for the local sender.
    Emit(TcpSegment),
    /// The handshake completed; the flow goes onto the accept queue.
    Accept,
    /// Payload or end-of-stream became available to the consumer.
    WakeReader,
    /// A terminal state was reached; the flow leaves the table.
    Remove,
}

/// RST answering `segment` when no flow (or no valid state) accepts it.
///
/// The reset claims the sequence number the sender acknowledged and acknowledges everything the
/// sender sent (payload plus SYN/FIN), at least one sequence number.
pub(crate) fn reset_for(segment: &TcpSegment, window: u16) -> TcpSegment {
    let ack = segment.seq_number.wrapping_add(segment.seq_len().max(1));
    TcpSegment::rst(
        segment.dst_port,
        segment.src_port,
        segment.ack_number,
        ack,
        window,
    )
}

pub(crate) struct TcpControlBlock {
    key: FlowKey,
    state: TcpState,

    send_next: u32,
    recv_next: u32,
    last_ack: u32,

    /// Window advertised by the peer, consumed by our writes.
    send_window: u32,
    /// Payload not yet handed to the consumer. Its length shrinks the advertised window.
    recv_buffer: Vec<u8>,
    fin_received: bool,
    peer_mss: Option<u16>,

    window: u16,
    mss: u16,
    ack_data_segments: bool,
}

impl TcpControlBlock {
    pub(crate) fn new(key: FlowKey, initial_seq: u32, config: &StackConfig) -> Self {
        Self {
            key,
            state: TcpState::Listen,
            send_next: initial_seq,
            recv_next: 0,
            last_ack: 0,
            send_window: config.window as u32,
            recv_buffer: Vec::new(),
            fin_received: false,
            peer_mss: None,
            window: config.window,
            mss: config.mss,
            ack_data_segments: config.ack_data_segments,
        }
    }

    pub(crate) fn state(&self) -> TcpState {
        self.state
    }

    pub(crate) fn send_next(&self) -> u32 {
        self.send_next
    }

    pub(crate) fn recv_next(&self) -> u32 {
        self.recv_next
    }

    pub(crate) fn last_ack(&self) -> u32 {
        self.last_ack
    }

    pub(crate) fn send_window(&self) -> u32 {
        self.send_window
    }

    pub(crate) fn buffered(&self) -> usize {
        self.recv_buffer.len()
    }

    /// True once the peer's FIN was consumed; reads return end-of-stream after the buffer drains.
    pub(crate) fn fin_received(&self) -> bool {
        self.fin_received
    }

    fn advertised_window(&self) -> u16 {
        (self.window as usize).saturating_sub(self.recv_buffer.len()) as u16
    }

    fn valid_seq(&self, seg: &TcpSegment) -> bool {
        seg.seq_number == self.recv_next
    }

    fn valid_ack(&self, seg: &TcpSegment) -> bool {
        seg.ack_number == self.send_next
    }

    fn ack(&self) -> TcpAction {
        TcpAction::Emit(TcpSegment::ack(
            self.key.dst.port(),
            self.key.src.port(),
            self.send_next,
            self.recv_next,
            self.advertised_window(),
        ))
    }

    fn fin_ack(&self) -> TcpAction {
        TcpAction::Emit(TcpSegment::fin_ack(
            self.key.dst.port(),
            self.key.src.port(),
            self.send_next,
            self.recv_next,
            self.advertised_window(),
        ))
    }

    fn syn_ack(&self) -> TcpAction {
        TcpAction::Emit(TcpSegment::syn_ack(
            self.key.dst.port(),
            self.key.src.port(),
            self.send_next,
            self.recv_next,
            self.advertised_window(),
            self.mss,
        ))
    }

    fn rst(&self) -> TcpAction {
        TcpAction::Emit(TcpSegment::rst(
            self.key.dst.port(),
            self.key.src.port(),
            self.send_next,
            self.recv_next,
            self.window,
        ))
    }

    fn transition(&mut self, next: TcpState) {
        debug!(flow = %self.key, from = %self.state, to = %next, "tcp state");
        self.state = next;
    }

    /// Buffers as much of the payload as the advertised window allows. Returns `false` if some of
    /// it was cut off; the peer then gets an ACK for what was kept and must retransmit the rest.
    fn buffer_payload(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) -> bool {
        if seg.payload.is_empty() {
            return true;
        }
        let room = usize::from(self.advertised_window());
        let kept = seg.payload.len().min(room);
        if kept > 0 {
            self.recv_buffer.extend_from_slice(&seg.payload[..kept]);
            self.recv_next = self.recv_next.wrapping_add(kept as u32);
            out.push(TcpAction::WakeReader);
        }
        if kept < seg.payload.len() {
            debug!(
                flow = %self.key,
                len = seg.payload.len(),
                kept,
                "receive window exhausted, payload trimmed"
            );
            out.push(self.ack());
            return false;
        }
        true
    }

    fn consume_fin(&mut self, out: &mut Vec<TcpAction>) {
        self.recv_next = self.recv_next.wrapping_add(1);
        self.fin_received = true;
        out.push(TcpAction::WakeReader);
    }

    fn reset_by_peer(&mut self, out: &mut Vec<TcpAction>) {
        self.transition(TcpState::Closed);
        out.push(TcpAction::WakeReader);
        out.push(TcpAction::Remove);
    }

    /// Feeds one inbound segment through the state machine.
    pub(crate) fn on_segment(&mut self, seg: &TcpSegment) -> Vec<TcpAction> {
        self.send_window = seg.window_size as u32;
        if seg.has(TcpFlags::ACK) {
            self.last_ack = seg.ack_number;
        }

        let mut out = Vec::new();
        match self.state {
            TcpState::Listen => self.on_listen(seg, &mut out),
            TcpState::SynReceived => self.on_syn_received(seg, &mut out),
            TcpState::Established => self.on_established(seg, &mut out),
            TcpState::FinWait1 => self.on_fin_wait_1(seg, &mut out),
            TcpState::FinWait2 => self.on_fin_wait_2(seg, &mut out),
            TcpState::Closing => self.on_closing(seg, &mut out),
            TcpState::LastAck => self.on_last_ack(seg, &mut out),
            TcpState::TimeWait | TcpState::Closed => {}
        }
        out
    }

    fn on_listen(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) {
        if !seg.has(TcpFlags::SYN) || seg.has(TcpFlags::ACK) || seg.has(TcpFlags::RST) {
            debug!(flow = %self.key, flags = %seg.flags, "non-SYN segment in LISTEN ignored");
            return;
        }
        self.recv_next = seg.seq_number.wrapping_add(1);
        self.peer_mss = seg.mss();
        out.push(self.syn_ack());
        self.send_next = self.send_next.wrapping_add(1);
        self.transition(TcpState::SynReceived);
    }

    fn on_syn_received(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) {
        // A retransmitted SYN means our SYN+ACK went missing; answer it again.
        if seg.has(TcpFlags::SYN)
            && !seg.has(TcpFlags::ACK)
            && seg.seq_number.wrapping_add(1) == self.recv_next
        {
            self.send_next = self.send_next.wrapping_sub(1);
            out.push(self.syn_ack());
            self.send_next = self.send_next.wrapping_add(1);
            return;
        }

        if !self.valid_ack(seg) || !self.valid_seq(seg) {
            if !seg.has(TcpFlags::RST) {
                debug!(flow = %self.key, seq = seg.seq_number, ack = seg.ack_number, "invalid handshake segment, resetting");
                out.push(TcpAction::Emit(reset_for(seg, self.window)));
            }
            return;
        }
        if seg.has(TcpFlags::RST) || !seg.has(TcpFlags::ACK) {
            return;
        }

        let complete = self.buffer_payload(seg, out);
        self.transition(TcpState::Established);
        out.push(TcpAction::Accept);
        if complete && !seg.payload.is_empty() && self.ack_data_segments {
            out.push(self.ack());
        }
    }

    fn on_established(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) {
        if !self.valid_seq(seg) {
            out.push(self.ack());
            return;
        }
        if seg.has(TcpFlags::RST) {
            debug!(flow = %self.key, "reset by peer");
            self.reset_by_peer(out);
            return;
        }
        if !seg.has(TcpFlags::ACK) {
            out.push(self.ack());
            return;
        }

        if !self.buffer_payload(seg, out) {
            return;
        }
        if seg.has(TcpFlags::FIN) {
            self.consume_fin(out);
            out.push(self.fin_ack());
            self.send_next = self.send_next.wrapping_add(1);
            self.transition(TcpState::LastAck);
        } else if !seg.payload.is_empty() && self.ack_data_segments {
            out.push(self.ack());
        }
    }

    fn on_fin_wait_1(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) {
        if !self.valid_seq(seg) {
            return;
        }
        if seg.has(TcpFlags::RST) {
            self.reset_by_peer(out);
            return;
        }
        if !seg.has(TcpFlags::ACK) {
            return;
        }

        // Nothing we send from here on can piggyback an ACK, so data is acknowledged directly.
        if !self.buffer_payload(seg, out) {
            self.transition(TcpState::FinWait2);
            return;
        }
        if seg.has(TcpFlags::FIN) {
            self.consume_fin(out);
            out.push(self.ack());
            if self.valid_ack(seg) {
                self.transition(TcpState::TimeWait);
                out.push(TcpAction::Remove);
            } else {
                self.transition(TcpState::Closing);
            }
            return;
        }
        if !seg.payload.is_empty() {
            out.push(self.ack());
        }
        self.transition(TcpState::FinWait2);
    }

    fn on_fin_wait_2(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) {
        if !self.valid_ack(seg) || !self.valid_seq(seg) {
            return;
        }
        if seg.has(TcpFlags::RST) {
            self.reset_by_peer(out);
            return;
        }
        if !seg.has(TcpFlags::ACK) {
            return;
        }

        if !self.buffer_payload(seg, out) {
            return;
        }
        if seg.has(TcpFlags::FIN) {
            self.consume_fin(out);
            out.push(self.ack());
            self.transition(TcpState::TimeWait);
            out.push(TcpAction::Remove);
        } else if !seg.payload.is_empty() {
            out.push(self.ack());
        }
    }

    fn on_closing(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) {
        if !self.valid_ack(seg) || !self.valid_seq(seg) {
            return;
        }
        if seg.has(TcpFlags::RST) {
            self.reset_by_peer(out);
            return;
        }
        if seg.has(TcpFlags::ACK) {
            self.transition(TcpState::TimeWait);
            out.push(TcpAction::Remove);
        }
    }

    fn on_last_ack(&mut self, seg: &TcpSegment, out: &mut Vec<TcpAction>) {
        if !self.valid_ack(seg) || !self.valid_seq(seg) {
            return;
        }
        if seg.has(TcpFlags::RST) {
            self.reset_by_peer(out);
            return;
        }
        if seg.has(TcpFlags::ACK) {
            self.transition(TcpState::Closed);
            out.push(TcpAction::Remove);
        }
    }

    /// Active close requested by the consumer.
    pub(crate) fn close(&mut self) -> Vec<TcpAction> {
        let mut out = Vec::new();
        match self.state {
            TcpState::Established => {
                out.push(self.fin_ack());
                self.send_next = self.send_next.wrapping_add(1);
                self.transition(TcpState::FinWait1);
            }
            TcpState::Listen | TcpState::SynReceived => self.abort(&mut out),
            _ => {}
        }
        out
    }

    /// No segment arrived within the idle timeout.
    ///
    /// An established flow starts an orderly close; a flow stuck anywhere else is reset.
    pub(crate) fn on_idle_timeout(&mut self) -> Vec<TcpAction> {
        match self.state {
            TcpState::Established => self.close(),
            TcpState::TimeWait | TcpState::Closed => Vec::new(),
            _ => {
                let mut out = Vec::new();
                self.abort(&mut out);
                out
            }
        }
    }

    /// Drops the flow at once, resetting the peer unless no SYN was seen yet.
    pub(crate) fn reset(&mut self) -> Vec<TcpAction> {
        let mut out = Vec::new();
        if !self.state.is_terminal() {
            self.abort(&mut out);
        }
        out
    }

    fn abort(&mut self, out: &mut Vec<TcpAction>) {
        if self.state != TcpState::Listen {
            out.push(self.rst());
        }
        self.transition(TcpState::Closed);
        out.push(TcpAction::WakeReader);
        out.push(TcpAction::Remove);
    }

    /// Largest payload for one outbound segment given the MTU-derived `limit`.
    pub(crate) fn segment_limit(&self, limit: usize) -> usize {
        self.peer_mss
            .map_or(limit, |mss| limit.min(mss as usize))
            .max(1)
    }

    /// How much may be written right now: `Ok(None)` while the peer window is closed.
    pub(crate) fn writable(&self, limit: usize) -> Result<Option<usize>, TcpState> {
        if self.state != TcpState::Established {
            return Err(self.state);
        }
        if self.send_window == 0 {
            return Ok(None);
        }
        Ok(Some((self.send_window as usize).min(self.segment_limit(limit))))
    }

    /// Splits `data` into PSH+ACK segments and advances `send_next` past them.
    ///
    /// The tracked peer window is consumed but never blocks; if it would underflow it is reset to
    /// the configured window.
    pub(crate) fn write_segments(&mut self, data: &[u8], limit: usize) -> Result<Vec<TcpSegment>, TcpState> {
        if self.state != TcpState::Established {
            return Err(self.state);
        }
        let limit = self.segment_limit(limit);
        let mut segments = Vec::with_capacity(data.len().div_ceil(limit));
        for chunk in data.chunks(limit) {
            segments.push(TcpSegment::psh_ack(
                self.key.dst.port(),
                self.key.src.port(),
                self.send_next,
                self.recv_next,
                self.advertised_window(),
                chunk.to_vec(),
            ));
            self.send_next = self.send_next.wrapping_add(chunk.len() as u32);
            self.send_window = self
                .send_window
                .checked_sub(chunk.len() as u32)
                .unwrap_or(self.window as u32);
        }
        Ok(segments)
    }

    /// Moves buffered payload into `buf`, reopening the advertised window.
    pub(crate) fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.recv_buffer.len());
        buf[..n].copy_from_slice(&self.recv_buffer[..n]);
        self.recv_buffer.drain(..n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    const ISN: u32 = 5000;
    const PEER_PORT: u16 = 40000;
    const SERVICE_PORT: u16 = 80;

    fn key() -> FlowKey {
        FlowKey::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), PEER_PORT),
            SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), SERVICE_PORT),
        )
    }

    fn tcb_with(config: &StackConfig) -> TcpControlBlock {
        TcpControlBlock::new(key(), ISN, config)
    }

    fn tcb() -> TcpControlBlock {
        tcb_with(&StackConfig::default())
    }

    fn seg(flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> TcpSegment {
        let mut s = TcpSegment::ack(PEER_PORT, SERVICE_PORT, seq, ack, 64240);
        s.flags = flags;
        s.payload = payload.to_vec();
        s
    }

    fn emitted(actions: &[TcpAction]) -> Vec<&TcpSegment> {
        actions
            .iter()
            .filter_map(|a| match a {
                TcpAction::Emit(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn established() -> TcpControlBlock {
        let mut tcb = tcb();
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 1, b""));
        assert_eq!(tcb.state(), TcpState::Established);
        tcb
    }

    #[test]
    fn syn_in_listen_answers_syn_ack() {
        let mut tcb = tcb();
        let mut syn = seg(TcpFlags::SYN, 1000, 0, b"");
        syn.options.push(tun2socks_packetlib::TcpOption::mss(1200));
        let actions = tcb.on_segment(&syn);

        assert_eq!(tcb.state(), TcpState::SynReceived);
        let out = emitted(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(out[0].seq_number, ISN);
        assert_eq!(out[0].ack_number, 1001);
        assert_eq!(out[0].mss(), Some(1460));
        assert_eq!(out[0].src_port, SERVICE_PORT);
        assert_eq!(out[0].dst_port, PEER_PORT);
        assert_eq!(tcb.send_next(), ISN + 1);
        assert_eq!(tcb.segment_limit(1460), 1200);
    }

    #[test]
    fn valid_ack_establishes_and_accepts_once() {
        let mut tcb = tcb();
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        let actions = tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 1, b""));
        assert_eq!(tcb.state(), TcpState::Established);
        assert_eq!(actions, vec![TcpAction::Accept]);

        let again = tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 1, b""));
        assert!(!again.contains(&TcpAction::Accept));
    }

    #[test]
    fn handshake_ack_with_payload_is_buffered() {
        let mut tcb = tcb();
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        let actions = tcb.on_segment(&seg(TcpFlags::ACK | TcpFlags::PSH, 1001, ISN + 1, b"GET"));
        assert!(actions.contains(&TcpAction::Accept));
        assert!(actions.contains(&TcpAction::WakeReader));
        assert_eq!(tcb.recv_next(), 1004);
        assert_eq!(tcb.buffered(), 3);
    }

    #[test]
    fn invalid_handshake_ack_is_reset() {
        let mut tcb = tcb();
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        let actions = tcb.on_segment(&seg(TcpFlags::ACK, 1001, 77, b""));
        assert_eq!(tcb.state(), TcpState::SynReceived);
        let out = emitted(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(out[0].seq_number, 77);
        assert_eq!(out[0].ack_number, 1002);

        // An invalid RST is not answered.
        let actions = tcb.on_segment(&seg(TcpFlags::RST, 1001, 77, b""));
        assert!(actions.is_empty());
    }

    #[test]
    fn retransmitted_syn_repeats_syn_ack() {
        let mut tcb = tcb();
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        let actions = tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        let out = emitted(&actions);
        assert_eq!(out[0].flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(out[0].seq_number, ISN);
        assert_eq!(tcb.send_next(), ISN + 1);
        assert_eq!(tcb.state(), TcpState::SynReceived);
    }

    #[test]
    fn in_order_data_is_buffered_without_ack() {
        let mut tcb = established();
        let actions = tcb.on_segment(&seg(TcpFlags::ACK | TcpFlags::PSH, 1001, ISN + 1, b"hi"));
        assert_eq!(actions, vec![TcpAction::WakeReader]);
        assert_eq!(tcb.recv_next(), 1003);

        let mut buf = [0u8; 8];
        assert_eq!(tcb.take(&mut buf), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(tcb.buffered(), 0);
    }

    #[test]
    fn data_can_be_acked_eagerly() {
        let config = StackConfig {
            ack_data_segments: true,
            ..StackConfig::default()
        };
        let mut tcb = tcb_with(&config);
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 1, b""));
        let actions = tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 1, b"abcd"));
        let out = emitted(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ack_number, 1005);
        assert_eq!(out[0].window_size, 65535 - 4);
    }

    #[test]
    fn out_of_order_segment_gets_duplicate_ack() {
        let mut tcb = established();
        tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 1, b"hi"));
        let actions = tcb.on_segment(&seg(TcpFlags::ACK, 2000, ISN + 1, b"later"));
        assert_eq!(tcb.recv_next(), 1003);
        let out = emitted(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flags, TcpFlags::ACK);
        assert_eq!(out[0].ack_number, 1003);
        assert_eq!(out[0].seq_number, ISN + 1);
        assert_eq!(tcb.buffered(), 2);
    }

    #[test]
    fn every_segment_updates_peer_window() {
        let mut tcb = established();
        let mut s = seg(TcpFlags::ACK, 9999, ISN + 1, b"");
        s.window_size = 0;
        tcb.on_segment(&s);
        assert_eq!(tcb.send_window(), 0);
        assert_eq!(tcb.writable(1460), Ok(None));
        assert_eq!(tcb.last_ack(), ISN + 1);
    }

    #[test]
    fn passive_close_goes_through_last_ack() {
        let mut tcb = established();
        let actions = tcb.on_segment(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, ISN + 1, b""));
        assert_eq!(tcb.state(), TcpState::LastAck);
        assert!(tcb.fin_received());
        let out = emitted(&actions);
        assert_eq!(out[0].flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(out[0].seq_number, ISN + 1);
        assert_eq!(out[0].ack_number, 1002);

        // A stale ACK does not finish the close.
        assert!(tcb.on_segment(&seg(TcpFlags::ACK, 1002, ISN + 1, b"")).is_empty());

        let actions = tcb.on_segment(&seg(TcpFlags::ACK, 1002, ISN + 2, b""));
        assert_eq!(tcb.state(), TcpState::Closed);
        assert_eq!(actions, vec![TcpAction::Remove]);
    }

    #[test]
    fn fin_with_payload_delivers_payload_first() {
        let mut tcb = established();
        let actions = tcb.on_segment(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, ISN + 1, b"bye"));
        assert_eq!(tcb.recv_next(), 1005);
        assert_eq!(tcb.buffered(), 3);
        assert_eq!(emitted(&actions)[0].ack_number, 1005);
    }

    #[test]
    fn reset_in_established_closes() {
        let mut tcb = established();
        let actions = tcb.on_segment(&seg(TcpFlags::RST, 1001, 0, b""));
        assert_eq!(tcb.state(), TcpState::Closed);
        assert!(actions.contains(&TcpAction::Remove));
    }

    #[test]
    fn active_close_through_fin_wait_2() {
        let mut tcb = established();
        let out = tcb.close();
        assert_eq!(tcb.state(), TcpState::FinWait1);
        assert_eq!(emitted(&out)[0].flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(tcb.send_next(), ISN + 2);

        assert!(tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 2, b"")).is_empty());
        assert_eq!(tcb.state(), TcpState::FinWait2);

        let actions = tcb.on_segment(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, ISN + 2, b""));
        assert_eq!(tcb.state(), TcpState::TimeWait);
        assert!(actions.contains(&TcpAction::Remove));
        assert_eq!(emitted(&actions)[0].ack_number, 1002);
    }

    #[test]
    fn fin_acking_our_fin_skips_to_time_wait() {
        let mut tcb = established();
        tcb.close();
        let actions = tcb.on_segment(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, ISN + 2, b""));
        assert_eq!(tcb.state(), TcpState::TimeWait);
        assert!(actions.contains(&TcpAction::Remove));
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let mut tcb = established();
        tcb.close();
        tcb.on_segment(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, ISN + 1, b""));
        assert_eq!(tcb.state(), TcpState::Closing);

        let actions = tcb.on_segment(&seg(TcpFlags::ACK, 1002, ISN + 2, b""));
        assert_eq!(tcb.state(), TcpState::TimeWait);
        assert_eq!(actions, vec![TcpAction::Remove]);
    }

    #[test]
    fn closing_twice_is_harmless() {
        let mut tcb = established();
        assert_eq!(tcb.close().len(), 1);
        assert!(tcb.close().is_empty());
        assert_eq!(tcb.state(), TcpState::FinWait1);
    }

    #[test]
    fn writes_are_chunked_and_consume_window() {
        let mut tcb = established();
        let data = vec![0x5a; 3000];
        let segs = tcb.write_segments(&data, 1460).unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].payload.len(), 1460);
        assert_eq!(segs[2].payload.len(), 80);
        assert!(segs.iter().all(|s| s.flags == TcpFlags::PSH | TcpFlags::ACK));
        assert_eq!(segs[1].seq_number, ISN + 1 + 1460);
        assert_eq!(tcb.send_next(), ISN + 1 + 3000);
        // The handshake ACK advertised 64240.
        assert_eq!(tcb.send_window(), 64240 - 3000);
    }

    #[test]
    fn window_underflow_resets_to_default() {
        let mut tcb = established();
        let mut s = seg(TcpFlags::ACK, 1001, ISN + 1, b"");
        s.window_size = 100;
        tcb.on_segment(&s);
        assert_eq!(tcb.writable(1460), Ok(Some(100)));
        tcb.write_segments(&[1u8; 200], 1460).unwrap();
        assert_eq!(tcb.send_window(), 65535);
    }

    #[test]
    fn writes_require_established() {
        let mut tcb = tcb();
        assert_eq!(tcb.write_segments(b"x", 1460), Err(TcpState::Listen));
        let mut tcb = established();
        tcb.close();
        assert_eq!(tcb.writable(1460), Err(TcpState::FinWait1));
    }

    #[test]
    fn idle_timeout_closes_gracefully_when_established() {
        let mut tcb = established();
        let out = tcb.on_idle_timeout();
        assert_eq!(tcb.state(), TcpState::FinWait1);
        assert_eq!(emitted(&out)[0].flags, TcpFlags::FIN | TcpFlags::ACK);

        let out = tcb.on_idle_timeout();
        assert_eq!(tcb.state(), TcpState::Closed);
        assert!(out.contains(&TcpAction::Remove));
    }

    #[test]
    fn idle_timeout_aborts_half_open_handshake() {
        let mut tcb = tcb();
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        let out = tcb.on_idle_timeout();
        assert_eq!(tcb.state(), TcpState::Closed);
        assert_eq!(emitted(&out)[0].flags, TcpFlags::RST | TcpFlags::ACK);
        assert!(out.contains(&TcpAction::Remove));
    }

    #[test]
    fn reset_aborts_established_flow() {
        let mut tcb = established();
        let out = tcb.reset();
        let rst = emitted(&out);
        assert_eq!(rst[0].flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(rst[0].seq_number, ISN + 1);
        assert_eq!(rst[0].ack_number, 1001);
        assert_eq!(tcb.state(), TcpState::Closed);
        assert!(tcb.reset().is_empty());
    }

    #[test]
    fn reset_mirrors_incoming_numbers() {
        let mut s = TcpSegment::ack(PEER_PORT, SERVICE_PORT, 7, 99, 1000);
        let rst = reset_for(&s, 65535);
        assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(rst.src_port, SERVICE_PORT);
        assert_eq!(rst.dst_port, PEER_PORT);
        assert_eq!(rst.seq_number, 99);
        assert_eq!(rst.ack_number, 8);
        assert_eq!(rst.window_size, 65535);

        s.payload = b"abc".to_vec();
        s.ack_number = 0;
        let rst = reset_for(&s, 65535);
        assert_eq!(rst.seq_number, 0);
        assert_eq!(rst.ack_number, 10);
    }

    #[test]
    fn reset_counts_syn_and_fin() {
        let mut s = seg(TcpFlags::SYN, 1000, 0, b"data");
        assert_eq!(reset_for(&s, 65535).ack_number, 1005);

        s.flags = TcpFlags::FIN | TcpFlags::ACK;
        s.payload.clear();
        assert_eq!(reset_for(&s, 65535).ack_number, 1001);
    }

    #[test]
    fn payload_beyond_receive_window_is_trimmed() {
        let config = StackConfig {
            window: 4000,
            ..StackConfig::default()
        };
        let mut tcb = tcb_with(&config);
        tcb.on_segment(&seg(TcpFlags::SYN, 1000, 0, b""));
        tcb.on_segment(&seg(TcpFlags::ACK, 1001, ISN + 1, b""));

        let chunk = [7u8; 1460];
        let mut seq = 1001u32;
        for _ in 0..2 {
            let actions = tcb.on_segment(&seg(TcpFlags::ACK | TcpFlags::PSH, seq, ISN + 1, &chunk));
            assert_eq!(actions, vec![TcpAction::WakeReader]);
            seq += 1460;
        }

        // Only 1080 bytes of room remain.
        let actions = tcb.on_segment(&seg(TcpFlags::ACK | TcpFlags::PSH, seq, ISN + 1, &chunk));
        assert_eq!(tcb.buffered(), 4000);
        assert_eq!(tcb.recv_next(), 1001 + 4000);
        let out = emitted(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ack_number, 1001 + 4000);
        assert_eq!(out[0].window_size, 0);

        // With the window closed nothing more is taken, and a FIN riding on cut data is not consumed.
        let actions = tcb.on_segment(&seg(
            TcpFlags::ACK | TcpFlags::FIN,
            1001 + 4000,
            ISN + 1,
            &chunk,
        ));
        assert_eq!(tcb.buffered(), 4000);
        assert!(!tcb.fin_received());
        assert_eq!(tcb.state(), TcpState::Established);
        assert_eq!(emitted(&actions)[0].window_size, 0);

        let mut buf = vec![0u8; 4000];
        assert_eq!(tcb.take(&mut buf), 4000);
        assert_eq!(tcb.advertised_window(), 4000);
    }
}
