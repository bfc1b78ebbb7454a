//! The write-back path to the interface.
//!
//! Every flow and the reactor hold a [`FrameSink`]; frames funnel through one bounded queue into a
//! single writer task, which serializes access to the device.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use tun2socks_packetlib::{Ipv4Packet, TcpSegment, UdpDatagram, IPPROTO_TCP, IPPROTO_UDP};

use crate::error::StackError;
use crate::stats::StackStats;
use crate::table::FlowKey;

#[derive(Debug)]
pub(crate) enum WriterMessage {
    Frame(Vec<u8>),
    /// Flush what is queued ahead of this message, then release the device.
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct FrameSink {
    tx: mpsc::Sender<WriterMessage>,
    ident: Arc<AtomicU16>,
    ttl: u8,
    mtu: usize,
}

impl FrameSink {
    pub(crate) fn new(tx: mpsc::Sender<WriterMessage>, ttl: u8, mtu: usize) -> Self {
        Self {
            tx,
            ident: Arc::new(AtomicU16::new(rand::random())),
            ttl,
            mtu,
        }
    }

    fn next_ident(&self) -> u16 {
        self.ident.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn send_frame(&self, frame: Vec<u8>) -> Result<(), StackError> {
        self.tx
            .send(WriterMessage::Frame(frame))
            .await
            .map_err(|_| StackError::Closed)
    }

    /// Sends `segment` back towards the local sender of `key`.
    pub(crate) async fn send_tcp(&self, key: &FlowKey, segment: &TcpSegment) -> Result<(), StackError> {
        let (src, dst) = (*key.dst.ip(), *key.src.ip());
        let body = segment.to_vec(src, dst)?;
        let packet = Ipv4Packet::new(src, dst, IPPROTO_TCP, self.next_ident(), self.ttl, body);
        trace!(
            flow = %key,
            flags = %segment.flags,
            seq = segment.seq_number,
            ack = segment.ack_number,
            len = segment.payload.len(),
            "tcp out"
        );
        self.send_frame(packet.to_vec()?).await
    }

    /// Sends `payload` back towards the local sender of `key`, fragmenting to the MTU.
    pub(crate) async fn send_udp(&self, key: &FlowKey, payload: &[u8]) -> Result<(), StackError> {
        let (src, dst) = (*key.dst.ip(), *key.src.ip());
        let body = UdpDatagram::new(key.dst.port(), key.src.port(), payload.to_vec()).to_vec(src, dst)?;
        let packet = Ipv4Packet::new(src, dst, IPPROTO_UDP, self.next_ident(), self.ttl, body);
        let fragments = packet.fragment(self.mtu)?;
        trace!(flow = %key, len = payload.len(), fragments = fragments.len(), "udp out");
        for fragment in fragments {
            self.send_frame(fragment.to_vec()?).await?;
        }
        Ok(())
    }

    /// Asks the writer task to finish. Frames queued before this call are still written.
    pub(crate) async fn shutdown(&self) {
        let _ = self.tx.send(WriterMessage::Shutdown).await;
    }
}

/// Drains the frame queue into `device` until shutdown or a write error.
pub(crate) async fn run_writer<W>(
    mut device: W,
    mut rx: mpsc::Receiver<WriterMessage>,
    stats: StackStats,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let frame = match msg {
            WriterMessage::Frame(frame) => frame,
            WriterMessage::Shutdown => break,
        };
        let res = async {
            device.write_all(&frame).await?;
            device.flush().await
        }
        .await;
        if let Err(err) = res {
            warn!(error = %err, len = frame.len(), "interface write failed, stopping writer");
            break;
        }
        stats.frame_tx(frame.len());
    }
    rx.close();
    if let Err(err) = device.shutdown().await {
        debug!(error = %err, "interface shutdown failed");
    }
    debug!("interface writer stopped");
}
