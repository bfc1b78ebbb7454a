use core::net::Ipv4Addr;

use super::ipv4::IPPROTO_UDP;
use super::{checksum, ensure_len, ensure_out_buf_len, PacketError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload length as carried on the wire. Recomputed by [`UdpDatagram::write`].
    pub length: u16,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    pub const HEADER_LEN: usize = 8;

    pub fn new(src_port: u16, dst_port: u16, payload: Vec<u8>) -> Self {
        Self {
            src_port,
            dst_port,
            length: 0,
            checksum: 0,
            payload,
        }
    }

    /// Parses a datagram. Bytes past the declared length are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        let length = u16::from_be_bytes([data[4], data[5]]);
        if (length as usize) < Self::HEADER_LEN {
            return Err(PacketError::Malformed("UDP length < header length"));
        }
        ensure_len(data, length as usize)?;
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            length,
            checksum: u16::from_be_bytes([data[6], data[7]]),
            payload: data[Self::HEADER_LEN..length as usize].to_vec(),
        })
    }

    /// Checks the checksum of a raw datagram. A zero checksum means "not computed" and passes.
    pub fn checksum_valid_ipv4(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, raw: &[u8]) -> bool {
        if raw.len() < Self::HEADER_LEN {
            return false;
        }
        if raw[6] == 0 && raw[7] == 0 {
            return true;
        }
        checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_UDP, raw) == 0
    }

    pub fn len(&self) -> Result<usize, PacketError> {
        let len = Self::HEADER_LEN + self.payload.len();
        if len > u16::MAX as usize {
            return Err(PacketError::TooLarge {
                len,
                max: u16::MAX as usize,
            });
        }
        Ok(len)
    }

    pub fn write(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&(len as u16).to_be_bytes());
        out[6..8].copy_from_slice(&0u16.to_be_bytes());
        out[8..len].copy_from_slice(&self.payload);
        let mut csum = checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_UDP, &out[..len]);
        if csum == 0 {
            csum = 0xffff;
        }
        out[6..8].copy_from_slice(&csum.to_be_bytes());
        Ok(len)
    }

    pub fn to_vec(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        self.write(src_ip, dst_ip, &mut buf)?;
        Ok(buf)
    }
}
