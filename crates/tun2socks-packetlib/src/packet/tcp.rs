use core::net::Ipv4Addr;

use super::ipv4::IPPROTO_TCP;
use super::options::{self, MAX_OPTIONS_LEN};
use super::{checksum, ensure_len, ensure_out_buf_len, PacketError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x0001);
    pub const SYN: TcpFlags = TcpFlags(0x0002);
    pub const RST: TcpFlags = TcpFlags(0x0004);
    pub const PSH: TcpFlags = TcpFlags(0x0008);
    pub const ACK: TcpFlags = TcpFlags(0x0010);
    pub const URG: TcpFlags = TcpFlags(0x0020);
    pub const ECE: TcpFlags = TcpFlags(0x0040);
    pub const CWR: TcpFlags = TcpFlags(0x0080);
    pub const NS: TcpFlags = TcpFlags(0x0100);

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl core::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const NAMES: [(TcpFlags, &str); 9] = [
            (TcpFlags::NS, "NS"),
            (TcpFlags::CWR, "CWR"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

pub const TCP_OPT_MSS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl TcpOption {
    pub fn mss(mss: u16) -> Self {
        Self {
            kind: TCP_OPT_MSS,
            data: mss.to_be_bytes().to_vec(),
        }
    }

    pub fn nop() -> Self {
        Self {
            kind: options::OPT_NOP,
            data: Vec::new(),
        }
    }

    /// Size on the wire, including the kind and length bytes.
    pub fn len(&self) -> usize {
        options::encoded_len(self.kind, &self.data)
    }
}

/// An owned TCP segment.
///
/// Addresses are not part of the header; they are passed to [`TcpSegment::write`] for the
/// pseudo-header checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;

        let ns = (data[12] & 0x01) as u16;
        let options = options::parse_raw(&data[Self::MIN_HEADER_LEN..header_len])?
            .into_iter()
            .map(|(kind, data)| TcpOption {
                kind,
                data: data.to_vec(),
            })
            .collect();

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags((ns << 8) | data[13] as u16),
            window_size: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            options,
            payload: data[header_len..].to_vec(),
        })
    }

    /// Checks the checksum of a raw, unparsed segment.
    pub fn checksum_valid_ipv4(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, raw: &[u8]) -> bool {
        checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, raw) == 0
    }

    fn control(
        src_port: u16,
        dst_port: u16,
        seq_number: u32,
        ack_number: u32,
        flags: TcpFlags,
        window_size: u16,
    ) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            flags,
            window_size,
            checksum: 0,
            urgent_pointer: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// SYN+ACK advertising `mss`.
    pub fn syn_ack(
        src_port: u16,
        dst_port: u16,
        seq_number: u32,
        ack_number: u32,
        window_size: u16,
        mss: u16,
    ) -> Self {
        let mut seg = Self::control(
            src_port,
            dst_port,
            seq_number,
            ack_number,
            TcpFlags::SYN | TcpFlags::ACK,
            window_size,
        );
        seg.options.push(TcpOption::mss(mss));
        seg
    }

    pub fn ack(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, window_size: u16) -> Self {
        Self::control(src_port, dst_port, seq_number, ack_number, TcpFlags::ACK, window_size)
    }

    pub fn rst(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, window_size: u16) -> Self {
        Self::control(
            src_port,
            dst_port,
            seq_number,
            ack_number,
            TcpFlags::RST | TcpFlags::ACK,
            window_size,
        )
    }

    pub fn fin_ack(
        src_port: u16,
        dst_port: u16,
        seq_number: u32,
        ack_number: u32,
        window_size: u16,
    ) -> Self {
        Self::control(
            src_port,
            dst_port,
            seq_number,
            ack_number,
            TcpFlags::FIN | TcpFlags::ACK,
            window_size,
        )
    }

    /// A data segment carrying PSH+ACK.
    pub fn psh_ack(
        src_port: u16,
        dst_port: u16,
        seq_number: u32,
        ack_number: u32,
        window_size: u16,
        payload: Vec<u8>,
    ) -> Self {
        let mut seg = Self::control(
            src_port,
            dst_port,
            seq_number,
            ack_number,
            TcpFlags::PSH | TcpFlags::ACK,
            window_size,
        );
        seg.payload = payload;
        seg
    }

    pub fn has(&self, flag: TcpFlags) -> bool {
        self.flags.contains(flag)
    }

    /// The MSS option value, if present.
    pub fn mss(&self) -> Option<u16> {
        self.options
            .iter()
            .find(|o| o.kind == TCP_OPT_MSS && o.data.len() == 2)
            .map(|o| u16::from_be_bytes([o.data[0], o.data[1]]))
    }

    /// Sequence space consumed by this segment (payload plus one each for SYN and FIN).
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32
            + self.has(TcpFlags::SYN) as u32
            + self.has(TcpFlags::FIN) as u32
    }

    pub fn header_len(&self) -> Result<usize, PacketError> {
        let unpadded: usize = self.options.iter().map(TcpOption::len).sum();
        let padded = options::padded_len(unpadded);
        if padded > MAX_OPTIONS_LEN {
            return Err(PacketError::Malformed("TCP header too large"));
        }
        Ok(Self::MIN_HEADER_LEN + padded)
    }

    pub fn len(&self) -> Result<usize, PacketError> {
        Ok(self.header_len()? + self.payload.len())
    }

    /// Serializes the segment, recomputing data offset and checksum.
    pub fn write(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, out: &mut [u8]) -> Result<usize, PacketError> {
        let header_len = self.header_len()?;
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;

        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_number.to_be_bytes());

        let data_offset = (header_len / 4) as u8;
        let ns = if self.flags.contains(TcpFlags::NS) { 1u8 } else { 0u8 };
        out[12] = (data_offset << 4) | ns;
        out[13] = (self.flags.0 & 0xff) as u8;

        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[16..18].copy_from_slice(&0u16.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        options::write_raw(
            self.options.iter().map(|o| (o.kind, o.data.as_slice())),
            &mut out[Self::MIN_HEADER_LEN..header_len],
        )?;
        out[header_len..len].copy_from_slice(&self.payload);

        // Unlike UDP, TCP has no "checksum disabled" sentinel value; a computed checksum
        // of 0x0000 is valid and must be written as-is.
        let csum = checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, &out[..len]);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(len)
    }

    pub fn to_vec(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        let written = self.write(src_ip, dst_ip, &mut buf)?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ACK segment with NOP, NOP, timestamps and two payload bytes, taken from a capture.
    const CAPTURED: [u8; 34] = [
        0x96, 0x78, 0x00, 0x19, 0xfd, 0x13, 0x81, 0x84, 0x7e, 0x2c, 0xe9, 0xc1, 0x80, 0x10, 0x30,
        0x1f, 0x07, 0xfa, 0x00, 0x00, 0x01, 0x01, 0x08, 0x0a, 0xcc, 0xda, 0x89, 0x80, 0x2f, 0xfb,
        0xda, 0xa7, 0x45, 0x54,
    ];

    #[test]
    fn parses_captured_segment() {
        let seg = TcpSegment::parse(&CAPTURED).unwrap();
        assert_eq!(seg.src_port, 0x9678);
        assert_eq!(seg.dst_port, 25);
        assert_eq!(seg.seq_number, 0xfd13_8184);
        assert_eq!(seg.ack_number, 0x7e2c_e9c1);
        assert_eq!(seg.flags, TcpFlags::ACK);
        assert_eq!(seg.window_size, 0x301f);
        assert_eq!(seg.options.len(), 3);
        assert_eq!(seg.options[0], TcpOption::nop());
        assert_eq!(seg.options[2].kind, 8);
        assert_eq!(seg.options[2].data.len(), 8);
        assert_eq!(seg.payload, b"ET");
    }

    #[test]
    fn reencode_preserves_semantic_fields() {
        let src_ip = Ipv4Addr::new(10, 10, 10, 116);
        let dst_ip = Ipv4Addr::new(144, 34, 187, 237);
        let seg = TcpSegment::parse(&CAPTURED).unwrap();
        let bytes = seg.to_vec(src_ip, dst_ip).unwrap();
        assert_eq!(bytes.len(), CAPTURED.len());
        assert!(TcpSegment::checksum_valid_ipv4(src_ip, dst_ip, &bytes));

        let mut again = TcpSegment::parse(&bytes).unwrap();
        again.checksum = seg.checksum;
        assert_eq!(again, seg);
    }

    #[test]
    fn every_flag_bit_round_trips() {
        let src_ip = Ipv4Addr::new(192, 0, 2, 1);
        let dst_ip = Ipv4Addr::new(192, 0, 2, 2);
        let all = TcpFlags(0x01ff);
        let mut seg = TcpSegment::ack(1, 2, 3, 4, 5);
        seg.flags = all;
        let parsed = TcpSegment::parse(&seg.to_vec(src_ip, dst_ip).unwrap()).unwrap();
        assert_eq!(parsed.flags, all);
        assert!(parsed.has(TcpFlags::NS));
        assert!(parsed.has(TcpFlags::CWR));
        assert_eq!(parsed.flags.to_string(), "NS|CWR|ECE|URG|ACK|PSH|RST|SYN|FIN");
    }

    #[test]
    fn build_and_parse_syn_ack() {
        let src_ip = Ipv4Addr::new(192, 0, 2, 1);
        let dst_ip = Ipv4Addr::new(192, 0, 2, 2);
        let seg = TcpSegment::syn_ack(1000, 80, 1, 0, 1024, 1460);
        let bytes = seg.to_vec(src_ip, dst_ip).unwrap();
        assert_eq!(bytes[12] >> 4, 6);
        let parsed = TcpSegment::parse(&bytes).unwrap();
        assert_eq!(parsed.src_port, 1000);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.seq_number, 1);
        assert_eq!(parsed.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(parsed.mss(), Some(1460));
        assert_eq!(parsed.seq_len(), 1);
        assert!(TcpSegment::checksum_valid_ipv4(src_ip, dst_ip, &bytes));
    }

    #[test]
    fn rejects_bad_data_offset() {
        let mut short = CAPTURED;
        short[12] = 0x40;
        assert_eq!(
            TcpSegment::parse(&short),
            Err(PacketError::Malformed("TCP data offset < 5"))
        );

        let mut long = CAPTURED;
        long[12] = 0xf0;
        assert!(matches!(
            TcpSegment::parse(&long),
            Err(PacketError::Truncated { needed: 60, .. })
        ));

        assert!(TcpSegment::parse(&CAPTURED[..19]).is_err());
    }

    #[test]
    fn tcp_checksum_can_be_zero() {
        let src_ip = Ipv4Addr::new(10, 0, 0, 1);
        let dst_ip = Ipv4Addr::new(10, 0, 0, 2);

        // Pick a two-byte payload that forces the correct checksum to exactly 0x0000. (This is
        // valid for TCP; only UDP treats 0x0000 as a special "checksum disabled" marker.)
        let base = TcpSegment::ack(1, 2, 1, 0, 1024);
        let mut raw = base.to_vec(src_ip, dst_ip).unwrap();
        raw[16..18].copy_from_slice(&0u16.to_be_bytes());
        raw.extend_from_slice(&[0, 0]);
        let sum_folded = !checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, &raw);
        let payload_word = 0xffffu16.wrapping_sub(sum_folded);

        let mut seg = base;
        seg.payload = payload_word.to_be_bytes().to_vec();
        let bytes = seg.to_vec(src_ip, dst_ip).unwrap();
        let parsed = TcpSegment::parse(&bytes).unwrap();

        assert_eq!(parsed.checksum, 0);
        assert!(TcpSegment::checksum_valid_ipv4(src_ip, dst_ip, &bytes));
    }
}
