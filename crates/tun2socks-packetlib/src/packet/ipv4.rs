use core::net::Ipv4Addr;

use super::checksum::ipv4_header_checksum;
use super::options::{self, MAX_OPTIONS_LEN};
use super::{ensure_len, ensure_out_buf_len, PacketError};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const IPV4_VERSION: u8 = 4;
pub const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

/// The 3-bit flags field of the IPv4 header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ipv4Flags(pub u8);

impl Ipv4Flags {
    pub const RESERVED: Ipv4Flags = Ipv4Flags(0b100);
    pub const DONT_FRAGMENT: Ipv4Flags = Ipv4Flags(0b010);
    pub const MORE_FRAGMENTS: Ipv4Flags = Ipv4Flags(0b001);

    pub const fn empty() -> Self {
        Ipv4Flags(0)
    }

    pub fn contains(self, other: Ipv4Flags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn without(self, other: Ipv4Flags) -> Self {
        Ipv4Flags(self.0 & !other.0)
    }
}

impl core::ops::BitOr for Ipv4Flags {
    type Output = Ipv4Flags;

    fn bitor(self, rhs: Ipv4Flags) -> Self::Output {
        Ipv4Flags(self.0 | rhs.0)
    }
}

/// One entry of the IPv4 option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Option {
    /// Whether the option must be replicated into every fragment.
    pub copied: bool,
    pub class: u8,
    pub number: u8,
    pub data: Vec<u8>,
}

impl Ipv4Option {
    pub fn from_kind(kind: u8, data: &[u8]) -> Self {
        Self {
            copied: kind & 0x80 != 0,
            class: (kind >> 5) & 0x03,
            number: kind & 0x1f,
            data: data.to_vec(),
        }
    }

    pub fn kind(&self) -> u8 {
        ((self.copied as u8) << 7) | ((self.class & 0x03) << 5) | (self.number & 0x1f)
    }

    /// Size on the wire, including the kind and length bytes.
    pub fn len(&self) -> usize {
        options::encoded_len(self.kind(), &self.data)
    }
}

/// The fixed 20-byte part of an IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub dscp: u8,
    pub ecn: u8,
    pub total_len: u16,
    pub identification: u16,
    pub flags: Ipv4Flags,
    /// Offset of this fragment's payload in 8-byte units.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub header_checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub const LEN: usize = 20;

    /// Parses and structurally validates the fixed header.
    ///
    /// The version nibble is reported but not checked so callers can recognise out-of-band
    /// markers before rejecting non-IPv4 frames. The checksum is never verified.
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        ensure_len(buf, Self::LEN)?;
        let version = buf[0] >> 4;
        let ihl = buf[0] & 0x0f;
        if ihl < 5 {
            return Err(PacketError::Malformed("IPv4 header length < 5 words"));
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]);
        if (total_len as usize) < (ihl as usize) * 4 {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        let flags_fragment = u16::from_be_bytes([buf[6], buf[7]]);

        Ok(Self {
            version,
            ihl,
            dscp: buf[1] >> 2,
            ecn: buf[1] & 0x03,
            total_len,
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            flags: Ipv4Flags((flags_fragment >> 13) as u8),
            fragment_offset: flags_fragment & 0x1fff,
            ttl: buf[8],
            protocol: buf[9],
            header_checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        })
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn more_fragments(&self) -> bool {
        self.flags.contains(Ipv4Flags::MORE_FRAGMENTS)
    }

    /// Fragment offset in bytes.
    pub fn fragment_byte_offset(&self) -> usize {
        self.fragment_offset as usize * 8
    }
}

/// An owned IPv4 datagram: header, parsed options and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub header: Ipv4Header,
    pub options: Vec<Ipv4Option>,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    /// A fresh, unfragmented datagram with the DF bit set.
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        identification: u16,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header: Ipv4Header {
                version: IPV4_VERSION,
                ihl: 5,
                dscp: 0,
                ecn: 0,
                total_len: 0,
                identification,
                flags: Ipv4Flags::DONT_FRAGMENT,
                fragment_offset: 0,
                ttl,
                protocol,
                header_checksum: 0,
                src,
                dst,
            },
            options: Vec::new(),
            payload,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Ipv4Header::parse(buf)?;
        Self::parse_body(header, buf)
    }

    /// Parses options and payload of a frame whose fixed header was already parsed.
    ///
    /// `buf` is the complete frame. Bytes past the declared total length (link padding) are
    /// ignored.
    pub fn parse_body(header: Ipv4Header, buf: &[u8]) -> Result<Self, PacketError> {
        let header_len = header.header_len();
        let total_len = header.total_len as usize;
        ensure_len(buf, total_len)?;

        let options = options::parse_raw(&buf[Ipv4Header::LEN..header_len])?
            .into_iter()
            .map(|(kind, data)| Ipv4Option::from_kind(kind, data))
            .collect();

        Ok(Self {
            header,
            options,
            payload: buf[header_len..total_len].to_vec(),
        })
    }

    pub fn src(&self) -> Ipv4Addr {
        self.header.src
    }

    pub fn dst(&self) -> Ipv4Addr {
        self.header.dst
    }

    pub fn protocol(&self) -> u8 {
        self.header.protocol
    }

    pub fn identification(&self) -> u16 {
        self.header.identification
    }

    /// True for any piece of a fragmented datagram (MF set or non-zero offset).
    pub fn is_fragment(&self) -> bool {
        self.header.more_fragments() || self.header.fragment_offset != 0
    }

    /// Header length as it will be serialized (options padded to 32-bit words).
    pub fn header_len(&self) -> Result<usize, PacketError> {
        let unpadded: usize = self.options.iter().map(Ipv4Option::len).sum();
        let padded = options::padded_len(unpadded);
        if padded > MAX_OPTIONS_LEN {
            return Err(PacketError::Malformed("IPv4 options exceed 40 bytes"));
        }
        Ok(Ipv4Header::LEN + padded)
    }

    pub fn len(&self) -> Result<usize, PacketError> {
        let len = self.header_len()? + self.payload.len();
        if len > MAX_DATAGRAM_LEN {
            return Err(PacketError::TooLarge {
                len,
                max: MAX_DATAGRAM_LEN,
            });
        }
        Ok(len)
    }

    /// Serializes the datagram into `out`.
    ///
    /// Header length, total length and header checksum are recomputed from the actual options
    /// and payload; the stored values are ignored.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let header_len = self.header_len()?;
        let len = self.len()?;
        ensure_out_buf_len(out, len)?;

        let h = &self.header;
        out[0] = (h.version << 4) | (header_len / 4) as u8;
        out[1] = (h.dscp << 2) | (h.ecn & 0x03);
        out[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        out[4..6].copy_from_slice(&h.identification.to_be_bytes());
        let flags_fragment = ((h.flags.0 as u16 & 0x07) << 13) | (h.fragment_offset & 0x1fff);
        out[6..8].copy_from_slice(&flags_fragment.to_be_bytes());
        out[8] = h.ttl;
        out[9] = h.protocol;
        out[10..12].copy_from_slice(&0u16.to_be_bytes());
        out[12..16].copy_from_slice(&h.src.octets());
        out[16..20].copy_from_slice(&h.dst.octets());
        options::write_raw(
            self.options.iter().map(|o| (o.kind(), o.data.as_slice())),
            &mut out[Ipv4Header::LEN..header_len],
        )?;

        let csum = ipv4_header_checksum(&out[..header_len]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        out[header_len..len].copy_from_slice(&self.payload);
        Ok(len)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = vec![0u8; self.len()?];
        let written = self.write(&mut buf)?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }

    /// Splits the datagram into fragments that each serialize to at most `mtu` bytes.
    ///
    /// Every fragment shares the identification of `self`; all but the last carry the
    /// more-fragments flag and offsets advance by the fragment payload size / 8. Options without
    /// the copied flag only travel in the first fragment. A datagram that already fits is returned
    /// as-is.
    pub fn fragment(&self, mtu: usize) -> Result<Vec<Ipv4Packet>, PacketError> {
        if self.len()? <= mtu {
            return Ok(vec![self.clone()]);
        }
        let first_header_len = self.header_len()?;
        let copied: Vec<Ipv4Option> = self.options.iter().filter(|o| o.copied).cloned().collect();
        let rest_header_len = Ipv4Header::LEN
            + options::padded_len(copied.iter().map(Ipv4Option::len).sum::<usize>());

        let mut fragments = Vec::new();
        let mut payload = self.payload.as_slice();
        let mut offset = self.header.fragment_offset as usize;
        let last_more = self.header.more_fragments();

        while !payload.is_empty() {
            let header_len = if fragments.is_empty() {
                first_header_len
            } else {
                rest_header_len
            };
            let room = mtu.saturating_sub(header_len) & !7;
            if room == 0 {
                return Err(PacketError::Malformed("MTU too small to fragment"));
            }
            let take = room.min(payload.len());
            let (chunk, rest) = payload.split_at(take);
            let is_last = rest.is_empty();

            let mut header = self.header;
            header.flags = header
                .flags
                .without(Ipv4Flags::DONT_FRAGMENT)
                .without(Ipv4Flags::MORE_FRAGMENTS);
            if !is_last || last_more {
                header.flags = header.flags | Ipv4Flags::MORE_FRAGMENTS;
            }
            header.fragment_offset = u16::try_from(offset / 8)
                .ok()
                .filter(|o| *o <= 0x1fff)
                .ok_or(PacketError::Malformed("fragment offset overflow"))?;

            fragments.push(Ipv4Packet {
                header,
                options: if fragments.is_empty() {
                    self.options.clone()
                } else {
                    copied.clone()
                },
                payload: chunk.to_vec(),
            });

            offset += take;
            payload = rest;
        }

        Ok(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A captured TCP/IPv4 frame (ACK with a timestamp option, 2 bytes of payload).
    const CAPTURED: [u8; 54] = [
        0x45, 0x00, 0x00, 0x36, 0x83, 0x1c, 0x40, 0x00, 0x40, 0x06, 0x57, 0x18, 0x0a, 0x0a, 0x0a,
        0x74, 0x90, 0x22, 0xbb, 0xed, 0x96, 0x78, 0x00, 0x19, 0xfd, 0x13, 0x81, 0x84, 0x7e, 0x2c,
        0xe9, 0xc1, 0x80, 0x10, 0x30, 0x1f, 0x07, 0xfa, 0x00, 0x00, 0x01, 0x01, 0x08, 0x0a, 0xcc,
        0xda, 0x89, 0x80, 0x2f, 0xfb, 0xda, 0xa7, 0x45, 0x54,
    ];

    fn without_checksum(mut pkt: Ipv4Packet) -> Ipv4Packet {
        pkt.header.header_checksum = 0;
        pkt
    }

    #[test]
    fn parses_captured_header() {
        let pkt = Ipv4Packet::parse(&CAPTURED).unwrap();
        assert_eq!(pkt.header.version, 4);
        assert_eq!(pkt.header.ihl, 5);
        assert_eq!(pkt.header.total_len, 54);
        assert_eq!(pkt.header.identification, 0x831c);
        assert_eq!(pkt.header.flags, Ipv4Flags::DONT_FRAGMENT);
        assert_eq!(pkt.header.fragment_offset, 0);
        assert_eq!(pkt.header.ttl, 64);
        assert_eq!(pkt.protocol(), IPPROTO_TCP);
        assert_eq!(pkt.src(), Ipv4Addr::new(10, 10, 10, 116));
        assert_eq!(pkt.dst(), Ipv4Addr::new(144, 34, 187, 237));
        assert!(pkt.options.is_empty());
        assert_eq!(pkt.payload.len(), 34);
        assert!(!pkt.is_fragment());
    }

    #[test]
    fn reencode_preserves_semantic_fields() {
        let pkt = Ipv4Packet::parse(&CAPTURED).unwrap();
        let bytes = pkt.to_vec().unwrap();
        assert_eq!(ipv4_header_checksum(&bytes[..20]), 0);
        let again = Ipv4Packet::parse(&bytes).unwrap();
        assert_eq!(without_checksum(again), without_checksum(pkt));
    }

    #[test]
    fn options_recompute_header_length() {
        let mut pkt = Ipv4Packet::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IPPROTO_UDP,
            7,
            64,
            b"payload".to_vec(),
        );
        // Router alert (copied, class 0, number 20) with two data bytes.
        pkt.options.push(Ipv4Option::from_kind(0x94, &[0, 0]));
        pkt.options.push(Ipv4Option::from_kind(1, &[]));

        let bytes = pkt.to_vec().unwrap();
        assert_eq!(bytes[0] & 0x0f, 7);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 28 + 7);

        let parsed = Ipv4Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.options, pkt.options);
        assert!(parsed.options[0].copied);
        assert_eq!(parsed.options[0].number, 20);
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn rejects_structurally_invalid_headers() {
        assert!(matches!(
            Ipv4Packet::parse(&CAPTURED[..19]),
            Err(PacketError::Truncated { .. })
        ));

        let mut short_ihl = CAPTURED;
        short_ihl[0] = 0x44;
        assert!(matches!(
            Ipv4Header::parse(&short_ihl),
            Err(PacketError::Malformed(_))
        ));

        let mut short_total = CAPTURED;
        short_total[2..4].copy_from_slice(&16u16.to_be_bytes());
        assert!(matches!(
            Ipv4Header::parse(&short_total),
            Err(PacketError::Malformed(_))
        ));

        let mut long_total = CAPTURED;
        long_total[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            Ipv4Packet::parse(&long_total),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_link_padding_is_ignored() {
        let mut padded = CAPTURED.to_vec();
        padded.extend_from_slice(&[0; 6]);
        let pkt = Ipv4Packet::parse(&padded).unwrap();
        assert_eq!(pkt.payload.len(), 34);
    }

    #[test]
    fn fragments_share_identification_and_advance_offsets() {
        let payload: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
        let pkt = Ipv4Packet::new(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IPPROTO_UDP,
            0x4242,
            64,
            payload.clone(),
        );
        let frags = pkt.fragment(1500).unwrap();
        assert_eq!(frags.len(), 3);

        let mut joined = Vec::new();
        let mut expected_offset = 0u16;
        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag.identification(), 0x4242);
            assert!(frag.to_vec().unwrap().len() <= 1500);
            assert_eq!(frag.header.fragment_offset, expected_offset);
            assert_eq!(frag.header.more_fragments(), i + 1 < frags.len());
            assert!(!frag.header.flags.contains(Ipv4Flags::DONT_FRAGMENT));
            expected_offset += (frag.payload.len() / 8) as u16;
            joined.extend_from_slice(&frag.payload);
        }
        assert_eq!(frags[0].payload.len(), 1480);
        assert_eq!(joined, payload);
    }

    #[test]
    fn small_datagram_is_not_fragmented() {
        let pkt = Ipv4Packet::new(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IPPROTO_UDP,
            1,
            64,
            vec![0; 100],
        );
        assert_eq!(pkt.fragment(1500).unwrap(), vec![pkt]);
    }
}
