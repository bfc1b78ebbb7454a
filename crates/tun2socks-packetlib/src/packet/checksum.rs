//! RFC 1071 Internet checksum helpers.

use core::net::Ipv4Addr;

/// Adds `data` to a running one's-complement sum as big-endian 16-bit words.
///
/// An odd trailing byte is padded with a zero on the right. The result is not folded; pass it to
/// [`finalize`] once every region has been summed.
pub fn sum_words(initial: u32, data: &[u8]) -> u32 {
    let mut sum = initial;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Folds the carries of a running sum and returns its one's complement.
pub fn finalize(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    finalize(sum_words(0, data))
}

/// Checksum of an IPv4 header whose checksum field is zeroed.
///
/// Running this over a header that carries a correct checksum yields `0`.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// Partial sum of the IPv4 pseudo-header used by TCP and UDP.
pub fn pseudo_header_sum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let mut sum = sum_words(0, &src_ip.octets());
    sum = sum_words(sum, &dst_ip.octets());
    sum = sum.wrapping_add(protocol as u32);
    sum.wrapping_add(len as u32)
}

/// Transport checksum over pseudo-header + `segment`.
///
/// `segment` must contain the complete transport header and payload. When the checksum field
/// inside `segment` is zero this returns the value to store; when it already holds a valid
/// checksum this returns `0`.
pub fn transport_checksum_ipv4(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let initial = pseudo_header_sum(src_ip, dst_ip, protocol, segment.len() as u16);
    finalize(sum_words(initial, segment))
}
