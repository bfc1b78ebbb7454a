#![forbid(unsafe_code)]

//! Wire codecs for the raw IPv4 traffic terminated by `tun2socks-net-stack`.
//!
//! Everything here is synchronous and allocation-light: parsers take a byte slice and return an
//! owned value (the stack keeps fragments and segments around across task boundaries), builders
//! recompute every length and checksum field on the way out.

pub mod packet;

pub use packet::checksum;
pub use packet::ipv4::{
    Ipv4Flags, Ipv4Header, Ipv4Option, Ipv4Packet, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};
pub use packet::tcp::{TcpFlags, TcpOption, TcpSegment};
pub use packet::udp::UdpDatagram;
pub use packet::PacketError;
