#![forbid(unsafe_code)]

//! A userspace TCP/IP stack for a captured TUN interface.
//!
//! Raw IPv4 frames read from the interface are reassembled and demultiplexed onto flows: TCP
//! flows are terminated locally by a minimal state machine, UDP flows are relayed per 4-tuple.
//! The relay layer above picks up flows from [`NetStack::accept_tcp`] and
//! [`NetStack::accept_udp`] and talks to them with plain `read`/`write` calls; everything written
//! to a flow goes back out through the interface as IPv4 frames.

mod config;
mod error;
mod policy;
mod reassembly;
mod sink;
mod stack;
mod stats;
mod table;
mod tcp;
mod udp;

pub use config::{StackConfig, MIN_MTU};
pub use error::{ConfigError, StackError};
pub use policy::{FlowPolicy, IpCidr};
pub use reassembly::{FragmentKey, ReassemblyTable};
pub use stack::{NetStack, STOP_MARKER};
pub use stats::{StackStats, StatsSnapshot};
pub use table::{ConnectionTable, FlowEntry, FlowKey};
pub use tcp::{TcpFlow, TcpState};
pub use udp::UdpFlow;
