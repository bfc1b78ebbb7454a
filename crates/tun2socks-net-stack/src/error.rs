use thiserror::Error;
use tun2socks_packetlib::PacketError;

use crate::tcp::TcpState;

/// Errors surfaced to the relay layer by [`crate::NetStack`] and its flows.
///
/// Anomalies in individual inbound frames never show up here; they are logged and dropped.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack or flow is closed")]
    Closed,

    #[error("operation timed out")]
    Timeout,

    #[error("flow is not connected (state {state})")]
    NotConnected { state: TcpState },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("interface I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet encoding failed: {0}")]
    Packet(#[from] PacketError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("MTU {0} out of range (68..=65535)")]
    MtuOutOfRange(usize),

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}
