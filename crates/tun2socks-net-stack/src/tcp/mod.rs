mod flow;
mod state;

pub use flow::TcpFlow;
pub use state::TcpState;

pub(crate) use flow::{open, TcpContext, TcpEntry};
pub(crate) use state::reset_for;
