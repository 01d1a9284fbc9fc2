use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::QpPeer;
use crate::bindings::*;
use crate::rdma::mr::MrRemote;

/// Operation carried by a send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendOp {
    /// Two-sided send, consuming a receive posted by the peer.
    #[default]
    Send,

    /// One-sided RDMA write into the peer's memory region.
    Write,

    /// One-sided RDMA read from the peer's memory region.
    Read,
}

impl SendOp {
    /// Whether this is a one-sided operation that needs the peer's memory
    /// region address and rkey.
    #[inline]
    pub fn is_rdma(self) -> bool {
        self != Self::Send
    }

    /// Get the `ibv_wr_opcode` value.
    pub fn to_raw(self) -> ibv_wr_opcode::Type {
        match self {
            Self::Send => ibv_wr_opcode::IBV_WR_SEND,
            Self::Write => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            Self::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
        }
    }
}

impl fmt::Display for SendOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::Write => "write",
            Self::Read => "read",
        })
    }
}

/// Error parsing a [`SendOp`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation {0:?} (expected `send`, `write` or `read`)")]
pub struct ParseSendOpError(String);

impl FromStr for SendOp {
    type Err = ParseSendOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "send" => Ok(Self::Send),
            "write" => Ok(Self::Write),
            "read" => Ok(Self::Read),
            _ => Err(ParseSendOpError(s.to_owned())),
        }
    }
}

/// Destination of a send work request.
#[derive(Clone, Copy)]
pub enum SendTarget<'a> {
    /// The peer a connected QP is bound to. Only valid for SEND on RC.
    Connected,

    /// A datagram peer behind an address handle. Only valid for SEND on UD.
    Ud(&'a QpPeer),

    /// A remote memory region. Only valid for WRITE and READ on RC.
    Rdma(&'a MrRemote),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        for (s, op) in [
            ("send", SendOp::Send),
            ("write", SendOp::Write),
            ("Read", SendOp::Read),
        ] {
            assert_eq!(s.parse::<SendOp>(), Ok(op));
            assert_eq!(op.to_string(), s.to_lowercase());
        }
        assert!("atomic".parse::<SendOp>().is_err());
    }

    #[test]
    fn raw_opcodes() {
        assert_eq!(SendOp::Send.to_raw(), ibv_wr_opcode::IBV_WR_SEND);
        assert_eq!(SendOp::Write.to_raw(), ibv_wr_opcode::IBV_WR_RDMA_WRITE);
        assert_eq!(SendOp::Read.to_raw(), ibv_wr_opcode::IBV_WR_RDMA_READ);
        assert!(!SendOp::Send.is_rdma());
        assert!(SendOp::Read.is_rdma());
    }
}
