use std::fmt;
use std::{io, mem};

use thiserror::Error;

use crate::bindings::*;
use crate::rdma::context::{query_gid, IbvContext};
use crate::rdma::gid::*;
use crate::rdma::type_alias::*;

/// Physical port information.
#[derive(Clone)]
pub struct Port {
    /// Index of this port.
    num: PortNum,

    /// Port attributes.
    attr: ibv_port_attr,

    /// GID table of this port.
    gids: Vec<Gid>,
}

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

/// Port query error type.
#[derive(Debug, Error)]
pub enum PortQueryError {
    /// The device has no port with this number.
    #[error("no such port: {0}")]
    NoSuchPort(PortNum),

    /// `libibverbs` interfaces returned an error when querying the port.
    #[error("ibv_query_port error")]
    Io(#[from] io::Error),
}

impl Port {
    /// Query the attributes and the GID table of an RDMA device's physical port.
    ///
    /// Reading the GID table stops at the first entry that cannot be queried.
    pub(crate) fn new(ctx: IbvContext, num: PortNum) -> Result<Self, PortQueryError> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed() };

        // SAFETY: FFI.
        let ret = unsafe { ___ibv_query_port(ctx.as_ptr(), num, &mut attr) };
        if ret != 0 {
            log::error!("cannot query port {}: errno {}", num, ret);
            return Err(io::Error::from_raw_os_error(ret).into());
        }

        let num_gids = attr.gid_tbl_len.clamp(0, GidIndex::MAX as i32 + 1);
        let mut gids = Vec::with_capacity(num_gids as usize);
        for i in 0..num_gids {
            match query_gid(ctx, num, i as GidIndex) {
                Ok(gid) => gids.push(gid),
                Err(e) => {
                    log::debug!("GID table of port {} truncated: {}", num, e);
                    break;
                }
            }
        }

        Ok(Self { num, attr, gids })
    }

    /// Get the index of this port.
    #[inline]
    pub fn num(&self) -> PortNum {
        self.num
    }

    /// Get the state of this port.
    #[inline]
    pub fn state(&self) -> PortState {
        match self.attr.state {
            ibv_port_state::IBV_PORT_DOWN => PortState::Down,
            ibv_port_state::IBV_PORT_INIT => PortState::Init,
            ibv_port_state::IBV_PORT_ARMED => PortState::Armed,
            ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
            ibv_port_state::IBV_PORT_ACTIVE_DEFER => PortState::ActiveDefer,
            _ => PortState::Nop,
        }
    }

    /// Get the LID of this port.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.attr.lid
    }

    /// Get the link layer protocol of this port.
    #[inline]
    pub fn link_layer(&self) -> PortLinkLayer {
        match self.attr.link_layer as i32 {
            IBV_LINK_LAYER_ETHERNET => PortLinkLayer::Ethernet,
            _ => PortLinkLayer::Infiniband,
        }
    }

    /// Get the active MTU of this port.
    #[inline]
    pub fn mtu(&self) -> Option<PortMtu> {
        PortMtu::from_raw(self.attr.active_mtu)
    }

    /// Get the GID table of this port.
    pub fn gids(&self) -> &[Gid] {
        &self.gids
    }
}

/// Port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Reserved value reported by some providers.
    Nop = ibv_port_state::IBV_PORT_NOP as _,

    /// Logical link is down. The physical link of the port isn't up.
    Down = ibv_port_state::IBV_PORT_DOWN as _,

    /// Logical link is Initializing.
    /// The physical link is up, but the SM hasn't configured the logical link yet.
    Init = ibv_port_state::IBV_PORT_INIT as _,

    /// Logical link is Armed.
    /// Only SM packets can be sent.
    Armed = ibv_port_state::IBV_PORT_ARMED as _,

    /// Logical link is Active.
    Active = ibv_port_state::IBV_PORT_ACTIVE as _,

    /// Logical link is Active Deferred, recovering from a physical failure.
    ActiveDefer = ibv_port_state::IBV_PORT_ACTIVE_DEFER as _,
}

/// Port link layer protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortLinkLayer {
    /// Infiniband.
    Infiniband,

    /// Ethernet (RoCE).
    Ethernet,
}

/// Path MTU size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortMtu {
    /// 256 bytes.
    Mtu256 = ibv_mtu::IBV_MTU_256 as _,

    /// 512 bytes.
    Mtu512 = ibv_mtu::IBV_MTU_512 as _,

    /// 1024 bytes.
    Mtu1024 = ibv_mtu::IBV_MTU_1024 as _,

    /// 2048 bytes.
    Mtu2048 = ibv_mtu::IBV_MTU_2048 as _,

    /// 4096 bytes.
    Mtu4096 = ibv_mtu::IBV_MTU_4096 as _,
}

impl PortMtu {
    /// Map the command-line MTU index (0 for 256 bytes up to 4 for 4096 bytes).
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Mtu256),
            1 => Some(Self::Mtu512),
            2 => Some(Self::Mtu1024),
            3 => Some(Self::Mtu2048),
            4 => Some(Self::Mtu4096),
            _ => None,
        }
    }

    /// Map an `ibv_mtu` value.
    pub fn from_raw(raw: ibv_mtu::Type) -> Option<Self> {
        match raw {
            ibv_mtu::IBV_MTU_256 => Some(Self::Mtu256),
            ibv_mtu::IBV_MTU_512 => Some(Self::Mtu512),
            ibv_mtu::IBV_MTU_1024 => Some(Self::Mtu1024),
            ibv_mtu::IBV_MTU_2048 => Some(Self::Mtu2048),
            ibv_mtu::IBV_MTU_4096 => Some(Self::Mtu4096),
            _ => None,
        }
    }

    /// Get the `ibv_mtu` value.
    #[inline]
    pub fn to_raw(self) -> ibv_mtu::Type {
        self as _
    }

    /// Get the MTU in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
            Self::Mtu2048 => 2048,
            Self::Mtu4096 => 4096,
        }
    }
}

impl fmt::Display for PortMtu {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_index_mapping() {
        let sizes = (0..5)
            .map(|i| PortMtu::from_index(i).unwrap().bytes())
            .collect::<Vec<_>>();
        assert_eq!(sizes, [256, 512, 1024, 2048, 4096]);
        assert_eq!(PortMtu::from_index(5), None);
    }

    #[test]
    fn mtu_raw_mapping() {
        for i in 0..5 {
            let mtu = PortMtu::from_index(i).unwrap();
            assert_eq!(PortMtu::from_raw(mtu.to_raw()), Some(mtu));
        }
        assert_eq!(PortMtu::Mtu256.to_raw(), ibv_mtu::IBV_MTU_256);
        assert_eq!(PortMtu::from_raw(0), None);
    }

    #[test]
    fn mtu_display() {
        assert_eq!(PortMtu::Mtu4096.to_string(), "4096B");
        assert_eq!(PortMtu::Mtu512.to_string(), "512B");
    }
}
