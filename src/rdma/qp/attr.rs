use crate::bindings::*;
use crate::rdma::gid::Gid;
use crate::rdma::nic::PortMtu;
use crate::rdma::type_alias::*;

/// Address vector of a remote port.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct AhAttr(ibv_ah_attr);

impl AhAttr {
    /// Hop limit of the global routing header.
    pub const HOP_LIMIT: u8 = 0xFF;

    /// Build a globally routed address vector towards `dgid`.
    pub fn global(dgid: Gid, sgid_index: GidIndex, port_num: PortNum, sl: ServiceLevel) -> Self {
        let mut attr = ibv_ah_attr::default();
        attr.grh.dgid = dgid.into();
        attr.grh.sgid_index = sgid_index;
        attr.grh.hop_limit = Self::HOP_LIMIT;
        attr.is_global = 1;
        attr.sl = sl;
        attr.port_num = port_num;
        Self(attr)
    }

    /// Get the destination GID.
    #[inline]
    pub fn dgid(&self) -> Gid {
        Gid::from(self.0.grh.dgid)
    }

    /// Get the local GID index.
    #[inline]
    pub fn sgid_index(&self) -> GidIndex {
        self.0.grh.sgid_index
    }

    /// Get the service level.
    #[inline]
    pub fn sl(&self) -> ServiceLevel {
        self.0.sl
    }

    /// Get the local port number.
    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.0.port_num
    }

    /// Get the underlying `ibv_ah_attr`.
    #[inline]
    pub(crate) fn as_raw(&self) -> ibv_ah_attr {
        self.0
    }
}

/// What a connected QP learns about its peer before entering RTR.
#[derive(Clone, Copy)]
pub struct QpConnectAttr {
    /// Address vector of the remote port.
    pub ah_attr: AhAttr,

    /// Remote QP number.
    pub dest_qpn: Qpn,

    /// Path MTU.
    pub path_mtu: PortMtu,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_address_vector() {
        let dgid: Gid = "fe80::1".parse().unwrap();
        let attr = AhAttr::global(dgid, 3, 1, 5);
        assert_eq!(attr.dgid(), dgid);
        assert_eq!(attr.sgid_index(), 3);
        assert_eq!(attr.port_num(), 1);
        assert_eq!(attr.sl(), 5);

        let raw = attr.as_raw();
        assert_eq!(raw.is_global, 1);
        assert_eq!(raw.grh.hop_limit, 0xFF);
        assert_eq!(raw.dlid, 0);
    }
}
