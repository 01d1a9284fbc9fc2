use crate::bindings::*;
use crate::rdma::type_alias::RKey;

/// Remote memory region.
///
/// Only describes the peer's region and holds no local resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MrRemote {
    pub addr: u64,
    pub len: usize,
    pub rkey: RKey,
}

impl MrRemote {
    /// Describe a remote memory region.
    pub fn new(addr: u64, len: usize, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }

    /// Generate the [`rdma_t`] part of a one-sided work request targeting
    /// the start of this region.
    #[inline]
    pub(crate) fn as_rdma_t(&self) -> rdma_t {
        rdma_t {
            remote_addr: self.addr,
            rkey: self.rkey,
        }
    }
}
