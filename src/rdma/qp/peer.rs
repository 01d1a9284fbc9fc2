use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use super::{AhAttr, Qp};
use crate::bindings::*;
use crate::rdma::pd::Pd;
use crate::rdma::type_alias::*;
use crate::utils::interop::from_c_ret;

struct QpPeerInner {
    /// Keeps the PD alive until the AH is destroyed.
    _pd: Pd,
    ah: NonNull<ibv_ah>,
    qpn: Qpn,
}

unsafe impl Send for QpPeerInner {}
unsafe impl Sync for QpPeerInner {}

impl Drop for QpPeerInner {
    fn drop(&mut self) {
        // SAFETY: FFI, and the AH is destroyed only once.
        let ret = unsafe { ibv_destroy_ah(self.ah.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("cannot destroy AH on drop: {}", e);
        }
    }
}

/// Datagram peer: an address handle plus the remote QP number.
#[derive(Clone)]
pub struct QpPeer {
    inner: Arc<QpPeerInner>,
}

impl fmt::Debug for QpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QpPeer")
            .field("ah", &self.inner.ah)
            .field("qpn", &self.inner.qpn)
            .finish()
    }
}

impl QpPeer {
    /// Create an address handle towards `ah_attr` on `pd` for the QP `qpn`.
    pub fn new(pd: &Pd, ah_attr: &AhAttr, qpn: Qpn) -> io::Result<Self> {
        let mut attr = ah_attr.as_raw();

        // SAFETY: FFI.
        let ah = unsafe { ibv_create_ah(pd.as_raw(), &mut attr) };
        let ah = NonNull::new(ah).ok_or_else(io::Error::last_os_error)?;
        log::debug!("created AH towards {} (qpn {})", ah_attr.dgid(), qpn);

        Ok(Self {
            inner: Arc::new(QpPeerInner {
                _pd: pd.clone(),
                ah,
                qpn,
            }),
        })
    }

    /// Get the remote QP number.
    #[inline]
    pub fn qpn(&self) -> Qpn {
        self.inner.qpn
    }

    /// Generate the [`ud_t`] part of a datagram send to this peer.
    #[inline]
    pub(crate) fn ud(&self) -> ud_t {
        ud_t {
            ah: self.inner.ah.as_ptr(),
            remote_qpn: self.inner.qpn,
            remote_qkey: Qp::GLOBAL_QKEY,
        }
    }
}
