//! Queue pair and related types.

mod attr;
mod builder;
mod op;
mod peer;
mod state;
mod ty;

use std::io::{self, ErrorKind};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::{fmt, mem};

use thiserror::Error;

pub use self::attr::*;
pub use self::builder::*;
pub use self::op::*;
pub use self::peer::*;
pub use self::state::*;
pub use self::ty::*;
use crate::bindings::*;
use crate::rdma::{context::Context, cq::Cq, mr::*, pd::Pd, type_alias::*};
use crate::utils::interop::*;

/// Wrapper for `*mut ibv_qp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvQp(NonNull<ibv_qp>);

impl IbvQp {
    /// Destroy the QP.
    ///
    /// # Safety
    ///
    /// - A QP must not be destroyed more than once.
    /// - Destroyed QPs must not be used anymore.
    pub unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_qp(self.as_ptr());
        from_c_ret(ret)
    }

    /// Get the QP number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        // SAFETY: `self` points to a valid `ibv_qp` instance.
        unsafe { (*self.as_ptr()).qp_num }
    }

    /// Get the QP state as last set through `ibv_modify_qp`.
    #[inline]
    pub fn qp_state(&self) -> QpState {
        // SAFETY: `self` points to a valid `ibv_qp` instance.
        let state = unsafe { (*self.as_ptr()).state };
        state.into()
    }
}

impl_ibv_wrapper_traits!(ibv_qp, IbvQp);

/// Queue pair creation error type.
#[derive(Debug, Error)]
pub enum QpCreationError {
    /// `libibverbs` interfaces returned an error.
    #[error("I/O error from ibverbs")]
    IoError(#[from] io::Error),

    /// A mandatory builder field was not set.
    #[error("QP builder field `{0}` must be set")]
    MissingField(&'static str),

    /// Specified capabilities are not supported by the device.
    /// The three fields are for the capability name, the maximum supported
    /// value, and the required value.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(String, u32, u32),
}

/// Ownership holder of queue pair.
struct QpInner {
    pd: Pd,
    qp: IbvQp,
    init_attr: QpInitAttr,
}

impl Drop for QpInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        if let Err(e) = unsafe { self.qp.destroy() } {
            log::warn!("cannot destroy QP {} on drop: {}", self.qp.qp_num(), e);
        }
    }
}

/// Queue pair.
#[derive(Clone)]
pub struct Qp {
    /// Cached queue pair pointer.
    qp: IbvQp,

    /// Queue pair body.
    inner: Arc<QpInner>,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qp")
            .field("qpn", &self.qp_num())
            .field("type", &self.qp_type())
            .field("state", &self.state())
            .finish()
    }
}

impl Qp {
    /// Global initial packet sequence number.
    pub const GLOBAL_INIT_PSN: Psn = 0;

    /// QKey shared by every UD QP of this crate.
    pub const GLOBAL_QKEY: QKey = 0x1111_1111;

    /// Size of the global routing header prepended to UD receives.
    pub const GRH_SIZE: usize = 40;

    /// Create a new QP builder.
    pub fn builder<'a>() -> QpBuilder<'a> {
        Default::default()
    }

    /// Check whether the given capabilities are supported by the device.
    fn check_caps(ctx: &Context, caps: &QpCaps) -> Result<(), QpCreationError> {
        let attr = ctx.attr();
        let limits = [
            ("max_send_wr", attr.max_qp_wr, caps.max_send_wr),
            ("max_recv_wr", attr.max_qp_wr, caps.max_recv_wr),
            ("max_send_sge", attr.max_sge, caps.max_send_sge),
            ("max_recv_sge", attr.max_sge, caps.max_recv_sge),
        ];
        for (name, max, required) in limits {
            let max = max.max(0) as u32;
            if required > max {
                return Err(QpCreationError::CapabilityNotEnough(
                    name.to_owned(),
                    max,
                    required,
                ));
            }
        }
        Ok(())
    }

    /// Create a new queue pair with the given builder.
    pub(crate) fn new(pd: &Pd, builder: QpBuilder) -> Result<Self, QpCreationError> {
        let init_attr = builder.into_init_attr()?;
        Self::check_caps(pd.context(), &init_attr.caps)?;

        let mut raw_attr = init_attr.to_init_attr();
        // SAFETY: FFI.
        let qp = unsafe { ibv_create_qp(pd.as_raw(), &mut raw_attr) };
        let qp = NonNull::new(qp).ok_or_else(io::Error::last_os_error)?;
        let qp = IbvQp(qp);
        log::debug!(
            "created {} QP {} ({:?})",
            init_attr.qp_type,
            qp.qp_num(),
            init_attr.caps
        );

        Ok(Qp {
            qp,
            inner: Arc::new(QpInner {
                pd: pd.clone(),
                qp,
                init_attr,
            }),
        })
    }

    /// Get the underlying `ibv_qp` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_qp {
        self.qp.as_ptr()
    }

    /// Get the protection domain of the queue pair.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.inner.pd
    }

    /// Get the context of the queue pair.
    #[inline]
    pub fn context(&self) -> &Context {
        self.inner.pd.context()
    }

    /// Get the type of the queue pair.
    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.inner.init_attr.qp_type
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp.qp_num()
    }

    /// Get the current state of the queue pair.
    #[inline]
    pub fn state(&self) -> QpState {
        self.qp.qp_state()
    }

    /// Get the capabilities of this QP.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.inner.init_attr.caps
    }

    /// Get the physical port this QP is bound to.
    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.inner.init_attr.port_num
    }

    /// Get the associated send completion queue.
    #[inline]
    pub fn scq(&self) -> &Cq {
        &self.inner.init_attr.send_cq
    }

    /// Get the associated receive completion queue.
    #[inline]
    pub fn rcq(&self) -> &Cq {
        &self.inner.init_attr.recv_cq
    }
}

impl Qp {
    fn modify(&self, attr: &mut ibv_qp_attr, mask: ibv_qp_attr_mask) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { ibv_modify_qp(self.as_raw(), attr, mask.0 as i32) };
        from_c_ret(ret)
    }

    /// Modify the queue pair from RESET to INIT.
    pub fn to_init(&self) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut attr_mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT;
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.port_num();

        match self.qp_type() {
            QpType::Rc => {
                attr.qp_access_flags = Permission::default().into();
                attr_mask |= ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
            QpType::Ud => {
                attr.qkey = Self::GLOBAL_QKEY;
                attr_mask |= ibv_qp_attr_mask::IBV_QP_QKEY;
            }
        }

        self.modify(&mut attr, attr_mask)?;
        log::debug!("QP {} is now INIT", self.qp_num());
        Ok(())
    }

    /// Modify the queue pair from INIT to RTR.
    ///
    /// RC QPs need the peer's address vector and QP number; UD QPs take none.
    pub fn to_rtr(&self, peer: Option<&QpConnectAttr>) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut attr_mask = ibv_qp_attr_mask::IBV_QP_STATE;
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;

        match (self.qp_type(), peer) {
            (QpType::Rc, Some(peer)) => {
                attr.ah_attr = peer.ah_attr.as_raw();
                attr.path_mtu = peer.path_mtu.to_raw();
                attr.dest_qp_num = peer.dest_qpn;
                attr.rq_psn = Self::GLOBAL_INIT_PSN;
                attr.max_dest_rd_atomic = 1;
                attr.min_rnr_timer = 12;
                attr_mask |= ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
            }
            (QpType::Rc, None) => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "RC QP needs peer attributes to enter RTR",
                ));
            }
            (QpType::Ud, _) => {}
        }

        self.modify(&mut attr, attr_mask)?;
        log::debug!("QP {} is now RTR", self.qp_num());
        Ok(())
    }

    /// Modify the queue pair from RTR to RTS.
    pub fn to_rts(&self) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mut attr_mask = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN;
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = Self::GLOBAL_INIT_PSN;

        if self.qp_type() == QpType::Rc {
            attr.max_rd_atomic = 1;
            attr.timeout = 14;
            attr.retry_cnt = 6;
            attr.rnr_retry = 6;
            attr_mask |= ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY;
        }

        self.modify(&mut attr, attr_mask)?;
        log::debug!("QP {} is now RTS", self.qp_num());
        Ok(())
    }

    /// Bring the queue pair from RESET up to RTR.
    pub fn bring_up_rtr(&self, peer: Option<&QpConnectAttr>) -> io::Result<()> {
        self.to_init()?;
        self.to_rtr(peer)
    }

    /// Bring the queue pair from RESET up to RTS.
    pub fn bring_up_rts(&self, peer: Option<&QpConnectAttr>) -> io::Result<()> {
        self.bring_up_rtr(peer)?;
        self.to_rts()
    }
}

impl Qp {
    /// Explain [`ibv_post_recv`] errors.
    fn recv_err_explanation(ret: i32) -> Option<&'static str> {
        match ret {
            libc::EINVAL => Some("invalid work request"),
            libc::ENOMEM => {
                Some("recv queue is full, or not enough resources to complete this operation")
            }
            libc::EFAULT => Some("invalid QP"),
            _ => None,
        }
    }

    /// Explain [`ibv_post_send`] errors.
    fn send_err_explanation(ret: i32) -> Option<&'static str> {
        match ret {
            libc::EINVAL => Some("invalid work request"),
            libc::ENOMEM => {
                Some("send queue is full, or not enough resources to complete this operation")
            }
            libc::EFAULT => Some("invalid QP"),
            _ => None,
        }
    }

    fn check_sgl(local: &[MrSlice], max_sge: u32) -> io::Result<()> {
        if local.len() > max_sge as usize {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "{} SGEs exceed the QP limit of {}",
                    local.len(),
                    max_sge
                ),
            ));
        }
        Ok(())
    }

    /// Post a receive work request covering `local`.
    pub fn post_recv(&self, local: &[MrSlice], wr_id: WrId) -> io::Result<()> {
        Self::check_sgl(local, self.caps().max_recv_sge)?;
        let mut sgl = build_sgl(local);

        let mut wr = ibv_recv_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: if sgl.is_empty() {
                ptr::null_mut()
            } else {
                sgl.as_mut_ptr()
            },
            num_sge: sgl.len() as i32,
        };
        let ret = {
            let mut bad_wr = ptr::null_mut();
            // SAFETY: FFI.
            unsafe { ibv_post_recv(self.as_raw(), &mut wr, &mut bad_wr) }
        };
        from_c_ret_explained(ret, Self::recv_err_explanation)?;
        log::trace!("QP {} posted recv {} ({} SGEs)", self.qp_num(), wr_id, sgl.len());
        Ok(())
    }

    /// Post a signaled send work request carrying `op` with `local` as the
    /// local scatter/gather list.
    ///
    /// The target must match the QP type and the operation: RC takes
    /// [`SendTarget::Connected`] for SEND and [`SendTarget::Rdma`] for WRITE
    /// and READ, while UD takes [`SendTarget::Ud`] for SEND only.
    pub fn post_send(
        &self,
        local: &[MrSlice],
        op: SendOp,
        wr_id: WrId,
        target: SendTarget<'_>,
    ) -> io::Result<()> {
        let consistent = matches!(
            (self.qp_type(), op, target),
            (QpType::Rc, SendOp::Send, SendTarget::Connected)
                | (QpType::Rc, SendOp::Write | SendOp::Read, SendTarget::Rdma(_))
                | (QpType::Ud, SendOp::Send, SendTarget::Ud(_))
        );
        if !consistent {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "{} on a {} QP cannot use the given target",
                    op,
                    self.qp_type()
                ),
            ));
        }
        Self::check_sgl(local, self.caps().max_send_sge)?;
        let mut sgl = build_sgl(local);

        let mut wr = ibv_send_wr {
            wr_id,
            next: ptr::null_mut(),
            sg_list: if sgl.is_empty() {
                ptr::null_mut()
            } else {
                sgl.as_mut_ptr()
            },
            num_sge: sgl.len() as i32,
            opcode: op.to_raw(),
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED.0,
            // SAFETY: POD type.
            ..unsafe { mem::zeroed() }
        };
        match target {
            SendTarget::Connected => {}
            SendTarget::Ud(peer) => wr.wr.ud = peer.ud(),
            SendTarget::Rdma(remote) => wr.wr.rdma = remote.as_rdma_t(),
        }

        let ret = {
            let mut bad_wr = ptr::null_mut();
            // SAFETY: FFI.
            unsafe { ibv_post_send(self.as_raw(), &mut wr, &mut bad_wr) }
        };
        from_c_ret_explained(ret, Self::send_err_explanation)?;
        log::trace!("QP {} posted {} {} ({} SGEs)", self.qp_num(), op, wr_id, sgl.len());
        Ok(())
    }
}

/// Build the scatter/gather list of a work request.
fn build_sgl(local: &[MrSlice]) -> Vec<ibv_sge> {
    local.iter().copied().map(ibv_sge::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::tests::test_device;
    use crate::rdma::nic::PortMtu;

    struct Fixture {
        pd: Pd,
        cq: Cq,
    }

    fn fixture() -> Fixture {
        let ctx = Context::open(&test_device()).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 100).unwrap();
        Fixture { pd, cq }
    }

    fn build_qp(fx: &Fixture, qp_type: QpType) -> Qp {
        Qp::builder()
            .send_cq(&fx.cq)
            .recv_cq(&fx.cq)
            .caps(QpCaps {
                max_send_wr: 16,
                max_recv_wr: 16,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            })
            .qp_type(qp_type)
            .sq_sig_all(true)
            .build(&fx.pd)
            .unwrap()
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn rc_loopback_bring_up() {
        let fx = fixture();
        let a = build_qp(&fx, QpType::Rc);
        let b = build_qp(&fx, QpType::Rc);
        assert_eq!(a.state(), QpState::Reset);

        let gid = fx.pd.context().query_gid(1, 0).unwrap();
        let connect = |qpn| QpConnectAttr {
            ah_attr: AhAttr::global(gid, 0, 1, 0),
            dest_qpn: qpn,
            path_mtu: PortMtu::Mtu1024,
        };
        a.bring_up_rtr(Some(&connect(b.qp_num()))).unwrap();
        b.bring_up_rts(Some(&connect(a.qp_num()))).unwrap();
        assert_eq!(a.state(), QpState::Rtr);
        assert_eq!(b.state(), QpState::Rts);
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn inconsistent_targets_are_rejected() {
        let fx = fixture();
        let qp = build_qp(&fx, QpType::Ud);
        qp.bring_up_rts(None).unwrap();

        let mr = Mr::new(&fx.pd, 64, Permission::default()).unwrap();
        let remote = mr.as_remote();
        let err = qp
            .post_send(&[mr.as_slice()], SendOp::Write, 2, SendTarget::Rdma(&remote))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = qp
            .post_send(&[mr.as_slice(), mr.as_slice()], SendOp::Send, 2, SendTarget::Connected)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn rc_needs_peer_for_rtr() {
        let fx = fixture();
        let qp = build_qp(&fx, QpType::Rc);
        qp.to_init().unwrap();
        assert_eq!(qp.to_rtr(None).unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn capabilities_are_checked() {
        let fx = fixture();
        let max_sge = fx.pd.context().attr().max_sge as u32;
        let err = Qp::builder()
            .send_cq(&fx.cq)
            .recv_cq(&fx.cq)
            .caps(QpCaps {
                max_send_sge: max_sge + 1,
                ..Default::default()
            })
            .qp_type(QpType::Rc)
            .build(&fx.pd)
            .unwrap_err();
        assert!(matches!(err, QpCreationError::CapabilityNotEnough(name, _, _) if name == "max_send_sge"));
    }
}
