use std::mem;

use super::{Qp, QpCreationError, QpType};
use crate::bindings::*;
use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;
use crate::rdma::type_alias::PortNum;

/// Queue pair capability attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QpCaps {
    /// Outstanding work requests on the send queue, up to the device's
    /// `max_qp_wr`.
    pub max_send_wr: u32,

    /// Outstanding work requests on the receive queue, up to the device's
    /// `max_qp_wr`.
    pub max_recv_wr: u32,

    /// Scatter/gather entries per send work request, up to the device's
    /// `max_sge`.
    pub max_send_sge: u32,

    /// Scatter/gather entries per receive work request, up to the device's
    /// `max_sge`.
    pub max_recv_sge: u32,

    /// Largest message in bytes that may be posted inline. May be zero.
    pub max_inline_data: u32,
}

/// Queue pair builder.
#[derive(Clone)]
pub struct QpBuilder<'a> {
    /// Send completion queue for this QP.
    pub(super) send_cq: Option<&'a Cq>,

    /// Receive completion queue for this QP. Can be the same as the send CQ.
    pub(super) recv_cq: Option<&'a Cq>,

    /// Capabilities of this QP.
    pub(super) caps: QpCaps,

    /// Queue pair type.
    pub(super) qp_type: Option<QpType>,

    /// Whether to signal for all send work requests.
    pub(super) sq_sig_all: bool,

    /// Physical port the QP is bound to when brought up.
    pub(super) port_num: PortNum,
}

impl<'a> QpBuilder<'a> {
    /// Create a new queue pair builder bound to port 1.
    pub fn new() -> Self {
        Self {
            send_cq: None,
            recv_cq: None,
            caps: QpCaps::default(),
            qp_type: None,
            sq_sig_all: false,
            port_num: 1,
        }
    }

    /// Set the send completion queue for this QP.
    pub fn send_cq(mut self, send_cq: &'a Cq) -> Self {
        self.send_cq = Some(send_cq);
        self
    }

    /// Set the receive completion queue for this QP.
    pub fn recv_cq(mut self, recv_cq: &'a Cq) -> Self {
        self.recv_cq = Some(recv_cq);
        self
    }

    /// Set the capabilities of this QP.
    /// If not set, the QP will be unable to send or receive any work request.
    pub fn caps(mut self, caps: QpCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Set the type of this QP.
    pub fn qp_type(mut self, qp_type: QpType) -> Self {
        self.qp_type = Some(qp_type);
        self
    }

    /// Set whether to signal for all send work requests.
    pub fn sq_sig_all(mut self, sq_sig_all: bool) -> Self {
        self.sq_sig_all = sq_sig_all;
        self
    }

    /// Set the physical port used by the INIT transition.
    pub fn port_num(mut self, port_num: PortNum) -> Self {
        self.port_num = port_num;
        self
    }

    /// Build the queue pair on the given protection domain.
    pub fn build(self, pd: &Pd) -> Result<Qp, QpCreationError> {
        Qp::new(pd, self)
    }

    /// Check the mandatory fields and return the set attributes.
    pub(super) fn into_init_attr(self) -> Result<QpInitAttr, QpCreationError> {
        Ok(QpInitAttr {
            send_cq: self
                .send_cq
                .ok_or(QpCreationError::MissingField("send_cq"))?
                .clone(),
            recv_cq: self
                .recv_cq
                .ok_or(QpCreationError::MissingField("recv_cq"))?
                .clone(),
            caps: self.caps,
            qp_type: self.qp_type.ok_or(QpCreationError::MissingField("qp_type"))?,
            sq_sig_all: self.sq_sig_all,
            port_num: self.port_num,
        })
    }
}

impl Default for QpBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialization attributes of a queue pair.
pub(super) struct QpInitAttr {
    pub send_cq: Cq,
    pub recv_cq: Cq,
    pub caps: QpCaps,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
    pub port_num: PortNum,
}

impl QpInitAttr {
    /// Create an [`ibv_qp_init_attr`] from the attributes.
    pub fn to_init_attr(&self) -> ibv_qp_init_attr {
        ibv_qp_init_attr {
            send_cq: self.send_cq.as_raw(),
            recv_cq: self.recv_cq.as_raw(),
            cap: ibv_qp_cap {
                max_send_wr: self.caps.max_send_wr,
                max_recv_wr: self.caps.max_recv_wr,
                max_send_sge: self.caps.max_send_sge,
                max_recv_sge: self.caps.max_recv_sge,
                max_inline_data: self.caps.max_inline_data,
            },
            qp_type: self.qp_type.into(),
            sq_sig_all: self.sq_sig_all as i32,
            // SAFETY: POD type.
            ..unsafe { mem::zeroed() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_are_reported() {
        let err = QpBuilder::new().qp_type(QpType::Rc).into_init_attr();
        assert!(matches!(err, Err(QpCreationError::MissingField("send_cq"))));
    }

    #[test]
    fn builder_defaults() {
        let builder = QpBuilder::default();
        assert_eq!(builder.port_num, 1);
        assert!(!builder.sq_sig_all);
        assert_eq!(builder.caps, QpCaps::default());
    }
}
