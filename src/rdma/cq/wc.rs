use std::{fmt, mem};

use thiserror::Error;

use crate::bindings::*;
use crate::rdma::type_alias::*;

/// Opcode of a work completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// RDMA compare-and-swap request.
    CompSwap,
    /// RDMA fetch-and-add request.
    FetchAdd,
    /// Memory window bind request.
    BindMw,
    /// Receive request.
    Recv,
    /// Receive of an RDMA write with immediate data.
    RecvRdmaImm,
    /// Any opcode not listed above, such as vendor extensions.
    Other(u32),
}

impl From<ibv_wc_opcode::Type> for WcOpcode {
    fn from(opcode: ibv_wc_opcode::Type) -> Self {
        match opcode {
            ibv_wc_opcode::IBV_WC_SEND => Self::Send,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => Self::RdmaWrite,
            ibv_wc_opcode::IBV_WC_RDMA_READ => Self::RdmaRead,
            ibv_wc_opcode::IBV_WC_COMP_SWAP => Self::CompSwap,
            ibv_wc_opcode::IBV_WC_FETCH_ADD => Self::FetchAdd,
            ibv_wc_opcode::IBV_WC_BIND_MW => Self::BindMw,
            ibv_wc_opcode::IBV_WC_RECV => Self::Recv,
            ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => Self::RecvRdmaImm,
            other => Self::Other(other as u32),
        }
    }
}

/// Status of a work completion.
///
/// Every variant but [`WcStatus::Success`] is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// The work request and its buffers are done with.
    #[error("success")]
    Success,

    /// A message exceeded the port's maximum message size, or a receive
    /// buffer was too small for the incoming message.
    #[error("local length error")]
    LocLenErr,

    /// The QP detected an internal inconsistency, e.g., an opcode its
    /// transport does not support.
    #[error("local QP operation error")]
    LocQpOpErr,

    /// EE context inconsistency. Only relevant to RD QPs.
    #[error("local EE context operation error")]
    LocEecOpErr,

    /// A local SGE does not reference a memory region valid for the operation.
    #[error("local protection error")]
    LocProtErr,

    /// The request was outstanding when the QP entered the error state.
    #[error("WR flush error")]
    WrFlushErr,

    /// Binding a memory window failed.
    #[error("memory window bind error")]
    MwBindErr,

    /// The responder returned an unexpected transport opcode.
    #[error("bad response error")]
    BadRespErr,

    /// A protection error on a local buffer targeted by the remote side.
    #[error("local access error")]
    LocAccessErr,

    /// The responder rejected the request, e.g., because its QP lacks the
    /// required access flags.
    #[error("remote invalid request error")]
    RemInvReqErr,

    /// A protection error on the remote buffer of an RDMA or atomic operation.
    #[error("remote access error")]
    RemAccessErr,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr,

    /// No ACK or NAK from the remote side within the retry budget. Usually
    /// means wrong connection attributes or a vanished peer.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// The remote side kept answering RNR NAK, i.e., it posted no receive.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    /// RDD mismatch. Only relevant to RD QPs.
    #[error("local RDD violation error")]
    LocRddViolErr,

    /// Invalid incoming RD message. Only relevant to RD QPs.
    #[error("remote invalid RD request")]
    RemInvRdReqErr,

    /// The responder aborted the operation.
    #[error("remote aborted error")]
    RemAbortErr,

    /// Invalid EE context number. Only relevant to RD QPs.
    #[error("invalid EE context number")]
    InvEecnErr,

    /// Illegal operation for the EE context state. Only relevant to RD QPs.
    #[error("invalid EE context state error")]
    InvEecStateErr,

    /// Possibly unrecoverable error.
    #[error("fatal error")]
    FatalErr,

    /// A response timed out.
    #[error("response timeout error")]
    RespTimeoutErr,

    /// Any other error.
    #[error("general error")]
    GeneralErr,

    /// A status code this crate does not know about.
    #[error("unknown work completion status {0}")]
    Unknown(u32),
}

impl From<ibv_wc_status::Type> for WcStatus {
    fn from(status: ibv_wc_status::Type) -> Self {
        use ibv_wc_status::*;

        match status {
            IBV_WC_SUCCESS => Self::Success,
            IBV_WC_LOC_LEN_ERR => Self::LocLenErr,
            IBV_WC_LOC_QP_OP_ERR => Self::LocQpOpErr,
            IBV_WC_LOC_EEC_OP_ERR => Self::LocEecOpErr,
            IBV_WC_LOC_PROT_ERR => Self::LocProtErr,
            IBV_WC_WR_FLUSH_ERR => Self::WrFlushErr,
            IBV_WC_MW_BIND_ERR => Self::MwBindErr,
            IBV_WC_BAD_RESP_ERR => Self::BadRespErr,
            IBV_WC_LOC_ACCESS_ERR => Self::LocAccessErr,
            IBV_WC_REM_INV_REQ_ERR => Self::RemInvReqErr,
            IBV_WC_REM_ACCESS_ERR => Self::RemAccessErr,
            IBV_WC_REM_OP_ERR => Self::RemOpErr,
            IBV_WC_RETRY_EXC_ERR => Self::RetryExcErr,
            IBV_WC_RNR_RETRY_EXC_ERR => Self::RnrRetryExcErr,
            IBV_WC_LOC_RDD_VIOL_ERR => Self::LocRddViolErr,
            IBV_WC_REM_INV_RD_REQ_ERR => Self::RemInvRdReqErr,
            IBV_WC_REM_ABORT_ERR => Self::RemAbortErr,
            IBV_WC_INV_EECN_ERR => Self::InvEecnErr,
            IBV_WC_INV_EEC_STATE_ERR => Self::InvEecStateErr,
            IBV_WC_FATAL_ERR => Self::FatalErr,
            IBV_WC_RESP_TIMEOUT_ERR => Self::RespTimeoutErr,
            IBV_WC_GENERAL_ERR => Self::GeneralErr,
            other => Self::Unknown(other as u32),
        }
    }
}

/// Work completion entry.
///
/// Transparently wraps an `ibv_wc` polled from a completion queue.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Wc(pub ibv_wc);

unsafe impl Send for Wc {}
unsafe impl Sync for Wc {}

impl Wc {
    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.0.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        WcStatus::from(self.0.status)
    }

    /// Get the number of bytes transferred on success, or the failure status.
    #[inline]
    pub fn result(&self) -> Result<usize, WcStatus> {
        match self.status() {
            WcStatus::Success => Ok(self.bytes()),
            status => Err(status),
        }
    }

    /// Get the opcode of the completed work request.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        WcOpcode::from(self.0.opcode)
    }

    /// Get the number of bytes transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.0.byte_len as usize
    }

    /// Get the local QP number this completion belongs to.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.0.qp_num
    }
}

impl Default for Wc {
    /// Create a zeroed work completion entry.
    fn default() -> Self {
        // SAFETY: zero-initializing a POD type is safe.
        unsafe { mem::zeroed() }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .field("opcode", &self.opcode())
            .field("bytes", &self.bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wc(status: ibv_wc_status::Type, opcode: ibv_wc_opcode::Type, byte_len: u32) -> Wc {
        let mut wc = Wc::default();
        wc.0.status = status;
        wc.0.opcode = opcode;
        wc.0.byte_len = byte_len;
        wc
    }

    #[test]
    fn success_yields_byte_count() {
        let wc = wc(ibv_wc_status::IBV_WC_SUCCESS, ibv_wc_opcode::IBV_WC_RECV, 53);
        assert_eq!(wc.result(), Ok(53));
        assert_eq!(wc.opcode(), WcOpcode::Recv);
    }

    #[test]
    fn failure_yields_status() {
        let wc = wc(
            ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR,
            ibv_wc_opcode::IBV_WC_SEND,
            0,
        );
        assert_eq!(wc.result(), Err(WcStatus::RnrRetryExcErr));
        assert_eq!(wc.status().to_string(), "RNR retry counter exceeded");
    }

    #[test]
    fn status_mapping_covers_known_codes() {
        assert_eq!(
            WcStatus::from(ibv_wc_status::IBV_WC_WR_FLUSH_ERR),
            WcStatus::WrFlushErr
        );
        assert_eq!(
            WcStatus::from(ibv_wc_status::IBV_WC_GENERAL_ERR),
            WcStatus::GeneralErr
        );
        assert_eq!(WcStatus::from(1000), WcStatus::Unknown(1000));
        assert_eq!(WcOpcode::from(1000), WcOpcode::Other(1000));
    }
}
