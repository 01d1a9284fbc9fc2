use crate::bindings::*;

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Reset.
    Reset,

    /// Initialized.
    Init,

    /// Ready To Receive.
    Rtr,

    /// Ready To Send.
    Rts,

    /// Send Queue Drain.
    Sqd,

    /// Send Queue Error.
    Sqe,

    /// Error.
    Error,

    /// Unknown.
    Unknown,
}

impl From<ibv_qp_state::Type> for QpState {
    fn from(qp_state: ibv_qp_state::Type) -> Self {
        match qp_state {
            ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QpState::Init,
            ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
            ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
            ibv_qp_state::IBV_QPS_SQD => QpState::Sqd,
            ibv_qp_state::IBV_QPS_SQE => QpState::Sqe,
            ibv_qp_state::IBV_QPS_ERR => QpState::Error,
            _ => QpState::Unknown,
        }
    }
}
