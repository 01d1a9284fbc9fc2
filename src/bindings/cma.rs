//! Inline helpers of `<rdma/rdma_verbs.h>`, which bindgen cannot emit.
//!
//! All helpers operate on endpoints created by `rdma_create_ep` without an SRQ.

use std::ptr;

use libc::*;

use super::private::*;

/// Store a non-zero verbs return code into `errno` and return -1.
#[inline]
unsafe fn rdma_seterrno(ret: c_int) -> c_int {
    if ret != 0 {
        *__errno_location() = ret;
        -1
    } else {
        0
    }
}

/// Register a buffer for sends and receives on the endpoint's PD.
/// The region only allows local write access.
#[inline]
pub unsafe fn rdma_reg_msgs(id: *mut rdma_cm_id, addr: *mut c_void, length: usize) -> *mut ibv_mr {
    ibv_reg_mr(
        (*id).pd,
        addr,
        length,
        ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as c_int,
    )
}

/// Post a single-SGE receive on the endpoint's QP.
#[inline]
pub unsafe fn rdma_post_recv(
    id: *mut rdma_cm_id,
    context: *mut c_void,
    addr: *mut c_void,
    length: usize,
    mr: *mut ibv_mr,
) -> c_int {
    let mut sge = ibv_sge {
        addr: addr as u64,
        length: length as u32,
        lkey: (*mr).lkey,
    };
    let mut wr = ibv_recv_wr {
        wr_id: context as u64,
        next: ptr::null_mut(),
        sg_list: &mut sge,
        num_sge: 1,
    };
    let mut bad_wr = ptr::null_mut();
    rdma_seterrno(ibv_post_recv((*id).qp, &mut wr, &mut bad_wr))
}

/// Post a single-SGE send on the endpoint's QP.
/// `mr` may be null for inline sends.
#[inline]
pub unsafe fn rdma_post_send(
    id: *mut rdma_cm_id,
    context: *mut c_void,
    addr: *mut c_void,
    length: usize,
    mr: *mut ibv_mr,
    flags: c_uint,
) -> c_int {
    let mut sge = ibv_sge {
        addr: addr as u64,
        length: length as u32,
        lkey: if mr.is_null() { 0 } else { (*mr).lkey },
    };
    let mut wr = ibv_send_wr {
        wr_id: context as u64,
        next: ptr::null_mut(),
        sg_list: &mut sge,
        num_sge: 1,
        opcode: ibv_wr_opcode::IBV_WR_SEND,
        send_flags: flags,
        ..std::mem::zeroed()
    };
    let mut bad_wr = ptr::null_mut();
    rdma_seterrno(ibv_post_send((*id).qp, &mut wr, &mut bad_wr))
}

/// Wait for one completion on `cq`, arming the completion channel and
/// sleeping on it while the queue is empty.
///
/// Return 1 on a reaped completion, or -1 with `errno` set.
#[inline]
unsafe fn rdma_get_comp(
    id: *mut rdma_cm_id,
    cq: *mut ibv_cq,
    channel: *mut ibv_comp_channel,
    wc: *mut ibv_wc,
) -> c_int {
    let mut ret;
    loop {
        ret = ibv_poll_cq(cq, 1, wc);
        if ret != 0 {
            break;
        }

        ret = ibv_req_notify_cq(cq, 0);
        if ret != 0 {
            return rdma_seterrno(ret);
        }

        ret = ibv_poll_cq(cq, 1, wc);
        if ret != 0 {
            break;
        }

        let mut ev_cq = ptr::null_mut();
        let mut ev_ctx = ptr::null_mut();
        ret = ibv_get_cq_event(channel, &mut ev_cq, &mut ev_ctx);
        if ret != 0 {
            return ret;
        }
        debug_assert!(ev_cq == cq && ev_ctx == id as *mut c_void);
        ibv_ack_cq_events(cq, 1);
    }

    if ret < 0 {
        rdma_seterrno(-ret)
    } else {
        ret
    }
}

/// Block until a send completion is reaped from the endpoint's send CQ.
#[inline]
pub unsafe fn rdma_get_send_comp(id: *mut rdma_cm_id, wc: *mut ibv_wc) -> c_int {
    rdma_get_comp(id, (*id).send_cq, (*id).send_cq_channel, wc)
}

/// Block until a receive completion is reaped from the endpoint's receive CQ.
#[inline]
pub unsafe fn rdma_get_recv_comp(id: *mut rdma_cm_id, wc: *mut ibv_wc) -> c_int {
    rdma_get_comp(id, (*id).recv_cq, (*id).recv_cq_channel, wc)
}
