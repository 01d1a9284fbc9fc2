//! RDMA connection manager side channel.
//!
//! Messages travel as one SEND/RECV pair over a small RC endpoint that the
//! connection manager creates and connects, separate from the QP under test.

use std::ffi::{c_void, CString};
use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use super::channel::SideChannel;
use crate::bindings::*;
use crate::rdma::cq::Wc;
use crate::utils::interop::from_c_errno;

/// Slack added to the receive buffer beyond the local message length, since
/// the peer's message may be slightly longer.
pub const RESERVED_LEN: usize = 20;

/// Resolve `node:port` for the TCP port space, passively if `node` is `None`
/// (binding `0.0.0.0`).
fn getaddrinfo(node: Option<&str>, port: u16) -> io::Result<NonNull<rdma_addrinfo>> {
    let to_cstring = |s: &str| {
        CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in address"))
    };
    let passive = node.is_none();
    let service = to_cstring(&port.to_string())?;
    let node = to_cstring(node.unwrap_or("0.0.0.0"))?;

    // SAFETY: POD type.
    let mut hints = unsafe { mem::zeroed::<rdma_addrinfo>() };
    hints.ai_port_space = rdma_port_space::RDMA_PS_TCP as _;
    if passive {
        hints.ai_flags = RAI_PASSIVE as _;
    }

    let mut res = ptr::null_mut();
    // SAFETY: FFI.
    let ret = unsafe { rdma_getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut res) };
    from_c_errno(ret)?;
    NonNull::new(res).ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no RDMA address"))
}

/// Create an endpoint from the first resolved address, with an RC QP able
/// to hold one message in each direction.
fn create_ep(node: Option<&str>, port: u16) -> io::Result<NonNull<rdma_cm_id>> {
    let res = getaddrinfo(node, port)?;

    // SAFETY: POD type.
    let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
    init_attr.cap = ibv_qp_cap {
        max_send_wr: 1,
        max_recv_wr: 1,
        max_send_sge: 1,
        max_recv_sge: 1,
        max_inline_data: 0,
    };
    init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    init_attr.sq_sig_all = 1;

    let mut id = ptr::null_mut();
    // SAFETY: FFI. `res` is valid until freed right after.
    let ret = unsafe { rdma_create_ep(&mut id, res.as_ptr(), ptr::null_mut(), &mut init_attr) };
    let err = io::Error::last_os_error();
    // SAFETY: FFI, called once on the list from `rdma_getaddrinfo`.
    unsafe { rdma_freeaddrinfo(res.as_ptr()) };

    if ret != 0 {
        return Err(err);
    }
    NonNull::new(id).ok_or(err)
}

/// Registration of a message buffer on an endpoint's PD.
struct MsgMr(NonNull<ibv_mr>);

impl MsgMr {
    fn new(id: NonNull<rdma_cm_id>, buf: &mut [u8]) -> io::Result<Self> {
        // SAFETY: FFI. The caller keeps `buf` alive until the guard drops.
        let mr = unsafe { rdma_reg_msgs(id.as_ptr(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        NonNull::new(mr).map(Self).ok_or_else(io::Error::last_os_error)
    }
}

impl Drop for MsgMr {
    fn drop(&mut self) {
        // SAFETY: FFI, and the MR is deregistered only once.
        if unsafe { ibv_dereg_mr(self.0.as_ptr()) } != 0 {
            log::warn!("cannot dereg CM message MR: {}", io::Error::last_os_error());
        }
    }
}

fn check_comp(ret: i32, wc: &Wc, what: &str) -> io::Result<usize> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    wc.result()
        .map_err(|status| io::Error::new(io::ErrorKind::Other, format!("CM {} failed: {}", what, status)))
}

/// Side channel over an RDMA connection manager endpoint.
pub struct CmChannel {
    id: Option<NonNull<rdma_cm_id>>,
    is_client: bool,
}

impl CmChannel {
    /// Listen on `0.0.0.0:<port>` and accept exactly one client.
    pub fn server(port: u16) -> io::Result<Self> {
        let listen_id = create_ep(None, port)?;
        let listen_guard = CmChannel {
            id: Some(listen_id),
            is_client: false,
        };

        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_listen(listen_id.as_ptr(), 0) })?;
        log::info!("waiting for a client on RDMA CM port {}", port);

        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_get_request(listen_id.as_ptr(), &mut id) })?;
        let channel = CmChannel {
            id: NonNull::new(id),
            is_client: false,
        };
        let id = channel.id()?;

        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_accept(id.as_ptr(), ptr::null_mut()) })?;
        drop(listen_guard);
        log::debug!("accepted RDMA CM client");
        Ok(channel)
    }

    /// Connect to `<host>:<port>`.
    pub fn client(host: &str, port: u16) -> io::Result<Self> {
        let channel = CmChannel {
            id: Some(create_ep(Some(host), port)?),
            is_client: true,
        };
        let id = channel.id()?;

        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_connect(id.as_ptr(), ptr::null_mut()) })?;
        log::debug!("connected to RDMA CM server {}:{}", host, port);
        Ok(channel)
    }

    fn id(&self) -> io::Result<NonNull<rdma_cm_id>> {
        self.id.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "CM side channel is closed")
        })
    }
}

impl SideChannel for CmChannel {
    fn kind(&self) -> &'static str {
        "CM"
    }

    fn exchange(&mut self, msg: &[u8]) -> io::Result<Vec<u8>> {
        let id = self.id()?;

        let mut recv_buf = vec![0u8; msg.len() + RESERVED_LEN];
        // Registering zero bytes fails, so empty messages keep one spare byte.
        let mut send_buf = msg.to_vec();
        send_buf.resize(msg.len().max(1), 0);

        let recv_mr = MsgMr::new(id, &mut recv_buf)?;
        // SAFETY: FFI. The buffer and its MR outlive the completion.
        let ret = unsafe {
            rdma_post_recv(
                id.as_ptr(),
                ptr::null_mut(),
                recv_buf.as_mut_ptr() as *mut c_void,
                recv_buf.len(),
                recv_mr.0.as_ptr(),
            )
        };
        from_c_errno(ret)?;

        let send_mr = MsgMr::new(id, &mut send_buf)?;
        // SAFETY: FFI. The buffer and its MR outlive the completion.
        let ret = unsafe {
            rdma_post_send(
                id.as_ptr(),
                ptr::null_mut(),
                send_buf.as_mut_ptr() as *mut c_void,
                msg.len(),
                send_mr.0.as_ptr(),
                ibv_send_flags::IBV_SEND_SIGNALED.0,
            )
        };
        from_c_errno(ret)?;

        let mut wc = Wc::default();
        // SAFETY: FFI.
        let ret = unsafe { rdma_get_recv_comp(id.as_ptr(), &mut wc.0) };
        let received = check_comp(ret, &wc, "receive")?;

        // SAFETY: FFI.
        let ret = unsafe { rdma_get_send_comp(id.as_ptr(), &mut wc.0) };
        check_comp(ret, &wc, "send")?;

        drop(send_mr);
        drop(recv_mr);
        recv_buf.truncate(received);
        Ok(recv_buf)
    }

    fn close(&mut self) -> io::Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };

        let ret = if self.is_client {
            // SAFETY: FFI.
            unsafe { rdma_disconnect(id.as_ptr()) }
        } else {
            0
        };
        // SAFETY: FFI, and `id` was taken so it is destroyed only once.
        unsafe { rdma_destroy_ep(id.as_ptr()) };
        from_c_errno(ret)
    }
}

impl Drop for CmChannel {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            // SAFETY: FFI, and `id` was taken so it is destroyed only once.
            unsafe { rdma_destroy_ep(id.as_ptr()) };
        }
    }
}
