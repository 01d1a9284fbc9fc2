//! The test flow shared by the server and the client.

use std::io;

use quanta::Instant;
use thiserror::Error;

use crate::config::TestConfig;
use crate::ctrl::{
    channel, CmChannel, HandshakeError, Handshaker, MessageError, RemoteInfo, SideChannel,
    TcpChannel, Value,
};
use crate::rdma::context::Context;
use crate::rdma::cq::{Cq, CqCreationError, WcStatus};
use crate::rdma::gid::GidQueryError;
use crate::rdma::mr::{Mr, MrRemote, Permission};
use crate::rdma::nic::{DeviceOpenError, Port, PortQueryError, PortState};
use crate::rdma::pd::Pd;
use crate::rdma::qp::*;
use crate::rdma::type_alias::{GidIndex, PortNum, WrId};

/// Work request ID of the posted receive.
pub const RECV_WR: WrId = 1;

/// Work request ID of the posted send.
pub const SEND_WR: WrId = 2;

/// Bytes a UD receive spends on the global routing header.
pub const GRH_LENGTH: usize = Qp::GRH_SIZE;

pub const CQ_DEPTH: u32 = 100;

/// Physical port the test runs on.
pub const PORT_NUM: PortNum = 1;

const TITLE: &str = "Rust test for RDMA";

/// Test error type.
#[derive(Debug, Error)]
pub enum TestError {
    /// The side channel cannot be established.
    #[error("cannot open the {0} side channel")]
    Connect(&'static str, #[source] io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer sent unusable connection metadata.
    #[error("bad remote info")]
    RemoteInfo(#[from] MessageError),

    #[error("cannot open the RDMA device")]
    Device(#[from] DeviceOpenError),

    #[error("cannot query the port")]
    Port(#[from] PortQueryError),

    #[error("GID index {index} is out of the port's table of {len}")]
    NoSuchGid { index: GidIndex, len: usize },

    /// The memory region length overflows.
    #[error("message size {0} is too large")]
    SizeTooLarge(usize),

    #[error("cannot query the local GID")]
    Gid(#[from] GidQueryError),

    #[error("cannot create the CQ")]
    Cq(#[from] CqCreationError),

    #[error("cannot create the QP")]
    Qp(#[from] QpCreationError),

    /// A verbs call failed. The first field names the step.
    #[error("{0} failed")]
    Verbs(&'static str, #[source] io::Error),

    /// A work request completed with an error.
    #[error("work completion error")]
    Completion(#[from] WcStatus),
}

/// The lines printed when a run starts.
pub fn banner(is_server: bool) -> String {
    format!(
        "{rule}\n{pad} {TITLE}\nRunning as {role}...\n{rule}\n",
        rule = channel::rule(),
        pad = " ".repeat(25),
        role = if is_server { "server" } else { "client" },
    )
}

/// Size and content of the memory region on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrLayout {
    /// Registered length.
    pub len: usize,

    /// Start of the part printed as the region content.
    pub view_offset: usize,

    /// Byte the region is filled with before each iteration.
    pub fill: u8,
}

impl MrLayout {
    /// The layout for this end of the test.
    ///
    /// A UD server reserves room for the GRH in front of the payload and
    /// leaves it out of the printed content.
    pub fn new(config: &TestConfig) -> Result<Self, TestError> {
        let is_server = config.is_server();
        let grh = if is_server && config.qp_type == QpType::Ud {
            GRH_LENGTH
        } else {
            0
        };
        let len = config
            .size
            .checked_add(grh)
            .ok_or(TestError::SizeTooLarge(config.size))?;
        Ok(Self {
            len,
            view_offset: grh,
            fill: if is_server { b's' } else { b'c' },
        })
    }

    /// Content written into the region before each iteration.
    pub fn content(&self) -> Vec<u8> {
        vec![self.fill; self.len]
    }

    /// Render the printed part of `mr`.
    pub fn view(&self, mr: &Mr) -> io::Result<String> {
        let bytes = mr.read(self.view_offset, self.len - self.view_offset)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn boxed<C: SideChannel + 'static>(channel: C) -> Box<dyn SideChannel> {
    Box::new(channel)
}

/// Open the side channel selected by the configuration. Blocks until the
/// peer is connected.
pub fn open_channel(config: &TestConfig) -> Result<Handshaker<Box<dyn SideChannel>>, TestError> {
    let port = config.port;
    let channel = match (&config.server_ip, config.use_cm) {
        (None, false) => TcpChannel::server(port).map(boxed),
        (Some(ip), false) => TcpChannel::client(ip, port).map(boxed),
        (None, true) => CmChannel::server(port).map(boxed),
        (Some(ip), true) => CmChannel::client(ip, port).map(boxed),
    };
    let kind = if config.use_cm { "CM" } else { "TCP" };
    let channel = channel.map_err(|e| TestError::Connect(kind, e))?;
    Ok(Handshaker::new(channel))
}

fn check_gid_index(index: GidIndex, len: usize) -> Result<(), TestError> {
    if usize::from(index) >= len {
        return Err(TestError::NoSuchGid { index, len });
    }
    Ok(())
}

/// Check that the port can carry the configured test.
pub fn check_port(port: &Port, config: &TestConfig) -> Result<(), TestError> {
    log::debug!(
        "port {} is {:?}, LID {}, {:?} link layer, active MTU {:?}, {} GIDs",
        port.num(),
        port.state(),
        port.lid(),
        port.link_layer(),
        port.mtu(),
        port.gids().len()
    );
    if port.state() != PortState::Active {
        log::warn!("port {} is {:?}, not active", port.num(), port.state());
    }
    match port.mtu() {
        Some(active) if config.mtu > active => {
            log::warn!(
                "path MTU {} exceeds the active MTU {} of port {}",
                config.mtu,
                active,
                port.num()
            )
        }
        _ => {}
    }
    check_gid_index(config.gid_index, port.gids().len())
}

fn remote_u32(remote: &RemoteInfo, key: &str) -> Result<u32, MessageError> {
    let n = remote.int(key)?;
    u32::try_from(n).map_err(|_| MessageError::InvalidValue {
        key: key.to_owned(),
        ty: "int".to_owned(),
        value: n.to_string(),
    })
}

/// Run the test.
pub fn run(config: &TestConfig) -> Result<(), TestError> {
    let is_server = config.is_server();
    let mut hs = open_channel(config)?;
    print!("{}", banner(is_server));
    hs.barrier()?;

    let ctx = Context::open(&config.ib_dev)?;
    check_port(&ctx.query_port(PORT_NUM)?, config)?;
    let pd = Pd::new(&ctx).map_err(|e| TestError::Verbs("PD allocation", e))?;
    let cq = Cq::new(&ctx, CQ_DEPTH)?;
    let qp = Qp::builder()
        .qp_type(config.qp_type)
        .caps(QpCaps {
            max_send_wr: config.tx_depth,
            max_recv_wr: config.rx_depth,
            max_send_sge: config.sg_depth,
            max_recv_sge: config.sg_depth,
            max_inline_data: config.inline_size,
        })
        .send_cq(&cq)
        .recv_cq(&cq)
        .sq_sig_all(true)
        .port_num(PORT_NUM)
        .build(&pd)?;

    let gid = ctx.query_gid(PORT_NUM, config.gid_index)?;
    let remote = hs.handshake(&[("gid", Value::from(gid)), ("qpn", Value::from(qp.qp_num()))])?;
    let ah_attr = AhAttr::global(remote.gid("gid")?, config.gid_index, PORT_NUM, config.sl);
    let remote_qpn = remote_u32(&remote, "qpn")?;

    let peer = match config.qp_type {
        QpType::Ud => {
            let peer = QpPeer::new(&pd, &ah_attr, remote_qpn)
                .map_err(|e| TestError::Verbs("AH creation", e))?;
            log::debug!("sending to UD QP {}", peer.qpn());
            qp.bring_up_rts(None)
                .map_err(|e| TestError::Verbs("QP bring-up", e))?;
            Some(peer)
        }
        QpType::Rc => {
            let connect = QpConnectAttr {
                ah_attr,
                dest_qpn: remote_qpn,
                path_mtu: config.mtu,
            };
            let ret = if is_server {
                qp.bring_up_rtr(Some(&connect))
            } else {
                qp.bring_up_rts(Some(&connect))
            };
            ret.map_err(|e| TestError::Verbs("QP bring-up", e))?;
            None
        }
    };
    hs.barrier()?;

    let layout = MrLayout::new(config)?;
    let mr = Mr::new(&pd, layout.len, Permission::default())
        .map_err(|e| TestError::Verbs("MR registration", e))?;
    let remote_mr = if config.op.is_rdma() {
        let remote = hs.handshake(&[
            ("addr", Value::Int(mr.addr() as u64)),
            ("rkey", Value::from(mr.rkey())),
        ])?;
        Some(MrRemote::new(remote.int("addr")?, config.size, remote_u32(&remote, "rkey")?))
    } else {
        None
    };

    let content = layout.content();
    for i in 1..=config.iters {
        println!("Iter: {}/{}", i, config.iters);
        mr.write(&content)
            .map_err(|e| TestError::Verbs("MR write", e))?;
        let view = layout.view(&mr).map_err(|e| TestError::Verbs("MR read", e))?;
        println!("MR Content before test:{}", view);

        let mut start = Instant::now();
        if is_server && config.op == SendOp::Send {
            qp.post_recv(&[mr.as_slice()], RECV_WR)
                .map_err(|e| TestError::Verbs("post recv", e))?;
        }
        hs.barrier()?;

        if !is_server {
            let target = match (&peer, &remote_mr) {
                (Some(peer), _) => SendTarget::Ud(peer),
                (None, Some(remote)) => SendTarget::Rdma(remote),
                (None, None) => SendTarget::Connected,
            };
            start = Instant::now();
            qp.post_send(&[mr.as_slice()], config.op, SEND_WR, target)
                .map_err(|e| TestError::Verbs("post send", e))?;
        }
        hs.barrier()?;

        if !is_server || config.op == SendOp::Send {
            let wc = cq
                .poll_one_blocking()
                .map_err(|e| TestError::Verbs("CQ poll", e))?;
            let bytes = wc.result()?;
            log::debug!(
                "iteration {}: QP {} wr {} completed {} bytes in {:?}",
                i,
                wc.qp_num(),
                wc.wr_id(),
                bytes,
                start.elapsed()
            );
        }

        let view = layout.view(&mr).map_err(|e| TestError::Verbs("MR read", e))?;
        println!("MR Content after test:{}", view);
    }

    hs.barrier()?;
    hs.close()?;
    println!("{}", channel::rule());
    Ok(())
}
