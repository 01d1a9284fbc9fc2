//! An RDMA verbs exercise: a server and a client bring up a queue pair,
//! exchange its metadata over a side channel, and run SEND, WRITE or READ
//! over it, printing the memory region before and after each iteration.
//!
//! The [`rdma`] module holds thin `Arc`-based wrappers of verbs resources.
//! [`Context`], [`Pd`], [`Cq`], [`Mr`] and [`Qp`] are references to the
//! underlying resources and are released in dependency order once the last
//! reference drops.
//!
//! Connection metadata travels over a [`ctrl::SideChannel`], either plain
//! TCP or the RDMA connection manager, driven by a [`ctrl::Handshaker`].
//!
//! # Example
//!
//! ```no_run
//! use rdma_test::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let context = Context::open("mlx5_0")?;
//!     let pd = Pd::new(&context)?;
//!     let mr = Mr::new(&pd, 4096, Permission::default())?;
//!     mr.write(b"hello")?;
//!     Ok(())
//! }
//! ```

#[macro_use]
mod utils;

mod bindings;

pub mod config;
pub mod ctrl;
pub mod rdma;
pub mod runner;

pub use rdma::context::Context;
pub use rdma::cq::{Cq, Wc, WcStatus};
pub use rdma::gid::Gid;
pub use rdma::mr::{Mr, MrRemote, MrSlice, Permission};
pub use rdma::pd::Pd;
pub use rdma::qp::{Qp, QpPeer, QpType, SendOp};
