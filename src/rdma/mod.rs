//! Owning wrappers of verbs resources.

pub mod context;
pub mod cq;
pub mod gid;
pub mod mr;
pub mod nic;
pub mod pd;
pub mod qp;
pub mod type_alias;
