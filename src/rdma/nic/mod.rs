//! RDMA device discovery.

mod device;
mod port;

use std::io;

use thiserror::Error;

pub(crate) use self::device::*;
pub use self::port::*;

/// Device open error type.
#[derive(Debug, Error)]
pub enum DeviceOpenError {
    /// `libibverbs` interfaces returned an error when listing, opening or
    /// querying the device.
    #[error("I/O error from ibverbs")]
    Io(#[from] io::Error),

    /// No RDMA device has the requested name.
    #[error("RDMA device {name:?} not found, available: {available:?}")]
    NotFound {
        name: String,
        available: Vec<String>,
    },
}
