//! Device context.

use std::io;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use super::gid::{Gid, GidQueryError};
use super::nic::*;
use super::type_alias::*;
use crate::bindings::*;
use crate::utils::interop::{from_c_err, from_c_ret};

/// Wrapper for `*mut ibv_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvContext(NonNull<ibv_context>);

impl IbvContext {
    /// Query device attributes.
    pub(crate) fn query_device(&self) -> io::Result<ibv_device_attr> {
        let mut dev_attr = Default::default();
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_device(self.as_ptr(), &mut dev_attr) };
        match ret {
            0 => Ok(dev_attr),
            _ => from_c_err(ret),
        }
    }

    /// Close the context.
    ///
    /// # Safety
    ///
    /// - A context must not be closed more than once.
    /// - Closed contexts must not be used anymore.
    pub(crate) unsafe fn close(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_close_device(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_context, IbvContext);

/// Ownership holder of device context.
struct ContextInner {
    ctx: IbvContext,
    name: String,
    attr: ibv_device_attr,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        if let Err(e) = unsafe { self.ctx.close() } {
            log::warn!("cannot close context of {} on drop: {}", self.name, e);
        }
    }
}

/// Device context.
///
/// Cloning only bumps a reference count. The device is closed when the last
/// clone, and every resource created from it, is dropped.
#[derive(Clone)]
pub struct Context {
    /// Cached context pointer.
    ctx: IbvContext,

    /// Context body.
    inner: Arc<ContextInner>,
}

impl Context {
    /// Open the RDMA device with the given name (e.g., `mlx5_0`, as listed by
    /// `ibv_devices`) and cache its attributes.
    pub fn open(dev_name: &str) -> Result<Self, DeviceOpenError> {
        let dev_list = IbvDeviceList::new()?;
        let dev = dev_list
            .find(dev_name)
            .ok_or_else(|| DeviceOpenError::NotFound {
                name: dev_name.to_owned(),
                available: dev_list.names(),
            })?;

        let ctx = dev.open()?;
        let attr = match ctx.query_device() {
            Ok(attr) => attr,
            Err(e) => {
                // SAFETY: the context was just opened and is not shared.
                let _ = unsafe { ctx.close() };
                return Err(e.into());
            }
        };
        drop(dev_list);

        log::debug!(
            "opened device {} ({} port(s), max_cqe {}, max_qp_wr {})",
            dev_name,
            attr.phys_port_cnt,
            attr.max_cqe,
            attr.max_qp_wr
        );
        Ok(Self {
            ctx,
            inner: Arc::new(ContextInner {
                ctx,
                name: dev_name.to_owned(),
                attr,
            }),
        })
    }

    /// Get the underlying [`ibv_context`] raw pointer.
    pub fn as_raw(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }

    /// Get the name of the opened device.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the underlying device attributes.
    pub fn attr(&self) -> &ibv_device_attr {
        &self.inner.attr
    }

    /// Query the attributes and GID table of a physical port.
    pub fn query_port(&self, port_num: PortNum) -> Result<Port, PortQueryError> {
        if port_num == 0 || port_num > self.attr().phys_port_cnt {
            return Err(PortQueryError::NoSuchPort(port_num));
        }
        Port::new(self.ctx, port_num)
    }

    /// Query the GID at `index` of the GID table of a physical port.
    pub fn query_gid(&self, port_num: PortNum, index: GidIndex) -> Result<Gid, GidQueryError> {
        query_gid(self.ctx, port_num, index)
    }
}

/// Query a single GID table entry.
pub(crate) fn query_gid(
    ctx: IbvContext,
    port_num: PortNum,
    index: GidIndex,
) -> Result<Gid, GidQueryError> {
    // SAFETY: POD type.
    let mut gid = unsafe { mem::zeroed::<ibv_gid>() };

    // SAFETY: FFI.
    let ret = unsafe { ibv_query_gid(ctx.as_ptr(), port_num, index as _, &mut gid) };
    if ret != 0 {
        return Err(GidQueryError::Io {
            index,
            source: io::Error::last_os_error(),
        });
    }
    Ok(Gid::from(gid))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_device() -> String {
        std::env::var("RDMA_TEST_DEV").unwrap_or_else(|_| "mlx5_0".to_owned())
    }

    #[test]
    fn open_unknown_device() {
        match Context::open("definitely-not-an-rdma-device") {
            Err(DeviceOpenError::NotFound { name, available }) => {
                assert_eq!(name, "definitely-not-an-rdma-device");
                assert!(!available.contains(&name));
            }
            // Hosts without any RDMA stack fail to list devices at all.
            Err(DeviceOpenError::Io(_)) => {}
            Ok(_) => panic!("opened a nonexistent device"),
        }
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn open_and_query() {
        let ctx = Context::open(&test_device()).unwrap();
        assert_eq!(ctx.name(), test_device());
        assert!(ctx.attr().phys_port_cnt >= 1);

        let port = ctx.query_port(1).unwrap();
        assert_eq!(port.num(), 1);
        assert!(matches!(
            ctx.query_port(0),
            Err(PortQueryError::NoSuchPort(0))
        ));

        let gid = ctx.query_gid(1, 0).unwrap();
        assert_eq!(Some(gid), port.gids().first().copied());
    }
}
