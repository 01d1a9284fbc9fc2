//! Protection domain.

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use super::context::Context;
use crate::bindings::*;
use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_pd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvPd(NonNull<ibv_pd>);

impl IbvPd {
    /// Deallocate the PD.
    ///
    /// # Safety
    ///
    /// - A PD must not be deallocated more than once.
    /// - Deallocated PDs must not be used anymore.
    pub(crate) unsafe fn dealloc(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dealloc_pd(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_pd, IbvPd);

/// Ownership holder of protection domain.
///
/// Holds a context clone so that the device outlives the PD.
struct PdInner {
    ctx: Context,
    pd: IbvPd,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        if let Err(e) = unsafe { self.pd.dealloc() } {
            log::warn!("cannot dealloc PD of {} on drop: {}", self.ctx.name(), e);
        }
    }
}

/// Protection domain.
#[derive(Clone)]
pub struct Pd {
    /// Cached protection domain pointer.
    pd: IbvPd,

    /// Protection domain body.
    inner: Arc<PdInner>,
}

impl Pd {
    /// Allocate a protection domain for the given RDMA device context.
    pub fn new(ctx: &Context) -> io::Result<Self> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(ctx.as_raw()) };
        let pd = NonNull::new(pd).ok_or_else(io::Error::last_os_error)?;
        let pd = IbvPd::from(pd);
        log::debug!("allocated PD on {}", ctx.name());

        Ok(Self {
            pd,
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                pd,
            }),
        })
    }

    /// Get the underlying `ibv_pd` structure.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    /// Get the RDMA device context of the protection domain.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::tests::test_device;

    #[test]
    #[ignore = "requires an RDMA device"]
    fn alloc_pd() {
        let ctx = Context::open(&test_device()).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        assert_eq!(pd.context().as_raw(), ctx.as_raw());

        // Dropping the context handle first must keep the device open.
        drop(ctx);
        let _clone = pd.clone();
    }
}
