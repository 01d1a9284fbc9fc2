//! Completion queue and work completion.

mod wc;

use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use thiserror::Error;

pub use self::wc::*;
use super::context::Context;
use crate::bindings::*;
use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_cq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvCq(NonNull<ibv_cq>);

impl IbvCq {
    /// Destroy the CQ.
    ///
    /// # Safety
    ///
    /// - A CQ must not be destroyed more than once.
    /// - Destroyed CQs must not be used anymore.
    pub(crate) unsafe fn destroy(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_destroy_cq(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_cq, IbvCq);

/// Ownership holder of completion queue.
struct CqInner {
    ctx: Context,
    cq: IbvCq,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        if let Err(e) = unsafe { self.cq.destroy() } {
            log::warn!("cannot destroy CQ of {} on drop: {}", self.ctx.name(), e);
        }
    }
}

/// Completion queue.
#[derive(Clone)]
pub struct Cq {
    /// Cached CQ pointer.
    cq: IbvCq,

    /// CQ body.
    inner: Arc<CqInner>,
}

impl Cq {
    /// Create a completion queue with at least `capacity` entries.
    pub fn new(ctx: &Context, capacity: u32) -> Result<Cq, CqCreationError> {
        let max_capacity = ctx.attr().max_cqe.max(0) as u32;
        if capacity > max_capacity {
            return Err(CqCreationError::TooManyCqes(capacity, max_capacity));
        }

        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                capacity as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        let cq = NonNull::new(cq).ok_or_else(io::Error::last_os_error)?;
        let cq = IbvCq(cq);
        log::debug!("created CQ with {} entries on {}", capacity, ctx.name());

        Ok(Self {
            cq,
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                cq,
            }),
        })
    }

    /// Get the underlying [`ibv_cq`] pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the actual capacity of the completion queue, which may be larger
    /// than requested.
    #[inline]
    pub fn capacity(&self) -> u32 {
        // SAFETY: the pointer is valid as long as the `Cq` is alive.
        (unsafe { (*self.cq.as_ptr()).cqe }) as u32
    }

    /// Non-blockingly poll into the given buffer. Return the number of work
    /// completions polled, possibly zero.
    ///
    /// Entries beyond the returned count are left untouched.
    #[inline]
    pub fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        if wc.is_empty() {
            return Ok(0);
        }

        // SAFETY: FFI, and `Wc` is transparent over `ibv_wc`.
        let num = unsafe { ibv_poll_cq(self.as_raw(), wc.len() as i32, wc.as_mut_ptr().cast()) };
        if num >= 0 {
            Ok(num as usize)
        } else {
            Err(io::Error::from_raw_os_error(-num))
        }
    }

    /// Non-blockingly poll one work completion.
    #[inline]
    pub fn poll_one(&self) -> io::Result<Option<Wc>> {
        let mut wc = [Wc::default()];
        Ok(match self.poll_into(&mut wc)? {
            0 => None,
            _ => Some(wc[0]),
        })
    }

    /// Busy-poll until `num` work completions are reaped.
    ///
    /// The status codes of the returned entries are not checked; use
    /// [`Wc::result`] on each.
    pub fn poll_blocking(&self, num: usize) -> io::Result<Vec<Wc>> {
        let mut wc = vec![Wc::default(); num];
        let mut polled = 0;
        while polled < num {
            polled += self.poll_into(&mut wc[polled..])?;
        }
        log::trace!("reaped {} work completion(s)", num);
        Ok(wc)
    }

    /// Busy-poll until one work completion is reaped.
    pub fn poll_one_blocking(&self) -> io::Result<Wc> {
        loop {
            if let Some(wc) = self.poll_one()? {
                return Ok(wc);
            }
        }
    }
}

/// CQ creation error type.
#[derive(Debug, Error)]
pub enum CqCreationError {
    /// `libibverbs` interfaces returned an error.
    #[error("I/O error from ibverbs")]
    IoError(#[from] io::Error),

    /// The requested capacity exceeds the device's `max_cqe`.
    #[error("CQ capacity {0} too large (maximum: {1})")]
    TooManyCqes(u32, u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::tests::test_device;

    #[test]
    #[ignore = "requires an RDMA device"]
    fn create_and_poll_empty() {
        let ctx = Context::open(&test_device()).unwrap();
        let cq = Cq::new(&ctx, 100).unwrap();
        assert!(cq.capacity() >= 100);
        assert!(cq.poll_one().unwrap().is_none());
        assert!(cq.poll_blocking(0).unwrap().is_empty());
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn capacity_is_checked() {
        let ctx = Context::open(&test_device()).unwrap();
        let too_many = ctx.attr().max_cqe as u32 + 1;
        assert!(matches!(
            Cq::new(&ctx, too_many),
            Err(CqCreationError::TooManyCqes(n, _)) if n == too_many
        ));
    }
}
