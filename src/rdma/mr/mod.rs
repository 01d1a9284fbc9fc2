//! Memory region.

mod perm;
mod remote;
mod slice;

use std::ffi::c_void;
use std::io;
use std::ptr::{self, NonNull};

pub use self::perm::*;
pub use self::remote::*;
pub use self::slice::*;
use super::pd::Pd;
use super::type_alias::*;
use crate::bindings::*;
use crate::utils::interop::from_c_ret;

/// Wrapper for `*mut ibv_mr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvMr(NonNull<ibv_mr>);

impl IbvMr {
    /// Get the local key of the memory region.
    pub fn lkey(&self) -> LKey {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.as_ptr()).lkey }
    }

    /// Get the remote key of the memory region.
    pub fn rkey(&self) -> RKey {
        // SAFETY: the `ibv_mr` instance is valid.
        unsafe { (*self.as_ptr()).rkey }
    }

    /// Deregister the MR.
    ///
    /// # Safety
    ///
    /// - An MR must not be deregistered more than once.
    /// - Deregistered MRs must not be used anymore.
    pub unsafe fn dereg(self) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dereg_mr(self.as_ptr());
        from_c_ret(ret)
    }
}

impl_ibv_wrapper_traits!(ibv_mr, IbvMr);

/// Local memory region over a zero-initialized buffer it owns.
///
/// The buffer may be modified by the RNIC at any time while the region is
/// registered, so it is only accessed through copies ([`Mr::write`] and
/// [`Mr::read`]), never borrowed.
pub struct Mr {
    /// Keeps the PD alive until deregistration.
    pd: Pd,
    mr: IbvMr,
    buf: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Mr {}
unsafe impl Sync for Mr {}

impl Mr {
    /// Allocate a zeroed buffer of `len` bytes and register it.
    pub fn new(pd: &Pd, len: usize, perm: Permission) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot register an empty memory region",
            ));
        }

        let buf = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;

        // SAFETY: FFI. `buf` points to `len` valid bytes.
        let mr = unsafe { ibv_reg_mr(pd.as_raw(), buf as *mut c_void, len, perm.into()) };
        let Some(mr) = NonNull::new(mr) else {
            let err = io::Error::last_os_error();
            // SAFETY: `buf` came from `Box::into_raw` and is not registered.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(buf, len)) });
            return Err(err);
        };
        let mr = IbvMr::from(mr);
        log::debug!(
            "registered MR of {} bytes at {:p} (lkey {:#x}, rkey {:#x}, {:?})",
            len,
            buf,
            mr.lkey(),
            mr.rkey(),
            perm
        );

        Ok(Self {
            pd: pd.clone(),
            mr,
            // SAFETY: `Box::into_raw` never returns null.
            buf: unsafe { NonNull::new_unchecked(buf) },
            len,
        })
    }

    /// Get the underlying `ibv_mr` structure.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_mr {
        self.mr.as_ptr()
    }

    /// Get the protection domain this region is registered in.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get the start address of the registered buffer.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Get the length of the registered buffer.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.mr.lkey()
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.mr.rkey()
    }

    /// Copy `content` into the start of the region.
    pub fn write(&self, content: &[u8]) -> io::Result<()> {
        if content.len() > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} bytes do not fit in a memory region of {} bytes",
                    content.len(),
                    self.len
                ),
            ));
        }

        // SAFETY: bounds checked above, and `content` cannot alias the
        // owned buffer.
        unsafe { ptr::copy_nonoverlapping(content.as_ptr(), self.addr(), content.len()) };
        Ok(())
    }

    /// Copy `len` bytes out of the region starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> io::Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];

        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(self.addr().add(offset), out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Get a slice covering the whole region.
    #[inline]
    pub fn as_slice(&self) -> MrSlice<'_> {
        MrSlice::new(self, 0, self.len)
    }

    /// Get a slice of `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> io::Result<MrSlice<'_>> {
        self.check_range(offset, len)?;
        Ok(MrSlice::new(self, offset, len))
    }

    /// Describe this region for RDMA access from the peer.
    #[inline]
    pub fn as_remote(&self) -> MrRemote {
        MrRemote::new(self.addr() as u64, self.len, self.rkey())
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {}+{} out of a memory region of {} bytes",
                    offset, len, self.len
                ),
            )),
        }
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        if let Err(e) = unsafe { self.mr.dereg() } {
            // The RNIC may still reach the buffer, so it is leaked.
            log::warn!("cannot dereg MR on drop, leaking its buffer: {}", e);
            return;
        }

        // SAFETY: the buffer came from `Box::into_raw` in `Mr::new` and is
        // no longer registered.
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(self.buf.as_ptr(), self.len)) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::tests::test_device;
    use crate::rdma::context::Context;

    fn test_mr(len: usize) -> Mr {
        let ctx = Context::open(&test_device()).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        Mr::new(&pd, len, Permission::default()).unwrap()
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn write_then_read() {
        let mr = test_mr(53);
        assert_eq!(mr.read(0, 53).unwrap(), vec![0u8; 53]);

        mr.write(&[b's'; 13]).unwrap();
        assert_eq!(mr.read(0, 13).unwrap(), b"sssssssssssss");
        assert_eq!(mr.read(13, 40).unwrap(), vec![0u8; 40]);
        assert!(mr.write(&[0; 54]).is_err());
        assert!(mr.read(40, 14).is_err());
    }

    #[test]
    #[ignore = "requires an RDMA device"]
    fn slices_and_remote_view() {
        let mr = test_mr(64);
        let remote = mr.as_remote();
        assert_eq!(remote.addr, mr.addr() as u64);
        assert_eq!(remote.len, 64);
        assert_eq!(remote.rkey, mr.rkey());

        let sge = ibv_sge::from(mr.slice(40, 24).unwrap());
        assert_eq!(sge.addr, mr.addr() as u64 + 40);
        assert_eq!(sge.length, 24);
        assert_eq!(sge.lkey, mr.lkey());
        assert!(mr.slice(40, 25).is_err());
        assert_eq!(mr.as_slice().len(), 64);
    }
}
