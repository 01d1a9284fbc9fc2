use std::ffi::CStr;
use std::io;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::slice;

use crate::bindings::*;
use crate::rdma::context::IbvContext;

/// Wrapper for `*mut ibv_device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvDevice(NonNull<ibv_device>);

impl IbvDevice {
    /// Get the name of this device.
    pub fn name(&self) -> io::Result<String> {
        // SAFETY: FFI.
        let name = unsafe { ibv_get_device_name(self.as_ptr()) };
        if name.is_null() {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `ibv_get_device_name` returns a pointer to a valid C string.
        let name = unsafe { CStr::from_ptr(name) };
        name.to_str().map(str::to_owned).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "device name is not valid UTF-8",
            )
        })
    }

    /// Open the device to get a context.
    pub fn open(self) -> io::Result<IbvContext> {
        // SAFETY: FFI.
        let ctx = unsafe { ibv_open_device(self.as_ptr()) };
        let ctx = NonNull::new(ctx).ok_or_else(io::Error::last_os_error)?;
        Ok(IbvContext::from(ctx))
    }
}

impl_ibv_wrapper_traits!(ibv_device, IbvDevice);

/// Wrapper for `*mut *mut ibv_device`.
#[repr(transparent)]
pub(crate) struct IbvDeviceList(ManuallyDrop<Box<[IbvDevice]>>);

impl IbvDeviceList {
    /// Get a list of RDMA physical devices.
    pub fn new() -> io::Result<Self> {
        let mut n = 0i32;

        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut n) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }

        // SAFETY:
        // - `IbvDevice` is a transparent wrapper of `*mut ibv_device`.
        // - `ibv_get_device_list` returns a pointer to a valid array of non-null `ibv_device` pointers.
        let list = unsafe { Box::from_raw(slice::from_raw_parts_mut(list as _, n as usize)) };
        log::trace!("found {} RDMA device(s)", n);
        Ok(Self(ManuallyDrop::new(list)))
    }
}

impl Deref for IbvDeviceList {
    type Target = [IbvDevice];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IbvDeviceList {
    /// Find the device named `name`. Devices whose names cannot be read
    /// never match.
    pub fn find(&self, name: &str) -> Option<IbvDevice> {
        self.iter()
            .copied()
            .find(|dev| dev.name().is_ok_and(|dev_name| dev_name == name))
    }

    /// Get the readable names of all listed devices.
    pub fn names(&self) -> Vec<String> {
        self.iter().filter_map(|dev| dev.name().ok()).collect()
    }
}

impl Drop for IbvDeviceList {
    fn drop(&mut self) {
        // SAFETY: FFI. The list memory belongs to `libibverbs`, so the box is
        // never dropped by Rust.
        unsafe { ibv_free_device_list(self.0.as_mut_ptr() as _) };
    }
}
