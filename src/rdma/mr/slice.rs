use super::Mr;
use crate::bindings::*;

/// Slice of a local memory region, usable as one scatter/gather entry.
#[derive(Clone, Copy)]
pub struct MrSlice<'a> {
    mr: &'a Mr,
    offset: usize,
    len: usize,
}

impl<'a> MrSlice<'a> {
    /// The caller checks that the range lies in the region.
    pub(super) fn new(mr: &'a Mr, offset: usize, len: usize) -> Self {
        Self { mr, offset, len }
    }

    /// Get the start address of this slice.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.mr.addr().wrapping_add(self.offset)
    }

    /// Get the length of this slice.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl From<MrSlice<'_>> for ibv_sge {
    fn from(slice: MrSlice<'_>) -> Self {
        Self {
            addr: slice.addr() as u64,
            length: slice.len() as u32,
            lkey: slice.mr.lkey(),
        }
    }
}
