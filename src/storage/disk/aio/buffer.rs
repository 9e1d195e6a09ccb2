//! Non-owning view of caller memory.
//!
//! An [`IoBuf`] is a pointer + length pair. The slot that carries it never
//! allocates or frees the memory behind it. The caller keeps the memory alive
//! and does not touch it from the moment the request is submitted until the
//! completion for that request has been claimed; the merge engine reads it
//! once for writes and fills it once for reads.

use std::fmt;
use std::ptr::NonNull;
use std::slice;

#[derive(Clone, Copy)]
pub struct IoBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// The view is only dereferenced by the single thread that owns the slot in
// its ISSUED state; the caller contract above rules out concurrent access.
unsafe impl Send for IoBuf {}
unsafe impl Sync for IoBuf {}

impl IoBuf {
    /// Borrows `buf` for the lifetime of an I/O request.
    ///
    /// # Safety
    ///
    /// `buf` must stay allocated and must not be read or written by anyone else
    /// until the completion of every request using this view has been claimed.
    pub unsafe fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self {
            ptr: NonNull::new_unchecked(buf.as_mut_ptr()),
            len: buf.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// The caller must hold the slot that carries this view in its ISSUED state.
    pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// The caller must hold the slot that carries this view in its ISSUED state.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
