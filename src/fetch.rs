//! Key/value descriptors for the fetch buffer protocol.
//!
//! Callers describe where fetched bytes should go: a [`FetchBuf`] in borrow
//! mode receives a pointer into persistent memory, one in copy mode receives
//! the bytes if its capacity suffices. In every case the actual record
//! length is reported; a zero length signals a tombstone.

use std::ptr::NonNull;

/// Destination descriptor for a fetched key or value.
pub struct FetchBuf<'a> {
    dst: Option<&'a mut [u8]>,
    borrowed: Option<NonNull<u8>>,
    len: usize,
    fetched: bool,
}

impl FetchBuf<'static> {
    /// Borrow mode: the engine hands back a pointer into persistent memory.
    ///
    /// The pointer stays valid for the lifetime of the surrounding
    /// transaction and pool mapping.
    pub fn borrowed() -> Self {
        FetchBuf {
            dst: None,
            borrowed: None,
            len: 0,
            fetched: false,
        }
    }
}

impl<'a> FetchBuf<'a> {
    /// Copy mode: the engine copies into `buf` when the record fits.
    pub fn copied(buf: &'a mut [u8]) -> Self {
        FetchBuf {
            dst: Some(buf),
            borrowed: None,
            len: 0,
            fetched: false,
        }
    }

    /// Actual length of the fetched record. Zero signals a tombstone.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing has been fetched or the record was a tombstone.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if the record did not fit the copy-mode buffer. The reported
    /// length is still the real one; the buffer contents are unspecified.
    pub fn is_truncated(&self) -> bool {
        match &self.dst {
            Some(buf) => self.fetched && self.len > buf.len(),
            None => false,
        }
    }

    /// The fetched bytes: the filled prefix in copy mode, the persistent
    /// bytes in borrow mode. `None` when truncated or not fetched.
    pub fn as_slice(&self) -> Option<&[u8]> {
        if !self.fetched || self.is_truncated() {
            return None;
        }
        match (&self.dst, self.borrowed) {
            (Some(buf), _) => Some(&buf[..self.len]),
            (None, Some(ptr)) => {
                // Valid for the life of the pool mapping; see `borrowed`.
                Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) })
            }
            (None, None) => None,
        }
    }

    /// Borrow-mode pointer and length, if any.
    pub fn borrowed_parts(&self) -> Option<(NonNull<u8>, usize)> {
        self.borrowed.map(|ptr| (ptr, self.len))
    }

    /// Record side: supply the persistent location and length of the datum.
    pub(crate) fn supply(&mut self, src: NonNull<u8>, len: usize) {
        self.fetched = true;
        self.len = len;
        match &mut self.dst {
            Some(buf) => {
                if len <= buf.len() {
                    unsafe {
                        std::ptr::copy_nonoverlapping(src.as_ptr(), buf.as_mut_ptr(), len)
                    };
                }
            }
            None => self.borrowed = Some(src),
        }
    }

    /// Record side: report a tombstone.
    pub(crate) fn supply_empty(&mut self) {
        self.fetched = true;
        self.len = 0;
        self.borrowed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_mode_fills_prefix() {
        let src = [7u8, 8, 9];
        let mut buf = [0u8; 8];
        let mut dst = FetchBuf::copied(&mut buf);
        dst.supply(NonNull::new(src.as_ptr() as *mut u8).unwrap(), src.len());
        assert_eq!(dst.len(), 3);
        assert!(!dst.is_truncated());
        assert_eq!(dst.as_slice(), Some(&src[..]));
    }

    #[test]
    fn too_small_buffer_reports_real_length() {
        let src = [1u8, 2, 3, 4];
        let mut buf = [0u8; 2];
        let mut dst = FetchBuf::copied(&mut buf);
        dst.supply(NonNull::new(src.as_ptr() as *mut u8).unwrap(), src.len());
        assert_eq!(dst.len(), 4);
        assert!(dst.is_truncated());
        assert_eq!(dst.as_slice(), None);
    }

    #[test]
    fn borrow_mode_hands_out_pointer() {
        let src = [5u8; 5];
        let mut dst = FetchBuf::borrowed();
        dst.supply(NonNull::new(src.as_ptr() as *mut u8).unwrap(), src.len());
        assert_eq!(dst.len(), 5);
        assert_eq!(dst.borrowed_parts().unwrap().1, 5);
        assert_eq!(dst.as_slice(), Some(&src[..]));
    }
}
