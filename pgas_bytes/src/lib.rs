//! Disjoint, mutable byte slices carved out of one shared allocation.
//!
//! Command payloads, RMA staging buffers, and remote-completion bodies all
//! want to be handed around as `[u8]` without copying out of the buffer they
//! were written into. `Bytes` lets many disjoint regions of one allocation
//! be owned and mutated independently, and recovers the original allocation
//! once every region has been dropped.
//!
//! # Examples
//!
//! ```
//! use pgas_bytes::Bytes;
//!
//! let buffer = vec![0u8; 1024];
//! let mut head = Bytes::from(buffer);
//! let mut mid = head.extract_to(100);
//! let mut tail = head.extract_to(100);
//!
//! assert_eq!(head.len(), 824);
//! assert_eq!(mid.len(), 100);
//! assert_eq!(tail.len(), 100);
//!
//! for b in mid.iter_mut() { *b = 7; }
//! drop(head);
//! drop(tail);
//!
//! let buffer = mid.try_recover().expect("uniquely held");
//! assert_eq!(buffer[100..200], [7u8; 100][..]);
//! ```
#![forbid(missing_docs)]

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A mutable, `Arc`-backed slice of bytes carved out of a shared allocation.
///
/// Every live `Bytes` derived from the same origin allocation holds a strong
/// reference to it; the allocation is only returned to its owner once the
/// last region referencing it is dropped.
#[derive(Debug)]
pub struct Bytes {
    ptr: *mut u8,
    len: usize,
    origin: Arc<Vec<u8>>,
}

// SAFETY: `ptr` always points within `origin`, and disjoint `Bytes` values
// carved from one origin never alias their byte ranges, so sending the
// pointer across threads alongside its owning `Arc` is sound.
unsafe impl Send for Bytes {}
unsafe impl Sync for Bytes {}

impl Bytes {
    /// Wraps an owned buffer as the origin of a `Bytes` region.
    pub fn from(mut buffer: Vec<u8>) -> Bytes {
        Bytes {
            ptr: buffer.as_mut_ptr(),
            len: buffer.len(),
            origin: Arc::new(buffer),
        }
    }

    /// Splits off `[0, index)` into a new region, advancing `self` past it.
    ///
    /// # Panics
    ///
    /// Panics if `index` exceeds `self.len()`.
    pub fn extract_to(&mut self, index: usize) -> Bytes {
        assert!(index <= self.len);
        let result = Bytes {
            ptr: self.ptr,
            len: index,
            origin: self.origin.clone(),
        };
        // SAFETY: `index <= self.len`, so the new pointer stays within the
        // allocation and the shrunk `self` no longer covers `[0, index)`.
        unsafe { self.ptr = self.ptr.add(index); }
        self.len -= index;
        result
    }

    /// Recovers the origin buffer if this is the only surviving region.
    pub fn try_recover(self) -> Result<Vec<u8>, Bytes> {
        match Arc::try_unwrap(self.origin) {
            Ok(buffer) => Ok(buffer),
            Err(origin) => Err(Bytes { ptr: self.ptr, len: self.len, origin }),
        }
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` and `len` describe a region within `origin` that no
        // other live `Bytes` overlaps.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for Bytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `Deref`; exclusive access follows from disjointness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}
