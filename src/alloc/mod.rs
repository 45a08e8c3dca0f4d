//! Huge-page-backed, zero-initialised buffers.
//!
//! Counting is memory-bandwidth bound, so the large arrays (counts, bitsets,
//! packed trie storage) are allocated so that the kernel can back them with
//! 2MB pages. Several strategies are tried in order:
//!
//! - `Mmap`: an anonymous private mapping, advised with `MADV_HUGEPAGE`
//! - `Aligned`: `posix_memalign` on a 2MB boundary, then `madvise`
//! - `Heap`: the global allocator (`alloc_zeroed`)
//!
//! Failure of one strategy is logged and the next one is tried. Only when the
//! heap also fails is an error returned. The strategy that succeeded is
//! recorded in the buffer so that deallocation always matches allocation.

use std::alloc::{self, Layout};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Transparent huge page size on x86_64 and aarch64 Linux.
pub const HUGE_PAGE_SIZE: usize = 1 << 21;

/// Element types whose all-zero bit pattern is a valid value.
///
/// # Safety
/// Implementors must be plain integers (no padding, no invalid bit patterns).
pub unsafe trait Zeroable: Copy + Send + Sync + 'static {}

unsafe impl Zeroable for u8 {}
unsafe impl Zeroable for u16 {}
unsafe impl Zeroable for u32 {}
unsafe impl Zeroable for u64 {}

/// The mechanism that produced a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// Anonymous mapping with a huge-page hint.
    Mmap,
    /// 2MB-aligned `posix_memalign` with a huge-page hint.
    Aligned,
    /// Plain global allocator.
    Heap,
}

impl AllocStrategy {
    fn next(self) -> Option<Self> {
        match self {
            AllocStrategy::Mmap => Some(AllocStrategy::Aligned),
            AllocStrategy::Aligned => Some(AllocStrategy::Heap),
            AllocStrategy::Heap => None,
        }
    }
}

enum Backing {
    Empty,
    Mmap(#[allow(dead_code)] MmapMut),
    Aligned,
    Heap(Layout),
}

/// A fixed-length, zero-initialised array of `T`.
pub struct HugeBuffer<T: Zeroable> {
    ptr: NonNull<T>,
    len: usize,
    backing: Backing,
    _marker: PhantomData<T>,
}

impl<T: Zeroable> HugeBuffer<T> {
    /// Allocate `len` zeroed elements, trying every strategy in order.
    ///
    /// `purpose` is only used for log lines and the error message.
    pub fn zeroed(len: usize, purpose: &'static str) -> Result<Self> {
        Self::zeroed_from(len, purpose, AllocStrategy::Mmap)
    }

    /// Like [`HugeBuffer::zeroed`], but start the fallback chain at `first`.
    pub fn zeroed_from(len: usize, purpose: &'static str, first: AllocStrategy) -> Result<Self> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(Error::Alloc {
                purpose,
                bytes: usize::MAX,
            })?;

        if bytes == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
                backing: Backing::Empty,
                _marker: PhantomData,
            });
        }

        let mut strategy = Some(first);
        while let Some(current) = strategy {
            match Self::try_alloc(current, len, bytes) {
                Ok((ptr, backing)) => {
                    debug!(purpose, bytes, strategy = ?current, "allocated buffer");
                    return Ok(Self {
                        ptr,
                        len,
                        backing,
                        _marker: PhantomData,
                    });
                }
                Err(e) => {
                    warn!(purpose, bytes, strategy = ?current, error = %e, "allocation strategy failed, falling back");
                    strategy = current.next();
                }
            }
        }

        Err(Error::Alloc { purpose, bytes })
    }

    fn try_alloc(strategy: AllocStrategy, len: usize, bytes: usize) -> io::Result<(NonNull<T>, Backing)> {
        match strategy {
            AllocStrategy::Mmap => {
                let mut mmap = MmapOptions::new().len(bytes).map_anon()?;
                #[cfg(target_os = "linux")]
                {
                    // Only a hint; a refusal still leaves us with usable memory.
                    let _ = mmap.advise(memmap2::Advice::HugePage);
                }
                let ptr = NonNull::new(mmap.as_mut_ptr() as *mut T)
                    .ok_or_else(|| io::Error::other("anonymous mapping returned null"))?;
                Ok((ptr, Backing::Mmap(mmap)))
            }
            AllocStrategy::Aligned => {
                let raw = aligned_zeroed(bytes)?;
                let ptr = NonNull::new(raw as *mut T)
                    .ok_or_else(|| io::Error::other("posix_memalign returned null"))?;
                Ok((ptr, Backing::Aligned))
            }
            AllocStrategy::Heap => {
                let layout = Layout::array::<T>(len).map_err(io::Error::other)?;
                // SAFETY: layout has non-zero size (bytes > 0 checked by caller).
                let raw = unsafe { alloc::alloc_zeroed(layout) };
                let ptr = NonNull::new(raw as *mut T)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
                Ok((ptr, Backing::Heap(layout)))
            }
        }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The strategy that produced this buffer, or `None` for an empty buffer.
    pub fn strategy(&self) -> Option<AllocStrategy> {
        match self.backing {
            Backing::Empty => None,
            Backing::Mmap(_) => Some(AllocStrategy::Mmap),
            Backing::Aligned => Some(AllocStrategy::Aligned),
            Backing::Heap(_) => Some(AllocStrategy::Heap),
        }
    }

    /// Size of the buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Raw pointer to the first element.
    ///
    /// Callers that write through this pointer while holding only `&self`
    /// must provide their own exclusion (see `CountsArray`).
    #[inline]
    pub fn raw_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Allocate a new buffer and copy this one into it.
    pub fn try_clone(&self, purpose: &'static str) -> Result<Self> {
        let mut copy = Self::zeroed(self.len, purpose)?;
        copy.copy_from_slice(self);
        Ok(copy)
    }
}

#[cfg(unix)]
fn aligned_zeroed(bytes: usize) -> io::Result<*mut u8> {
    let mut raw: *mut libc::c_void = ptr::null_mut();
    // SAFETY: raw is a valid out-pointer and the alignment is a power of two
    // multiple of sizeof(void*).
    let rc = unsafe { libc::posix_memalign(&mut raw, HUGE_PAGE_SIZE, bytes) };
    if rc != 0 || raw.is_null() {
        return Err(io::Error::from_raw_os_error(rc));
    }

    #[cfg(target_os = "linux")]
    {
        // SAFETY: raw..raw+bytes was just allocated; madvise failure is harmless.
        let _ = unsafe { libc::madvise(raw, bytes, libc::MADV_HUGEPAGE) };
    }

    // SAFETY: raw is valid for `bytes` writable bytes.
    unsafe { ptr::write_bytes(raw as *mut u8, 0, bytes) };
    Ok(raw as *mut u8)
}

#[cfg(not(unix))]
fn aligned_zeroed(_bytes: usize) -> io::Result<*mut u8> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

impl<T: Zeroable> Drop for HugeBuffer<T> {
    fn drop(&mut self) {
        match &self.backing {
            // The mapping is released when the MmapMut drops.
            Backing::Empty | Backing::Mmap(_) => {}
            Backing::Aligned => {
                #[cfg(unix)]
                // SAFETY: ptr came from posix_memalign and is freed once.
                unsafe {
                    libc::free(self.ptr.as_ptr() as *mut libc::c_void)
                };
            }
            Backing::Heap(layout) => {
                // SAFETY: ptr came from alloc_zeroed with this exact layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, *layout) };
            }
        }
    }
}

impl<T: Zeroable> Deref for HugeBuffer<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        // SAFETY: ptr is valid (or dangling with len 0) for len initialised elements.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Zeroable> DerefMut for HugeBuffer<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Zeroable> fmt::Debug for HugeBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HugeBuffer")
            .field("len", &self.len)
            .field("strategy", &self.strategy())
            .finish()
    }
}

// The buffer owns its memory exclusively.
unsafe impl<T: Zeroable> Send for HugeBuffer<T> {}
unsafe impl<T: Zeroable> Sync for HugeBuffer<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_writable() {
        let mut buf: HugeBuffer<u64> = HugeBuffer::zeroed(4096, "test").unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|&w| w == 0));

        buf[17] = 0xdead_beef;
        assert_eq!(buf[17], 0xdead_beef);
        assert!(buf.strategy().is_some());
    }

    #[test]
    fn test_every_strategy() {
        for strategy in [AllocStrategy::Mmap, AllocStrategy::Aligned, AllocStrategy::Heap] {
            let mut buf: HugeBuffer<u32> = HugeBuffer::zeroed_from(1000, "test", strategy).unwrap();
            assert!(buf.iter().all(|&c| c == 0));
            buf[999] = 7;
            assert_eq!(buf.iter().map(|&c| c as u64).sum::<u64>(), 7);
        }

        let heap: HugeBuffer<u8> = HugeBuffer::zeroed_from(10, "test", AllocStrategy::Heap).unwrap();
        assert_eq!(heap.strategy(), Some(AllocStrategy::Heap));
    }

    #[test]
    fn test_empty_buffer() {
        let buf: HugeBuffer<u32> = HugeBuffer::zeroed(0, "test").unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.strategy(), None);
        assert_eq!(&buf[..], &[] as &[u32]);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a: HugeBuffer<u32> = HugeBuffer::zeroed(64, "test").unwrap();
        a[3] = 42;
        let mut b = a.try_clone("test").unwrap();
        assert_eq!(b[3], 42);

        b[3] = 1;
        assert_eq!(a[3], 42);
    }

    #[test]
    fn test_overflowing_request_fails() {
        let err = HugeBuffer::<u64>::zeroed(usize::MAX, "test").unwrap_err();
        assert!(matches!(err, Error::Alloc { .. }));
    }
}
