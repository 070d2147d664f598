use std::fmt::Debug;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Typed view over a region of (possibly shared) memory.
///
/// Plain accessors read and write little-endian values at any offset.
/// Ordered accessors go through `AtomicI32`/`AtomicI64` and require a
/// naturally aligned offset; they are what other processes synchronise on:
///
/// - `*_volatile` loads use `Acquire`,
/// - `*_ordered` stores use `Release`,
/// - read-modify-write operations use `AcqRel`.
///
/// The view borrows the owner of the memory for `'a`, so it cannot outlive
/// the mapping it points into. Every access is bounds checked and panics
/// when it falls outside the view.
#[derive(Clone, Copy)]
pub struct AtomicBuffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a [u8]>,
}

unsafe impl Send for AtomicBuffer<'_> {}
unsafe impl Sync for AtomicBuffer<'_> {}

impl<'a> AtomicBuffer<'a> {
    /// Wraps `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes for `'a` and aligned to
    /// at least 8 bytes.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % 8, 0);
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Sub-view of `len` bytes starting at `offset`.
    pub fn view(&self, offset: usize, len: usize) -> AtomicBuffer<'a> {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "view out of bounds"
        );
        Self {
            ptr: unsafe { self.ptr.add(offset) },
            len,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn at(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "access out of bounds: offset={offset} len={len} capacity={}",
            self.len
        );
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    #[inline(always)]
    fn atomic_i32(&self, offset: usize) -> &'a AtomicI32 {
        assert_eq!(offset % 4, 0, "unaligned atomic i32 at {offset}");
        unsafe { &*(self.at(offset, 4) as *const AtomicI32) }
    }

    #[inline(always)]
    fn atomic_i64(&self, offset: usize) -> &'a AtomicI64 {
        assert_eq!(offset % 8, 0, "unaligned atomic i64 at {offset}");
        unsafe { &*(self.at(offset, 8) as *const AtomicI64) }
    }

    #[inline(always)]
    pub fn get_u8(&self, offset: usize) -> u8 {
        unsafe { self.at(offset, 1).read() }
    }

    #[inline(always)]
    pub fn put_u8(&self, offset: usize, value: u8) {
        unsafe { self.at(offset, 1).write(value) }
    }

    #[inline(always)]
    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(unsafe { (self.at(offset, 2) as *const [u8; 2]).read_unaligned() })
    }

    #[inline(always)]
    pub fn put_u16(&self, offset: usize, value: u16) {
        unsafe { (self.at(offset, 2) as *mut [u8; 2]).write_unaligned(value.to_le_bytes()) }
    }

    #[inline(always)]
    pub fn get_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(unsafe { (self.at(offset, 4) as *const [u8; 4]).read_unaligned() })
    }

    #[inline(always)]
    pub fn put_i32(&self, offset: usize, value: i32) {
        unsafe { (self.at(offset, 4) as *mut [u8; 4]).write_unaligned(value.to_le_bytes()) }
    }

    #[inline(always)]
    pub fn get_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(unsafe { (self.at(offset, 8) as *const [u8; 8]).read_unaligned() })
    }

    #[inline(always)]
    pub fn put_i64(&self, offset: usize, value: i64) {
        unsafe { (self.at(offset, 8) as *mut [u8; 8]).write_unaligned(value.to_le_bytes()) }
    }

    #[inline(always)]
    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Release)
    }

    #[inline(always)]
    pub fn compare_and_set_i32(&self, offset: usize, expected: i32, update: i32) -> bool {
        self.atomic_i32(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline(always)]
    pub fn get_i64_volatile(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn put_i64_ordered(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Release)
    }

    /// Adds `delta` and returns the previous value.
    #[inline(always)]
    pub fn get_and_add_i64(&self, offset: usize, delta: i64) -> i64 {
        self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel)
    }

    #[inline(always)]
    pub fn compare_and_set_i64(&self, offset: usize, expected: i64, update: i64) -> bool {
        self.atomic_i64(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline(always)]
    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        let dst = self.at(offset, src.len());
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) }
    }

    #[inline(always)]
    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        let src = self.at(offset, dst.len());
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) }
    }

    pub fn set_memory(&self, offset: usize, len: usize, value: u8) {
        let dst = self.at(offset, len);
        unsafe { std::ptr::write_bytes(dst, value, len) }
    }

    /// Borrows `len` bytes at `offset` immutably.
    ///
    /// # Safety
    ///
    /// No one may write the range while the slice is alive.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.at(offset, len), len) }
    }

    /// Borrows `len` bytes at `offset` mutably.
    ///
    /// # Safety
    ///
    /// The caller must be the only one accessing the range while the slice is
    /// alive. For a term buffer this holds for bytes at or beyond the frame
    /// being written, which readers do not touch until its length is
    /// published.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.at(offset, len), len) }
    }
}

impl Debug for AtomicBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
