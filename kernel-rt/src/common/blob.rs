use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// 按指定对齐分配的一块主机内存。
pub struct Blob {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for Blob {}
unsafe impl Sync for Blob {}

impl Blob {
    /// 分配 `size` 字节，失败时返回 `None`。
    pub fn new(size: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size.max(1), align.max(1)).ok()?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Blob {
    #[inline]
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl Deref for Blob {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for Blob {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

#[test]
fn test_alignment() {
    let blob = Blob::new(100, 256).unwrap();
    assert_eq!(blob.as_ptr() as usize % 256, 0);
    assert_eq!(blob.len(), 100);
    assert!(blob.iter().all(|&b| b == 0));
}
