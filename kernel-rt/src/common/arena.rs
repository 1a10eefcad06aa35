use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Range,
};

/// 地址空间空闲表。
///
/// 只记录地址区间，不持有存储本身，因此可以同时服务于主机和设备存储。
/// 分配采用最佳适配，回收时与相邻空闲区间合并。
#[derive(Debug)]
pub struct FreeList {
    alignment: usize,
    by_offset: BTreeMap<usize, usize>,
    by_len: BTreeSet<(usize, usize)>,
}

impl FreeList {
    pub fn new(alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        Self {
            alignment,
            by_offset: BTreeMap::new(),
            by_len: BTreeSet::new(),
        }
    }

    #[inline]
    fn round(&self, len: usize) -> usize {
        len.div_ceil(self.alignment) * self.alignment
    }

    /// 空闲字节总数。
    pub fn free_bytes(&self) -> usize {
        self.by_offset.values().sum()
    }

    /// 归还一个区间，区间起点必须对齐。
    pub fn put(&mut self, range: Range<usize>) {
        // 空区间也占用一个对齐单位，与 take 对应
        let mut len = self.round(range.len().max(1));
        let mut off = range.start;
        debug_assert_eq!(off % self.alignment, 0);

        if let Some((&prev, &prev_len)) = self.by_offset.range(..off).next_back() {
            if prev + prev_len == off {
                self.remove(prev, prev_len);
                off = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.by_offset.get(&(off + len)) {
            self.remove(off + len, next_len);
            len += next_len;
        }
        self.insert(off, len)
    }

    /// 取出一个至少 `size` 字节的区间。
    pub fn take(&mut self, size: usize) -> Option<Range<usize>> {
        let len = self.round(size.max(1));
        let &(free_len, off) = self.by_len.range((len, 0)..).next()?;
        self.remove(off, free_len);
        if free_len > len {
            self.insert(off + len, free_len - len)
        }
        Some(off..off + size)
    }

    fn insert(&mut self, off: usize, len: usize) {
        self.by_offset.insert(off, len);
        self.by_len.insert((len, off));
    }

    fn remove(&mut self, off: usize, len: usize) {
        self.by_offset.remove(&off);
        self.by_len.remove(&(len, off));
    }
}
