use log::{debug, warn};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering::Acquire},
        Arc, Mutex,
    },
};

/// 流上的一个位置。
///
/// 流在执行到这个位置时推进退休计数，此后 [`Mark::is_retired`] 返回 `true`。
#[derive(Clone, Debug)]
pub struct Mark {
    retired: Arc<AtomicU64>,
    position: u64,
}

impl Mark {
    #[inline]
    pub fn new(retired: Arc<AtomicU64>, position: u64) -> Self {
        Self { retired, position }
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Acquire) >= self.position
    }
}

/// 延迟释放队列。
///
/// 异步拷贝的源内存在入队时转移到这里，直到拷贝所在的流越过入队时记录的位置才释放。
pub struct DeferredRelease<M> {
    entries: Mutex<VecDeque<(Mark, M)>>,
}

impl<M> Default for DeferredRelease<M> {
    #[inline]
    fn default() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }
}

impl<M> DeferredRelease<M> {
    pub fn push(&self, mark: Mark, mem: M) {
        self.entries.lock().unwrap().push_back((mark, mem))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 检查队列中是否有满足条件的内存。
    pub fn any(&self, mut f: impl FnMut(&M) -> bool) -> bool {
        self.entries.lock().unwrap().iter().any(|(_, mem)| f(mem))
    }

    /// 释放所有位置已经退休的条目，返回释放的数量。
    pub fn reclaim(&self) -> usize {
        let released = {
            let mut entries = self.entries.lock().unwrap();
            let (retired, pending): (VecDeque<_>, VecDeque<_>) =
                entries.drain(..).partition(|(mark, _)| mark.is_retired());
            *entries = pending;
            retired
        };
        // 在锁外析构，释放函数可能较慢
        let n = released.len();
        if n > 0 {
            debug!("reclaimed {n} deferred host allocation(s)");
        }
        drop(released);
        n
    }
}

impl<M> Drop for DeferredRelease<M> {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap();
        let pending = entries.iter().filter(|(mark, _)| !mark.is_retired()).count();
        if pending > 0 {
            warn!("{pending} deferred host allocation(s) dropped before their stream retired");
        }
    }
}
