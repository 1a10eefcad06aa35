//! 用主机线程模拟的硬件。
//!
//! 每个流是一个驱动线程，存储是主机内存。提供故障注入和流暂停，用于观察异步行为。

mod stream;

pub use stream::{Fault, Stream, Work};

use crate::{
    args_not_support, utils::check_copy, Blob, DataTransfer, DeferredRelease, DeviceError,
    DeviceProp, FreeList, Hardware, LaunchError, Pool, Provider, Queue, Tensor,
};
use digit_layout::{types as ty, DigitLayout};
use half::{bf16, f16};
use log::debug;
use rayon::{iter::ParallelIterator, slice::ParallelSliceMut};
use std::{
    collections::HashMap,
    ops::{Deref, DerefMut, Range},
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Mutex,
    },
};

#[derive(Clone, Copy, Debug)]
pub struct Cpu;

impl Hardware for Cpu {
    type Byte = u8;
    type Queue = Stream;
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device_id: i32,
    pub name: String,
    /// 所有存储的对齐。
    pub alignment: usize,
    /// 池每次扩张的最小字节数。
    pub arena_chunk: usize,
    /// 锁页存储上限。
    pub pinned_limit: usize,
    pub total_memory: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: 0,
            name: "emulated".into(),
            alignment: 256,
            arena_chunk: 1 << 20,
            pinned_limit: usize::MAX,
            total_memory: 1 << 30,
        }
    }
}

pub struct CpuProvider {
    config: Config,
    prop: DeviceProp,
    arena: Arc<Arena>,
    pinned_in_use: Arc<AtomicUsize>,
    deferred: DeferredRelease<PinnedMem>,
    last_error: Arc<Mutex<Option<DeviceError>>>,
    blas: Pool<Blas>,
    blas_created: AtomicUsize,
    ones: Mutex<HashMap<DigitLayout, Vec<DevMem>>>,
}

impl Default for CpuProvider {
    #[inline]
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl CpuProvider {
    pub fn new(config: Config) -> Self {
        let prop = DeviceProp {
            name: config.name.clone(),
            total_memory: config.total_memory,
            max_threads_per_block: 1024,
            multiprocessor_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            compute_capability: (0, 0),
            alignment: config.alignment,
        };
        Self {
            arena: Arc::new(Arena {
                alignment: config.alignment,
                chunk: config.arena_chunk,
                state: Mutex::new(ArenaState {
                    chunks: Vec::new(),
                    free: FreeList::new(config.alignment),
                    reserved: 0,
                    in_use: 0,
                }),
            }),
            pinned_in_use: Default::default(),
            deferred: Default::default(),
            last_error: Default::default(),
            blas: Default::default(),
            blas_created: AtomicUsize::new(0),
            ones: Default::default(),
            prop,
            config,
        }
    }

    /// 创建一个与此提供者共享错误槽的流。
    #[inline]
    pub fn stream(&self) -> Stream {
        Stream::new(self.last_error.clone())
    }

    /// 记录一个硬件错误，就像刚刚发射的任务在硬件上出错。
    #[inline]
    pub fn raise(&self, e: DeviceError) {
        *self.last_error.lock().unwrap() = Some(e)
    }

    /// 正在使用的锁页存储字节数，包括延迟释放队列中的。
    #[inline]
    pub fn pinned_in_use(&self) -> usize {
        self.pinned_in_use.load(Relaxed)
    }

    /// 池已经从主机取得的字节数。
    #[inline]
    pub fn arena_reserved(&self) -> usize {
        self.arena.state.lock().unwrap().reserved
    }

    /// 池中被占用的字节数。
    #[inline]
    pub fn arena_in_use(&self) -> usize {
        self.arena.state.lock().unwrap().in_use
    }

    fn alloc_blob(&self, size: usize) -> Option<Blob> {
        Blob::new(size, self.config.alignment)
    }
}

impl Provider for CpuProvider {
    type Hardware = Cpu;
    type DevMem = DevMem;
    type HostMem = PinnedMem;
    type Blas = Blas;

    #[inline]
    fn device_id(&self) -> i32 {
        self.config.device_id
    }

    #[inline]
    fn device_prop(&self) -> &DeviceProp {
        &self.prop
    }

    #[inline]
    fn scratch(&self, size: usize) -> Option<DevMem> {
        self.arena.take(size)
    }

    fn transient(&self, size: usize) -> Option<DevMem> {
        self.alloc_blob(size).map(|blob| DevMem {
            storage: Storage::Transient(blob, size),
        })
    }

    fn pinned(&self, size: usize) -> Option<PinnedMem> {
        // 先回收已经安全的延迟释放存储
        self.reclaim();
        let limit = self.config.pinned_limit;
        self.pinned_in_use
            .fetch_update(Relaxed, Relaxed, |used| {
                used.checked_add(size).filter(|&total| total <= limit)
            })
            .ok()?;
        match self.alloc_blob(size) {
            Some(blob) => Some(PinnedMem {
                blob,
                len: size,
                in_use: self.pinned_in_use.clone(),
            }),
            None => {
                self.pinned_in_use.fetch_sub(size, Relaxed);
                None
            }
        }
    }

    #[inline]
    fn deferred(&self) -> &DeferredRelease<PinnedMem> {
        &self.deferred
    }

    #[inline]
    fn last_error(&self) -> Option<DeviceError> {
        self.last_error.lock().unwrap().take()
    }

    fn blas<T>(&self, queue: &Stream, f: impl FnOnce(&Blas) -> T) -> Result<T, LaunchError> {
        let mut blas = self.blas.pop().unwrap_or_else(|| Blas {
            id: self.blas_created.fetch_add(1, Relaxed),
            stream: None,
        });
        blas.stream = Some(queue.id());
        let ans = f(&blas);
        self.blas.push(blas);
        Ok(ans)
    }

    fn const_ones(&self, dt: DigitLayout, count: usize) -> Result<*const u8, LaunchError> {
        let one = one_bytes(dt)?;
        let size = count * one.len();

        let mut ones = self.ones.lock().unwrap();
        let cached = ones.entry(dt).or_default();
        if let Some(mem) = cached.last().filter(|mem| mem.len() >= size) {
            return Ok(mem.as_ptr());
        }
        // 旧的缓冲可能仍被已发射的任务引用，保留到提供者析构
        let mut mem = self
            .transient(size)
            .unwrap_or_else(|| panic!("out of device memory: {size} bytes requested"));
        mem.par_chunks_exact_mut(one.len())
            .for_each(|e| e.copy_from_slice(&one));
        let ptr = mem.as_ptr();
        cached.push(mem);
        Ok(ptr)
    }

    #[inline]
    fn data_transfer(&self) -> &dyn DataTransfer<Cpu> {
        &CpuTransfer
    }
}

fn one_bytes(dt: DigitLayout) -> Result<Vec<u8>, LaunchError> {
    Ok(match dt {
        ty::F16 => f16::ONE.to_le_bytes().to_vec(),
        ty::BF16 => bf16::ONE.to_le_bytes().to_vec(),
        ty::F32 => 1f32.to_le_bytes().to_vec(),
        ty::F64 => 1f64.to_le_bytes().to_vec(),
        _ => return Err(args_not_support(format!("ones of {dt:?}"))),
    })
}

/// 模拟硬件上的张量拷贝：在流上逐字节拷贝。
struct CpuTransfer;

impl DataTransfer<Cpu> for CpuTransfer {
    fn copy(
        &self,
        src: &Tensor<Cpu>,
        dst: &mut Tensor<Cpu>,
        queue: &Stream,
    ) -> Result<(), LaunchError> {
        let len = check_copy(&src.layout, &dst.layout)?;
        unsafe { queue.memcpy_d2d(dst.base, src.base, len) }?;
        Ok(())
    }
}

/// 模拟的数学库句柄。
#[derive(Debug)]
pub struct Blas {
    id: usize,
    stream: Option<u64>,
}

impl Blas {
    /// 句柄的创建序号。
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// 句柄当前绑定的流。
    #[inline]
    pub fn stream(&self) -> Option<u64> {
        self.stream
    }
}

struct Arena {
    alignment: usize,
    chunk: usize,
    state: Mutex<ArenaState>,
}

struct ArenaState {
    chunks: Vec<Blob>,
    free: FreeList,
    reserved: usize,
    in_use: usize,
}

impl Arena {
    fn take(self: &Arc<Self>, size: usize) -> Option<DevMem> {
        let mut state = self.state.lock().unwrap();
        let range = match state.free.take(size) {
            Some(range) => range,
            None => {
                let len = size.max(self.chunk).div_ceil(self.alignment) * self.alignment;
                // 多留一个对齐单位，避免相邻的块在空闲表中被合并
                let blob = Blob::new(len + self.alignment, self.alignment)?;
                let start = blob.as_ptr() as usize;
                debug!("arena grows by {len} bytes");
                state.chunks.push(blob);
                state.reserved += len;
                state.free.put(start..start + len);
                state.free.take(size)?
            }
        };
        state.in_use += range.len();
        Some(DevMem {
            storage: Storage::Arena(self.clone(), range),
        })
    }

    fn put(&self, range: Range<usize>) {
        let mut state = self.state.lock().unwrap();
        state.in_use -= range.len();
        state.free.put(range)
    }
}

/// 模拟的硬件存储。
pub struct DevMem {
    storage: Storage,
}

enum Storage {
    Arena(Arc<Arena>, Range<usize>),
    Transient(Blob, usize),
}

impl Deref for DevMem {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.storage {
            Storage::Arena(_, range) => unsafe { from_raw_parts(range.start as _, range.len()) },
            Storage::Transient(blob, len) => &blob[..*len],
        }
    }
}

impl DerefMut for DevMem {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Arena(_, range) => unsafe {
                from_raw_parts_mut(range.start as _, range.len())
            },
            Storage::Transient(blob, len) => &mut blob[..*len],
        }
    }
}

impl Drop for DevMem {
    fn drop(&mut self) {
        if let Storage::Arena(arena, range) = &self.storage {
            arena.put(range.clone())
        }
    }
}

/// 模拟的锁页存储，析构时归还配额。
pub struct PinnedMem {
    blob: Blob,
    len: usize,
    in_use: Arc<AtomicUsize>,
}

impl Deref for PinnedMem {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.blob[..self.len]
    }
}

impl DerefMut for PinnedMem {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.blob[..self.len]
    }
}

impl Drop for PinnedMem {
    #[inline]
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.len, Relaxed);
    }
}
