//! 英伟达 GPU，CUDA 运行时在运行时动态加载。

mod runtime;
mod stream;

pub use stream::Stream;

use crate::{
    args_not_support, device_failure, utils::check_copy, DataTransfer, DeferredRelease,
    DeviceError, DeviceProp, FreeList, Hardware, LaunchError, Pool, Provider, Queue, Tensor,
};
use digit_layout::{types as ty, DigitLayout};
use half::{bf16, f16};
use log::{debug, warn};
use runtime::{
    check_cublas, cublas, runtime, Cublas, Runtime, ATTR_COMPUTE_CAPABILITY_MAJOR,
    ATTR_COMPUTE_CAPABILITY_MINOR, ATTR_MAX_THREADS_PER_BLOCK, ATTR_MULTIPROCESSOR_COUNT,
    MEMCPY_H2D, SUCCESS,
};
use std::{
    collections::HashMap,
    ffi::{c_int, c_void},
    ops::{Deref, DerefMut, Range},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{Arc, Mutex},
};

#[derive(Clone, Copy, Debug)]
pub struct Gpu;

/// 硬件存储的字节，主机不可直接读写。
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct DevByte(#[allow(dead_code)] u8);

impl Hardware for Gpu {
    type Byte = DevByte;
    type Queue = Stream;
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device_id: i32,
    /// 池每次扩张的最小字节数。
    pub arena_chunk: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: 0,
            arena_chunk: 64 << 20,
        }
    }
}

const ALIGNMENT: usize = 256;

pub struct GpuProvider {
    rt: &'static Runtime,
    device: c_int,
    prop: DeviceProp,
    arena: Arc<Arena>,
    deferred: DeferredRelease<PinnedMem>,
    blas: Pool<Blas>,
    ones: Mutex<HashMap<DigitLayout, Vec<DevMem>>>,
}

impl GpuProvider {
    /// 没有可用的 CUDA 运行时或设备时返回 `None`。
    pub fn new(config: Config) -> Option<Self> {
        let rt = runtime()?;
        let mut count = 0;
        if unsafe { (rt.get_device_count)(&mut count) } != SUCCESS || config.device_id >= count {
            return None;
        }
        let device = config.device_id;
        let prop = match query_prop(rt, device) {
            Ok(prop) => prop,
            Err(e) => {
                warn!("failed to query device {device}: {e}");
                return None;
            }
        };
        debug!("{prop:?}");
        Some(Self {
            rt,
            device,
            prop,
            arena: Arc::new(Arena {
                rt,
                device,
                chunk: config.arena_chunk,
                state: Mutex::new(ArenaState {
                    chunks: Vec::new(),
                    free: FreeList::new(ALIGNMENT),
                }),
            }),
            deferred: Default::default(),
            blas: Default::default(),
            ones: Default::default(),
        })
    }

    /// 在此设备上创建一个流。
    #[inline]
    pub fn stream(&self) -> Result<Stream, DeviceError> {
        Stream::new(self.rt, self.device)
    }

    #[inline]
    fn activate(&self) -> Result<(), DeviceError> {
        self.rt.check(unsafe { (self.rt.set_device)(self.device) })
    }
}

fn query_prop(rt: &Runtime, device: c_int) -> Result<DeviceProp, DeviceError> {
    rt.check(unsafe { (rt.set_device)(device) })?;
    let attr = |attr| {
        let mut value = 0;
        rt.check(unsafe { (rt.device_get_attribute)(&mut value, attr, device) })
            .map(|()| value)
    };
    let (mut free, mut total) = (0, 0);
    rt.check(unsafe { (rt.mem_get_info)(&mut free, &mut total) })?;
    Ok(DeviceProp {
        name: format!("cuda:{device}"),
        total_memory: total,
        max_threads_per_block: attr(ATTR_MAX_THREADS_PER_BLOCK)? as _,
        multiprocessor_count: attr(ATTR_MULTIPROCESSOR_COUNT)? as _,
        compute_capability: (
            attr(ATTR_COMPUTE_CAPABILITY_MAJOR)? as _,
            attr(ATTR_COMPUTE_CAPABILITY_MINOR)? as _,
        ),
        alignment: ALIGNMENT,
    })
}

/// 在当前设备上分配 `size` 字节，0 字节也得到一个有效地址。
fn malloc(rt: &Runtime, size: usize) -> Result<*mut c_void, DeviceError> {
    let mut ptr = null_mut();
    rt.check(unsafe { (rt.malloc)(&mut ptr, size.max(1)) })?;
    Ok(ptr)
}

impl Provider for GpuProvider {
    type Hardware = Gpu;
    type DevMem = DevMem;
    type HostMem = PinnedMem;
    type Blas = Blas;

    #[inline]
    fn device_id(&self) -> i32 {
        self.device
    }

    #[inline]
    fn device_prop(&self) -> &DeviceProp {
        &self.prop
    }

    fn scratch(&self, size: usize) -> Option<DevMem> {
        self.arena.take(size)
    }

    fn transient(&self, size: usize) -> Option<DevMem> {
        self.activate().ok()?;
        match malloc(self.rt, size) {
            Ok(ptr) => Some(DevMem {
                storage: Storage::Transient(self.rt, ptr, size),
            }),
            Err(e) => {
                warn!("cudaMalloc({size}) failed: {e}");
                None
            }
        }
    }

    fn pinned(&self, size: usize) -> Option<PinnedMem> {
        self.reclaim();
        let rt = self.rt;
        let mut ptr = null_mut();
        match rt.check(unsafe { (rt.malloc_host)(&mut ptr, size.max(1)) }) {
            Ok(()) => Some(PinnedMem {
                rt,
                ptr: NonNull::new(ptr.cast())?,
                len: size,
            }),
            Err(e) => {
                warn!("cudaMallocHost({size}) failed: {e}");
                None
            }
        }
    }

    #[inline]
    fn deferred(&self) -> &DeferredRelease<PinnedMem> {
        &self.deferred
    }

    fn last_error(&self) -> Option<DeviceError> {
        match unsafe { (self.rt.get_last_error)() } {
            SUCCESS => None,
            code => Some(self.rt.error(code)),
        }
    }

    fn blas<T>(&self, queue: &Stream, f: impl FnOnce(&Blas) -> T) -> Result<T, LaunchError> {
        let lib = cublas().ok_or_else(|| device_failure("cuBLAS is not available"))?;
        let blas = match self.blas.pop() {
            Some(blas) => blas,
            None => {
                self.activate()?;
                let mut raw = null_mut();
                check_cublas(unsafe { (lib.create)(&mut raw) }, "cublasCreate")?;
                Blas { lib, raw }
            }
        };
        if let Err(e) = check_cublas(
            unsafe { (lib.set_stream)(blas.raw, queue.as_raw()) },
            "cublasSetStream",
        ) {
            self.blas.push(blas);
            return Err(e.into());
        }
        let ans = f(&blas);
        self.blas.push(blas);
        Ok(ans)
    }

    fn const_ones(&self, dt: DigitLayout, count: usize) -> Result<*const DevByte, LaunchError> {
        let one = match dt {
            ty::F16 => f16::ONE.to_le_bytes().to_vec(),
            ty::BF16 => bf16::ONE.to_le_bytes().to_vec(),
            ty::F32 => 1f32.to_le_bytes().to_vec(),
            ty::F64 => 1f64.to_le_bytes().to_vec(),
            _ => return Err(args_not_support(format!("ones of {dt:?}"))),
        };
        let size = count * one.len();

        let mut ones = self.ones.lock().unwrap();
        let cached = ones.entry(dt).or_default();
        if let Some(mem) = cached.last().filter(|mem| mem.len() >= size) {
            return Ok(mem.as_ptr());
        }
        let mut mem = self
            .transient(size)
            .unwrap_or_else(|| panic!("out of device memory: {size} bytes requested"));
        let host = one.repeat(count);
        let rt = self.rt;
        rt.check(unsafe {
            (rt.memcpy)(
                mem.as_mut_ptr().cast(),
                host.as_ptr().cast(),
                size,
                MEMCPY_H2D,
            )
        })?;
        let ptr = mem.as_ptr();
        cached.push(mem);
        Ok(ptr)
    }

    #[inline]
    fn data_transfer(&self) -> &dyn DataTransfer<Gpu> {
        &GpuTransfer
    }
}

struct GpuTransfer;

impl DataTransfer<Gpu> for GpuTransfer {
    fn copy(
        &self,
        src: &Tensor<Gpu>,
        dst: &mut Tensor<Gpu>,
        queue: &Stream,
    ) -> Result<(), LaunchError> {
        let len = check_copy(&src.layout, &dst.layout)?;
        unsafe { queue.memcpy_d2d(dst.base, src.base, len) }?;
        Ok(())
    }
}

/// cuBLAS 句柄。
pub struct Blas {
    lib: &'static Cublas,
    raw: *mut c_void,
}

unsafe impl Send for Blas {}

impl Blas {
    #[inline]
    pub fn as_raw(&self) -> *mut c_void {
        self.raw
    }
}

impl Drop for Blas {
    fn drop(&mut self) {
        if let Err(e) = check_cublas(unsafe { (self.lib.destroy)(self.raw) }, "cublasDestroy") {
            warn!("{e}")
        }
    }
}

struct Arena {
    rt: &'static Runtime,
    device: c_int,
    chunk: usize,
    state: Mutex<ArenaState>,
}

struct ArenaState {
    chunks: Vec<usize>,
    free: FreeList,
}

impl Arena {
    fn take(self: &Arc<Self>, size: usize) -> Option<DevMem> {
        let mut state = self.state.lock().unwrap();
        let range = match state.free.take(size) {
            Some(range) => range,
            None => {
                let len = size.max(self.chunk).div_ceil(ALIGNMENT) * ALIGNMENT;
                let rt = self.rt;
                rt.check(unsafe { (rt.set_device)(self.device) }).ok()?;
                let start = match malloc(rt, len + ALIGNMENT) {
                    Ok(ptr) => ptr as usize,
                    Err(e) => {
                        warn!("arena failed to grow by {len} bytes: {e}");
                        return None;
                    }
                };
                debug!("arena grows by {len} bytes");
                state.chunks.push(start);
                state.free.put(start..start + len);
                state.free.take(size)?
            }
        };
        Some(DevMem {
            storage: Storage::Arena(self.clone(), range),
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let rt = self.rt;
        for &chunk in &self.state.get_mut().unwrap().chunks {
            let _ = rt.check(unsafe { (rt.free)(chunk as _) });
        }
    }
}

/// 硬件存储。
pub struct DevMem {
    storage: Storage,
}

enum Storage {
    Arena(Arc<Arena>, Range<usize>),
    Transient(&'static Runtime, *mut c_void, usize),
}

unsafe impl Send for DevMem {}

impl Deref for DevMem {
    type Target = [DevByte];
    #[inline]
    fn deref(&self) -> &[DevByte] {
        match &self.storage {
            Storage::Arena(_, range) => unsafe { from_raw_parts(range.start as _, range.len()) },
            &Storage::Transient(_, ptr, len) => unsafe { from_raw_parts(ptr.cast(), len) },
        }
    }
}

impl DerefMut for DevMem {
    #[inline]
    fn deref_mut(&mut self) -> &mut [DevByte] {
        match &self.storage {
            Storage::Arena(_, range) => unsafe {
                from_raw_parts_mut(range.start as _, range.len())
            },
            &Storage::Transient(_, ptr, len) => unsafe { from_raw_parts_mut(ptr.cast(), len) },
        }
    }
}

impl Drop for DevMem {
    fn drop(&mut self) {
        match &self.storage {
            Storage::Arena(arena, range) => arena.state.lock().unwrap().free.put(range.clone()),
            &Storage::Transient(rt, ptr, _) => {
                let _ = rt.check(unsafe { (rt.free)(ptr) });
            }
        }
    }
}

/// 锁页主机存储。
pub struct PinnedMem {
    rt: &'static Runtime,
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for PinnedMem {}

impl Deref for PinnedMem {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PinnedMem {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PinnedMem {
    fn drop(&mut self) {
        let rt = self.rt;
        let _ = rt.check(unsafe { (rt.free_host)(self.ptr.as_ptr().cast()) });
    }
}
