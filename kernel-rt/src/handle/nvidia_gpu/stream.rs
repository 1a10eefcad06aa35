use super::{
    runtime::{CudaError, RawStream, Runtime, MEMCPY_D2D, MEMCPY_H2D, SUCCESS},
    DevByte,
};
use crate::{execution_failed, DeviceError, Done, Mark, Queue};
use std::{
    ffi::{c_int, c_void},
    ptr::null_mut,
    sync::{
        atomic::{
            AtomicU64,
            Ordering::{AcqRel, Relaxed},
        },
        Arc, Mutex,
    },
};

/// CUDA 流。
pub struct Stream {
    rt: &'static Runtime,
    raw: RawStream,
    device: c_int,
    id: u64,
    /// 已分配的最大标记位置，锁保证标记按位置顺序入流。
    marks: Mutex<u64>,
    retired: Arc<AtomicU64>,
}

unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

impl Stream {
    pub(super) fn new(rt: &'static Runtime, device: c_int) -> Result<Self, DeviceError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        let mut raw = null_mut();
        rt.check(unsafe { (rt.set_device)(device) })?;
        rt.check(unsafe { (rt.stream_create)(&mut raw) })?;
        Ok(Self {
            rt,
            raw,
            device,
            id: NEXT_ID.fetch_add(1, Relaxed),
            marks: Mutex::new(0),
            retired: Arc::new(AtomicU64::new(0)),
        })
    }

    #[inline]
    pub fn as_raw(&self) -> RawStream {
        self.raw
    }

    fn memcpy(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        kind: c_int,
    ) -> Result<(), DeviceError> {
        if len == 0 {
            return Ok(());
        }
        let rt = self.rt;
        rt.check(unsafe { (rt.set_device)(self.device) })?;
        rt.check(unsafe { (rt.memcpy_async)(dst, src, len, kind, self.raw) })
    }

    /// 在流上登记一个主机函数，返回错误时 `data` 已被回收。
    fn host_fn<T>(
        &self,
        f: unsafe extern "C" fn(RawStream, CudaError, *mut c_void),
        data: Box<T>,
    ) -> Result<(), DeviceError> {
        let data = Box::into_raw(data);
        let code = unsafe { (self.rt.stream_add_callback)(self.raw, f, data.cast(), 0) };
        if code != SUCCESS {
            drop(unsafe { Box::from_raw(data) });
        }
        self.rt.check(code)
    }
}

// 流回调中不能调用 CUDA 接口，只做记录

unsafe extern "C" fn retire(_: RawStream, _: CudaError, data: *mut c_void) {
    let (retired, position) = *Box::from_raw(data.cast::<(Arc<AtomicU64>, u64)>());
    retired.fetch_max(position, AcqRel);
}

unsafe extern "C" fn call_done(_: RawStream, status: CudaError, data: *mut c_void) {
    let done = *Box::from_raw(data.cast::<Done>());
    done.call(if status == SUCCESS {
        Ok(())
    } else {
        Err(execution_failed(format!(
            "stream failed with cuda error {status}"
        )))
    })
}

impl Queue for Stream {
    type Byte = DevByte;

    #[inline]
    fn id(&self) -> u64 {
        self.id
    }

    unsafe fn memcpy_h2d(
        &self,
        dst: *mut DevByte,
        src: *const u8,
        len: usize,
    ) -> Result<(), DeviceError> {
        self.memcpy(dst.cast(), src.cast(), len, MEMCPY_H2D)
    }

    unsafe fn memcpy_d2d(
        &self,
        dst: *mut DevByte,
        src: *const DevByte,
        len: usize,
    ) -> Result<(), DeviceError> {
        self.memcpy(dst.cast(), src.cast(), len, MEMCPY_D2D)
    }

    #[inline]
    fn add_callback(&self, done: Done) -> Result<(), DeviceError> {
        self.host_fn(call_done, Box::new(done))
    }

    fn mark(&self) -> Result<Mark, DeviceError> {
        let mut marks = self.marks.lock().unwrap();
        let position = *marks + 1;
        self.host_fn(retire, Box::new((self.retired.clone(), position)))?;
        *marks = position;
        Ok(Mark::new(self.retired.clone(), position))
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        let rt = self.rt;
        rt.check(unsafe { (rt.stream_synchronize)(self.raw) })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let rt = self.rt;
        // 已登记的回调仍会执行，之后才真正销毁
        let _ = rt.check(unsafe { (rt.stream_synchronize)(self.raw) });
        let _ = rt.check(unsafe { (rt.stream_destroy)(self.raw) });
    }
}
