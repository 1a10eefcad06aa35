//! 运行时加载的 CUDA 运行时和 cuBLAS 符号。

use crate::DeviceError;
use libloading::Library;
use log::{debug, info};
use std::{
    ffi::{c_char, c_int, c_uint, c_void, CStr},
    sync::OnceLock,
};

pub(super) type CudaError = c_int;
pub(super) type RawStream = *mut c_void;
pub(super) type StreamCallback = unsafe extern "C" fn(RawStream, CudaError, *mut c_void);

pub(super) const SUCCESS: CudaError = 0;

pub(super) const MEMCPY_H2D: c_int = 1;
pub(super) const MEMCPY_D2D: c_int = 3;

pub(super) const ATTR_MAX_THREADS_PER_BLOCK: c_int = 1;
pub(super) const ATTR_MULTIPROCESSOR_COUNT: c_int = 16;
pub(super) const ATTR_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
pub(super) const ATTR_COMPUTE_CAPABILITY_MINOR: c_int = 76;

pub(super) struct Runtime {
    pub set_device: unsafe extern "C" fn(c_int) -> CudaError,
    pub get_device_count: unsafe extern "C" fn(*mut c_int) -> CudaError,
    pub device_get_attribute: unsafe extern "C" fn(*mut c_int, c_int, c_int) -> CudaError,
    pub mem_get_info: unsafe extern "C" fn(*mut usize, *mut usize) -> CudaError,
    pub malloc: unsafe extern "C" fn(*mut *mut c_void, usize) -> CudaError,
    pub free: unsafe extern "C" fn(*mut c_void) -> CudaError,
    pub malloc_host: unsafe extern "C" fn(*mut *mut c_void, usize) -> CudaError,
    pub free_host: unsafe extern "C" fn(*mut c_void) -> CudaError,
    pub memcpy: unsafe extern "C" fn(*mut c_void, *const c_void, usize, c_int) -> CudaError,
    pub memcpy_async:
        unsafe extern "C" fn(*mut c_void, *const c_void, usize, c_int, RawStream) -> CudaError,
    pub stream_create: unsafe extern "C" fn(*mut RawStream) -> CudaError,
    pub stream_destroy: unsafe extern "C" fn(RawStream) -> CudaError,
    pub stream_synchronize: unsafe extern "C" fn(RawStream) -> CudaError,
    pub stream_add_callback:
        unsafe extern "C" fn(RawStream, StreamCallback, *mut c_void, c_uint) -> CudaError,
    pub get_last_error: unsafe extern "C" fn() -> CudaError,
    get_error_name: unsafe extern "C" fn(CudaError) -> *const c_char,
    get_error_string: unsafe extern "C" fn(CudaError) -> *const c_char,
    _lib: Library,
}

/// 进程内唯一的运行时，找不到动态库或符号时为 `None`。
pub(super) fn runtime() -> Option<&'static Runtime> {
    static RT: OnceLock<Option<Runtime>> = OnceLock::new();
    RT.get_or_init(|| {
        const CANDIDATES: &[&str] = if cfg!(windows) {
            &["cudart64_12.dll", "cudart64_110.dll"]
        } else {
            &["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"]
        };
        let lib = open(CANDIDATES)?;
        let rt = unsafe { Runtime::load(lib) };
        if rt.is_none() {
            info!("cuda runtime found but incomplete");
        }
        rt
    })
    .as_ref()
}

impl Runtime {
    unsafe fn load(lib: Library) -> Option<Self> {
        Some(Self {
            set_device: sym(&lib, "cudaSetDevice")?,
            get_device_count: sym(&lib, "cudaGetDeviceCount")?,
            device_get_attribute: sym(&lib, "cudaDeviceGetAttribute")?,
            mem_get_info: sym(&lib, "cudaMemGetInfo")?,
            malloc: sym(&lib, "cudaMalloc")?,
            free: sym(&lib, "cudaFree")?,
            malloc_host: sym(&lib, "cudaMallocHost")?,
            free_host: sym(&lib, "cudaFreeHost")?,
            memcpy: sym(&lib, "cudaMemcpy")?,
            memcpy_async: sym(&lib, "cudaMemcpyAsync")?,
            stream_create: sym(&lib, "cudaStreamCreate")?,
            stream_destroy: sym(&lib, "cudaStreamDestroy")?,
            stream_synchronize: sym(&lib, "cudaStreamSynchronize")?,
            stream_add_callback: sym(&lib, "cudaStreamAddCallback")?,
            get_last_error: sym(&lib, "cudaGetLastError")?,
            get_error_name: sym(&lib, "cudaGetErrorName")?,
            get_error_string: sym(&lib, "cudaGetErrorString")?,
            _lib: lib,
        })
    }

    /// 把返回码转换为错误，名字和描述来自运行时。
    pub fn check(&self, code: CudaError) -> Result<(), DeviceError> {
        if code == SUCCESS {
            Ok(())
        } else {
            Err(self.error(code))
        }
    }

    pub fn error(&self, code: CudaError) -> DeviceError {
        let text = |ptr: *const c_char| {
            if ptr.is_null() {
                format!("cuda error {code}")
            } else {
                unsafe { CStr::from_ptr(ptr) }
                    .to_string_lossy()
                    .into_owned()
            }
        };
        DeviceError::new(
            text(unsafe { (self.get_error_name)(code) }),
            text(unsafe { (self.get_error_string)(code) }),
        )
    }
}

pub(super) struct Cublas {
    pub create: unsafe extern "C" fn(*mut *mut c_void) -> c_int,
    pub destroy: unsafe extern "C" fn(*mut c_void) -> c_int,
    pub set_stream: unsafe extern "C" fn(*mut c_void, RawStream) -> c_int,
    _lib: Library,
}

pub(super) fn cublas() -> Option<&'static Cublas> {
    static LIB: OnceLock<Option<Cublas>> = OnceLock::new();
    LIB.get_or_init(|| {
        const CANDIDATES: &[&str] = if cfg!(windows) {
            &["cublas64_12.dll", "cublas64_11.dll"]
        } else {
            &["libcublas.so", "libcublas.so.12", "libcublas.so.11"]
        };
        let lib = open(CANDIDATES)?;
        unsafe {
            Some(Cublas {
                create: sym(&lib, "cublasCreate_v2")?,
                destroy: sym(&lib, "cublasDestroy_v2")?,
                set_stream: sym(&lib, "cublasSetStream_v2")?,
                _lib: lib,
            })
        }
    })
    .as_ref()
}

/// cuBLAS 状态码转换为错误。
pub(super) fn check_cublas(status: c_int, call: &str) -> Result<(), DeviceError> {
    if status == 0 {
        Ok(())
    } else {
        Err(DeviceError::new(
            format!("CUBLAS_STATUS_{status}"),
            format!("{call} failed"),
        ))
    }
}

fn open(candidates: &[&str]) -> Option<Library> {
    for name in candidates {
        match unsafe { Library::new(name) } {
            Ok(lib) => {
                info!("loaded {name}");
                return Some(lib);
            }
            Err(e) => debug!("failed to load {name}: {e}"),
        }
    }
    None
}

unsafe fn sym<T: Copy>(lib: &Library, name: &str) -> Option<T> {
    match lib.get::<T>(name.as_bytes()) {
        Ok(f) => Some(*f),
        Err(e) => {
            debug!("missing symbol {name}: {e}");
            None
        }
    }
}
