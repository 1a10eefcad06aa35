// #![deny(warnings)]

mod async_buffer;
mod common;
mod handle;
mod kernel;

pub use async_buffer::AsyncHostBuffer;
pub use common::*;
pub use kernel::{Kernel, KernelBase, OpContext, OpKernel};

#[cfg(any(use_cpu, test))]
pub use handle::common_cpu;

#[cfg(use_cuda)]
pub use handle::nvidia_gpu;

use digit_layout::DigitLayout;
use log::warn;
use std::ops::DerefMut;

/// 算力硬件抽象。
///
/// 约定硬件如何存储和运行。
pub trait Hardware {
    /// 硬件的存储单元类型。
    type Byte;
    /// 硬件的任务队列类型。
    type Queue: Queue<Byte = Self::Byte>;
}

pub type ByteOf<H> = <H as Hardware>::Byte;
pub type QueueOf<H> = <H as Hardware>::Queue;
pub type HardwareOf<P> = <P as Provider>::Hardware;

/// 有序的异步任务队列，即流。
///
/// 同一个流上的任务按提交顺序执行和退休，不同流之间没有顺序保证。
pub trait Queue: Sync {
    /// 队列所在硬件的存储单元类型。
    type Byte;

    /// 进程内唯一的流标识。
    fn id(&self) -> u64;

    /// 异步拷贝主机数据到硬件。
    ///
    /// # Safety
    ///
    /// `dst` 和 `src` 必须在拷贝实际执行时仍然有效，这通常晚于本函数返回。
    unsafe fn memcpy_h2d(
        &self,
        dst: *mut Self::Byte,
        src: *const u8,
        len: usize,
    ) -> Result<(), DeviceError>;

    /// 异步拷贝硬件数据。
    ///
    /// # Safety
    ///
    /// 同 [`Queue::memcpy_h2d`]。
    unsafe fn memcpy_d2d(
        &self,
        dst: *mut Self::Byte,
        src: *const Self::Byte,
        len: usize,
    ) -> Result<(), DeviceError>;

    /// 在流上注册完成回调，回调在此前提交的所有任务退休后由驱动线程调用。
    fn add_callback(&self, done: Done) -> Result<(), DeviceError>;

    /// 标记流的当前位置。
    fn mark(&self) -> Result<Mark, DeviceError>;

    /// 阻塞直到此前提交的所有任务退休。
    fn synchronize(&self) -> Result<(), DeviceError>;
}

/// 硬件属性。
#[derive(Clone, Debug)]
pub struct DeviceProp {
    pub name: String,
    pub total_memory: usize,
    pub max_threads_per_block: usize,
    pub multiprocessor_count: usize,
    pub compute_capability: (u32, u32),
    pub alignment: usize,
}

/// 张量拷贝，与引擎其他部分走同一条传输路径。
pub trait DataTransfer<H: Hardware>: Send + Sync {
    fn copy(&self, src: &Tensor<H>, dst: &mut Tensor<H>, queue: &H::Queue)
        -> Result<(), LaunchError>;
}

/// 硬件资源提供者。
///
/// 在所有算子之间共享，所有方法都可以被多个线程并发调用。
pub trait Provider: Send + Sync {
    /// 提供者管理的硬件。
    type Hardware: Hardware;
    /// 硬件存储，析构时归还给提供者。
    type DevMem: DerefMut<Target = [ByteOf<Self::Hardware>]> + Send;
    /// 锁页主机存储。
    type HostMem: DerefMut<Target = [u8]> + Send;
    /// 数学库句柄。
    type Blas;

    fn device_id(&self) -> i32;
    fn device_prop(&self) -> &DeviceProp;

    /// 从池中分配硬件存储，释放后可被同类分配复用。
    fn scratch(&self, size: usize) -> Option<Self::DevMem>;
    /// 绕过池直接分配硬件存储。
    fn transient(&self, size: usize) -> Option<Self::DevMem>;
    /// 分配锁页主机存储。
    fn pinned(&self, size: usize) -> Option<Self::HostMem>;

    /// 提供者持有的延迟释放队列。
    fn deferred(&self) -> &DeferredRelease<Self::HostMem>;

    /// 取出并清除最近的硬件错误。
    fn last_error(&self) -> Option<DeviceError>;

    /// 取一个绑定到 `queue` 的数学库句柄执行 `f`。
    fn blas<T>(
        &self,
        queue: &QueueOf<Self::Hardware>,
        f: impl FnOnce(&Self::Blas) -> T,
    ) -> Result<T, LaunchError>;

    /// 至少 `count` 个元素的全 1 常量，在提供者的生命周期内有效。
    fn const_ones(
        &self,
        dt: DigitLayout,
        count: usize,
    ) -> Result<*const ByteOf<Self::Hardware>, LaunchError>;

    fn data_transfer(&self) -> &dyn DataTransfer<Self::Hardware>;

    /// 转移主机存储的所有权，直到 `queue` 上此前提交的任务全部退休才释放。
    fn defer_release(&self, queue: &QueueOf<Self::Hardware>, mem: Self::HostMem) {
        match queue.mark() {
            Ok(mark) => self.deferred().push(mark, mem),
            Err(e) => {
                warn!("stream {} failed to mark ({e}), release after synchronize", queue.id());
                match queue.synchronize() {
                    Ok(()) => drop(mem),
                    Err(e) => {
                        // 无法确认拷贝已结束，宁可泄漏
                        warn!("stream {} failed to synchronize ({e}), leaking", queue.id());
                        std::mem::forget(mem)
                    }
                }
            }
        }
    }

    /// 释放所有已经安全的延迟释放存储。
    #[inline]
    fn reclaim(&self) -> usize {
        self.deferred().reclaim()
    }
}
