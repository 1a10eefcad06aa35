use crate::{ByteOf, HardwareOf, KernelBase, LaunchError, Provider, Queue, QueueOf};
use rayon::iter::{IntoParallelRefMutIterator, ParallelIterator};
use std::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ptr::{null, null_mut},
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// 锁页主机缓冲及其硬件副本。
///
/// 异步拷贝要求主机内存是锁页的，并且只能在拷贝真正执行完之后释放。
/// 因此上传成功后主机存储被转移给提供者的延迟释放队列，而不是随缓冲析构。
pub struct AsyncHostBuffer<'a, T, P: Provider> {
    base: &'a KernelBase<P>,
    stream: &'a QueueOf<HardwareOf<P>>,
    host: Option<P::HostMem>,
    device: Option<P::DevMem>,
    len: usize,
    _phantom: PhantomData<T>,
}

impl<'a, T: Copy, P: Provider> AsyncHostBuffer<'a, T, P> {
    #[inline]
    pub fn new(base: &'a KernelBase<P>, stream: &'a QueueOf<HardwareOf<P>>) -> Self {
        Self {
            base,
            stream,
            host: None,
            device: None,
            len: 0,
            _phantom: PhantomData,
        }
    }

    pub fn with_len(
        base: &'a KernelBase<P>,
        stream: &'a QueueOf<HardwareOf<P>>,
        len: usize,
    ) -> Self {
        let mut ans = Self::new(base, stream);
        ans.allocate_host(len);
        ans
    }

    pub fn from_slice(
        base: &'a KernelBase<P>,
        stream: &'a QueueOf<HardwareOf<P>>,
        data: &[T],
    ) -> Self {
        let mut ans = Self::with_len(base, stream, data.len());
        ans.host_mut().copy_from_slice(data);
        ans
    }

    pub fn filled(
        base: &'a KernelBase<P>,
        stream: &'a QueueOf<HardwareOf<P>>,
        value: T,
        len: usize,
    ) -> Self
    where
        T: Send + Sync,
    {
        let mut ans = Self::with_len(base, stream, len);
        ans.host_mut().par_iter_mut().for_each(|x| *x = value);
        ans
    }

    /// 分配 `len` 个元素的锁页主机存储，替换之前持有的主机存储。
    ///
    /// # Panics
    ///
    /// 锁页存储耗尽时 panic。
    pub fn allocate_host(&mut self, len: usize) {
        self.host = None;
        self.len = len;
        if len == 0 {
            return;
        }
        let host = self.base.pinned::<T>(len).unwrap_or_else(|| {
            panic!(
                "out of pinned memory: {} bytes requested",
                len * size_of::<T>()
            )
        });
        assert_eq!(host.as_ptr().align_offset(align_of::<T>()), 0);
        self.host = Some(host);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 主机存储，转移之后为空。
    #[inline]
    pub fn host(&self) -> &[T] {
        match &self.host {
            Some(host) => unsafe { from_raw_parts(host.as_ptr().cast(), self.len) },
            None => &[],
        }
    }

    #[inline]
    pub fn host_mut(&mut self) -> &mut [T] {
        match &mut self.host {
            Some(host) => unsafe { from_raw_parts_mut(host.as_mut_ptr().cast(), self.len) },
            None => &mut [],
        }
    }

    /// 主机存储的地址，转移之后为空指针。
    #[inline]
    pub fn host_ptr(&self) -> *const T {
        self.host.as_ref().map_or(null(), |host| host.as_ptr().cast())
    }

    #[inline]
    pub fn host_mut_ptr(&mut self) -> *mut T {
        self.host
            .as_mut()
            .map_or(null_mut(), |host| host.as_mut_ptr().cast())
    }

    /// 硬件存储的地址，上传之前为空指针。
    #[inline]
    pub fn device_ptr(&self) -> *const ByteOf<HardwareOf<P>> {
        self.device.as_ref().map_or(null(), |dev| dev.as_ptr())
    }

    #[inline]
    pub fn device_mut_ptr(&mut self) -> *mut ByteOf<HardwareOf<P>> {
        self.device
            .as_mut()
            .map_or(null_mut(), |dev| dev.as_mut_ptr())
    }

    #[inline]
    pub fn device(&self) -> Option<&P::DevMem> {
        self.device.as_ref()
    }

    /// 向流提交主机到硬件的异步拷贝。
    ///
    /// 没有主机存储时什么也不做。拷贝提交成功后主机存储转移给延迟释放队列；
    /// 提交失败时主机存储仍由缓冲持有，随缓冲析构释放。
    pub fn upload_async(&mut self) -> Result<(), LaunchError> {
        let Some(host) = self.host.take() else {
            return Ok(());
        };
        let size = self.len * size_of::<T>();
        let dev = match &mut self.device {
            Some(dev) if dev.len() >= size => dev,
            slot => slot.insert(self.base.scratch::<T>(self.len)),
        };
        let dst = dev.as_mut_ptr();
        if let Err(e) = unsafe { self.stream.memcpy_h2d(dst, host.as_ptr(), size) } {
            self.host = Some(host);
            return Err(e.into());
        }
        self.base.defer_release(self.stream, host);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::AsyncHostBuffer;
    use crate::{
        common_cpu::{Config, CpuProvider},
        DeviceError, KernelBase, LaunchErrorKind, Provider, Queue,
    };
    use std::sync::Arc;

    fn base(config: Config) -> (Arc<CpuProvider>, KernelBase<CpuProvider>) {
        let provider = Arc::new(CpuProvider::new(config));
        let base = KernelBase::new(provider.clone());
        (provider, base)
    }

    #[test]
    fn test_upload() {
        let (provider, base) = base(Config::default());
        let stream = provider.stream();

        let mut buf = AsyncHostBuffer::from_slice(&base, &stream, &[1.0f32, 2., 3., 4.]);
        assert_eq!(buf.host(), [1., 2., 3., 4.]);
        assert!(buf.device_ptr().is_null());
        let host = buf.host_ptr();

        buf.upload_async().unwrap();
        assert!(!buf.device_ptr().is_null());
        assert!(buf.host_ptr().is_null());
        assert!(buf.host().is_empty());
        assert_eq!(buf.len(), 4);
        assert!(provider.deferred().any(|mem| mem.as_ptr() == host.cast()));

        stream.synchronize().unwrap();
        let dev = buf.device().unwrap();
        assert_eq!(&dev[..16], bytes(&[1.0f32, 2., 3., 4.]));
    }

    #[test]
    fn test_deferred_until_retired() {
        let (provider, base) = base(Config::default());
        let stream = provider.stream();

        stream.pause();
        let mut buf = AsyncHostBuffer::filled(&base, &stream, 7u32, 256);
        buf.upload_async().unwrap();
        // 拷贝还没有执行，主机存储不能释放
        assert_eq!(provider.reclaim(), 0);
        assert_eq!(provider.deferred().len(), 1);
        assert_eq!(provider.pinned_in_use(), 1024);

        stream.resume();
        stream.synchronize().unwrap();
        assert_eq!(provider.reclaim(), 1);
        assert!(provider.deferred().is_empty());
        assert_eq!(provider.pinned_in_use(), 0);
        assert!(buf.device().unwrap()[..1024]
            .chunks_exact(4)
            .all(|b| b == 7u32.to_le_bytes()));
    }

    #[test]
    fn test_empty() {
        let (provider, base) = base(Config::default());
        let stream = provider.stream();

        let mut buf = AsyncHostBuffer::<f32, _>::with_len(&base, &stream, 0);
        assert!(buf.is_empty());
        buf.upload_async().unwrap();
        assert!(buf.device_ptr().is_null());
        assert!(provider.deferred().is_empty());
        assert_eq!(stream.submitted(), 0);
        assert_eq!(provider.pinned_in_use(), 0);
    }

    #[test]
    fn test_upload_refused() {
        let (provider, base) = base(Config::default());
        let stream = provider.stream();

        let mut buf = AsyncHostBuffer::from_slice(&base, &stream, &[1u8, 2, 3]);
        stream.inject_fault(DeviceError::new("InvalidValue", "invalid argument"));
        let e = buf.upload_async().unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::DeviceFailure);
        // 主机存储仍由缓冲持有
        assert_eq!(buf.host(), [1, 2, 3]);
        assert!(provider.deferred().is_empty());
        assert_eq!(provider.pinned_in_use(), 3);

        drop(buf);
        assert_eq!(provider.pinned_in_use(), 0);
    }

    #[test]
    fn test_device_reused() {
        let (provider, base) = base(Config::default());
        let stream = provider.stream();

        let mut buf = AsyncHostBuffer::from_slice(&base, &stream, &[1i64, 2, 3]);
        buf.upload_async().unwrap();
        let dev = buf.device_ptr();

        buf.allocate_host(2);
        buf.host_mut().copy_from_slice(&[4, 5]);
        buf.upload_async().unwrap();
        assert_eq!(buf.device_ptr(), dev);

        stream.synchronize().unwrap();
        assert_eq!(&buf.device().unwrap()[..24], bytes(&[4i64, 5, 3]));
    }

    #[test]
    #[should_panic(expected = "out of pinned memory")]
    fn test_pinned_exhausted() {
        let (provider, base) = base(Config {
            pinned_limit: 8,
            ..Default::default()
        });
        let stream = provider.stream();
        let _ = AsyncHostBuffer::<f32, _>::with_len(&base, &stream, 4);
    }

    fn bytes<T: Copy>(data: &[T]) -> &[u8] {
        unsafe { std::slice::from_raw_parts(data.as_ptr().cast(), std::mem::size_of_val(data)) }
    }
}
