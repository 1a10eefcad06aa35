use crate::{
    unimplemented, ByteOf, DeviceProp, Done, HardwareOf, LaunchError, Provider, Queue, QueueOf,
    Tensor,
};
use digit_layout::DigitLayout;
use log::trace;
use std::{mem::size_of, sync::Arc};

/// 算子共用的能力集合：分配器、句柄、硬件信息和张量拷贝。
///
/// 组合进每个具体算子，持有共享的资源提供者。
pub struct KernelBase<P> {
    provider: Arc<P>,
}

impl<P> Clone for KernelBase<P> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
        }
    }
}

impl<P: Provider> KernelBase<P> {
    #[inline]
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// 从池中分配 `count` 个 `T` 的硬件存储。
    pub fn scratch<T>(&self, count: usize) -> P::DevMem {
        let size = count * size_of::<T>();
        self.provider
            .scratch(size)
            .unwrap_or_else(|| panic!("out of device memory: {size} bytes requested"))
    }

    /// 绕过池分配 `count` 个 `T` 的硬件存储，用于不应被记录复用的一次性缓冲。
    pub fn transient_scratch<T>(&self, count: usize) -> P::DevMem {
        let size = count * size_of::<T>();
        self.provider
            .transient(size)
            .unwrap_or_else(|| panic!("out of device memory: {size} bytes requested"))
    }

    /// 分配 `count` 个 `T` 的锁页主机存储。
    #[inline]
    pub fn pinned<T>(&self, count: usize) -> Option<P::HostMem> {
        self.provider.pinned(count * size_of::<T>())
    }

    #[inline]
    pub fn defer_release(&self, stream: &QueueOf<HardwareOf<P>>, mem: P::HostMem) {
        self.provider.defer_release(stream, mem)
    }

    #[inline]
    pub fn device_prop(&self) -> &DeviceProp {
        self.provider.device_prop()
    }

    #[inline]
    pub fn device_id(&self) -> i32 {
        self.provider.device_id()
    }

    #[inline]
    pub fn blas<T>(
        &self,
        stream: &QueueOf<HardwareOf<P>>,
        f: impl FnOnce(&P::Blas) -> T,
    ) -> Result<T, LaunchError> {
        self.provider.blas(stream, f)
    }

    #[inline]
    pub fn const_ones(
        &self,
        dt: DigitLayout,
        count: usize,
    ) -> Result<*const ByteOf<HardwareOf<P>>, LaunchError> {
        self.provider.const_ones(dt, count)
    }

    #[inline]
    pub fn copy_tensor(
        &self,
        src: &Tensor<HardwareOf<P>>,
        dst: &mut Tensor<HardwareOf<P>>,
        stream: &QueueOf<HardwareOf<P>>,
    ) -> Result<(), LaunchError> {
        self.provider.data_transfer().copy(src, dst, stream)
    }
}

/// 单次调用的上下文：输入输出张量和调用所在的流。
pub struct OpContext<'a, H: crate::Hardware> {
    stream: &'a H::Queue,
    pub inputs: Vec<Tensor<H>>,
    pub outputs: Vec<Tensor<H>>,
}

impl<'a, H: crate::Hardware> OpContext<'a, H> {
    #[inline]
    pub fn new(stream: &'a H::Queue) -> Self {
        Self {
            stream,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[inline]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = Tensor<H>>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    #[inline]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = Tensor<H>>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    /// 本次调用的流。
    #[inline]
    pub fn stream(&self) -> &'a H::Queue {
        self.stream
    }

    #[inline]
    pub fn input(&self, i: usize) -> Option<&Tensor<H>> {
        self.inputs.get(i)
    }

    #[inline]
    pub fn output(&mut self, i: usize) -> Option<&mut Tensor<H>> {
        self.outputs.get_mut(i)
    }
}

/// 具体算子。
pub trait Kernel: Sync {
    type Provider: Provider;

    fn base(&self) -> &KernelBase<Self::Provider>;

    /// 向 `ctx.stream()` 发射任务，不等待任务完成。
    fn compute_internal(
        &self,
        ctx: &mut OpContext<HardwareOf<Self::Provider>>,
    ) -> Result<(), LaunchError>;

    #[inline]
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// 调度器看到的算子接口。
pub trait OpKernel {
    type Hardware: crate::Hardware;

    fn is_async(&self) -> bool;

    /// 同步执行入口，总是失败。
    fn compute(&self, ctx: &mut OpContext<Self::Hardware>) -> Result<(), LaunchError>;

    /// 发射算子并立即返回。
    ///
    /// 返回 `Ok` 表示已发射而非已完成；之后 `done` 在流上此前的所有任务退休时被调用恰好一次。
    /// 返回 `Err` 时 `done` 被丢弃，不会被调用。
    fn compute_async(
        &self,
        ctx: &mut OpContext<Self::Hardware>,
        done: Done,
    ) -> Result<(), LaunchError>;
}

impl<K: Kernel> OpKernel for K {
    type Hardware = HardwareOf<K::Provider>;

    #[inline]
    fn is_async(&self) -> bool {
        true
    }

    fn compute(&self, _ctx: &mut OpContext<Self::Hardware>) -> Result<(), LaunchError> {
        Err(unimplemented(format!(
            "{}: synchronous compute is not implemented",
            self.name()
        )))
    }

    fn compute_async(
        &self,
        ctx: &mut OpContext<Self::Hardware>,
        done: Done,
    ) -> Result<(), LaunchError> {
        let name = self.name();
        let stream = ctx.stream();
        trace!("{name}: stream {} assigned", stream.id());

        if let Err(e) = self.compute_internal(ctx) {
            trace!("{name}: launch failed: {e}");
            return Err(e);
        }
        trace!("{name}: launched");

        // 错误状态是提供者范围的，可能来自共享同一硬件的其他算子
        if let Some(e) = self.base().provider().last_error() {
            trace!("{name}: polled {e}");
            return Err(e.into());
        }

        stream.add_callback(done)?;
        trace!("{name}: callback registered on stream {}", stream.id());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Kernel, KernelBase, OpContext, OpKernel};
    use crate::{
        args_not_support,
        common_cpu::{Cpu, CpuProvider},
        execution_failed, AsyncHostBuffer, DeviceError, Done, LaunchError, LaunchErrorKind,
        Provider, Queue, Tensor, TensorLayout,
    };
    use digit_layout::types as ty;
    use rand::Rng;
    use std::{
        slice::{from_raw_parts, from_raw_parts_mut},
        sync::{Arc, Mutex},
        thread,
        time::Duration,
    };

    /// `y = x * factor`。
    struct Scale {
        base: KernelBase<CpuProvider>,
        factor: f32,
        delay: Duration,
        reject: bool,
        device_fault: bool,
    }

    impl Scale {
        fn new(provider: Arc<CpuProvider>, factor: f32) -> Self {
            Self {
                base: KernelBase::new(provider),
                factor,
                delay: Duration::ZERO,
                reject: false,
                device_fault: false,
            }
        }
    }

    impl Kernel for Scale {
        type Provider = CpuProvider;

        fn base(&self) -> &KernelBase<CpuProvider> {
            &self.base
        }

        fn compute_internal(&self, ctx: &mut OpContext<Cpu>) -> Result<(), LaunchError> {
            if self.reject {
                return Err(execution_failed("scale: rejected"));
            }
            let x = ctx
                .input(0)
                .ok_or_else(|| args_not_support("scale: missing input"))?
                .clone();
            let y = ctx
                .output(0)
                .ok_or_else(|| args_not_support("scale: missing output"))?
                .clone();
            crate::utils::check_copy(&x.layout, &y.layout)?;

            let n = x.layout.element_count();
            let (factor, delay, fault) = (self.factor, self.delay, self.device_fault);
            ctx.stream().launch(move || {
                let (x, y) = (x, y);
                thread::sleep(delay);
                if fault {
                    return Err(DeviceError::new(
                        "IllegalAddress",
                        "an illegal memory access was encountered",
                    ));
                }
                // 输入输出可以是同一块存储，先读出输入再建立可变切片
                let x = unsafe { from_raw_parts(x.base.cast::<f32>(), n) }.to_vec();
                let y = unsafe { from_raw_parts_mut(y.base.cast::<f32>(), n) };
                for (y, x) in y.iter_mut().zip(x) {
                    *y = x * factor
                }
                Ok(())
            })?;
            Ok(())
        }
    }

    /// 什么也不发射的算子。
    struct Nop(KernelBase<CpuProvider>);

    impl Kernel for Nop {
        type Provider = CpuProvider;

        fn base(&self) -> &KernelBase<CpuProvider> {
            &self.0
        }

        fn compute_internal(&self, _ctx: &mut OpContext<Cpu>) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    fn tensor(base: *mut u8, n: usize) -> Tensor<Cpu> {
        Tensor::new(TensorLayout::new(ty::F32, &[n]), base)
    }

    fn read(mem: &[u8]) -> Vec<f32> {
        mem.chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_sync_entry() {
        let provider = Arc::new(CpuProvider::default());
        let kernel = Scale::new(provider.clone(), 2.);
        let stream = provider.stream();
        let mut ctx = OpContext::new(&stream);

        assert!(kernel.is_async());
        let e = kernel.compute(&mut ctx).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::Unimplemented);
        assert_eq!(stream.submitted(), 0);
    }

    #[test]
    fn test_launch() {
        let provider = Arc::new(CpuProvider::default());
        let kernel = Scale::new(provider.clone(), 2.);
        let stream = provider.stream();

        let mut x = AsyncHostBuffer::from_slice(kernel.base(), &stream, &[1.0f32, 2., 3., 4.]);
        x.upload_async().unwrap();
        let mut y = kernel.base().scratch::<f32>(4);

        let mut ctx = OpContext::new(&stream)
            .with_inputs([tensor(x.device_mut_ptr(), 4)])
            .with_outputs([tensor(y.as_mut_ptr(), 4)]);
        let (done, completion) = Done::pair();
        kernel.compute_async(&mut ctx, done).unwrap();

        assert!(matches!(completion.wait(), Some(Ok(()))));
        assert_eq!(read(&y), [2., 4., 6., 8.]);
        drop(x);
        stream.synchronize().unwrap();
        assert_eq!(provider.reclaim(), 1);
        assert_eq!(provider.pinned_in_use(), 0);
    }

    #[test]
    fn test_launch_failed() {
        let provider = Arc::new(CpuProvider::default());
        let mut kernel = Scale::new(provider.clone(), 2.);
        kernel.reject = true;
        let stream = provider.stream();
        let mut ctx = OpContext::new(&stream);

        let (done, completion) = Done::pair();
        let e = kernel.compute_async(&mut ctx, done).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::ExecutionFailed);
        assert_eq!(e.info, "scale: rejected");
        // 回调被丢弃，永远不会执行
        assert!(completion.wait().is_none());
        assert_eq!(stream.submitted(), 0);
    }

    #[test]
    fn test_device_error_polled() {
        let provider = Arc::new(CpuProvider::default());
        let kernel = Nop(KernelBase::new(provider.clone()));
        let stream = provider.stream();
        let mut ctx = OpContext::new(&stream);

        provider.raise(DeviceError::new(
            "IllegalAddress",
            "an illegal memory access was encountered",
        ));
        let (done, completion) = Done::pair();
        let e = kernel.compute_async(&mut ctx, done).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::DeviceFailure);
        assert!(e.info.contains("IllegalAddress"));
        assert!(e.info.contains("an illegal memory access was encountered"));
        assert!(completion.wait().is_none());

        // 错误被取走之后恢复正常
        let (done, completion) = Done::pair();
        kernel.compute_async(&mut ctx, done).unwrap();
        assert!(matches!(completion.wait(), Some(Ok(()))));
    }

    #[test]
    fn test_device_error_reported_later() {
        let provider = Arc::new(CpuProvider::default());
        let mut faulty = Scale::new(provider.clone(), 1.);
        faulty.device_fault = true;
        let nop = Nop(KernelBase::new(provider.clone()));
        let stream = provider.stream();
        let mut x = faulty.base().scratch::<f32>(1);
        let mut y = faulty.base().scratch::<f32>(1);
        let mut ctx = OpContext::new(&stream)
            .with_inputs([tensor(x.as_mut_ptr(), 1)])
            .with_outputs([tensor(y.as_mut_ptr(), 1)]);

        // 发射成功，硬件错误在回调的状态中体现
        stream.pause();
        let (done, completion) = Done::pair();
        faulty.compute_async(&mut ctx, done).unwrap();
        stream.resume();
        let status = completion.wait().unwrap();
        assert_eq!(status.unwrap_err().kind, LaunchErrorKind::ExecutionFailed);

        // 错误状态是提供者范围的，由下一次调度取走
        let (done, _completion) = Done::pair();
        let e = nop.compute_async(&mut ctx, done).unwrap_err();
        assert!(e.info.contains("IllegalAddress"));
    }

    #[test]
    fn test_callback_refused() {
        let provider = Arc::new(CpuProvider::default());
        let kernel = Nop(KernelBase::new(provider.clone()));
        let stream = provider.stream();
        let mut ctx = OpContext::new(&stream);

        stream.inject_fault(DeviceError::new("NotReady", "stream is busy"));
        let (done, completion) = Done::pair();
        let e = kernel.compute_async(&mut ctx, done).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::DeviceFailure);
        assert!(e.info.contains("NotReady"));
        assert!(completion.wait().is_none());
    }

    #[test]
    fn test_callback_order() {
        let provider = Arc::new(CpuProvider::default());
        let mut slow = Scale::new(provider.clone(), 1.);
        slow.delay = Duration::from_millis(50);
        let fast = Scale::new(provider.clone(), 1.);
        let stream = provider.stream();
        let mut x = slow.base().scratch::<f32>(16);
        let mut y = slow.base().scratch::<f32>(16);
        let mut ctx = OpContext::new(&stream)
            .with_inputs([tensor(x.as_mut_ptr(), 16)])
            .with_outputs([tensor(y.as_mut_ptr(), 16)]);

        let order = Arc::new(Mutex::new(Vec::new()));
        for (kernel, name) in [(&slow, "slow"), (&fast, "fast")] {
            let order = order.clone();
            let done = Done::new(move |status| {
                order.lock().unwrap().push((name, status.is_ok()))
            });
            kernel.compute_async(&mut ctx, done).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*order.lock().unwrap(), [("slow", true), ("fast", true)]);
    }

    #[test]
    fn test_concurrent_streams() {
        const N: usize = 64;

        let provider = Arc::new(CpuProvider::default());
        thread::scope(|s| {
            for factor in [2.0f32, 3.] {
                let provider = provider.clone();
                s.spawn(move || {
                    let kernel = Scale::new(provider.clone(), factor);
                    let stream = provider.stream();
                    let mut rng = rand::thread_rng();
                    let data = (0..N)
                        .map(|_| rng.gen_range(-1.0f32..1.0))
                        .collect::<Vec<_>>();

                    let mut x = AsyncHostBuffer::from_slice(kernel.base(), &stream, &data);
                    x.upload_async().unwrap();
                    let mut y = kernel.base().scratch::<f32>(N);
                    let mut ctx = OpContext::new(&stream)
                        .with_inputs([tensor(x.device_mut_ptr(), N)])
                        .with_outputs([tensor(y.as_mut_ptr(), N)]);

                    let completions = (0..16)
                        .map(|_| {
                            let (done, completion) = Done::pair();
                            kernel.compute_async(&mut ctx, done).unwrap();
                            completion
                        })
                        .collect::<Vec<_>>();
                    for completion in completions {
                        assert!(matches!(completion.wait(), Some(Ok(()))));
                    }
                    let expected = data.iter().map(|x| x * factor).collect::<Vec<_>>();
                    assert_eq!(read(&y), expected);
                });
            }
        });
    }

    #[test]
    fn test_copy_tensor() {
        let provider = Arc::new(CpuProvider::default());
        let base = KernelBase::new(provider.clone());
        let stream = provider.stream();

        let mut x = AsyncHostBuffer::from_slice(&base, &stream, &[1.0f32, 2., 3.]);
        x.upload_async().unwrap();
        let src = tensor(x.device_mut_ptr(), 3);
        let mut y = base.scratch::<f32>(3);
        let mut dst = tensor(y.as_mut_ptr(), 3);
        base.copy_tensor(&src, &mut dst, &stream).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(read(&y), [1., 2., 3.]);

        let mut wrong = tensor(y.as_mut_ptr(), 2);
        let e = base.copy_tensor(&src, &mut wrong, &stream).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_base_capabilities() {
        let provider = Arc::new(CpuProvider::default());
        let base = KernelBase::new(provider.clone());
        let stream = provider.stream();

        assert_eq!(base.device_id(), 0);
        assert_eq!(base.device_prop().alignment, 256);
        let id = base.blas(&stream, |blas| blas.stream()).unwrap();
        assert_eq!(id, Some(stream.id()));

        let scratch = base.scratch::<f32>(16);
        let in_use = provider.arena_in_use();
        assert_eq!(in_use, 64);
        let transient = base.transient_scratch::<f32>(64);
        assert_eq!(transient.len(), 256);
        assert_eq!(provider.arena_in_use(), in_use);
        drop((scratch, transient));
        assert_eq!(provider.arena_in_use(), 0);

        let ones = base.const_ones(ty::F32, 8).unwrap();
        let ones = unsafe { from_raw_parts(ones, 32) };
        assert_eq!(read(ones), [1.; 8]);
    }
}
