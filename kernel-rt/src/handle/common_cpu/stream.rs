use crate::{execution_failed, DeviceError, Done, Mark, Queue};
use log::warn;
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    ptr::copy_nonoverlapping,
    sync::{
        atomic::{
            AtomicU64,
            Ordering::{AcqRel, Acquire, Relaxed},
        },
        mpsc::{channel, Receiver, Sender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

/// 发射到流上的一个硬件任务。
pub type Work = Box<dyn FnOnce() -> Result<(), DeviceError> + Send>;

/// 可以注入故障的流操作。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Fault {
    /// 发射任务、拷贝或注册回调。
    Submit,
    Mark,
    Synchronize,
}

enum Command {
    Work(Work),
    Callback(Done),
}

/// 模拟的流：一个按提交顺序执行任务的驱动线程。
///
/// 任务和回调都在驱动线程上执行，不会在提交线程上执行。
pub struct Stream {
    id: u64,
    submitter: Mutex<Option<Submitter>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    faults: Mutex<HashMap<Fault, DeviceError>>,
}

struct Submitter {
    sender: Sender<Command>,
    submitted: u64,
}

struct Shared {
    retired: Arc<AtomicU64>,
    progress: Mutex<()>,
    progress_cond: Condvar,
    paused: Mutex<bool>,
    gate: Condvar,
    /// 提供者范围的错误槽。
    last_error: Arc<Mutex<Option<DeviceError>>>,
}

impl Stream {
    pub(super) fn new(last_error: Arc<Mutex<Option<DeviceError>>>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_ID.fetch_add(1, Relaxed);

        let shared = Arc::new(Shared {
            retired: Arc::new(AtomicU64::new(0)),
            progress: Mutex::new(()),
            progress_cond: Condvar::new(),
            paused: Mutex::new(false),
            gate: Condvar::new(),
            last_error,
        });
        let (sender, receiver) = channel();
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("stream-{id}"))
                .spawn(move || drive(receiver, shared))
                .unwrap()
        };
        Self {
            id,
            submitter: Mutex::new(Some(Submitter {
                sender,
                submitted: 0,
            })),
            worker: Some(worker),
            shared,
            faults: Default::default(),
        }
    }

    fn submit(&self, cmd: Command) -> Result<u64, DeviceError> {
        self.check_fault(Fault::Submit)?;
        let mut submitter = self.submitter.lock().unwrap();
        let Some(submitter) = submitter.as_mut() else {
            return Err(destroyed());
        };
        submitter.sender.send(cmd).map_err(|_| destroyed())?;
        submitter.submitted += 1;
        Ok(submitter.submitted)
    }

    /// 发射一个模拟的硬件任务，任务返回的错误记入提供者的错误槽。
    pub fn launch(
        &self,
        work: impl FnOnce() -> Result<(), DeviceError> + Send + 'static,
    ) -> Result<(), DeviceError> {
        self.submit(Command::Work(Box::new(work))).map(drop)
    }

    /// 让下一次提交失败。
    #[inline]
    pub fn inject_fault(&self, e: DeviceError) {
        self.inject_fault_on(Fault::Submit, e)
    }

    /// 让下一次 `op` 操作失败。
    pub fn inject_fault_on(&self, op: Fault, e: DeviceError) {
        self.faults.lock().unwrap().insert(op, e);
    }

    fn check_fault(&self, op: Fault) -> Result<(), DeviceError> {
        match self.faults.lock().unwrap().remove(&op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 暂停驱动线程，已提交的任务保持未执行。
    pub fn pause(&self) {
        *self.shared.paused.lock().unwrap() = true
    }

    pub fn resume(&self) {
        *self.shared.paused.lock().unwrap() = false;
        self.shared.gate.notify_all()
    }

    #[inline]
    pub fn submitted(&self) -> u64 {
        self.submitter
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |s| s.submitted)
    }

    #[inline]
    pub fn retired(&self) -> u64 {
        self.shared.retired.load(Acquire)
    }
}

fn destroyed() -> DeviceError {
    DeviceError::new("StreamDestroyed", "the stream is being destroyed")
}

fn panicked(what: &str) -> DeviceError {
    warn!("{what} panicked on stream driver");
    DeviceError::new("StreamPanicked", format!("a {what} panicked on the stream"))
}

fn drive(receiver: Receiver<Command>, shared: Arc<Shared>) {
    let mut status = None::<DeviceError>;
    for cmd in receiver {
        drop(
            shared
                .gate
                .wait_while(shared.paused.lock().unwrap(), |paused| *paused)
                .unwrap(),
        );
        // 任务或回调 panic 视为流故障，驱动线程继续退休后续命令
        match cmd {
            Command::Work(work) => {
                let e = match catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(panicked("work")),
                };
                if let Some(e) = e {
                    *shared.last_error.lock().unwrap() = Some(e.clone());
                    status = Some(e);
                }
            }
            Command::Callback(done) => {
                let result = match &status {
                    Some(e) => Err(execution_failed(format!("stream failed: {e}"))),
                    None => Ok(()),
                };
                if catch_unwind(AssertUnwindSafe(|| done.call(result))).is_err() {
                    status = Some(panicked("callback"));
                }
            }
        }
        shared.retired.fetch_add(1, AcqRel);
        let _guard = shared.progress.lock().unwrap();
        shared.progress_cond.notify_all();
    }
}

struct CopyTask {
    dst: *mut u8,
    src: *const u8,
    len: usize,
}

unsafe impl Send for CopyTask {}

impl CopyTask {
    fn run(self) -> Result<(), DeviceError> {
        unsafe { copy_nonoverlapping(self.src, self.dst, self.len) };
        Ok(())
    }
}

impl Queue for Stream {
    type Byte = u8;

    #[inline]
    fn id(&self) -> u64 {
        self.id
    }

    unsafe fn memcpy_h2d(
        &self,
        dst: *mut u8,
        src: *const u8,
        len: usize,
    ) -> Result<(), DeviceError> {
        let copy = CopyTask { dst, src, len };
        self.submit(Command::Work(Box::new(move || copy.run())))
            .map(drop)
    }

    #[inline]
    unsafe fn memcpy_d2d(
        &self,
        dst: *mut u8,
        src: *const u8,
        len: usize,
    ) -> Result<(), DeviceError> {
        self.memcpy_h2d(dst, src, len)
    }

    #[inline]
    fn add_callback(&self, done: Done) -> Result<(), DeviceError> {
        self.submit(Command::Callback(done)).map(drop)
    }

    fn mark(&self) -> Result<Mark, DeviceError> {
        self.check_fault(Fault::Mark)?;
        Ok(Mark::new(self.shared.retired.clone(), self.submitted()))
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.check_fault(Fault::Synchronize)?;
        let target = self.submitted();
        let retired = &self.shared.retired;
        drop(
            self.shared
                .progress_cond
                .wait_while(self.shared.progress.lock().unwrap(), |_| {
                    retired.load(Acquire) < target
                })
                .unwrap(),
        );
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.resume();
        drop(self.submitter.lock().unwrap().take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
