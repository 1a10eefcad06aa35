use crate::LaunchError;
use std::{
    fmt,
    sync::mpsc::{channel, Receiver, RecvTimeoutError, TryRecvError},
    time::Duration,
};

/// 完成回调。
///
/// 注册到流上之后由驱动线程在流排空时调用。调用消耗 `self`，因此一个回调至多执行一次；
/// 未注册即被丢弃的回调永远不会执行。
pub struct Done(Box<dyn FnOnce(Result<(), LaunchError>) + Send>);

impl Done {
    #[inline]
    pub fn new(f: impl FnOnce(Result<(), LaunchError>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// 构造一对回调和等待端。
    pub fn pair() -> (Self, Completion) {
        let (sender, receiver) = channel();
        let done = Self::new(move |status| {
            let _ = sender.send(status);
        });
        (done, Completion(receiver))
    }

    #[inline]
    pub fn call(self, status: Result<(), LaunchError>) {
        (self.0)(status)
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Done")
    }
}

/// [`Done::pair`] 的等待端。
///
/// 回调执行后得到其状态；回调未执行就被丢弃时得到 `None`。
pub struct Completion(Receiver<Result<(), LaunchError>>);

impl Completion {
    /// 阻塞直到回调执行或被丢弃。
    #[inline]
    pub fn wait(self) -> Option<Result<(), LaunchError>> {
        self.0.recv().ok()
    }

    /// 回调尚未执行也未被丢弃时返回 `Err(self)`。
    pub fn try_wait(self) -> Result<Option<Result<(), LaunchError>>, Self> {
        match self.0.try_recv() {
            Ok(status) => Ok(Some(status)),
            Err(TryRecvError::Disconnected) => Ok(None),
            Err(TryRecvError::Empty) => Err(self),
        }
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<Result<(), LaunchError>>, Self> {
        match self.0.recv_timeout(timeout) {
            Ok(status) => Ok(Some(status)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }
}
