use std::sync::Mutex;

/// 对象池，用于复用创建代价较高的上下文资源（例如数学库句柄）。
///
/// 后放回的对象先被取出。
pub struct Pool<T>(Mutex<Vec<T>>);

impl<T> Default for Pool<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    #[inline]
    pub const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    #[inline]
    pub fn push(&self, value: T) {
        self.0.lock().unwrap().push(value)
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.0.lock().unwrap().pop()
    }
}

#[cfg(test)]
mod test {
    use super::Pool;
    use std::{sync::Arc, thread};

    #[test]
    fn test_push_pop() {
        let pool = Pool::new();
        assert!(pool.pop().is_none());
        pool.push(1);
        pool.push(2);
        assert_eq!(pool.pop(), Some(2));
        assert_eq!(pool.pop(), Some(1));
        assert!(pool.pop().is_none());
    }

    #[test]
    fn test_concurrent() {
        let pool = Arc::new(Pool::new());
        let workers = (0..4)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for j in 0..256 {
                        pool.push(i * 256 + j);
                    }
                })
            })
            .collect::<Vec<_>>();
        for w in workers {
            w.join().unwrap();
        }
        let mut values = std::iter::from_fn(|| pool.pop()).collect::<Vec<_>>();
        values.sort_unstable();
        assert_eq!(values, (0..1024).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_pop_push() {
        const HANDLES: usize = 16;

        let pool = Arc::new(Pool::new());
        for i in 0..HANDLES {
            pool.push(Box::new(i))
        }
        thread::scope(|s| {
            for _ in 0..8 {
                let pool = pool.clone();
                s.spawn(move || {
                    for _ in 0..10_000 {
                        if let Some(handle) = pool.pop() {
                            assert!(*handle < HANDLES);
                            pool.push(handle)
                        }
                    }
                });
            }
        });
        let mut values = std::iter::from_fn(|| pool.pop())
            .map(|b| *b)
            .collect::<Vec<_>>();
        values.sort_unstable();
        assert_eq!(values, (0..HANDLES).collect::<Vec<_>>());
    }
}
