//! Execution contexts: an event queue ([`MainContext`]) run by a dedicated
//! OS thread, shared between several owners ([`Thread`]).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};

use super::{PoolShared, ThreadType};

static THREAD_COUNTER: AtomicU64 = AtomicU64::new(0);
static SOURCE_COUNTER: AtomicU64 = AtomicU64::new(0);

type Task = Box<dyn FnOnce() + Send>;

struct Queue {
    tasks: VecDeque<Task>,
    quit: bool,
}

/// An event queue. Tasks pushed with [`invoke`](Self::invoke) run in order
/// on whichever thread is executing [`run`](Self::run).
pub struct MainContext {
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl MainContext {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                quit: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Queue `task` for execution on the loop thread.
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.queue.lock();
        if queue.quit {
            tracing::trace!("context stopped, dropping task");
            return;
        }
        queue.tasks.push_back(Box::new(task));
        self.cond.notify_one();
    }

    /// Number of queued tasks not yet dispatched.
    pub fn pending(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    pub fn is_quit(&self) -> bool {
        self.queue.lock().quit
    }

    /// Create a dispatch source bound to this context.
    pub fn attach(self: &Arc<Self>) -> Source {
        Source {
            inner: Arc::new(SourceInner {
                id: SOURCE_COUNTER.fetch_add(1, Ordering::Relaxed),
                context: Arc::downgrade(self),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Dispatch tasks until [`quit`](Self::quit) is called. Tasks still
    /// queued at that point are dropped.
    pub(crate) fn run(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.quit {
                        let dropped = queue.tasks.len();
                        queue.tasks.clear();
                        if dropped > 0 {
                            tracing::debug!(dropped, "loop quit with pending tasks");
                        }
                        return;
                    }
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    self.cond.wait(&mut queue);
                }
            };
            task();
        }
    }

    pub(crate) fn quit(&self) {
        self.queue.lock().quit = true;
        self.cond.notify_all();
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

struct SourceInner {
    id: u64,
    context: Weak<MainContext>,
    destroyed: AtomicBool,
}

/// A registration on a [`MainContext`]. Work dispatched through a source
/// is silently dropped once the source is destroyed, including work that
/// was already queued.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl Source {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Queue `task` on the bound context. Returns `false` if the source was
    /// destroyed or the context is gone.
    pub fn dispatch<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_destroyed() {
            return false;
        }
        let Some(context) = self.inner.context.upgrade() else {
            return false;
        };
        let inner = self.inner.clone();
        context.invoke(move || {
            if !inner.destroyed.load(Ordering::Acquire) {
                task();
            }
        });
        true
    }

    pub fn destroy(&self) {
        if !self.inner.destroyed.swap(true, Ordering::AcqRel) {
            tracing::debug!(source = self.inner.id, "source destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.inner.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// A background execution context shared by one or more owners.
///
/// The loop keeps running while the reuse counter is above zero. It starts
/// at one for the creator; every extra owner calls [`reuse`](Self::reuse)
/// and every owner eventually calls [`stop`](Self::stop).
pub struct Thread {
    id: u64,
    kind: ThreadType,
    context: Arc<MainContext>,
    reused: AtomicI32,
    pool: OnceLock<Weak<PoolShared>>,
}

impl Thread {
    pub fn new(kind: ThreadType) -> Arc<Self> {
        let id = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(thread = id, %kind, "new thread");
        Arc::new(Self {
            id,
            kind,
            context: Arc::new(MainContext::new()),
            reused: AtomicI32::new(1),
            pool: OnceLock::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ThreadType {
        self.kind
    }

    pub fn context(&self) -> &Arc<MainContext> {
        &self.context
    }

    /// Register an additional owner.
    pub fn reuse(&self) {
        let owners = self.reused.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(thread = self.id, owners, "reuse thread");
    }

    /// Register an additional owner unless the loop is already shutting down.
    pub(crate) fn try_reuse(&self) -> bool {
        let result = self
            .reused
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owners| {
                (owners > 0).then_some(owners + 1)
            });
        match result {
            Ok(previous) => {
                tracing::debug!(thread = self.id, owners = previous + 1, "reuse thread");
                true
            }
            Err(_) => false,
        }
    }

    /// Release one owner. The loop quits when the last owner is gone.
    pub fn stop(&self) {
        let previous = self.reused.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(thread = self.id, owners = previous - 1, "stop thread");
        if previous == 1 {
            tracing::debug!(thread = self.id, "stop mainloop of thread");
            self.context.quit();
        }
    }

    /// Number of owners keeping the loop alive.
    pub fn reuse_count(&self) -> i32 {
        self.reused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.context.is_quit()
    }

    pub(super) fn set_pool(&self, pool: Weak<PoolShared>) {
        let _ = self.pool.set(pool);
    }

    pub(super) fn pool(&self) -> Option<Arc<PoolShared>> {
        self.pool.get().and_then(Weak::upgrade)
    }

    pub(super) fn run(&self) {
        self.context.run();
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("reused", &self.reuse_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_order_until_quit() {
        let context = Arc::new(MainContext::new());
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            context.invoke(move || tx.send(i).unwrap());
        }

        let runner = {
            let context = context.clone();
            thread::spawn(move || context.run())
        };
        let received: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2]);

        context.quit();
        runner.join().unwrap();
    }

    #[test]
    fn run_returns_immediately_after_quit() {
        let context = MainContext::new();
        context.quit();
        context.run();
        context.invoke(|| panic!("must not run"));
        assert_eq!(context.pending(), 0);
    }

    #[test]
    fn destroyed_source_drops_queued_work() {
        let context = Arc::new(MainContext::new());
        let source = context.attach();
        let (tx, rx) = mpsc::channel::<()>();

        assert!(source.dispatch(move || tx.send(()).unwrap()));
        source.destroy();
        assert!(!source.dispatch(|| panic!("must not run")));

        let runner = {
            let context = context.clone();
            thread::spawn(move || context.run())
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        context.quit();
        runner.join().unwrap();
    }

    #[test]
    fn loop_stops_with_last_owner() {
        let thread = Thread::new(ThreadType::Media);
        thread.reuse();
        assert_eq!(thread.reuse_count(), 2);

        thread.stop();
        assert!(!thread.is_stopped());
        thread.stop();
        assert!(thread.is_stopped());
        assert!(!thread.try_reuse());
    }
}
