//! Allocation and recycling of execution contexts.
//!
//! Two kinds of [`Thread`] are handed out:
//!
//! - **Client** threads run connection handling. Their number is capped by
//!   the pool's [`ThreadLimit`]; once the cap is reached, the oldest live
//!   thread is recycled (its reuse counter goes up) instead of spawning.
//! - **Media** threads deliver a media's graph notifications. They are
//!   always freshly spawned and never counted against the limit.
//!
//! ```text
//! get_thread(Client) ── limit Inline ──────────────> None (run inline)
//!        │
//!        ├─ live == max ── pop oldest, reuse, requeue ─> Some(recycled)
//!        └─ otherwise ──── spawn loop, enqueue ───────> Some(new)
//! ```
//!
//! A thread's loop exits once every owner called [`Thread::stop`]; the
//! worker then removes it from the pool's live queue.

pub mod thread;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
pub use thread::{MainContext, Source, Thread};

/// What a thread is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadType {
    /// Handling of a client connection.
    Client,
    /// Delivery of a media's graph notifications.
    Media,
}

impl fmt::Display for ThreadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Media => write!(f, "media"),
        }
    }
}

/// Ceiling on concurrently live client threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLimit {
    /// No client threads; callers handle connections on their own loop.
    Inline,
    /// At most this many live client threads, recycling beyond it.
    Max(NonZeroUsize),
    /// A new client thread for every request.
    Unlimited,
}

/// One client thread.
pub const DEFAULT_THREAD_LIMIT: ThreadLimit = ThreadLimit::Max(NonZeroUsize::MIN);

impl Default for ThreadLimit {
    fn default() -> Self {
        DEFAULT_THREAD_LIMIT
    }
}

/// `0` = inline, negative = unlimited, positive = cap.
impl From<i32> for ThreadLimit {
    fn from(value: i32) -> Self {
        match usize::try_from(value) {
            Err(_) => Self::Unlimited,
            Ok(n) => NonZeroUsize::new(n).map_or(Self::Inline, Self::Max),
        }
    }
}

impl fmt::Display for ThreadLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => write!(f, "0"),
            Self::Max(n) => write!(f, "{n}"),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Caller-side information passed along with a thread request. Only
/// [`ThreadPoolHooks::configure_thread`] looks at it.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    pub peer_addr: Option<SocketAddr>,
    pub uri: Option<String>,
}

/// Customization points of a [`ThreadPool`].
///
/// Hooks run while the pool lock is held (`configure_thread`) or on the
/// worker thread itself (`thread_enter` / `thread_leave`); they must not
/// request threads from the same pool.
pub trait ThreadPoolHooks: Send + Sync {
    /// Called once for every newly created thread, before its loop starts.
    fn configure_thread(&self, _thread: &Thread, _state: &ClientState) {}

    /// Called on the worker right before the loop runs.
    fn thread_enter(&self, _thread: &Thread) {}

    /// Called on the worker right after the loop exited.
    fn thread_leave(&self, _thread: &Thread) {}
}

struct PoolState {
    limit: ThreadLimit,
    /// Live client threads, oldest first.
    threads: VecDeque<Arc<Thread>>,
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    hooks: Option<Arc<dyn ThreadPoolHooks>>,
}

/// Hands out [`Thread`]s for client connections and medias.
///
/// Cheap to clone; clones share the same live queue.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_THREAD_LIMIT)
    }

    pub fn with_limit(limit: ThreadLimit) -> Self {
        Self::build(limit, None)
    }

    pub fn with_hooks(limit: ThreadLimit, hooks: Arc<dyn ThreadPoolHooks>) -> Self {
        Self::build(limit, Some(hooks))
    }

    fn build(limit: ThreadLimit, hooks: Option<Arc<dyn ThreadPoolHooks>>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    limit,
                    threads: VecDeque::new(),
                }),
                hooks,
            }),
        }
    }

    pub fn set_max_threads(&self, limit: ThreadLimit) {
        tracing::debug!(%limit, "set max threads");
        self.shared.state.lock().limit = limit;
    }

    pub fn max_threads(&self) -> ThreadLimit {
        self.shared.state.lock().limit
    }

    /// Number of live client threads.
    pub fn n_threads(&self) -> usize {
        self.shared.state.lock().threads.len()
    }

    /// Get a thread of `kind`. The caller owns one reference on the
    /// returned thread and must call [`Thread::stop`] when done.
    ///
    /// Returns `Ok(None)` when client threads are disabled
    /// ([`ThreadLimit::Inline`]), and [`MediaError::Spawn`](crate::MediaError::Spawn)
    /// when the worker could not be started.
    pub fn get_thread(&self, kind: ThreadType, state: &ClientState) -> Result<Option<Arc<Thread>>> {
        match kind {
            ThreadType::Client => self.get_client_thread(state),
            ThreadType::Media => {
                tracing::debug!("make new media thread");
                let thread = self.make_thread(kind, state);
                self.submit(&thread)?;
                Ok(Some(thread))
            }
        }
    }

    fn get_client_thread(&self, state: &ClientState) -> Result<Option<Arc<Thread>>> {
        let mut pool = self.shared.state.lock();

        let max = match pool.limit {
            ThreadLimit::Inline => {
                tracing::debug!("no client threads allowed");
                return Ok(None);
            }
            ThreadLimit::Max(max) => Some(max.get()),
            ThreadLimit::Unlimited => None,
        };

        if let Some(max) = max {
            // Threads whose last owner already stopped are on their way out
            // and no longer count against the ceiling.
            while pool.threads.len() >= max {
                let Some(thread) = pool.threads.pop_front() else {
                    break;
                };
                if thread.try_reuse() {
                    tracing::debug!(thread = thread.id(), "recycle client thread");
                    pool.threads.push_back(thread.clone());
                    return Ok(Some(thread));
                }
                tracing::debug!(thread = thread.id(), "skipping exiting client thread");
            }
        }

        tracing::debug!("make new client thread");
        let thread = self.make_thread(ThreadType::Client, state);
        self.submit(&thread)?;
        pool.threads.push_back(thread.clone());
        Ok(Some(thread))
    }

    fn make_thread(&self, kind: ThreadType, state: &ClientState) -> Arc<Thread> {
        let thread = Thread::new(kind);
        thread.set_pool(Arc::downgrade(&self.shared));
        if let Some(hooks) = &self.shared.hooks {
            hooks.configure_thread(&thread, state);
        }
        thread
    }

    fn submit(&self, thread: &Arc<Thread>) -> Result<()> {
        let worker = thread.clone();
        std::thread::Builder::new()
            .name(format!("rtsp-{}-{}", thread.kind(), thread.id()))
            .spawn(move || do_loop(worker))
            .map_err(|e| {
                tracing::error!(thread = thread.id(), error = %e, "failed to spawn thread");
                e
            })?;
        Ok(())
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadPool")
            .field("limit", &state.limit)
            .field("threads", &state.threads.len())
            .finish()
    }
}

fn do_loop(thread: Arc<Thread>) {
    let pool = thread.pool();
    let hooks = pool.as_ref().and_then(|pool| pool.hooks.clone());

    if let Some(hooks) = &hooks {
        hooks.thread_enter(&thread);
    }

    tracing::info!(thread = thread.id(), kind = %thread.kind(), "enter mainloop");
    thread.run();
    tracing::info!(thread = thread.id(), kind = %thread.kind(), "exit mainloop");

    if let Some(hooks) = &hooks {
        hooks.thread_leave(&thread);
    }

    if let Some(pool) = pool {
        pool.state
            .lock()
            .threads
            .retain(|live| !Arc::ptr_eq(live, &thread));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn limit_from_i32() {
        assert_eq!(ThreadLimit::from(0), ThreadLimit::Inline);
        assert_eq!(ThreadLimit::from(-1), ThreadLimit::Unlimited);
        assert_eq!(
            ThreadLimit::from(3),
            ThreadLimit::Max(NonZeroUsize::new(3).unwrap())
        );
    }

    #[test]
    fn default_limit_is_one() {
        assert_eq!(ThreadPool::new().max_threads().to_string(), "1");
    }

    #[test]
    fn inline_limit_refuses_client_threads() {
        let pool = ThreadPool::with_limit(ThreadLimit::Inline);
        let thread = pool
            .get_thread(ThreadType::Client, &ClientState::default())
            .unwrap();
        assert!(thread.is_none());
        assert_eq!(pool.n_threads(), 0);
    }

    #[test]
    fn media_threads_ignore_limit() {
        let pool = ThreadPool::with_limit(ThreadLimit::Inline);
        let thread = pool
            .get_thread(ThreadType::Media, &ClientState::default())
            .unwrap()
            .expect("media thread");
        assert_eq!(thread.kind(), ThreadType::Media);
        assert_eq!(pool.n_threads(), 0);
        thread.stop();
    }

    #[test]
    fn exited_threads_leave_the_queue() {
        let pool = ThreadPool::with_limit(ThreadLimit::Unlimited);
        let thread = pool
            .get_thread(ThreadType::Client, &ClientState::default())
            .unwrap()
            .unwrap();
        assert_eq!(pool.n_threads(), 1);

        thread.stop();
        assert!(wait_for(|| pool.n_threads() == 0));
    }

    #[derive(Default)]
    struct CountingHooks {
        configured: AtomicUsize,
        entered: AtomicUsize,
        left: AtomicUsize,
    }

    impl ThreadPoolHooks for CountingHooks {
        fn configure_thread(&self, _thread: &Thread, _state: &ClientState) {
            self.configured.fetch_add(1, Ordering::SeqCst);
        }

        fn thread_enter(&self, _thread: &Thread) {
            self.entered.fetch_add(1, Ordering::SeqCst);
        }

        fn thread_leave(&self, _thread: &Thread) {
            self.left.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hooks_see_every_new_thread() {
        let hooks = Arc::new(CountingHooks::default());
        let pool = ThreadPool::with_hooks(ThreadLimit::from(1), hooks.clone());
        let state = ClientState::default();

        let first = pool.get_thread(ThreadType::Client, &state).unwrap().unwrap();
        let recycled = pool.get_thread(ThreadType::Client, &state).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &recycled));
        assert_eq!(hooks.configured.load(Ordering::SeqCst), 1);
        assert!(wait_for(|| hooks.entered.load(Ordering::SeqCst) == 1));

        first.stop();
        recycled.stop();
        assert!(wait_for(|| hooks.left.load(Ordering::SeqCst) == 1));
    }
}
