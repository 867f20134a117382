//! Media sessions: readiness and playback state of one media resource.
//!
//! A [`Media`] wraps a user-supplied bin of producers inside a managing
//! [`Pipeline`]. It discovers the bin's [`Stream`]s, prerolls the graph on
//! [`prepare`](Media::prepare), counts active client transports, and tears
//! everything down again on [`unprepare`](Media::unprepare).
//!
//! ## Status machine
//!
//! ```text
//! UNPREPARED ──prepare──> PREPARING ──async-done──> PREPARED
//!     ^                      │                         │
//!     │                      │ error / timeout         │ unprepare with eos_shutdown
//!     │                      v                         v
//!     └────── teardown ──── ERROR                 UNPREPARING ──eos──> teardown
//! ```
//!
//! `ERROR` is sticky: only a teardown resets it.
//!
//! ## Producer naming
//!
//! | Element name | Meaning |
//! |--------------|---------|
//! | `pay0`, `pay1`, ... | payloader with a static `src` pad, one stream each |
//! | `dynpay0`, `dynpay1`, ... | producer exposing its pads later, one stream per pad |
//!
//! ## Locking
//!
//! Attributes live behind a short-held mutex paired with a condition
//! variable that is signalled on every status change. Transitions run under
//! a re-entrant state lock, held across calls into the graph; notification
//! handling re-enters it when it triggers a teardown.

pub mod event;
pub mod hooks;
pub mod range;
pub mod stream;
pub mod transport;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, ReentrantMutex};

use crate::address_pool::AddressPool;
use crate::auth::Auth;
use crate::error::{MediaError, Result};
use crate::pipeline::{
    Bin, BusHandler, ClockTime, Element, ElementFactory, Message, Pad, Pipeline, Seek, SeekFlags,
    SeekType, SignalHandlerId, State, StateChangeReturn,
};
use crate::thread_pool::{ClientState, Source, Thread, ThreadPool, ThreadType};
use event::Observers;

pub use event::{MediaEvent, SubscriptionId};
pub use hooks::{DefaultHooks, ImmediateTeardown, MediaHooks};
pub use range::{RangeTime, RangeUnit, TimeRange};
pub use stream::Stream;
pub use transport::{LowerTransport, StreamTransport, Transport};

static MEDIA_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How long [`Media::prepare`] waits for preroll before giving up.
pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default kernel buffer size for delivery sockets.
pub const DEFAULT_BUFFER_SIZE: u32 = 0x80000;

/// Factory of the RTP session manager element.
const RTPBIN_FACTORY: &str = "rtpbin";
/// Factory (and name) of the placeholder sink used while dynamic producers
/// have not exposed their pads yet.
const FAKESINK_FACTORY: &str = "fakesink";

/// Readiness of a media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaStatus {
    Unprepared,
    Unpreparing,
    Preparing,
    Prepared,
    Error,
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unprepared => write!(f, "unprepared"),
            Self::Unpreparing => write!(f, "unpreparing"),
            Self::Preparing => write!(f, "preparing"),
            Self::Prepared => write!(f, "prepared"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Per-media options.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Whether several clients may share this media.
    pub shared: bool,
    /// Whether the media can be prepared again after a teardown.
    pub reusable: bool,
    /// Lower transports clients may use.
    pub protocols: LowerTransport,
    /// Send end-of-stream and wait for it before tearing down.
    pub eos_shutdown: bool,
    /// Kernel buffer size for delivery sockets.
    pub buffer_size: u32,
    /// Upper bound on the wait in [`Media::prepare`]; exceeding it counts
    /// as a graph error.
    pub prepare_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            shared: false,
            reusable: false,
            protocols: LowerTransport::default(),
            eos_shutdown: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            prepare_timeout: DEFAULT_PREPARE_TIMEOUT,
        }
    }
}

/// The graph a media drives: the bin holding the producers, the pipeline
/// it is placed in, and a factory for helper elements.
#[derive(Clone)]
pub struct Graph {
    pub element: Arc<dyn Bin>,
    pub pipeline: Arc<dyn Pipeline>,
    pub factory: Arc<dyn ElementFactory>,
}

impl Graph {
    pub fn new(
        element: Arc<dyn Bin>,
        pipeline: Arc<dyn Pipeline>,
        factory: Arc<dyn ElementFactory>,
    ) -> Self {
        Self {
            element,
            pipeline,
            factory,
        }
    }
}

struct Inner {
    config: MediaConfig,
    status: MediaStatus,
    /// Torn down at least once.
    reused: bool,
    auth: Option<Arc<dyn Auth>>,
    address_pool: Option<Arc<dyn AddressPool>>,

    streams: Vec<Arc<Stream>>,
    dynamic: Vec<Arc<dyn Element>>,
    n_active: usize,
    /// A dynamic stream is being linked; its async-done chatter is ignored.
    adding: bool,

    is_live: bool,
    seekable: bool,
    buffering: bool,
    target_state: State,

    range: TimeRange,
    range_start: Option<ClockTime>,
    range_stop: Option<ClockTime>,

    rtpbin: Option<Arc<dyn Element>>,
    fakesink: Option<Arc<dyn Element>>,
    source: Option<Source>,
    thread: Option<Arc<Thread>>,
    signal_handlers: Vec<(Weak<dyn Element>, SignalHandlerId)>,
    /// Held while waiting for end-of-stream so the media outlives its owner.
    keep_alive: Option<Arc<Media>>,
}

/// State machine of one media resource. See the [module docs](self).
pub struct Media {
    id: u64,
    element: Arc<dyn Bin>,
    pipeline: Arc<dyn Pipeline>,
    factory: Arc<dyn ElementFactory>,
    pool: ThreadPool,
    hooks: Box<dyn MediaHooks>,
    observers: Observers,
    state_lock: ReentrantMutex<()>,
    inner: Mutex<Inner>,
    cond: Condvar,
    me: Weak<Media>,
}

impl Media {
    pub fn new(graph: Graph, pool: ThreadPool) -> Arc<Self> {
        Self::with_config(graph, pool, MediaConfig::default())
    }

    pub fn with_config(graph: Graph, pool: ThreadPool, config: MediaConfig) -> Arc<Self> {
        Self::with_hooks(graph, pool, config, Box::new(DefaultHooks))
    }

    /// Create a media around `graph`. The bin is added to the pipeline and
    /// its static streams are collected right away.
    pub fn with_hooks(
        graph: Graph,
        pool: ThreadPool,
        config: MediaConfig,
        hooks: Box<dyn MediaHooks>,
    ) -> Arc<Self> {
        let id = MEDIA_COUNTER.fetch_add(1, Ordering::SeqCst);
        let media = Arc::new_cyclic(|me| Self {
            id,
            element: graph.element,
            pipeline: graph.pipeline,
            factory: graph.factory,
            pool,
            hooks,
            observers: Observers::default(),
            state_lock: ReentrantMutex::new(()),
            inner: Mutex::new(Inner {
                config,
                status: MediaStatus::Unprepared,
                reused: false,
                auth: None,
                address_pool: None,
                streams: Vec::new(),
                dynamic: Vec::new(),
                n_active: 0,
                adding: false,
                is_live: false,
                seekable: false,
                buffering: false,
                target_state: State::Null,
                range: TimeRange::default(),
                range_start: None,
                range_stop: None,
                rtpbin: None,
                fakesink: None,
                source: None,
                thread: None,
                signal_handlers: Vec::new(),
                keep_alive: None,
            }),
            cond: Condvar::new(),
            me: me.clone(),
        });

        let element: Arc<dyn Element> = media.element.clone();
        if !media.pipeline.add(element) {
            tracing::warn!(media = id, "bin already in pipeline");
        }
        media.collect_streams();
        tracing::debug!(media = id, streams = media.n_streams(), "media created");
        media
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn element(&self) -> &Arc<dyn Bin> {
        &self.element
    }

    pub fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.pipeline
    }

    // --- Configuration ---

    pub fn config(&self) -> MediaConfig {
        self.inner.lock().config.clone()
    }

    pub fn set_shared(&self, shared: bool) {
        self.inner.lock().config.shared = shared;
    }

    pub fn is_shared(&self) -> bool {
        self.inner.lock().config.shared
    }

    pub fn set_reusable(&self, reusable: bool) {
        self.inner.lock().config.reusable = reusable;
    }

    pub fn is_reusable(&self) -> bool {
        self.inner.lock().config.reusable
    }

    /// Restrict the lower transports; forwarded to every stream.
    pub fn set_protocols(&self, protocols: LowerTransport) {
        let streams = {
            let mut inner = self.inner.lock();
            inner.config.protocols = protocols;
            inner.streams.clone()
        };
        for stream in streams {
            stream.set_protocols(protocols);
        }
    }

    pub fn protocols(&self) -> LowerTransport {
        self.inner.lock().config.protocols
    }

    pub fn set_eos_shutdown(&self, eos_shutdown: bool) {
        self.inner.lock().config.eos_shutdown = eos_shutdown;
    }

    pub fn is_eos_shutdown(&self) -> bool {
        self.inner.lock().config.eos_shutdown
    }

    pub fn set_buffer_size(&self, size: u32) {
        self.inner.lock().config.buffer_size = size;
    }

    pub fn buffer_size(&self) -> u32 {
        self.inner.lock().config.buffer_size
    }

    pub fn set_prepare_timeout(&self, timeout: Duration) {
        self.inner.lock().config.prepare_timeout = timeout;
    }

    pub fn prepare_timeout(&self) -> Duration {
        self.inner.lock().config.prepare_timeout
    }

    pub fn set_auth(&self, auth: Option<Arc<dyn Auth>>) {
        self.inner.lock().auth = auth;
    }

    pub fn auth(&self) -> Option<Arc<dyn Auth>> {
        self.inner.lock().auth.clone()
    }

    /// Attach an address pool; forwarded to every stream.
    pub fn set_address_pool(&self, pool: Option<Arc<dyn AddressPool>>) {
        let streams = {
            let mut inner = self.inner.lock();
            inner.address_pool = pool.clone();
            inner.streams.clone()
        };
        for stream in streams {
            stream.set_address_pool(pool.clone());
        }
    }

    pub fn address_pool(&self) -> Option<Arc<dyn AddressPool>> {
        self.inner.lock().address_pool.clone()
    }

    // --- Observed state ---

    /// Current status. Blocks while the media is preparing, up to the
    /// prepare timeout, after which the status becomes [`MediaStatus::Error`].
    pub fn status(&self) -> MediaStatus {
        let mut inner = self.inner.lock();
        let deadline = Instant::now() + inner.config.prepare_timeout;
        while inner.status == MediaStatus::Preparing {
            tracing::debug!(media = self.id, "waiting for status change");
            if self.cond.wait_until(&mut inner, deadline).timed_out()
                && inner.status == MediaStatus::Preparing
            {
                tracing::warn!(media = self.id, "timeout, assuming error status");
                inner.status = MediaStatus::Error;
                self.cond.notify_all();
            }
        }
        inner.status
    }

    /// Current status, without waiting for preparation to settle.
    pub fn status_now(&self) -> MediaStatus {
        self.inner.lock().status
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().is_live
    }

    pub fn is_seekable(&self) -> bool {
        self.inner.lock().seekable
    }

    pub fn is_buffering(&self) -> bool {
        self.inner.lock().buffering
    }

    /// Number of currently active client transports.
    pub fn n_active(&self) -> usize {
        self.inner.lock().n_active
    }

    /// The run state last requested from the graph.
    pub fn target_state(&self) -> State {
        self.inner.lock().target_state
    }

    /// Whether the media has been torn down at least once.
    pub fn was_used(&self) -> bool {
        self.inner.lock().reused
    }

    /// Playable range as last collected from the graph.
    pub fn range(&self) -> TimeRange {
        self.inner.lock().range
    }

    pub fn n_streams(&self) -> usize {
        self.inner.lock().streams.len()
    }

    pub fn stream(&self, index: usize) -> Option<Arc<Stream>> {
        self.inner.lock().streams.get(index).cloned()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.inner.lock().streams.clone()
    }

    // --- Observers ---

    /// Register `observer` for [`MediaEvent`]s. It runs on whichever thread
    /// caused the event, possibly with the state lock held.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&MediaEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Subscribe through a channel. The subscription ends with the first
    /// event sent after the receiver is dropped.
    pub fn events(&self) -> mpsc::Receiver<MediaEvent> {
        let (tx, rx) = mpsc::channel();
        self.observers
            .subscribe_while(move |event| tx.send(event.clone()).is_ok());
        rx
    }

    fn emit(&self, event: MediaEvent) {
        self.observers.emit(&event);
    }

    // --- Streams ---

    /// Scan the bin for `payN` and `dynpayN` producers, stopping at the
    /// first index where neither exists.
    fn collect_streams(&self) {
        self.inner.lock().dynamic.clear();

        for i in 0.. {
            let mut found = false;

            if let Some(pay) = self.element.by_name(&format!("pay{i}")) {
                found = true;
                match pay.static_pad("src") {
                    Some(pad) => {
                        tracing::info!(media = self.id, index = i, "found stream");
                        self.create_stream(pay, &pad);
                    }
                    None => {
                        tracing::warn!(media = self.id, payloader = %pay.name(), "payloader without src pad");
                    }
                }
            }

            if let Some(dynpay) = self.element.by_name(&format!("dynpay{i}")) {
                found = true;
                tracing::info!(media = self.id, index = i, "found dynamic element");
                self.inner.lock().dynamic.push(dynpay);
            }

            if !found {
                break;
            }
        }
    }

    /// Publish `pad` of `payloader` on the bin as `src_N` and register a new
    /// stream for it at the next index.
    pub fn create_stream(&self, payloader: Arc<dyn Element>, pad: &Pad) -> Arc<Stream> {
        let stream = {
            let mut inner = self.inner.lock();
            let index = inner.streams.len();
            let srcpad = self.element.add_ghost_pad(&format!("src_{index}"), pad);
            let stream = Arc::new(Stream::new(index, payloader, srcpad));
            stream.set_address_pool(inner.address_pool.clone());
            stream.set_protocols(inner.config.protocols);
            inner.streams.push(stream.clone());
            stream
        };
        tracing::debug!(media = self.id, stream = stream.index(), pad = %pad, "created stream");
        self.emit(MediaEvent::NewStream(stream.clone()));
        stream
    }

    fn pad_added(&self, element: &Arc<dyn Element>, pad: &Pad) {
        let stream = self.create_stream(element.clone(), pad);
        tracing::info!(media = self.id, pad = %pad, stream = stream.index(), "pad added");

        let _state = self.state_lock.lock();
        let Some(rtpbin) = self.inner.lock().rtpbin.clone() else {
            tracing::warn!(media = self.id, "pad added on unprepared media");
            return;
        };

        self.inner.lock().adding = true;
        // Called from a streaming thread of a PAUSED graph.
        if let Err(e) = stream.join_bin(&*self.pipeline, &rtpbin, State::Paused) {
            tracing::warn!(media = self.id, error = %e, "failed to join dynamic stream");
        }
        self.inner.lock().adding = false;
    }

    fn no_more_pads(&self) {
        tracing::info!(media = self.id, "no more pads");
        let fakesink = self.inner.lock().fakesink.take();
        if let Some(fakesink) = fakesink {
            self.remove_fakesink(&fakesink);
        }
    }

    fn remove_fakesink(&self, fakesink: &Arc<dyn Element>) {
        self.pipeline.remove(fakesink);
        fakesink.set_state(State::Null);
        tracing::info!(media = self.id, "removed fakesink");
    }

    // --- Preparation ---

    /// Preroll the graph and block until it is ready.
    ///
    /// Already prepared media return immediately; while another caller is
    /// preparing, this waits for its outcome. On failure the media is torn
    /// down before returning.
    pub fn prepare(&self) -> Result<()> {
        let state = self.state_lock.lock();

        let (status, reusable, reused, needs_streams) = {
            let inner = self.inner.lock();
            (
                inner.status,
                inner.config.reusable,
                inner.reused,
                inner.streams.is_empty() && inner.reused,
            )
        };

        match status {
            MediaStatus::Prepared => {
                tracing::debug!(media = self.id, "media was prepared");
                return Ok(());
            }
            MediaStatus::Preparing => {
                drop(state);
                return self.wait_prepared(false);
            }
            MediaStatus::Unprepared => {}
            other => {
                tracing::warn!(media = self.id, status = %other, "media was not unprepared");
                return Err(MediaError::InvalidStatus(other));
            }
        }

        if !reusable && reused {
            tracing::warn!(media = self.id, "media is not reusable");
            return Err(MediaError::NotReusable);
        }

        let rtpbin = self.factory.make(RTPBIN_FACTORY, None).ok_or_else(|| {
            tracing::warn!(media = self.id, "no rtpbin element");
            MediaError::ElementUnavailable(RTPBIN_FACTORY.to_string())
        })?;

        let thread = self
            .pool
            .get_thread(ThreadType::Media, &ClientState::default())?
            .ok_or(MediaError::NoThread)?;

        if needs_streams {
            self.collect_streams();
        }

        tracing::info!(media = self.id, thread = thread.id(), "preparing media");
        let source = thread.context().attach();
        {
            let mut inner = self.inner.lock();
            inner.is_live = false;
            inner.seekable = false;
            inner.buffering = false;
            inner.status = MediaStatus::Preparing;
            inner.rtpbin = Some(rtpbin.clone());
            inner.source = Some(source.clone());
            inner.thread = Some(thread);
        }
        self.cond.notify_all();
        self.watch_bus(source);

        if let Err(e) = self.start_preroll(rtpbin) {
            tracing::warn!(media = self.id, error = %e, "failed to preroll pipeline");
            self.teardown();
            return Err(e);
        }

        drop(state);
        self.wait_prepared(true)
    }

    fn watch_bus(&self, source: Source) {
        let media = self.me.clone();
        let handler: BusHandler = Arc::new(move |message: Message| {
            let media = media.clone();
            let watch = source.clone();
            source.dispatch(move || {
                if let Some(media) = media.upgrade() {
                    media.bus_message(&watch, &message);
                }
            });
        });
        self.pipeline.set_bus_handler(Some(handler));
    }

    fn start_preroll(&self, rtpbin: Arc<dyn Element>) -> Result<()> {
        self.pipeline.add(rtpbin.clone());

        for stream in self.streams() {
            stream.join_bin(&*self.pipeline, &rtpbin, State::Null)?;
        }

        let dynamic = self.inner.lock().dynamic.clone();
        for element in dynamic {
            tracing::info!(media = self.id, element = %element.name(), "adding callbacks for dynamic element");
            self.connect_dynamic(&element);

            if self.inner.lock().fakesink.is_none() {
                let fakesink = self
                    .factory
                    .make(FAKESINK_FACTORY, Some(FAKESINK_FACTORY))
                    .ok_or_else(|| MediaError::ElementUnavailable(FAKESINK_FACTORY.to_string()))?;
                self.pipeline.add(fakesink.clone());
                self.inner.lock().fakesink = Some(fakesink);
            }
        }

        tracing::info!(media = self.id, "setting pipeline to PAUSED");
        let ret = self.pipeline.set_state(State::Paused);
        self.inner.lock().target_state = State::Paused;

        match ret {
            StateChangeReturn::Success | StateChangeReturn::Async => {
                tracing::info!(media = self.id, ?ret, "state change to PAUSED");
                self.inner.lock().seekable = true;
            }
            StateChangeReturn::NoPreroll => {
                tracing::info!(media = self.id, "NO_PREROLL state change: live media");
                {
                    let mut inner = self.inner.lock();
                    inner.seekable = false;
                    inner.is_live = true;
                }
                if self.pipeline.set_state(State::Playing) == StateChangeReturn::Failure {
                    return Err(MediaError::StateChangeFailed);
                }
            }
            StateChangeReturn::Failure => return Err(MediaError::StateChangeFailed),
        }
        Ok(())
    }

    fn connect_dynamic(&self, element: &Arc<dyn Element>) {
        let weak_element = Arc::downgrade(element);

        let media = self.me.clone();
        let target = weak_element.clone();
        let pad_added = element.connect_pad_added(Box::new(move |pad| {
            if let (Some(media), Some(element)) = (media.upgrade(), target.upgrade()) {
                media.pad_added(&element, pad);
            }
        }));

        let media = self.me.clone();
        let no_more_pads = element.connect_no_more_pads(Box::new(move || {
            if let Some(media) = media.upgrade() {
                media.no_more_pads();
            }
        }));

        let mut inner = self.inner.lock();
        inner.signal_handlers.push((weak_element.clone(), pad_added));
        inner.signal_handlers.push((weak_element, no_more_pads));
    }

    fn wait_prepared(&self, initiator: bool) -> Result<()> {
        match self.status() {
            MediaStatus::Prepared => {
                if initiator {
                    tracing::info!(media = self.id, "media is prerolled");
                    self.emit(MediaEvent::Prepared);
                }
                Ok(())
            }
            status => {
                tracing::warn!(media = self.id, %status, "failed to preroll pipeline");
                if let Err(e) = self.unprepare() {
                    tracing::warn!(media = self.id, error = %e, "unprepare after failed preroll");
                }
                Err(MediaError::PrepareFailed)
            }
        }
    }

    fn set_status(&self, status: MediaStatus) {
        let mut inner = self.inner.lock();
        if inner.status != MediaStatus::Error {
            inner.status = status;
        }
        tracing::debug!(media = self.id, %status, current = %inner.status, "setting new status");
        self.cond.notify_all();
    }

    // --- Graph notifications ---

    fn bus_message(&self, watch: &Source, message: &Message) {
        let _state = self.state_lock.lock();
        // A teardown may have run while this message waited for the lock.
        if watch.is_destroyed() {
            tracing::trace!(media = self.id, message = message.type_name(), "stale bus message");
            return;
        }
        tracing::trace!(media = self.id, message = message.type_name(), "bus message");
        self.hooks.handle_message(self, message);
    }

    /// Built-in handling of a graph notification. Must be called with the
    /// state lock held, which is the case inside [`MediaHooks::handle_message`].
    pub fn default_handle_message(&self, message: &Message) {
        match message {
            Message::StateChanged { old, new } => {
                tracing::trace!(media = self.id, %old, %new, "state changed");
            }
            Message::Buffering { percent } => self.handle_buffering(*percent),
            Message::Latency => {
                self.pipeline.recalculate_latency();
            }
            Message::Error { message, debug: details } => {
                tracing::warn!(media = self.id, error = %message, debug = ?details, "got error");
                if self.status_now() == MediaStatus::Unpreparing {
                    // The end-of-stream being waited for will not arrive.
                    tracing::debug!(media = self.id, "shutting down after error");
                    self.teardown();
                } else {
                    self.set_status(MediaStatus::Error);
                }
            }
            Message::Warning { message, debug: details } => {
                tracing::warn!(media = self.id, warning = %message, debug = ?details, "got warning");
            }
            Message::AsyncDone => {
                if self.inner.lock().adding {
                    // Linking a dynamic stream settles on its own; only the
                    // final preroll counts.
                    tracing::info!(media = self.id, "ignoring ASYNC_DONE");
                } else {
                    tracing::info!(media = self.id, "got ASYNC_DONE");
                    self.collect_media_stats();
                    if self.status_now() == MediaStatus::Preparing {
                        self.set_status(MediaStatus::Prepared);
                    }
                }
            }
            Message::Eos => {
                tracing::info!(media = self.id, "got EOS");
                if self.status_now() == MediaStatus::Unpreparing {
                    tracing::debug!(media = self.id, "shutting down after EOS");
                    self.teardown();
                }
            }
            Message::Element { .. } | Message::StreamStatus => {}
        }
    }

    fn handle_buffering(&self, percent: u8) {
        let mut inner = self.inner.lock();
        if inner.is_live {
            return;
        }

        let playing = inner.target_state == State::Playing;
        if percent >= 100 {
            let was_buffering = std::mem::replace(&mut inner.buffering, false);
            drop(inner);
            if was_buffering && playing {
                tracing::info!(media = self.id, "buffering done, setting pipeline to PLAYING");
                self.pipeline.set_state(State::Playing);
            } else {
                tracing::info!(media = self.id, "buffering done");
            }
        } else {
            let was_buffering = std::mem::replace(&mut inner.buffering, true);
            drop(inner);
            if !was_buffering {
                if playing {
                    tracing::info!(media = self.id, percent, "buffering, setting pipeline to PAUSED");
                    self.pipeline.set_state(State::Paused);
                } else {
                    tracing::info!(media = self.id, percent, "buffering");
                }
            }
        }
    }

    fn collect_media_stats(&self) {
        let is_live = self.inner.lock().is_live;

        let (range, start, stop) = if is_live {
            (TimeRange::default(), None, None)
        } else {
            let position = self.pipeline.query_position().unwrap_or_else(|| {
                tracing::info!(media = self.id, "position query failed");
                Duration::ZERO
            });
            let duration = self.pipeline.query_duration();
            if duration.is_none() {
                tracing::info!(media = self.id, "duration query failed");
            }
            tracing::info!(media = self.id, ?position, ?duration, "stats");
            (
                TimeRange::npt(Some(position), duration),
                Some(position),
                duration,
            )
        };

        let mut inner = self.inner.lock();
        inner.range = range;
        inner.range_start = start;
        inner.range_stop = stop;
    }

    // --- Playback ---

    /// The playable range as an NPT string. For anything but a PLAY
    /// response, a media with active clients reports its start as `now`.
    pub fn range_string(&self, play: bool) -> Result<String> {
        let _state = self.state_lock.lock();
        let inner = self.inner.lock();
        if inner.status != MediaStatus::Prepared {
            tracing::warn!(media = self.id, status = %inner.status, "range of unprepared media");
            return Err(MediaError::NotPrepared(inner.status));
        }
        let mut range = inner.range;
        if !play && inner.n_active > 0 {
            range.min = RangeTime::Now;
        }
        Ok(range.to_string())
    }

    /// Seek to `range`. Bounds equal to the current ones are left alone;
    /// when nothing changes no seek is issued. Media that can not seek
    /// accept any range without doing anything.
    pub fn seek(&self, range: &TimeRange) -> Result<()> {
        let _state = self.state_lock.lock();

        let (status, seekable, current_start, current_stop) = {
            let inner = self.inner.lock();
            (inner.status, inner.seekable, inner.range_start, inner.range_stop)
        };
        if status != MediaStatus::Prepared {
            tracing::warn!(media = self.id, %status, "media is not prepared");
            return Err(MediaError::NotPrepared(status));
        }
        if !seekable {
            tracing::info!(media = self.id, "pipeline is not seekable");
            return Ok(());
        }

        let (start, stop) = range.get_times().inspect_err(|_| {
            tracing::warn!(media = self.id, unit = %range.unit, "seek unit not supported");
        })?;
        tracing::info!(media = self.id, ?start, ?stop, ?current_start, ?current_stop, "seek request");

        let (start_type, start) = seek_bound(start, current_start);
        let (stop_type, stop) = seek_bound(stop, current_stop);

        if start.is_none() && stop.is_none() {
            tracing::info!(media = self.id, "no seek needed");
            return Ok(());
        }

        tracing::info!(media = self.id, ?start, ?stop, "seeking");
        let seek = Seek {
            rate: 1.0,
            flags: SeekFlags::FLUSH | SeekFlags::ACCURATE | SeekFlags::KEY_UNIT,
            start_type,
            start,
            stop_type,
            stop,
        };
        let res = self.pipeline.seek(&seek);
        tracing::info!(media = self.id, res, "done seeking");

        self.pipeline.get_state(None);
        tracing::info!(media = self.id, "prerolled again");
        self.collect_media_stats();

        if res { Ok(()) } else { Err(MediaError::SeekFailed) }
    }

    /// Move `transports` to `state` and adjust the graph when the number of
    /// active transports crosses zero.
    ///
    /// `Ready` is treated as `Null`. Reaching `Null` with no active
    /// transports left unprepares the media.
    pub fn set_state(&self, state: State, transports: &[Arc<StreamTransport>]) -> Result<()> {
        let _state = self.state_lock.lock();

        let status = self.status_now();
        if status != MediaStatus::Prepared {
            tracing::warn!(media = self.id, %status, "media is not prepared");
            return Err(MediaError::NotPrepared(status));
        }

        let state = if state == State::Ready { State::Null } else { state };
        let activate = state == State::Playing;
        tracing::info!(media = self.id, %state, transports = transports.len(), "going to state");

        let (old_active, n_active, target_state) = {
            let mut inner = self.inner.lock();
            let old_active = inner.n_active;
            for transport in transports {
                if transport.set_active(activate) {
                    if activate {
                        inner.n_active += 1;
                    } else {
                        inner.n_active = inner.n_active.saturating_sub(1);
                    }
                }
            }
            (old_active, inner.n_active, inner.target_state)
        };

        let do_state = (old_active == 0 && activate) || n_active == 0;
        tracing::info!(media = self.id, %state, n_active, do_state, "state");

        if target_state != state {
            if do_state {
                if state == State::Null {
                    self.unprepare()?;
                } else {
                    tracing::info!(media = self.id, %state, "setting pipeline state");
                    self.inner.lock().target_state = state;
                    self.pipeline.set_state(state);
                }
            }
            self.emit(MediaEvent::NewState(state));
        }

        if state != State::Null && (state == State::Paused || old_active != n_active) {
            self.collect_media_stats();
        }
        Ok(())
    }

    // --- Shutdown ---

    /// Release the media. A prepared media goes through
    /// [`MediaHooks::unprepare`]; any other state is torn down at once.
    pub fn unprepare(&self) -> Result<()> {
        let _state = self.state_lock.lock();

        let status = {
            let mut inner = self.inner.lock();
            if inner.status == MediaStatus::Unprepared {
                tracing::debug!(media = self.id, "media was already unprepared");
                return Ok(());
            }
            inner.target_state = State::Null;
            inner.status
        };

        tracing::info!(media = self.id, %status, "unprepare media");
        if status == MediaStatus::Prepared {
            self.hooks.unprepare(self)
        } else {
            self.teardown();
            Ok(())
        }
    }

    /// Built-in shutdown: with `eos_shutdown`, push end-of-stream through
    /// the running graph and finish on its arrival; otherwise tear down.
    pub fn default_unprepare(&self) -> Result<()> {
        let _state = self.state_lock.lock();

        if self.is_eos_shutdown() {
            tracing::debug!(media = self.id, "sending EOS for shutdown");
            self.pipeline.send_eos();
            // EOS only propagates through a running graph.
            self.pipeline.set_state(State::Playing);
            self.inner.lock().keep_alive = self.me.upgrade();
            self.set_status(MediaStatus::Unpreparing);
        } else {
            self.teardown();
        }
        Ok(())
    }

    /// Detach everything added by [`prepare`](Self::prepare) and return to
    /// [`MediaStatus::Unprepared`].
    pub fn teardown(&self) {
        let _state = self.state_lock.lock();

        if self.status_now() == MediaStatus::Unprepared {
            return;
        }
        tracing::debug!(media = self.id, "shutting down");

        self.pipeline.set_state(State::Null);

        let (fakesink, streams, rtpbin, source, thread, handlers) = {
            let mut inner = self.inner.lock();
            (
                inner.fakesink.take(),
                std::mem::take(&mut inner.streams),
                inner.rtpbin.take(),
                inner.source.take(),
                inner.thread.take(),
                std::mem::take(&mut inner.signal_handlers),
            )
        };

        if let Some(fakesink) = fakesink {
            self.remove_fakesink(&fakesink);
        }

        for (element, id) in handlers {
            if let Some(element) = element.upgrade() {
                element.disconnect(id);
            }
        }

        for stream in &streams {
            if let Some(rtpbin) = &rtpbin {
                stream.leave_bin(&*self.pipeline, rtpbin);
            }
            self.element.remove_pad(stream.srcpad());
        }

        if let Some(rtpbin) = &rtpbin {
            self.pipeline.remove(rtpbin);
        }

        self.pipeline.set_bus_handler(None);
        if let Some(source) = source {
            source.destroy();
        }
        if let Some(thread) = thread {
            thread.stop();
        }

        let keep_alive = {
            let mut inner = self.inner.lock();
            inner.reused = true;
            inner.n_active = 0;
            inner.adding = false;
            inner.buffering = false;
            inner.target_state = State::Null;
            inner.status = MediaStatus::Unprepared;
            inner.keep_alive.take()
        };
        self.cond.notify_all();

        tracing::info!(media = self.id, streams = streams.len(), "media unprepared");
        self.emit(MediaEvent::Unprepared);
        drop(keep_alive);
    }
}

/// Seek type and position for one bound; unchanged bounds are left alone.
fn seek_bound(
    requested: Option<ClockTime>,
    current: Option<ClockTime>,
) -> (SeekType, Option<ClockTime>) {
    if requested == current {
        (SeekType::None, None)
    } else if requested.is_some() {
        (SeekType::Set, requested)
    } else {
        (SeekType::None, None)
    }
}

impl Drop for Media {
    fn drop(&mut self) {
        if self.inner.get_mut().status != MediaStatus::Unprepared {
            tracing::debug!(media = self.id, "dropping media that was not unprepared");
            self.teardown();
        }
    }
}

impl fmt::Debug for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Media")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("streams", &inner.streams.len())
            .field("n_active", &inner.n_active)
            .field("target_state", &inner.target_state)
            .field("config", &inner.config)
            .finish()
    }
}
