//! Media graph engine boundary.
//!
//! The media session never builds encoders, payloaders or network sinks
//! itself. It drives a processing graph through the traits in this module:
//!
//! - [`Pipeline`] — the top-level graph: run state, position/duration
//!   queries, seeking, end-of-stream, and asynchronous bus notifications.
//! - [`Element`] / [`Bin`] — individual graph nodes. Dynamic producers
//!   announce new output pads through `pad-added` / `no-more-pads` callbacks.
//! - [`ElementFactory`] — creates the helper elements a media needs
//!   (the RTP session manager and the placeholder sink).
//!
//! ## Run states
//!
//! ```text
//! Null -> Ready -> Paused (prerolled) -> Playing
//! ```
//!
//! Moving to [`State::Paused`] is usually asynchronous: the graph answers
//! [`StateChangeReturn::Async`] and later posts [`Message::AsyncDone`] once
//! every sink has prerolled. Live sources can not preroll and answer
//! [`StateChangeReturn::NoPreroll`].
//!
//! [`sim`] provides an in-memory implementation used by tests and the CLI.

pub mod sim;

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::media::stream::Stream;

/// Position on the media timeline.
pub type ClockTime = Duration;

/// Run state of a graph or element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Ready => write!(f, "READY"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Playing => write!(f, "PLAYING"),
        }
    }
}

/// Outcome of a run state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeReturn {
    /// The state change completed synchronously.
    Success,
    /// The state change continues in the background; completion is
    /// announced with [`Message::AsyncDone`].
    Async,
    /// The graph is live and can not preroll in the paused state.
    NoPreroll,
    /// The state change failed.
    Failure,
}

/// Asynchronous notification posted on the graph's bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StateChanged { old: State, new: State },
    /// Buffering progress, `0..=100`.
    Buffering { percent: u8 },
    /// Latency of some element changed; the graph latency must be recomputed.
    Latency,
    Error { message: String, debug: Option<String> },
    Warning { message: String, debug: Option<String> },
    /// All sinks prerolled after an asynchronous state change.
    AsyncDone,
    /// End-of-stream reached every sink.
    Eos,
    /// Element-specific notification.
    Element { name: String },
    StreamStatus,
}

impl Message {
    /// Short name of the message type, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state-changed",
            Self::Buffering { .. } => "buffering",
            Self::Latency => "latency",
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
            Self::AsyncDone => "async-done",
            Self::Eos => "eos",
            Self::Element { .. } => "element",
            Self::StreamStatus => "stream-status",
        }
    }
}

/// Seek behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekFlags(u32);

impl SeekFlags {
    pub const NONE: Self = Self(0);
    /// Flush queued data before seeking.
    pub const FLUSH: Self = Self(1 << 0);
    /// Seek to the exact position, decoding from the previous key unit.
    pub const ACCURATE: Self = Self(1 << 1);
    /// Snap to key units.
    pub const KEY_UNIT: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SeekFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How a seek bound is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    /// Leave this bound unchanged.
    None,
    /// Set this bound to the given position.
    Set,
}

/// A seek request on the time format.
#[derive(Debug, Clone, PartialEq)]
pub struct Seek {
    pub rate: f64,
    pub flags: SeekFlags,
    pub start_type: SeekType,
    pub start: Option<ClockTime>,
    pub stop_type: SeekType,
    pub stop: Option<ClockTime>,
}

/// A connection point on an element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pad {
    name: String,
    parent: Option<String>,
}

impl Pad {
    pub fn new(name: &str, parent: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.map(str::to_string),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the element owning this pad, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}

impl fmt::Display for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}:{}", parent, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

static SIGNAL_HANDLER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies a connected element callback so it can be disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandlerId(u64);

impl SignalHandlerId {
    /// Allocate a process-unique handler id.
    pub fn next() -> Self {
        Self(SIGNAL_HANDLER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receives bus notifications. Called from whatever thread posts them.
pub type BusHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Called with the new pad when a dynamic element exposes an output.
pub type PadAddedCallback = Box<dyn Fn(&Pad) + Send + Sync>;

/// Called when a dynamic element will not expose any more outputs.
pub type NoMorePadsCallback = Box<dyn Fn() + Send + Sync>;

/// A node in the processing graph.
pub trait Element: Send + Sync {
    fn name(&self) -> String;

    /// Look up an always-present pad by name (e.g. `"src"`).
    fn static_pad(&self, name: &str) -> Option<Pad>;

    fn set_state(&self, state: State) -> StateChangeReturn;

    /// Invoked from a streaming thread whenever the element exposes a new pad.
    fn connect_pad_added(&self, callback: PadAddedCallback) -> SignalHandlerId;

    /// Invoked once the element has exposed all of its pads.
    fn connect_no_more_pads(&self, callback: NoMorePadsCallback) -> SignalHandlerId;

    fn disconnect(&self, id: SignalHandlerId);
}

/// An element containing other elements, e.g. the user-supplied media bin.
pub trait Bin: Element {
    fn by_name(&self, name: &str) -> Option<Arc<dyn Element>>;

    /// Publish `target` on the bin's external boundary under `name`.
    fn add_ghost_pad(&self, name: &str, target: &Pad) -> Pad;

    fn remove_pad(&self, pad: &Pad) -> bool;
}

/// The top-level graph a media session drives.
///
/// Implementations must be safe to call from several threads at once:
/// protocol handler threads, the media's control thread, and streaming
/// threads all reach the pipeline.
pub trait Pipeline: Send + Sync {
    fn set_state(&self, state: State) -> StateChangeReturn;

    /// Block until a pending state change settles (or `timeout` elapses)
    /// and return the outcome together with the current state.
    fn get_state(&self, timeout: Option<Duration>) -> (StateChangeReturn, State);

    /// Current playback position; `None` when the query fails.
    fn query_position(&self) -> Option<ClockTime>;

    /// Total duration; `None` when unknown.
    fn query_duration(&self) -> Option<ClockTime>;

    fn seek(&self, seek: &Seek) -> bool;

    /// Inject an end-of-stream event at the sources.
    fn send_eos(&self) -> bool;

    fn recalculate_latency(&self) -> bool;

    fn add(&self, element: Arc<dyn Element>) -> bool;

    fn remove(&self, element: &Arc<dyn Element>) -> bool;

    /// Build and link the delivery branch for `stream` behind the session
    /// manager element, bringing new elements to `state`.
    fn join_stream(&self, stream: &Stream, session: &Arc<dyn Element>, state: State) -> bool;

    /// Undo [`join_stream`](Self::join_stream).
    fn leave_stream(&self, stream: &Stream, session: &Arc<dyn Element>) -> bool;

    /// Install (or clear) the receiver of bus notifications.
    fn set_bus_handler(&self, handler: Option<BusHandler>);
}

/// Creates graph elements by factory name.
pub trait ElementFactory: Send + Sync {
    fn make(&self, factory: &str, name: Option<&str>) -> Option<Arc<dyn Element>>;
}
