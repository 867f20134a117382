//! In-memory graph engine.
//!
//! Implements the [`Pipeline`], [`Bin`], [`Element`] and [`ElementFactory`]
//! boundary without moving any media. It behaves like a real engine where
//! the media session can observe it:
//!
//! - going to PAUSED answers according to the configured [`Preroll`] and
//!   posts [`Message::AsyncDone`] from a background thread;
//! - while a `fakesink` placeholder is in the graph, preroll stays pending
//!   until the placeholder is removed;
//! - end-of-stream is posted once the graph runs after [`Pipeline::send_eos`],
//!   unless automatic end-of-stream is switched off.
//!
//! Every request is recorded so tests can assert on the exact run state
//! changes and seeks a media issued.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    Bin, BusHandler, ClockTime, Element, ElementFactory, Message, NoMorePadsCallback, Pad,
    PadAddedCallback, Pipeline, Seek, SeekType, SignalHandlerId, State, StateChangeReturn,
};
use crate::media::stream::Stream;

/// Name of the placeholder sink that keeps preroll asynchronous.
pub const PLACEHOLDER_NAME: &str = "fakesink";

const DEFAULT_DURATION: Duration = Duration::from_secs(10);

type PadAddedFn = Arc<dyn Fn(&Pad) + Send + Sync>;
type NoMorePadsFn = Arc<dyn Fn() + Send + Sync>;

/// A leaf element. Dynamic producers emit pads via
/// [`emit_pad_added`](Self::emit_pad_added).
pub struct SimElement {
    name: String,
    src_pad: Option<Pad>,
    state: Mutex<State>,
    pad_added: Mutex<Vec<(SignalHandlerId, PadAddedFn)>>,
    no_more_pads: Mutex<Vec<(SignalHandlerId, NoMorePadsFn)>>,
}

impl SimElement {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, None))
    }

    /// An element with an always-present `src` pad, like a payloader.
    pub fn with_src_pad(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, Some(Pad::new("src", Some(name)))))
    }

    fn build(name: &str, src_pad: Option<Pad>) -> Self {
        Self {
            name: name.to_string(),
            src_pad,
            state: Mutex::new(State::Null),
            pad_added: Mutex::new(Vec::new()),
            no_more_pads: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// Expose a new pad and notify every `pad-added` callback.
    pub fn emit_pad_added(&self, pad_name: &str) -> Pad {
        let pad = Pad::new(pad_name, Some(&self.name));
        let callbacks: Vec<PadAddedFn> = self
            .pad_added
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(&pad);
        }
        pad
    }

    pub fn emit_no_more_pads(&self) {
        let callbacks: Vec<NoMorePadsFn> = self
            .no_more_pads
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Number of connected callbacks of either kind.
    pub fn handler_count(&self) -> usize {
        self.pad_added.lock().len() + self.no_more_pads.lock().len()
    }
}

impl Element for SimElement {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn static_pad(&self, name: &str) -> Option<Pad> {
        self.src_pad.as_ref().filter(|pad| pad.name() == name).cloned()
    }

    fn set_state(&self, state: State) -> StateChangeReturn {
        *self.state.lock() = state;
        StateChangeReturn::Success
    }

    fn connect_pad_added(&self, callback: PadAddedCallback) -> SignalHandlerId {
        let id = SignalHandlerId::next();
        self.pad_added.lock().push((id, Arc::from(callback)));
        id
    }

    fn connect_no_more_pads(&self, callback: NoMorePadsCallback) -> SignalHandlerId {
        let id = SignalHandlerId::next();
        self.no_more_pads.lock().push((id, Arc::from(callback)));
        id
    }

    fn disconnect(&self, id: SignalHandlerId) {
        self.pad_added.lock().retain(|(handler, _)| *handler != id);
        self.no_more_pads.lock().retain(|(handler, _)| *handler != id);
    }
}

/// The user-supplied media bin holding the producers.
pub struct SimBin {
    name: String,
    state: Mutex<State>,
    children: Mutex<Vec<Arc<SimElement>>>,
    ghost_pads: Mutex<Vec<Pad>>,
}

impl SimBin {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(State::Null),
            children: Mutex::new(Vec::new()),
            ghost_pads: Mutex::new(Vec::new()),
        })
    }

    /// A bin with `n_static` payloaders (`pay0`, `pay1`, ...) and
    /// `n_dynamic` dynamic producers (`dynpay0`, ...).
    pub fn with_payloaders(name: &str, n_static: usize, n_dynamic: usize) -> Arc<Self> {
        let bin = Self::new(name);
        for i in 0..n_static {
            bin.add(SimElement::with_src_pad(&format!("pay{i}")));
        }
        for i in 0..n_dynamic {
            bin.add(SimElement::new(&format!("dynpay{i}")));
        }
        bin
    }

    pub fn add(&self, child: Arc<SimElement>) {
        self.children.lock().push(child);
    }

    pub fn child(&self, name: &str) -> Option<Arc<SimElement>> {
        self.children
            .lock()
            .iter()
            .find(|child| child.name == name)
            .cloned()
    }

    pub fn ghost_pads(&self) -> Vec<Pad> {
        self.ghost_pads.lock().clone()
    }
}

impl Element for SimBin {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn static_pad(&self, name: &str) -> Option<Pad> {
        self.ghost_pads
            .lock()
            .iter()
            .find(|pad| pad.name() == name)
            .cloned()
    }

    fn set_state(&self, state: State) -> StateChangeReturn {
        *self.state.lock() = state;
        StateChangeReturn::Success
    }

    fn connect_pad_added(&self, _callback: PadAddedCallback) -> SignalHandlerId {
        SignalHandlerId::next()
    }

    fn connect_no_more_pads(&self, _callback: NoMorePadsCallback) -> SignalHandlerId {
        SignalHandlerId::next()
    }

    fn disconnect(&self, _id: SignalHandlerId) {}
}

impl Bin for SimBin {
    fn by_name(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.child(name).map(|child| child as Arc<dyn Element>)
    }

    fn add_ghost_pad(&self, name: &str, _target: &Pad) -> Pad {
        let pad = Pad::new(name, Some(&self.name));
        self.ghost_pads.lock().push(pad.clone());
        pad
    }

    fn remove_pad(&self, pad: &Pad) -> bool {
        let mut pads = self.ghost_pads.lock();
        let before = pads.len();
        pads.retain(|p| p != pad);
        pads.len() != before
    }
}

/// Creates [`SimElement`]s; individual factories can be marked missing.
#[derive(Default)]
pub struct SimFactory {
    missing: Mutex<HashSet<String>>,
    made: Mutex<Vec<String>>,
}

impl SimFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A factory that fails to create any of `factories`.
    pub fn without(factories: &[&str]) -> Arc<Self> {
        let factory = Self::default();
        factory
            .missing
            .lock()
            .extend(factories.iter().map(|f| f.to_string()));
        Arc::new(factory)
    }

    pub fn set_missing(&self, factory: &str, missing: bool) {
        let mut set = self.missing.lock();
        if missing {
            set.insert(factory.to_string());
        } else {
            set.remove(factory);
        }
    }

    /// Factory names of every element created so far.
    pub fn made(&self) -> Vec<String> {
        self.made.lock().clone()
    }
}

impl ElementFactory for SimFactory {
    fn make(&self, factory: &str, name: Option<&str>) -> Option<Arc<dyn Element>> {
        if self.missing.lock().contains(factory) {
            tracing::debug!(factory, "no such element factory");
            return None;
        }
        self.made.lock().push(factory.to_string());
        Some(SimElement::new(name.unwrap_or(factory)) as Arc<dyn Element>)
    }
}

/// How the simulated graph answers a request to go to PAUSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preroll {
    /// Answer `Success` and post `AsyncDone` right away.
    Immediate,
    /// Answer `Async` and post `AsyncDone` after the delay.
    Async(Duration),
    /// Answer `NoPreroll`; `AsyncDone` follows once PLAYING is requested.
    Live,
    /// Answer `Async` and never finish prerolling.
    Never,
    /// Refuse PAUSED and PLAYING.
    Fail,
}

struct Graph {
    current: State,
    preroll_pending: bool,
    live_started: bool,
    eos_pending: bool,
    auto_eos: bool,
    elements: Vec<Arc<dyn Element>>,
    joined: Vec<(usize, State)>,
    requests: Vec<State>,
    seeks: Vec<Seek>,
    position: Option<ClockTime>,
    duration: Option<ClockTime>,
    latency_recalcs: usize,
    eos_sent: usize,
}

impl Graph {
    fn has_placeholder(&self) -> bool {
        self.elements.iter().any(|e| e.name() == PLACEHOLDER_NAME)
    }
}

/// A simulated top-level graph.
pub struct SimPipeline {
    preroll: Preroll,
    graph: Mutex<Graph>,
    bus: Mutex<Option<BusHandler>>,
    me: Weak<SimPipeline>,
}

impl SimPipeline {
    pub fn new(preroll: Preroll) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            preroll,
            graph: Mutex::new(Graph {
                current: State::Null,
                preroll_pending: false,
                live_started: false,
                eos_pending: false,
                auto_eos: true,
                elements: Vec::new(),
                joined: Vec::new(),
                requests: Vec::new(),
                seeks: Vec::new(),
                position: Some(Duration::ZERO),
                duration: Some(DEFAULT_DURATION),
                latency_recalcs: 0,
                eos_sent: 0,
            }),
            bus: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Post a notification on the bus, as a streaming thread would.
    pub fn post(&self, message: Message) {
        let handler = self.bus.lock().clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::trace!(message = message.type_name(), "no bus handler, dropping"),
        }
    }

    fn post_after(&self, message: Message, delay: Duration) {
        if delay.is_zero() {
            self.post(message);
            return;
        }
        let me = self.me.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if let Some(pipeline) = me.upgrade() {
                pipeline.post(message);
            }
        });
    }

    fn preroll_delay(&self) -> Duration {
        match self.preroll {
            Preroll::Async(delay) => delay,
            _ => Duration::ZERO,
        }
    }

    pub fn current_state(&self) -> State {
        self.graph.lock().current
    }

    /// Every run state requested so far, in order.
    pub fn state_requests(&self) -> Vec<State> {
        self.graph.lock().requests.clone()
    }

    pub fn clear_state_requests(&self) {
        self.graph.lock().requests.clear();
    }

    pub fn seeks(&self) -> Vec<Seek> {
        self.graph.lock().seeks.clone()
    }

    /// `(stream index, state)` of every stream currently joined.
    pub fn joined_streams(&self) -> Vec<(usize, State)> {
        self.graph.lock().joined.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graph.lock().elements.iter().any(|e| e.name() == name)
    }

    pub fn has_bus_handler(&self) -> bool {
        self.bus.lock().is_some()
    }

    pub fn latency_recalcs(&self) -> usize {
        self.graph.lock().latency_recalcs
    }

    pub fn eos_sent(&self) -> usize {
        self.graph.lock().eos_sent
    }

    /// When disabled, [`Pipeline::send_eos`] is recorded but end-of-stream
    /// is only posted by an explicit [`post`](Self::post).
    pub fn set_auto_eos(&self, auto_eos: bool) {
        self.graph.lock().auto_eos = auto_eos;
    }

    pub fn set_position(&self, position: Option<ClockTime>) {
        self.graph.lock().position = position;
    }

    pub fn set_duration(&self, duration: Option<ClockTime>) {
        self.graph.lock().duration = duration;
    }
}

impl Pipeline for SimPipeline {
    fn set_state(&self, state: State) -> StateChangeReturn {
        let mut graph = self.graph.lock();
        graph.requests.push(state);

        if self.preroll == Preroll::Fail && state >= State::Paused {
            return StateChangeReturn::Failure;
        }

        let previous = graph.current;
        graph.current = state;
        let mut posts = Vec::new();

        let ret = match state {
            State::Null | State::Ready => {
                graph.preroll_pending = false;
                graph.live_started = false;
                graph.eos_pending = false;
                StateChangeReturn::Success
            }
            State::Paused if previous >= State::Paused => StateChangeReturn::Success,
            State::Paused => match self.preroll {
                Preroll::Immediate => {
                    posts.push((Message::AsyncDone, Duration::ZERO));
                    StateChangeReturn::Success
                }
                Preroll::Async(delay) => {
                    if graph.has_placeholder() {
                        graph.preroll_pending = true;
                    } else {
                        posts.push((Message::AsyncDone, delay));
                    }
                    StateChangeReturn::Async
                }
                Preroll::Live => StateChangeReturn::NoPreroll,
                Preroll::Never => StateChangeReturn::Async,
                Preroll::Fail => StateChangeReturn::Failure,
            },
            State::Playing => {
                let mut ret = StateChangeReturn::Success;
                if self.preroll == Preroll::Live && !graph.live_started {
                    graph.live_started = true;
                    posts.push((Message::AsyncDone, Duration::ZERO));
                    ret = StateChangeReturn::Async;
                }
                if graph.eos_pending && graph.auto_eos {
                    graph.eos_pending = false;
                    posts.push((Message::Eos, Duration::ZERO));
                }
                ret
            }
        };
        drop(graph);

        for (message, delay) in posts {
            self.post_after(message, delay);
        }
        ret
    }

    fn get_state(&self, _timeout: Option<Duration>) -> (StateChangeReturn, State) {
        (StateChangeReturn::Success, self.graph.lock().current)
    }

    fn query_position(&self) -> Option<ClockTime> {
        self.graph.lock().position
    }

    fn query_duration(&self) -> Option<ClockTime> {
        self.graph.lock().duration
    }

    fn seek(&self, seek: &Seek) -> bool {
        let mut graph = self.graph.lock();
        if seek.start_type == SeekType::Set {
            graph.position = seek.start;
        }
        graph.seeks.push(seek.clone());
        true
    }

    fn send_eos(&self) -> bool {
        let mut graph = self.graph.lock();
        graph.eos_sent += 1;
        if !graph.auto_eos {
            return true;
        }
        if graph.current == State::Playing {
            drop(graph);
            self.post(Message::Eos);
        } else {
            graph.eos_pending = true;
        }
        true
    }

    fn recalculate_latency(&self) -> bool {
        self.graph.lock().latency_recalcs += 1;
        true
    }

    fn add(&self, element: Arc<dyn Element>) -> bool {
        let mut graph = self.graph.lock();
        if graph.elements.iter().any(|e| Arc::ptr_eq(e, &element)) {
            return false;
        }
        graph.elements.push(element);
        true
    }

    fn remove(&self, element: &Arc<dyn Element>) -> bool {
        let mut graph = self.graph.lock();
        let before = graph.elements.len();
        graph.elements.retain(|e| !Arc::ptr_eq(e, element));
        let removed = graph.elements.len() != before;

        let release_preroll =
            removed && graph.preroll_pending && element.name() == PLACEHOLDER_NAME;
        if release_preroll {
            graph.preroll_pending = false;
        }
        drop(graph);

        if release_preroll {
            self.post_after(Message::AsyncDone, self.preroll_delay());
        }
        removed
    }

    fn join_stream(&self, stream: &Stream, _session: &Arc<dyn Element>, state: State) -> bool {
        self.graph.lock().joined.push((stream.index(), state));
        true
    }

    fn leave_stream(&self, stream: &Stream, _session: &Arc<dyn Element>) -> bool {
        let mut graph = self.graph.lock();
        let before = graph.joined.len();
        graph.joined.retain(|(index, _)| *index != stream.index());
        graph.joined.len() != before
    }

    fn set_bus_handler(&self, handler: Option<BusHandler>) {
        *self.bus.lock() = handler;
    }
}
