//! Media session lifecycle and execution contexts for RTSP servers.
//!
//! - [`Media`] drives a processing graph from idle to prerolled, counts the
//!   clients receiving it, and tears it down again.
//! - [`ThreadPool`] hands out the [`Thread`]s that client connections and
//!   media notification handling run on.
//! - [`pipeline`] is the boundary to the graph engine, with an in-memory
//!   engine in [`pipeline::sim`].

pub mod address_pool;
pub mod auth;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod thread_pool;

pub use address_pool::{AddressPool, PortRangePool};
pub use auth::{AllowAll, Auth};
pub use error::{MediaError, Result};
pub use media::{
    DefaultHooks, Graph, ImmediateTeardown, LowerTransport, Media, MediaConfig, MediaEvent,
    MediaHooks, MediaStatus, RangeTime, RangeUnit, Stream, StreamTransport, SubscriptionId,
    TimeRange, Transport,
};
pub use thread_pool::{ClientState, Thread, ThreadLimit, ThreadPool, ThreadPoolHooks, ThreadType};
