//! Error types for the media session library.

use crate::media::MediaStatus;
use crate::media::range::RangeUnit;

/// Errors that can occur while driving a media session or its threads.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Misuse**: [`NotPrepared`](Self::NotPrepared),
///   [`InvalidStatus`](Self::InvalidStatus),
///   [`NotReusable`](Self::NotReusable) — the operation is not valid in the
///   current status. State is left untouched.
/// - **Resource unavailable**: [`ElementUnavailable`](Self::ElementUnavailable)
///   — a required graph sub-element could not be created.
/// - **Graph failure**: [`StateChangeFailed`](Self::StateChangeFailed),
///   [`PrepareFailed`](Self::PrepareFailed), [`SeekFailed`](Self::SeekFailed),
///   [`StreamLink`](Self::StreamLink).
/// - **Unsupported request**: [`UnsupportedRangeUnit`](Self::UnsupportedRangeUnit),
///   [`InvalidRange`](Self::InvalidRange).
/// - **Threads**: [`NoThread`](Self::NoThread) when the pool hands out none,
///   [`Spawn`](Self::Spawn) when a thread could not be handed to the OS.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The media must be in [`MediaStatus::Prepared`] for this operation.
    #[error("media is not prepared (status: {0:?})")]
    NotPrepared(MediaStatus),

    /// `prepare` was called while the media was neither unprepared nor
    /// preparing/prepared.
    #[error("media can not be prepared from status {0:?}")]
    InvalidStatus(MediaStatus),

    /// The media is not reusable and has already been torn down once.
    #[error("media is not reusable and was already used")]
    NotReusable,

    /// The element factory could not create a required element.
    #[error("failed to create element '{0}'")]
    ElementUnavailable(String),

    /// The graph refused a run state change during preparation.
    #[error("graph failed to change state during preparation")]
    StateChangeFailed,

    /// The graph posted an error (or preroll timed out) while preparing.
    #[error("media failed to preroll")]
    PrepareFailed,

    /// The graph could not link the delivery branch of a stream.
    #[error("failed to link stream {0}")]
    StreamLink(usize),

    /// The graph rejected a seek request.
    #[error("graph rejected seek")]
    SeekFailed,

    /// Seeking is only supported for NPT ranges.
    #[error("seek unit {0} not supported")]
    UnsupportedRangeUnit(RangeUnit),

    /// A range string could not be parsed.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// The thread pool did not hand out a media thread.
    #[error("no thread available for media")]
    NoThread,

    /// The OS refused to spawn a worker thread for an execution context.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Convenience alias for `Result<T, MediaError>`.
pub type Result<T> = std::result::Result<T, MediaError>;
