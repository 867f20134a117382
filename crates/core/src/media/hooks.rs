//! Replaceable behavior of a [`Media`].
//!
//! Both hooks run with the media's state lock held, so they may call back
//! into any `Media` method.

use super::Media;
use crate::error::Result;
use crate::pipeline::Message;

/// Override points for handling graph notifications and shutting down.
pub trait MediaHooks: Send + Sync {
    /// Handle one bus notification. Runs on the media's control thread.
    fn handle_message(&self, media: &Media, message: &Message) {
        media.default_handle_message(message);
    }

    /// Shut down a prepared media.
    fn unprepare(&self, media: &Media) -> Result<()> {
        media.default_unprepare()
    }
}

/// Default behavior: end-of-stream shutdown when the media is configured
/// for it, immediate teardown otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl MediaHooks for DefaultHooks {}

/// Tears down immediately on unprepare, ignoring `eos_shutdown`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateTeardown;

impl MediaHooks for ImmediateTeardown {
    fn unprepare(&self, media: &Media) -> Result<()> {
        media.teardown();
        Ok(())
    }
}
