//! Authorization collaborator attached to a media.
//!
//! The media only stores the handle and hands it out; deciding what a client
//! may do is left to the implementation.

use std::fmt;

/// Decides whether a request against a media is allowed.
pub trait Auth: Send + Sync + fmt::Debug {
    /// `true` when `check` (e.g. `"media.access"`) passes for the current client.
    fn check(&self, check: &str) -> bool;
}

/// Allows every check.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Auth for AllowAll {
    fn check(&self, _check: &str) -> bool {
        true
    }
}
