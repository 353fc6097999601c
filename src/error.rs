//! Error types for the execution bridge.
//!
//! Only failures that prevent an action from being attempted surface as
//! errors to the caller. Everything that happens after an action was accepted
//! (venue rejects, poll failures, stream drops) degrades into events on the
//! event log instead. Malformed protocol lines are dropped at the decode
//! layer with a debug trace and never become errors at all.

use thiserror::Error;

/// Bridge-level errors returned synchronously from order actions and startup.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The engine subprocess could not be spawned. Fatal to the whole bridge.
    #[error("failed to spawn engine process `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine's stdin is gone. Fatal to the specific command only.
    #[error("engine channel closed")]
    ChannelClosed,

    /// The live venue cannot be reached for this action at all
    /// (e.g. credentials not configured). Venue failures *during* an
    /// attempted action become synthesized events, not this error.
    #[error("venue unavailable: {0}")]
    VenueUnavailable(String),
}
