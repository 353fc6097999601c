//! Engine subprocess integration: stdio channel and wire protocol.

pub mod channel;
pub mod protocol;

pub use channel::ProcessChannel;
