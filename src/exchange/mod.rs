//! Live exchange integration: signed REST client and the user-data stream.

pub mod rest;
pub mod user_stream;

pub use rest::{VenueApi, VenueRestClient};
pub use user_stream::UserDataStream;
