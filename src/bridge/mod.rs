//! The execution bridge core: event log, reconciliation stores, and the
//! execution router tying the engine and venue paths together.

pub mod account_store;
pub mod event_log;
pub mod order_store;
pub mod router;

pub use account_store::AccountStore;
pub use event_log::EventLog;
pub use order_store::OrderStore;
pub use router::{ExecutionRouter, RouterConfig};
