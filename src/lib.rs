//! BridgeBot Backend Library
//!
//! Exposes the execution bridge for the `bridgebot` binary and tests:
//! the engine stdio channel, the event log, the reconciliation stores,
//! the execution router, the live-venue integration, and the HTTP surface.

pub mod api;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod market_feed;
pub mod models;
