//! Single-threaded readiness runtime.
//!
//! - `connection`: connection records and the fixed-capacity registry
//! - `ids`: session and connection identifiers
//! - `provision`: ephemeral port search for new data channels
//! - `event_loop`: the mio poll loop and per-channel I/O
//! - `request`: control command execution and session notifications

mod connection;
mod event_loop;
mod ids;
mod provision;
mod request;

pub use event_loop::run;
