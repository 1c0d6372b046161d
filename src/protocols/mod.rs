//! Protocol implementations.
//!
//! Each protocol is pure parsing/encoding over byte buffers used by the
//! runtime event loop:
//! - `control`: text commands on the well-known listener
//! - `compute`: binary arithmetic frames on stream and datagram channels

pub mod compute;
pub mod control;
