//! Compute protocol implementation.
//!
//! Binary frames of 32-bit unsigned words in network byte order:
//!
//! ```text
//! flag(0) | reserved | count | idx1 | idx2 | idx_res | opcode | data[0..count)
//! ```
//!
//! The server stores `data[idx1] <op> data[idx2]` into `data[idx_res]` and
//! echoes the whole frame back. Opcodes: `43` add, `42` multiply, `37` modulo.
//!
//! ## Variants
//!
//! - Stream: `count <= 1024`. Undefined operations store `0xFFFFFFFF` and
//!   still succeed; every frame reports a status to the owning session.
//! - Datagram: one frame per packet of at most 512 bytes, `count <= 107`.
//!   Anything invalid or undefined is dropped without a reply.

pub mod frame;
pub mod handler;

pub use handler::{process_datagram, process_stream, Status, StreamOutcome};
