//! Control protocol implementation.
//!
//! A line-oriented ASCII protocol spoken on the well-known listener.
//! Clients register a display name, open data channels and close them:
//!
//! ```text
//! Request:  #N@NAME:alice;!
//! Response: #NOK@CONNECTION:0;!
//!
//! Request:  #T@!
//! Response: #TOK@PORT:6001;CONNECTION:2;!
//!
//! Request:  #K@CONNECTION:2;!
//! Response: #KOK@INFO:2 closed;!
//! ```
//!
//! The server also pushes unsolicited `#INF@INFO:<text>;!` notifications.
//! Text that does not match any command is ignored.

pub mod parser;

pub use parser::{parse, ChannelKind, Command, OpenFailure, ParseResult, Response};
