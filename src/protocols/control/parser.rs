//! Control protocol parser and response encoder.

use std::fmt;

/// Longest command accepted before the line buffer is discarded.
pub const MAX_COMMAND_LEN: usize = 511;

/// Names are truncated to this many bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Kind of data channel a control session can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Connection-oriented channel (`T`).
    Stream,
    /// Packet-oriented channel (`U`).
    Datagram,
}

impl ChannelKind {
    /// Single-letter tag used on the wire.
    pub fn tag(self) -> char {
        match self {
            ChannelKind::Stream => 'T',
            ChannelKind::Datagram => 'U',
        }
    }
}

/// Parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `#N@NAME:<name>;!`
    Name(String),
    /// `#K@CONNECTION:<id>;!`
    Disconnect(u32),
    /// `#T@!` / `#U@!`
    Open(ChannelKind),
    /// `#A@!`
    ActiveCount,
    /// `#D@!`
    FreeCount,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed command with bytes consumed.
    Complete(Command, usize),
    /// A terminated command that matched nothing; skip `usize` bytes.
    Unrecognized(usize),
    /// No terminator yet.
    Incomplete,
    /// No terminator within `MAX_COMMAND_LEN` bytes.
    Overflow,
}

/// Parse one control command from the front of `input`.
///
/// A command ends at the first `!` directly preceded by `;` or `@`.
pub fn parse(input: &[u8]) -> ParseResult {
    let end = match find_terminator(input) {
        Some(pos) => pos,
        None if input.len() > MAX_COMMAND_LEN => return ParseResult::Overflow,
        None => return ParseResult::Incomplete,
    };
    let consumed = end + 1;

    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(end);
    let line = &input[start..consumed];

    match parse_line(line) {
        Some(command) => ParseResult::Complete(command, consumed),
        None => ParseResult::Unrecognized(consumed),
    }
}

fn parse_line(line: &[u8]) -> Option<Command> {
    match line {
        b"#T@!" => return Some(Command::Open(ChannelKind::Stream)),
        b"#U@!" => return Some(Command::Open(ChannelKind::Datagram)),
        b"#A@!" => return Some(Command::ActiveCount),
        b"#D@!" => return Some(Command::FreeCount),
        _ => {}
    }

    if let Some(rest) = line.strip_prefix(b"#N@NAME:") {
        let body = rest.strip_suffix(b";!")?;
        let name = body.split(|&b| b == b';').next().unwrap_or_default();
        if name.is_empty() {
            return None;
        }
        let name = &name[..name.len().min(MAX_NAME_LEN)];
        return Some(Command::Name(String::from_utf8_lossy(name).into_owned()));
    }

    if let Some(rest) = line.strip_prefix(b"#K@CONNECTION:") {
        let digits = rest.strip_suffix(b";!")?;
        let id = std::str::from_utf8(digits).ok()?.trim().parse().ok()?;
        return Some(Command::Disconnect(id));
    }

    None
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    (1..buffer.len()).find(|&i| buffer[i] == b'!' && matches!(buffer[i - 1], b';' | b'@'))
}

/// Reasons a channel could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    NotRegistered,
    NoFreePort,
    NoFreeSlot,
    ListenFailed,
}

impl OpenFailure {
    pub fn reason(self) -> &'static str {
        match self {
            OpenFailure::NotRegistered => "Not registered",
            OpenFailure::NoFreePort => "No free port",
            OpenFailure::NoFreeSlot => "No free connection slot",
            OpenFailure::ListenFailed => "Listen failed",
        }
    }
}

/// Server-to-client control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Named { slot: usize },
    Opened { kind: ChannelKind, port: u16, connection: u32 },
    OpenFailed { kind: ChannelKind, failure: OpenFailure },
    Closed { connection: u32 },
    NotFound,
    Active(usize),
    Free(usize),
    Info(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Named { slot } => write!(f, "#NOK@CONNECTION:{slot};!"),
            Response::Opened {
                kind,
                port,
                connection,
            } => write!(
                f,
                "#{}OK@PORT:{port};CONNECTION:{connection};!",
                kind.tag()
            ),
            Response::OpenFailed { kind, failure } => {
                write!(f, "#{}ER@ERROR:{};!", kind.tag(), failure.reason())
            }
            Response::Closed { connection } => write!(f, "#KOK@INFO:{connection} closed;!"),
            Response::NotFound => f.write_str("#KER@ERROR:connection not found;!"),
            Response::Active(n) => write!(f, "#AOK@ALL:{n};!"),
            Response::Free(n) => write!(f, "#DOK@FREE:{n};!"),
            Response::Info(text) => write!(f, "#INF@INFO:{text};!"),
        }
    }
}

impl Response {
    /// Encode for the wire.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}
