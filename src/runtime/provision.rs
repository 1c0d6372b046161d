//! On-demand data channel sockets.
//!
//! A channel binds the first free port above a kind-specific base. Stream
//! channels must also enter the listening state. Nothing here touches the
//! registry; the caller decides whether the bound socket is kept.

use crate::protocols::control::ChannelKind;
use mio::net::{TcpListener, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::trace;

/// Pending connections a stream channel will queue.
const STREAM_BACKLOG: i32 = 10;

/// Ports `base + 1 ..= base + span` searched for one kind of channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub base: u16,
    pub span: u16,
}

impl PortRange {
    pub fn new(base: u16, span: u16) -> Self {
        Self { base, span }
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        let first = self.base.saturating_add(1);
        let last = self.base.saturating_add(self.span);
        first..=last
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no free port in {}..={}", .range.start(), .range.end())]
    NoFreePort { range: RangeInclusive<u16> },
    #[error("listen failed on port {port}: {source}")]
    Listen { port: u16, source: io::Error },
}

/// A bound, non-blocking data channel socket.
#[derive(Debug)]
pub enum BoundSocket {
    Listener(TcpListener),
    Datagram(UdpSocket),
}

#[derive(Debug)]
pub struct BoundChannel {
    pub socket: BoundSocket,
    pub addr: SocketAddr,
}

/// Bind a new channel of `kind` on `host` in the first free port of `range`.
pub fn bind_channel(
    kind: ChannelKind,
    host: IpAddr,
    range: PortRange,
) -> Result<BoundChannel, ProvisionError> {
    let (socket, addr) = range
        .ports()
        .find_map(|port| {
            let addr = SocketAddr::new(host, port);
            match try_bind(kind, addr) {
                Ok(socket) => Some((socket, addr)),
                Err(e) => {
                    trace!(port, error = %e, "Port unavailable");
                    None
                }
            }
        })
        .ok_or_else(|| ProvisionError::NoFreePort {
            range: range.ports(),
        })?;

    let port = addr.port();
    let socket = match kind {
        ChannelKind::Stream => {
            socket
                .listen(STREAM_BACKLOG)
                .map_err(|source| ProvisionError::Listen { port, source })?;
            BoundSocket::Listener(TcpListener::from_std(socket.into()))
        }
        ChannelKind::Datagram => BoundSocket::Datagram(UdpSocket::from_std(socket.into())),
    };

    Ok(BoundChannel { socket, addr })
}

fn try_bind(kind: ChannelKind, addr: SocketAddr) -> io::Result<Socket> {
    let domain = Domain::for_address(addr);
    let socket = match kind {
        ChannelKind::Stream => {
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket
        }
        // SO_REUSEADDR would let two datagram channels share a port
        ChannelKind::Datagram => Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?,
    };
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}
