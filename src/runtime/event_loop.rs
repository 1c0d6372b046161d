//! mio event loop for control and data channels.
//!
//! Readiness-based: poll reports which descriptors are ready, then each is
//! drained with non-blocking reads until it would block.
//!
//! One thread owns the poller, the control listener and the connection
//! registry. Every ready socket is handled to completion before the next
//! one, so no state is shared and nothing is locked.

use crate::config::Config;
use crate::protocols::compute::{process_datagram, process_stream, Status, StreamOutcome};
use crate::protocols::compute::frame::{DATAGRAM_CAPACITY, MAX_STREAM_FRAME_LEN};
use crate::protocols::control::parser::MAX_COMMAND_LEN;
use crate::runtime::connection::{
    Channel, ConnectionRecord, ConnectionRegistry, Fill, Peer, StreamChannel,
};
use crate::runtime::ids::IdAllocator;
use crate::runtime::provision::PortRange;
use bytes::Buf;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 128;

/// Backlog of the well-known control listener.
const CONTROL_BACKLOG: i32 = 10;

/// Most control input buffered at once; anything longer is an overflow.
const CONTROL_READ_LIMIT: usize = MAX_COMMAND_LEN + 1;

/// Where and how data channels are provisioned.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSettings {
    pub bind_host: IpAddr,
    pub stream_ports: PortRange,
    pub datagram_ports: PortRange,
    pub frame_timeout: Option<Duration>,
}

/// Readiness of one descriptor within a wake-up.
#[derive(Debug, Clone, Copy)]
struct Ready {
    fd: RawFd,
    readable: bool,
    writable: bool,
}

/// The single-threaded server: poller, listener and all connection state.
pub struct Server {
    pub(crate) poll: Poll,
    listener: TcpListener,
    listener_fd: RawFd,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) ids: IdAllocator,
    pub(crate) settings: ChannelSettings,
    /// Descriptors whose last read stopped at the buffer limit.
    deferred: Vec<RawFd>,
}

/// Run the server until a fatal poll error.
pub fn run(config: Config) -> io::Result<()> {
    let mut server = Server::bind(&config)?;
    server.run()
}

impl Server {
    /// Bind the control listener. Failure here is fatal for the process.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(config.listen)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let listener_fd = listener.as_raw_fd();

        let settings = ChannelSettings {
            bind_host: config.bind_host,
            stream_ports: PortRange::new(config.stream_port_base, config.port_range),
            datagram_ports: PortRange::new(config.datagram_port_base, config.port_range),
            frame_timeout: config.frame_timeout,
        };

        let server = Self {
            poll,
            listener,
            listener_fd,
            registry: ConnectionRegistry::new(config.max_connections),
            ids: IdAllocator::new(),
            settings,
            deferred: Vec::new(),
        };

        info!(
            addr = %server.local_addr()?,
            max_connections = config.max_connections,
            stream_ports = ?server.settings.stream_ports.ports(),
            datagram_ports = ?server.settings.datagram_ports.ports(),
            "Control listener ready"
        );
        Ok(server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut ready = Vec::with_capacity(EVENTS_CAPACITY);

        loop {
            let timeout = if self.deferred.is_empty() {
                self.poll_timeout(Instant::now())
            } else {
                Some(Duration::ZERO)
            };
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            ready.clear();
            ready.extend(self.deferred.drain(..).map(|fd| Ready {
                fd,
                readable: true,
                writable: false,
            }));
            for event in events.iter() {
                let fd = match event.token() {
                    LISTENER_TOKEN => Some(self.listener_fd),
                    Token(slot) => self.registry.descriptor(slot),
                };
                if let Some(fd) = fd {
                    ready.push(Ready {
                        fd,
                        readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                        writable: event.is_writable(),
                    });
                }
            }
            order_ready(&mut ready);

            for r in ready.iter().copied() {
                self.dispatch(r);
            }

            self.expire_partial_frames(Instant::now());
        }
    }

    /// How long poll may block: until the oldest partial frame expires.
    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        let timeout = self.settings.frame_timeout?;
        let oldest = self.registry.oldest_partial()?;
        Some((oldest + timeout).saturating_duration_since(now))
    }

    fn dispatch(&mut self, ready: Ready) {
        if ready.fd == self.listener_fd {
            self.accept_controls();
            return;
        }

        // records closed earlier in this wake-up are gone
        let slot = match self.registry.find_by_descriptor(ready.fd) {
            Some(slot) => slot,
            None => return,
        };

        if ready.writable {
            if let Err(e) = self.flush(slot) {
                debug!(slot, error = %e, "Write failed");
                self.close(slot);
                return;
            }
        }

        if !ready.readable {
            return;
        }

        let result = match self.registry.get(slot).map(|r| &r.channel) {
            Some(Channel::Control { .. }) => self.read_control(slot),
            Some(Channel::StreamListener { .. }) => self.accept_stream(slot),
            Some(Channel::StreamData(_)) => self.read_stream(slot),
            Some(Channel::DatagramData { .. }) => self.read_datagrams(slot),
            None => Ok(()),
        };

        if let Err(e) = result {
            debug!(slot, error = %e, "Connection error");
            self.close(slot);
        }
    }

    fn accept_controls(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let record = ConnectionRecord::control(stream, peer_addr);
                    match self.registry.allocate(record) {
                        Ok(slot) => {
                            if let Err(e) = self.register(slot) {
                                error!(slot, error = %e, "Failed to watch control connection");
                                self.close(slot);
                                continue;
                            }
                            debug!(slot, peer = %peer_addr, "Accepted control connection");
                        }
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "Rejecting control connection");
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Accept the single peer of a stream channel and retire its listener.
    fn accept_stream(&mut self, slot: usize) -> io::Result<()> {
        let record = match self.registry.get_mut(slot) {
            Some(record) => record,
            None => return Ok(()),
        };
        let (accepted, owner) = match &mut record.channel {
            Channel::StreamListener { listener, owner } => (listener.accept(), *owner),
            _ => return Ok(()),
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(())
            }
            Err(e) => {
                error!(slot, error = %e, "Stream channel accept failed");
                return Ok(());
            }
        };

        let _ = self.poll.registry().deregister(record.channel.source());
        // replacing the channel drops, and so closes, the listener
        record.channel = Channel::StreamData(StreamChannel {
            peer: Peer::new(stream),
            owner,
            partial_since: None,
            scratch: Vec::new(),
        });
        record.remote_addr = peer_addr;

        debug!(
            slot,
            client_id = %owner,
            connection_id = ?record.connection_id,
            peer = %peer_addr,
            "Accepted stream channel peer"
        );
        self.register(slot)
    }

    fn read_control(&mut self, slot: usize) -> io::Result<()> {
        let fill = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
            Some(Channel::Control { peer, .. }) => peer.fill(CONTROL_READ_LIMIT)?,
            _ => return Ok(()),
        };

        self.process_commands(slot);

        if fill == Fill::Closed {
            debug!(slot, "Control connection closed by peer");
            self.close(slot);
            return Ok(());
        }
        self.defer_if_full(slot, fill);
        self.sync_interest(slot);
        Ok(())
    }

    fn read_stream(&mut self, slot: usize) -> io::Result<()> {
        let (fill, owner) = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
            Some(Channel::StreamData(data)) => {
                (data.peer.fill(MAX_STREAM_FRAME_LEN)?, data.owner)
            }
            _ => return Ok(()),
        };

        let mut progressed = false;
        loop {
            let data = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
                Some(Channel::StreamData(data)) => data,
                _ => return Ok(()),
            };

            let status = match process_stream(&data.peer.inbox, &mut data.scratch) {
                StreamOutcome::NeedData => break,
                StreamOutcome::Ignored { consumed } => {
                    data.peer.inbox.advance(consumed);
                    None
                }
                StreamOutcome::Rejected { consumed, status } => {
                    data.peer.inbox.advance(consumed);
                    Some(status)
                }
                StreamOutcome::Computed { consumed, reply } => {
                    data.peer.inbox.advance(consumed);
                    data.peer.send(&reply)?;
                    Some(Status::ComputationOk)
                }
            };
            progressed = true;

            if let Some(status) = status {
                debug!(slot, client_id = %owner, status = status.as_str(), "Stream frame processed");
                self.broadcast(owner, status.as_str());
            }
        }

        let pending = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
            Some(Channel::StreamData(data)) => {
                if data.peer.inbox.is_empty() {
                    data.partial_since = None;
                } else if progressed || data.partial_since.is_none() {
                    data.partial_since = Some(Instant::now());
                }
                data.peer.inbox.len()
            }
            _ => return Ok(()),
        };

        if fill == Fill::Closed {
            if pending > 0 {
                self.broadcast(owner, Status::truncated(pending).as_str());
            }
            debug!(slot, client_id = %owner, "Stream channel closed by peer");
            self.close(slot);
            return Ok(());
        }
        self.defer_if_full(slot, fill);
        self.sync_interest(slot);
        Ok(())
    }

    /// Edge-triggered readiness will not fire again for input left in the
    /// socket, so read `slot` again on the next turn.
    fn defer_if_full(&mut self, slot: usize, fill: Fill) {
        if fill != Fill::Full {
            return;
        }
        if let Some(fd) = self.registry.descriptor(slot) {
            self.deferred.push(fd);
        }
    }

    fn read_datagrams(&mut self, slot: usize) -> io::Result<()> {
        let socket = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
            Some(Channel::DatagramData { socket, .. }) => socket,
            _ => return Ok(()),
        };

        let mut buf = [0u8; DATAGRAM_CAPACITY];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => match process_datagram(&buf[..n]) {
                    Some(reply) => {
                        if let Err(e) = socket.send_to(&reply, from) {
                            debug!(slot, peer = %from, error = %e, "Datagram reply failed");
                        }
                    }
                    None => debug!(slot, peer = %from, len = n, "Datagram dropped"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(slot, error = %e, "Datagram receive failed");
                    return Ok(());
                }
            }
        }
    }

    /// Report and discard partial stream frames older than the deadline.
    fn expire_partial_frames(&mut self, now: Instant) {
        let timeout = match self.settings.frame_timeout {
            Some(timeout) => timeout,
            None => return,
        };

        for slot in self.registry.find_stalled(now, timeout) {
            let (owner, status) = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
                Some(Channel::StreamData(data)) => {
                    let status = Status::truncated(data.peer.inbox.len());
                    data.peer.inbox.clear();
                    data.partial_since = None;
                    (data.owner, status)
                }
                _ => continue,
            };
            warn!(slot, client_id = %owner, status = status.as_str(), "Stream frame timed out");
            self.broadcast(owner, status.as_str());
        }
    }

    /// Start watching the socket in `slot` for readability.
    pub(crate) fn register(&mut self, slot: usize) -> io::Result<()> {
        let record = self
            .registry
            .get_mut(slot)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        self.poll
            .registry()
            .register(record.channel.source(), Token(slot), Interest::READABLE)
    }

    fn flush(&mut self, slot: usize) -> io::Result<()> {
        if let Some(peer) = self
            .registry
            .get_mut(slot)
            .and_then(|r| r.channel.peer_mut())
        {
            peer.flush()?;
        }
        self.sync_interest(slot);
        Ok(())
    }

    /// Watch for writability only while output is queued.
    pub(crate) fn sync_interest(&mut self, slot: usize) {
        let result = match self
            .registry
            .get_mut(slot)
            .and_then(|r| r.channel.peer_mut())
        {
            Some(peer) => match peer.interest_change() {
                Some(interest) => {
                    self.poll
                        .registry()
                        .reregister(&mut peer.stream, Token(slot), interest)
                }
                None => Ok(()),
            },
            None => Ok(()),
        };

        if let Err(e) = result {
            debug!(slot, error = %e, "Failed to update interest");
            self.close(slot);
        }
    }

    /// Release `slot`, stop watching its socket and close it.
    pub(crate) fn close(&mut self, slot: usize) {
        if let Some(mut record) = self.registry.release(slot) {
            let _ = self.poll.registry().deregister(record.channel.source());
            debug!(
                slot,
                kind = record.channel.kind(),
                connection_id = ?record.connection_id,
                peer = %record.remote_addr,
                "Connection closed"
            );
        }
    }
}

/// Sort by descriptor and merge duplicate entries for one descriptor.
fn order_ready(ready: &mut Vec<Ready>) {
    ready.sort_by_key(|r| r.fd);
    ready.dedup_by(|next, kept| {
        if next.fd != kept.fd {
            return false;
        }
        kept.readable |= next.readable;
        kept.writable |= next.writable;
        true
    });
}

/// Create the well-known control listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(CONTROL_BACKLOG)?;

    Ok(socket.into())
}
