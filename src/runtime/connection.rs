//! Connection records and the fixed-capacity registry that owns them.
//!
//! Each record holds one socket and the channel state that goes with it.
//! The registry hands out stable slot indices which double as mio tokens.
//! Dropping a record closes its socket.

use crate::runtime::ids::{ClientId, ConnectionId};
use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use thiserror::Error;

const READ_CHUNK: usize = 4096;

/// How a [`Peer::fill`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The socket would block.
    Drained,
    /// `inbox` reached the limit; the socket may hold more.
    Full,
    /// The peer closed its side.
    Closed,
}

/// A connected TCP peer with inbound and outbound byte queues.
#[derive(Debug)]
pub struct Peer {
    pub stream: TcpStream,
    /// Bytes read but not yet consumed by a parser.
    pub inbox: BytesMut,
    /// Bytes accepted for sending that the socket has not taken yet.
    outbox: BytesMut,
    /// Interest currently registered with the poller.
    interest: Interest,
}

impl Peer {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            inbox: BytesMut::with_capacity(READ_CHUNK),
            outbox: BytesMut::new(),
            interest: Interest::READABLE,
        }
    }

    /// Read available input into `inbox` until it holds `limit` bytes.
    pub fn fill(&mut self, limit: usize) -> io::Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let room = limit.saturating_sub(self.inbox.len()).min(READ_CHUNK);
            if room == 0 {
                return Ok(Fill::Full);
            }
            match self.stream.read(&mut chunk[..room]) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Drained),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue `data` and write as much as the socket accepts.
    pub fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.outbox.extend_from_slice(data);
        self.flush()
    }

    /// Write queued bytes until the queue is empty or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbox.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Interest to re-register with, if it differs from the current one.
    pub fn interest_change(&mut self) -> Option<Interest> {
        let wanted = if self.outbox.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if wanted == self.interest {
            return None;
        }
        self.interest = wanted;
        Some(wanted)
    }
}

/// Registration state of a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    /// Accepted, no NAME yet.
    Anonymous,
    Named { client_id: ClientId, name: String },
}

/// A stream data channel after its peer was accepted.
#[derive(Debug)]
pub struct StreamChannel {
    pub peer: Peer,
    pub owner: ClientId,
    /// When the frame at the front of `peer.inbox` started to wait for bytes.
    pub partial_since: Option<Instant>,
    /// Reused buffer for decoded data words.
    pub scratch: Vec<u32>,
}

/// What a record is; decides how readiness on its socket is handled.
#[derive(Debug)]
pub enum Channel {
    Control { peer: Peer, session: Session },
    /// Provisioned stream port waiting for its single peer.
    StreamListener { listener: TcpListener, owner: ClientId },
    StreamData(StreamChannel),
    DatagramData { socket: UdpSocket, owner: ClientId },
}

impl Channel {
    pub fn source(&mut self) -> &mut dyn Source {
        match self {
            Channel::Control { peer, .. } => &mut peer.stream,
            Channel::StreamListener { listener, .. } => listener,
            Channel::StreamData(data) => &mut data.peer.stream,
            Channel::DatagramData { socket, .. } => socket,
        }
    }

    pub fn descriptor(&self) -> RawFd {
        match self {
            Channel::Control { peer, .. } => peer.stream.as_raw_fd(),
            Channel::StreamListener { listener, .. } => listener.as_raw_fd(),
            Channel::StreamData(data) => data.peer.stream.as_raw_fd(),
            Channel::DatagramData { socket, .. } => socket.as_raw_fd(),
        }
    }

    /// Buffered peer, for channels that have one.
    pub fn peer_mut(&mut self) -> Option<&mut Peer> {
        match self {
            Channel::Control { peer, .. } => Some(peer),
            Channel::StreamData(data) => Some(&mut data.peer),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Channel::Control { .. } => "control",
            Channel::StreamListener { .. } => "stream-listener",
            Channel::StreamData(_) => "stream",
            Channel::DatagramData { .. } => "datagram",
        }
    }
}

/// One registry slot.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// Peer address for accepted sockets, local address for bound ones.
    pub remote_addr: SocketAddr,
    /// `None` only for a control connection that has not sent NAME.
    pub connection_id: Option<ConnectionId>,
    pub channel: Channel,
}

impl ConnectionRecord {
    /// A freshly accepted, anonymous control connection.
    pub fn control(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            connection_id: None,
            channel: Channel::Control {
                peer: Peer::new(stream),
                session: Session::Anonymous,
            },
        }
    }

    /// Session this record belongs to.
    pub fn client_id(&self) -> Option<ClientId> {
        match &self.channel {
            Channel::Control {
                session: Session::Named { client_id, .. },
                ..
            } => Some(*client_id),
            Channel::Control { .. } => None,
            Channel::StreamListener { owner, .. } | Channel::DatagramData { owner, .. } => {
                Some(*owner)
            }
            Channel::StreamData(data) => Some(data.owner),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection registry exhausted ({capacity} slots in use)")]
    Exhausted { capacity: usize },
}

/// Fixed-capacity pool of connection records.
///
/// A new record always takes the lowest free slot; slot numbers are visible
/// to clients. Callers only allocate, release and look up; slots are never
/// iterated from outside.
pub struct ConnectionRegistry {
    slots: Vec<Option<ConnectionRecord>>,
    in_use: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            in_use: 0,
        }
    }

    /// Place `record` in the lowest free slot.
    ///
    /// On failure the record is dropped, which closes its socket.
    pub fn allocate(&mut self, record: ConnectionRecord) -> Result<usize, RegistryError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::Exhausted {
                capacity: self.slots.len(),
            })?;
        self.slots[slot] = Some(record);
        self.in_use += 1;
        Ok(slot)
    }

    /// Free a slot and hand back its record for the caller to drop.
    pub fn release(&mut self, slot: usize) -> Option<ConnectionRecord> {
        let record = self.slots.get_mut(slot)?.take()?;
        self.in_use -= 1;
        Some(record)
    }

    pub fn get(&self, slot: usize) -> Option<&ConnectionRecord> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ConnectionRecord> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.get(slot).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.in_use >= self.slots.len()
    }

    pub fn count_in_use(&self) -> usize {
        self.in_use
    }

    pub fn count_free(&self) -> usize {
        self.slots.len() - self.in_use
    }

    /// Socket descriptor held by `slot`.
    pub fn descriptor(&self, slot: usize) -> Option<RawFd> {
        self.get(slot).map(|r| r.channel.descriptor())
    }

    fn records(&self) -> impl Iterator<Item = (usize, &ConnectionRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, r)| r.as_ref().map(|r| (slot, r)))
    }

    pub fn find_by_descriptor(&self, fd: RawFd) -> Option<usize> {
        self.records()
            .find(|(_, r)| r.channel.descriptor() == fd)
            .map(|(slot, _)| slot)
    }

    /// Look up a connection, but only among those owned by `client`.
    pub fn find_by_connection_id(&self, id: ConnectionId, client: ClientId) -> Option<usize> {
        self.records()
            .find(|(_, r)| r.connection_id == Some(id) && r.client_id() == Some(client))
            .map(|(slot, _)| slot)
    }

    /// Named control connections of a session.
    pub fn find_sessions(&self, client: ClientId) -> Vec<usize> {
        self.records()
            .filter(|(_, r)| {
                matches!(
                    &r.channel,
                    Channel::Control {
                        session: Session::Named { client_id, .. },
                        ..
                    } if *client_id == client
                )
            })
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Stream channels whose partial frame has waited at least `timeout`.
    pub fn find_stalled(&self, now: Instant, timeout: Duration) -> Vec<usize> {
        self.records()
            .filter(|(_, r)| match &r.channel {
                Channel::StreamData(data) => data
                    .partial_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= timeout),
                _ => false,
            })
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Start of the oldest outstanding partial frame.
    pub fn oldest_partial(&self) -> Option<Instant> {
        self.records()
            .filter_map(|(_, r)| match &r.channel {
                Channel::StreamData(data) => data.partial_since,
                _ => None,
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(owner: u32, id: u32) -> ConnectionRecord {
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        ConnectionRecord {
            remote_addr: socket.local_addr().unwrap(),
            connection_id: Some(ConnectionId(id)),
            channel: Channel::DatagramData {
                socket,
                owner: ClientId(owner),
            },
        }
    }

    fn control_pair() -> (std::net::TcpStream, ConnectionRecord) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, ConnectionRecord::control(TcpStream::from_std(server), addr))
    }

    #[test]
    fn test_registry_exhaustion() {
        let mut registry = ConnectionRegistry::new(30);

        let slots: Vec<usize> = (0..30)
            .map(|i| registry.allocate(datagram(0, i + 1)).unwrap())
            .collect();
        assert_eq!(registry.count_in_use(), 30);
        assert_eq!(registry.count_free(), 0);

        assert_eq!(
            registry.allocate(datagram(0, 99)).unwrap_err(),
            RegistryError::Exhausted { capacity: 30 }
        );

        registry.release(slots[7]).unwrap();
        assert_eq!(registry.count_free(), 1);
        assert!(registry.allocate(datagram(0, 100)).is_ok());
        assert!(registry.release(usize::MAX).is_none());
    }

    #[test]
    fn test_lowest_free_slot_is_reused_first() {
        let mut registry = ConnectionRegistry::new(4);
        for i in 0..3 {
            assert_eq!(registry.allocate(datagram(0, i + 1)).unwrap(), i as usize);
        }

        registry.release(0).unwrap();
        registry.release(1).unwrap();
        assert!(registry.release(1).is_none());
        assert_eq!(registry.count_in_use(), 1);

        assert_eq!(registry.allocate(datagram(0, 4)).unwrap(), 0);
        assert_eq!(registry.allocate(datagram(0, 5)).unwrap(), 1);
        assert_eq!(registry.allocate(datagram(0, 6)).unwrap(), 3);
        assert!(registry.is_full());
    }

    #[test]
    fn test_find_by_connection_id_is_scoped() {
        let mut registry = ConnectionRegistry::new(4);
        let a = registry.allocate(datagram(0, 5)).unwrap();
        let b = registry.allocate(datagram(1, 6)).unwrap();

        assert_eq!(
            registry.find_by_connection_id(ConnectionId(5), ClientId(0)),
            Some(a)
        );
        assert_eq!(
            registry.find_by_connection_id(ConnectionId(6), ClientId(1)),
            Some(b)
        );
        assert_eq!(
            registry.find_by_connection_id(ConnectionId(6), ClientId(0)),
            None
        );
        assert_eq!(
            registry.find_by_connection_id(ConnectionId(7), ClientId(1)),
            None
        );
    }

    #[test]
    fn test_find_by_descriptor() {
        let mut registry = ConnectionRegistry::new(4);
        let a = registry.allocate(datagram(0, 1)).unwrap();
        let b = registry.allocate(datagram(0, 2)).unwrap();

        let fd = registry.descriptor(b).unwrap();
        assert_eq!(registry.find_by_descriptor(fd), Some(b));
        assert_ne!(registry.descriptor(a), Some(fd));

        registry.release(b);
        assert_eq!(registry.descriptor(b), None);
    }

    #[test]
    fn test_sessions_and_client_ids() {
        let mut registry = ConnectionRegistry::new(4);
        let (_client, record) = control_pair();
        assert_eq!(record.client_id(), None);
        let slot = registry.allocate(record).unwrap();

        // anonymous sessions never receive broadcasts
        assert!(registry.find_sessions(ClientId(0)).is_empty());

        if let Channel::Control { session, .. } = &mut registry.get_mut(slot).unwrap().channel {
            *session = Session::Named {
                client_id: ClientId(0),
                name: "alice".into(),
            };
        }
        registry.allocate(datagram(0, 2)).unwrap();

        assert_eq!(registry.find_sessions(ClientId(0)), vec![slot]);
        assert!(registry.find_sessions(ClientId(1)).is_empty());
        assert_eq!(registry.get(slot).unwrap().client_id(), Some(ClientId(0)));
    }

    #[test]
    fn test_peer_send_and_fill() {
        let (mut client, mut record) = control_pair();
        let peer = record.channel.peer_mut().unwrap();

        peer.send(b"#INF@INFO:hi;!").unwrap();
        assert!(peer.interest_change().is_none());
        let mut buf = [0u8; 14];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"#INF@INFO:hi;!");

        client.write_all(b"#A@!").unwrap();
        client.flush().unwrap();
        let mut fill = Fill::Drained;
        for _ in 0..100 {
            fill = peer.fill(512).unwrap();
            if !peer.inbox.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fill, Fill::Drained);
        assert_eq!(&peer.inbox[..], b"#A@!");

        drop(client);
        let mut closed = false;
        for _ in 0..100 {
            if peer.fill(512).unwrap() == Fill::Closed {
                closed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(closed);
    }

    #[test]
    fn test_fill_stops_at_limit() {
        let (client, mut record) = control_pair();
        let writer = std::thread::spawn(move || {
            let mut client = client;
            // fails once the reader goes away
            let _ = client.write_all(&vec![b'a'; 2 * 1024 * 1024]);
        });

        let peer = record.channel.peer_mut().unwrap();
        let mut full = 0;
        for _ in 0..500 {
            match peer.fill(512).unwrap() {
                Fill::Full => {
                    assert_eq!(peer.inbox.len(), 512);
                    peer.inbox.clear();
                    full += 1;
                    if full == 8 {
                        break;
                    }
                }
                Fill::Drained => std::thread::sleep(Duration::from_millis(5)),
                Fill::Closed => panic!("peer closed early"),
            }
            assert!(peer.inbox.len() <= 512);
        }
        assert_eq!(full, 8);

        drop(record);
        writer.join().unwrap();
    }
}
