//! Session and connection identifier allocation.
//!
//! Identifiers are handed out in strictly increasing order and never reused
//! while the process runs. Client ids start at 0, connection ids at 1.
//! Once `u32::MAX` has been handed out the allocator stays exhausted.

use std::fmt;

/// Identifies a session: a control connection and every channel it opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// Identifies one connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic allocator for client and connection ids.
#[derive(Debug)]
pub struct IdAllocator {
    next_client: Option<u32>,
    next_connection: Option<u32>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_client: Some(0),
            next_connection: Some(1),
        }
    }

    /// Allocate the id for a newly named session.
    pub fn next_client_id(&mut self) -> Option<ClientId> {
        let id = self.next_client?;
        self.next_client = id.checked_add(1);
        Some(ClientId(id))
    }

    /// Allocate the id for a newly named or provisioned connection.
    pub fn next_connection_id(&mut self) -> Option<ConnectionId> {
        let id = self.next_connection?;
        self.next_connection = id.checked_add(1);
        Some(ConnectionId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_allocator() {
        let mut ids = IdAllocator::new();

        assert_eq!(ids.next_client_id(), Some(ClientId(0)));
        assert_eq!(ids.next_connection_id(), Some(ConnectionId(1)));
        assert_eq!(ids.next_connection_id(), Some(ConnectionId(2)));
        assert_eq!(ids.next_client_id(), Some(ClientId(1)));
        assert_eq!(ids.next_connection_id(), Some(ConnectionId(3)));
        assert_eq!(ConnectionId(3).to_string(), "3");
    }

    #[test]
    fn test_id_space_exhaustion() {
        let mut ids = IdAllocator {
            next_client: Some(u32::MAX),
            next_connection: Some(u32::MAX - 1),
        };

        assert_eq!(ids.next_client_id(), Some(ClientId(u32::MAX)));
        assert_eq!(ids.next_client_id(), None);
        assert_eq!(ids.next_client_id(), None);

        assert_eq!(ids.next_connection_id(), Some(ConnectionId(u32::MAX - 1)));
        assert_eq!(ids.next_connection_id(), Some(ConnectionId(u32::MAX)));
        assert_eq!(ids.next_connection_id(), None);
    }
}
