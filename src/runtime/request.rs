//! Control command execution.
//!
//! Runs parsed control commands against the server state: session
//! registration, channel provisioning, disconnects, count queries and
//! session notifications.

use crate::protocols::control::{parse, ChannelKind, Command, OpenFailure, ParseResult, Response};
use crate::runtime::connection::{Channel, ConnectionRecord, Session};
use crate::runtime::event_loop::Server;
use crate::runtime::ids::{ClientId, ConnectionId};
use crate::runtime::provision::{bind_channel, BoundSocket, ProvisionError};
use bytes::Buf;
use tracing::{debug, error, info, warn};

impl Server {
    /// Execute every complete command buffered on control connection `slot`.
    pub(crate) fn process_commands(&mut self, slot: usize) {
        loop {
            let peer = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
                Some(Channel::Control { peer, .. }) => peer,
                _ => return,
            };

            let command = match parse(&peer.inbox) {
                ParseResult::Complete(command, consumed) => {
                    peer.inbox.advance(consumed);
                    command
                }
                ParseResult::Unrecognized(consumed) => {
                    debug!(
                        slot,
                        text = %String::from_utf8_lossy(&peer.inbox[..consumed]),
                        "Ignoring unknown command"
                    );
                    peer.inbox.advance(consumed);
                    continue;
                }
                ParseResult::Incomplete => return,
                ParseResult::Overflow => {
                    warn!(slot, len = peer.inbox.len(), "Discarding oversized command");
                    peer.inbox.clear();
                    return;
                }
            };

            debug!(slot, ?command, "Received command");
            if !self.handle_command(slot, command) {
                return;
            }
        }
    }

    /// Returns `false` when the requester's own connection was closed.
    fn handle_command(&mut self, slot: usize, command: Command) -> bool {
        match command {
            Command::Name(name) => self.register_session(slot, name),
            Command::Disconnect(id) => return self.disconnect(slot, ConnectionId(id)),
            Command::Open(kind) => {
                let response = self.open_channel(slot, kind);
                self.respond(slot, &response);
            }
            Command::ActiveCount => {
                let response = Response::Active(self.registry.count_in_use());
                self.respond(slot, &response);
            }
            Command::FreeCount => {
                let response = Response::Free(self.registry.count_free());
                self.respond(slot, &response);
            }
        }
        self.registry.contains(slot)
    }

    fn register_session(&mut self, slot: usize, name: String) {
        let record = match self.registry.get_mut(slot) {
            Some(record) => record,
            None => return,
        };
        let session = match &mut record.channel {
            Channel::Control { session, .. } => session,
            _ => return,
        };
        if let Session::Named { client_id, .. } = session {
            debug!(slot, client_id = %client_id, "Ignoring repeated NAME");
            return;
        }

        let (client_id, connection_id) =
            match (self.ids.next_client_id(), self.ids.next_connection_id()) {
                (Some(client_id), Some(connection_id)) => (client_id, connection_id),
                _ => {
                    error!(slot, "Identifier space exhausted, NAME ignored");
                    return;
                }
            };
        info!(slot, client_id = %client_id, connection_id = %connection_id, name = %name, "Client registered");
        *session = Session::Named { client_id, name };
        record.connection_id = Some(connection_id);

        self.respond(slot, &Response::Named { slot });
    }

    fn disconnect(&mut self, slot: usize, target: ConnectionId) -> bool {
        let client = self.registry.get(slot).and_then(ConnectionRecord::client_id);
        let found = client.and_then(|c| self.registry.find_by_connection_id(target, c));

        match found {
            Some(target_slot) => {
                self.respond(
                    slot,
                    &Response::Closed {
                        connection: target.0,
                    },
                );
                info!(slot, connection_id = %target, "Closing connection on request");
                self.close(target_slot);
            }
            None => self.respond(slot, &Response::NotFound),
        }
        self.registry.contains(slot)
    }

    /// Provision a data channel for the session owning `slot`.
    fn open_channel(&mut self, slot: usize, kind: ChannelKind) -> Response {
        let failed = |failure| Response::OpenFailed { kind, failure };

        let owner = match self.registry.get(slot).and_then(ConnectionRecord::client_id) {
            Some(owner) => owner,
            None => return failed(OpenFailure::NotRegistered),
        };

        let range = match kind {
            ChannelKind::Stream => self.settings.stream_ports,
            ChannelKind::Datagram => self.settings.datagram_ports,
        };

        let bound = match bind_channel(kind, self.settings.bind_host, range) {
            Ok(bound) => bound,
            Err(e @ ProvisionError::NoFreePort { .. }) => {
                warn!(slot, kind = ?kind, error = %e, "Channel not opened");
                return failed(OpenFailure::NoFreePort);
            }
            Err(e @ ProvisionError::Listen { .. }) => {
                error!(slot, kind = ?kind, error = %e, "Channel not opened");
                return failed(OpenFailure::ListenFailed);
            }
        };

        // dropping `bound` closes the socket
        if self.registry.is_full() {
            warn!(slot, kind = ?kind, port = bound.addr.port(), "Connection registry full");
            return failed(OpenFailure::NoFreeSlot);
        }

        let connection_id = match self.ids.next_connection_id() {
            Some(id) => id,
            None => {
                error!(slot, kind = ?kind, "Identifier space exhausted");
                return failed(OpenFailure::NoFreeSlot);
            }
        };
        let record = ConnectionRecord {
            remote_addr: bound.addr,
            connection_id: Some(connection_id),
            channel: match bound.socket {
                BoundSocket::Listener(listener) => Channel::StreamListener { listener, owner },
                BoundSocket::Datagram(socket) => Channel::DatagramData { socket, owner },
            },
        };

        let new_slot = match self.registry.allocate(record) {
            Ok(new_slot) => new_slot,
            Err(e) => {
                warn!(slot, error = %e, "Connection registry full");
                return failed(OpenFailure::NoFreeSlot);
            }
        };
        if let Err(e) = self.register(new_slot) {
            error!(slot = new_slot, error = %e, "Failed to watch data channel");
            self.close(new_slot);
            return failed(OpenFailure::ListenFailed);
        }

        info!(
            slot = new_slot,
            client_id = %owner,
            connection_id = %connection_id,
            kind = ?kind,
            port = bound.addr.port(),
            "Data channel waiting"
        );

        Response::Opened {
            kind,
            port: bound.addr.port(),
            connection: connection_id.0,
        }
    }

    /// Send a response on control connection `slot`.
    fn respond(&mut self, slot: usize, response: &Response) {
        let result = match self.registry.get_mut(slot).map(|r| &mut r.channel) {
            Some(Channel::Control { peer, .. }) => peer.send(&response.encode()),
            _ => return,
        };
        match result {
            Ok(()) => self.sync_interest(slot),
            Err(e) => {
                debug!(slot, error = %e, "Failed to send response");
                self.close(slot);
            }
        }
    }

    /// Notify every named control connection of session `client`.
    pub(crate) fn broadcast(&mut self, client: ClientId, text: &str) {
        let message = Response::Info(text.to_string());
        for slot in self.registry.find_sessions(client) {
            debug!(slot, client_id = %client, info = text, "Notifying session");
            self.respond(slot, &message);
        }
    }
}
