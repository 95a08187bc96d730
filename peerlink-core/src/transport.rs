//! Transport engine: host-driven, single-threaded. The host calls [`Transport::poll`] once
//! per tick and gets back at most one event; sends go straight to the channel.

use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::channel::{
    ChannelNotification, ChannelTag, CloseReason, NotificationKind, NotifyId, PacketChannel,
    ReceivedPacket, Reliability, MAX_PACKET_SIZE,
};
use crate::identity::{ConnectionHandle, IdentityError, PeerId, SocketToken, SERVER_HANDLE};
use crate::pool::{ReceivePool, SendPool, SplitError};
use crate::reassembly::ReassemblyError;
use crate::registry::{Peer, PeerRegistry};
use crate::settings::{SettingsError, TransportSettings};

const SUBSCRIBED_NOTIFICATIONS: [NotificationKind; 3] = [
    NotificationKind::ConnectionRequest,
    NotificationKind::ConnectionClosed,
    NotificationKind::IncomingQueueFull,
];

/// Lifecycle of one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Initialized,
    Server,
    Client,
    ShutDown,
}

/// Delivery hint from the host. Every packet goes out reliable-ordered regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    Unreliable,
    UnreliableSequenced,
    #[default]
    Reliable,
    ReliableSequenced,
    ReliableFragmentedSequenced,
}

/// Event surfaced by one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent<'a> {
    Nothing,
    Connect {
        handle: ConnectionHandle,
    },
    Disconnect {
        handle: ConnectionHandle,
    },
    /// A complete message. `payload` lives in a pooled buffer and is only valid until the
    /// next poll.
    Data {
        handle: ConnectionHandle,
        payload: &'a [u8],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult<'a> {
    pub event: NetworkEvent<'a>,
    /// Time since [`Transport::initialize`].
    pub receive_time: Duration,
}

/// Poll outcome before the payload borrow is attached.
enum Outcome {
    Nothing,
    Connect(ConnectionHandle),
    Disconnect(ConnectionHandle),
    Data(ConnectionHandle),
}

/// Message transport over a [`PacketChannel`] with 1170-byte packets.
pub struct Transport<C: PacketChannel> {
    channel: C,
    settings: TransportSettings,
    state: TransportState,
    registry: PeerRegistry,
    send_pool: SendPool,
    receive_pool: ReceivePool,
    subscriptions: Vec<NotifyId>,
    /// Scratch buffer the channel writes each received packet into.
    payload: Box<[u8]>,
    /// Payload of the last Data event, returned to the pool on the next poll.
    delivered: Option<Vec<u8>>,
    started: Instant,
}

impl<C: PacketChannel> Transport<C> {
    pub fn new(channel: C, settings: TransportSettings) -> Result<Self, TransportError> {
        settings.validate()?;
        Ok(Self {
            channel,
            settings,
            state: TransportState::Uninitialized,
            registry: PeerRegistry::new(),
            send_pool: SendPool::new(),
            receive_pool: ReceivePool::new(),
            subscriptions: Vec::new(),
            payload: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
            delivered: None,
            started: Instant::now(),
        })
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn receive_pool(&self) -> &ReceivePool {
        &self.receive_pool
    }

    /// Handle under which clients see the server.
    pub fn server_handle(&self) -> ConnectionHandle {
        SERVER_HANDLE
    }

    /// Round-trip time is not measured at this layer.
    pub fn current_rtt(&self, _handle: ConnectionHandle) -> u64 {
        0
    }

    /// Reset peers, subscribe to channel notifications and discard stale incoming packets.
    pub fn initialize(&mut self) -> Result<(), TransportError> {
        self.expect_state(
            "initialize",
            &[TransportState::Uninitialized, TransportState::ShutDown],
        )?;
        debug!(
            server = %self.settings.server_peer,
            local = %self.settings.local_peer,
            session = %self.settings.session_id,
            "initialize"
        );

        self.release_delivered();
        self.registry.clear();
        self.registry.set_server_peer(self.settings.server_peer);

        let local = self.settings.local_peer;
        for kind in SUBSCRIBED_NOTIFICATIONS {
            let id = self.channel.subscribe(&local, kind);
            self.subscriptions.push(id);
        }

        self.started = Instant::now();
        self.drain_stale_packets();
        self.state = TransportState::Initialized;
        Ok(())
    }

    pub fn start_server(&mut self) -> Result<(), TransportError> {
        self.expect_state("start_server", &[TransportState::Initialized])?;
        debug!("start server");
        self.state = TransportState::Server;
        Ok(())
    }

    /// Point the server peer at our session socket and send it a Connect packet.
    pub fn start_client(&mut self) -> Result<(), TransportError> {
        self.expect_state("start_client", &[TransportState::Initialized])?;
        let socket =
            SocketToken::for_session(&self.settings.local_peer, &self.settings.session_id)?;
        debug!(socket = %socket, "start client");

        if let Some(server) = self.registry.server_peer_mut() {
            server.set_socket(socket);
        }
        if let Some(server) = self.registry.server_peer() {
            Self::transmit(
                &mut self.channel,
                &self.settings.local_peer,
                server,
                ChannelTag::Connect,
                &[],
            );
        }
        self.state = TransportState::Client;
        Ok(())
    }

    /// Send one message. Messages over [`MAX_PACKET_SIZE`] go out as chunks.
    /// Sends to an unknown handle are dropped; the peer may have just been removed.
    pub fn send(
        &mut self,
        handle: ConnectionHandle,
        data: &[u8],
        _delivery: Delivery,
    ) -> Result<(), TransportError> {
        self.expect_state("send", &[TransportState::Server, TransportState::Client])?;
        let local = &self.settings.local_peer;
        let Some(peer) = self.registry.get(handle) else {
            warn!(handle, size = data.len(), "send to unknown handle, dropping");
            return Ok(());
        };

        if data.len() > MAX_PACKET_SIZE {
            let chunks = self.send_pool.split(data)?;
            debug!(peer = %peer, size = data.len(), chunks = chunks.len(), "send chunks");
            for chunk in chunks.iter() {
                Self::transmit(&mut self.channel, local, peer, ChannelTag::Chunks, chunk);
            }
        } else if let Some(buf) = self.send_pool.acquire(data.len()) {
            buf.copy_from_slice(data);
            Self::transmit(&mut self.channel, local, peer, ChannelTag::Default, buf);
        }
        Ok(())
    }

    /// Consume pending notifications, then receive at most one packet.
    pub fn poll(&mut self) -> Result<PollResult<'_>, TransportError> {
        self.expect_state(
            "poll",
            &[
                TransportState::Initialized,
                TransportState::Server,
                TransportState::Client,
            ],
        )?;
        self.release_delivered();
        self.pump_notifications();

        let local = self.settings.local_peer;
        let outcome = match self.channel.receive_packet(&local, &mut self.payload) {
            Ok(None) => self.on_queue_empty(),
            Ok(Some(packet)) => self.on_packet(packet)?,
            Err(e) => {
                error!(error = %e, "receive failed");
                Outcome::Nothing
            }
        };

        let event = match outcome {
            Outcome::Nothing => NetworkEvent::Nothing,
            Outcome::Connect(handle) => NetworkEvent::Connect { handle },
            Outcome::Disconnect(handle) => NetworkEvent::Disconnect { handle },
            Outcome::Data(handle) => NetworkEvent::Data {
                handle,
                payload: self.delivered.as_deref().unwrap_or_default(),
            },
        };
        Ok(PollResult {
            event,
            receive_time: self.started.elapsed(),
        })
    }

    /// Process one channel notification. `poll` calls this for every queued notification;
    /// hosts whose channel uses callbacks can call it directly.
    pub fn handle_notification(&mut self, notification: ChannelNotification) {
        match notification {
            ChannelNotification::ConnectionRequest {
                socket,
                local,
                remote,
            } => self.on_connection_request(socket, local, remote),
            ChannelNotification::ConnectionClosed { remote, reason, .. } => {
                self.on_connection_closed(remote, reason)
            }
            ChannelNotification::IncomingQueueFull {
                channel,
                queue_size,
                queue_capacity,
                packet_size,
                ..
            } => warn!(
                channel,
                queue_size, queue_capacity, packet_size, "incoming packet queue full"
            ),
        }
    }

    /// Close the connection to one client. Server only.
    pub fn disconnect_remote(&mut self, handle: ConnectionHandle) -> Result<(), TransportError> {
        if self.state != TransportState::Server {
            return Err(TransportError::NotServer);
        }
        debug!(handle, "disconnect remote client");
        match self.registry.get(handle) {
            Some(peer) => Self::close(&mut self.channel, &self.settings.local_peer, peer),
            None => error!(handle, "no connected client with this handle"),
        }
        Ok(())
    }

    pub fn disconnect_local(&mut self) {
        debug!("disconnect local client");
        self.close_all();
    }

    /// Close every connection and drop all peers. `initialize` may be called again.
    pub fn shutdown(&mut self) {
        debug!("shutdown");
        self.close_all();
        for id in self.subscriptions.drain(..) {
            self.channel.unsubscribe(id);
        }
        self.release_delivered();
        self.registry.clear();
        self.state = TransportState::ShutDown;
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[TransportState],
    ) -> Result<(), TransportError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TransportError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn release_delivered(&mut self) {
        if let Some(buf) = self.delivered.take() {
            self.receive_pool.release(buf);
        }
    }

    fn drain_stale_packets(&mut self) {
        let local = self.settings.local_peer;
        let mut info = self.channel.queue_info(&local);
        debug!(
            incoming_count = info.incoming_count,
            incoming_bytes = info.incoming_bytes,
            outgoing_count = info.outgoing_count,
            outgoing_bytes = info.outgoing_bytes,
            "packet queues"
        );
        while info.incoming_count > 0 {
            debug!(remaining = info.incoming_count, "discarding stale packet");
            match self.channel.receive_packet(&local, &mut self.payload) {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "receive failed while discarding stale packets");
                    break;
                }
            }
            info = self.channel.queue_info(&local);
        }
    }

    fn pump_notifications(&mut self) {
        let local = self.settings.local_peer;
        while let Some(notification) = self.channel.next_notification(&local) {
            self.handle_notification(notification);
        }
    }

    fn on_connection_request(&mut self, socket: SocketToken, local: PeerId, remote: PeerId) {
        if self.state != TransportState::Server {
            error!(
                socket = %socket, local = %local, remote = %remote,
                "connection request received by a non-server transport"
            );
            return;
        }
        if !socket.belongs_to(&self.settings.session_id) {
            debug!(
                socket = %socket,
                remote = %remote,
                "wrong session, ignoring connection request"
            );
            return;
        }

        debug!(remote = %remote, socket = %socket, "accepting connection");
        if let Err(e) = self.channel.accept_connection(&local, &remote, &socket) {
            warn!(error = %e, operation = "accept_connection", "channel call failed");
        }
        let peer = self.registry.add_client_peer(remote, socket);
        Self::transmit(
            &mut self.channel,
            &self.settings.local_peer,
            peer,
            ChannelTag::Connect,
            &[],
        );
    }

    fn on_connection_closed(&mut self, remote: PeerId, reason: CloseReason) {
        match self.registry.get_by_id(&remote).map(Peer::handle) {
            Some(handle) => {
                if self.registry.push_pending_disconnect(handle) {
                    debug!(handle, ?reason, "disconnect detected");
                }
            }
            None => debug!(
                remote = %remote,
                ?reason,
                "connection closed for unknown peer, ignoring"
            ),
        }
    }

    /// "Not found" from the channel: surface one pending disconnect before reporting idle.
    fn on_queue_empty(&mut self) -> Outcome {
        let Some(handle) = self.registry.pop_pending_disconnect() else {
            return Outcome::Nothing;
        };
        if self.state == TransportState::Server {
            if let Some(mut peer) = self.registry.remove_client_peer(handle) {
                for chunk in peer.chunks.reset() {
                    self.receive_pool.release(chunk);
                }
            }
        } else if let Some(server) = self.registry.get_mut(handle) {
            for chunk in server.chunks.reset() {
                self.receive_pool.release(chunk);
            }
        }
        debug!(handle, "peer disconnected");
        Outcome::Disconnect(handle)
    }

    fn on_packet(&mut self, packet: ReceivedPacket) -> Result<Outcome, TransportError> {
        let Some(peer) = self.registry.get_by_id_mut(&packet.sender) else {
            // Left over from a previous session or from a peer that was already removed.
            warn!(sender = %packet.sender, size = packet.len, "packet from unknown peer, ignoring");
            return Ok(Outcome::Nothing);
        };
        let handle = peer.handle();
        let tag = ChannelTag::try_from(packet.channel).map_err(TransportError::UnsupportedChannel)?;
        let bytes = &self.payload[..packet.len.min(MAX_PACKET_SIZE)];

        match tag {
            ChannelTag::Connect => {
                debug!(handle, "connect");
                Ok(Outcome::Connect(handle))
            }
            ChannelTag::Default => {
                debug!(handle, size = packet.len, "data");
                self.delivered = Some(self.receive_pool.acquire_filled(bytes));
                Ok(Outcome::Data(handle))
            }
            ChannelTag::Chunks => {
                let chunk = self.receive_pool.acquire_filled(bytes);
                if let Err(ReassemblyError::InvalidHeader(chunk)) = peer.chunks.push(chunk) {
                    warn!(
                        handle,
                        size = packet.len,
                        "chunk without a valid count header, dropping"
                    );
                    self.receive_pool.release(chunk);
                    return Ok(Outcome::Nothing);
                }
                debug!(
                    handle,
                    size = packet.len,
                    received = peer.chunks.received(),
                    declared = peer.chunks.declared(),
                    "chunk"
                );
                if !peer.chunks.is_full() {
                    return Ok(Outcome::Nothing);
                }

                let mut message = self.receive_pool.acquire(peer.chunks.message_len());
                peer.chunks.drain_into(&mut message);
                for chunk in peer.chunks.reset() {
                    self.receive_pool.release(chunk);
                }
                debug!(handle, size = message.len(), "message reassembled");
                self.delivered = Some(message);
                Ok(Outcome::Data(handle))
            }
        }
    }

    fn close_all(&mut self) {
        debug!("close all connections");
        let local = &self.settings.local_peer;
        match self.state {
            TransportState::Server => {
                for peer in self.registry.clients() {
                    Self::close(&mut self.channel, local, peer);
                }
            }
            TransportState::Client => {
                if let Some(server) = self.registry.server_peer() {
                    Self::close(&mut self.channel, local, server);
                }
            }
            _ => {}
        }
    }

    fn transmit(channel: &mut C, local: &PeerId, peer: &Peer, tag: ChannelTag, data: &[u8]) {
        let Some(socket) = peer.socket() else {
            warn!(peer = %peer, "peer has no socket, packet not sent");
            return;
        };
        debug!(peer = %peer, size = data.len(), channel = ?tag, "send packet");
        let sent = channel.send_packet(
            local,
            &peer.id(),
            socket,
            tag,
            data,
            Reliability::ReliableOrdered,
            true,
        );
        if let Err(e) = sent {
            warn!(error = %e, operation = "send_packet", "channel call failed");
        }
    }

    fn close(channel: &mut C, local: &PeerId, peer: &Peer) {
        let Some(socket) = peer.socket() else {
            debug!(peer = %peer, "peer has no socket, nothing to close");
            return;
        };
        debug!(peer = %peer, "close connection");
        if let Err(e) = channel.close_connections(local, socket) {
            warn!(error = %e, operation = "close_connections", "channel call failed");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TransportState,
    },
    #[error("only a server can disconnect a remote client")]
    NotServer,
    #[error("unsupported channel {0}")]
    UnsupportedChannel(u8),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}
