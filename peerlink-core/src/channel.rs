//! Packet channel capability: the peer-to-peer datagram service the transport runs on.
//!
//! The channel only moves packets of up to [`MAX_PACKET_SIZE`] bytes between peers that
//! share a socket name. Connection requests and closures are reported as notifications
//! that the transport drains during `poll`.

use crate::identity::{PeerId, SocketToken};

/// Largest packet the channel will carry.
pub const MAX_PACKET_SIZE: usize = 1170;

/// Channel byte carried out-of-band with every packet; tells the receiver how to treat it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelTag {
    /// Zero-length handshake packet.
    Connect = 0,
    /// One complete message in a single packet.
    Default = 1,
    /// One piece of a split message.
    Chunks = 2,
}

impl From<ChannelTag> for u8 {
    fn from(tag: ChannelTag) -> u8 {
        tag as u8
    }
}

impl TryFrom<u8> for ChannelTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelTag::Connect),
            1 => Ok(ChannelTag::Default),
            2 => Ok(ChannelTag::Chunks),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    UnreliableUnordered,
    ReliableUnordered,
    ReliableOrdered,
}

/// Metadata of one received packet. Payload bytes were written into the caller's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub sender: PeerId,
    pub socket: SocketToken,
    pub channel: u8,
    pub len: usize,
}

/// Snapshot of the channel's packet queues for one local peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub incoming_count: u64,
    pub incoming_bytes: u64,
    pub outgoing_count: u64,
    pub outgoing_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ConnectionRequest,
    ConnectionClosed,
    IncomingQueueFull,
}

/// Subscription id returned by [`PacketChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unknown,
    ClosedByLocalUser,
    ClosedByPeer,
    TimedOut,
    ConnectionFailed,
}

/// Asynchronous notifications raised by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotification {
    ConnectionRequest {
        socket: SocketToken,
        local: PeerId,
        remote: PeerId,
    },
    ConnectionClosed {
        local: PeerId,
        remote: PeerId,
        reason: CloseReason,
    },
    IncomingQueueFull {
        local: PeerId,
        channel: u8,
        queue_size: u64,
        queue_capacity: u64,
        packet_size: u64,
    },
}

impl ChannelNotification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            ChannelNotification::ConnectionRequest { .. } => NotificationKind::ConnectionRequest,
            ChannelNotification::ConnectionClosed { .. } => NotificationKind::ConnectionClosed,
            ChannelNotification::IncomingQueueFull { .. } => NotificationKind::IncomingQueueFull,
        }
    }
}

/// Non-success status of a channel call. "Not found" on receive is `Ok(None)`, not an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("no connection to remote peer")]
    NoConnection,
    #[error("limit exceeded")]
    LimitExceeded,
    #[error("too many requests")]
    TooManyRequests,
    #[error("invalid local user")]
    InvalidUser,
    #[error("channel error: {0}")]
    Other(String),
}

/// The packet channel the transport is layered on.
pub trait PacketChannel {
    #[allow(clippy::too_many_arguments)]
    fn send_packet(
        &mut self,
        local: &PeerId,
        remote: &PeerId,
        socket: &SocketToken,
        channel: ChannelTag,
        data: &[u8],
        reliability: Reliability,
        allow_delayed: bool,
    ) -> Result<(), ChannelError>;

    /// Pop the next queued packet for `local` into `buf`. `Ok(None)` when nothing is queued.
    fn receive_packet(
        &mut self,
        local: &PeerId,
        buf: &mut [u8],
    ) -> Result<Option<ReceivedPacket>, ChannelError>;

    fn accept_connection(
        &mut self,
        local: &PeerId,
        remote: &PeerId,
        socket: &SocketToken,
    ) -> Result<(), ChannelError>;

    /// Close every connection `local` has on `socket`.
    fn close_connections(
        &mut self,
        local: &PeerId,
        socket: &SocketToken,
    ) -> Result<(), ChannelError>;

    fn queue_info(&self, local: &PeerId) -> QueueInfo;

    fn subscribe(&mut self, local: &PeerId, kind: NotificationKind) -> NotifyId;

    fn unsubscribe(&mut self, id: NotifyId);

    /// Next notification for `local` from any active subscription.
    fn next_notification(&mut self, local: &PeerId) -> Option<ChannelNotification>;
}
