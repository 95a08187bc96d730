//! In-memory packet channel for tests and local simulation.
//!
//! All endpoints share one hub through `Rc<RefCell<..>>`; clone the channel to hand it to
//! another transport. Single-threaded only, like the transport itself.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::channel::{
    ChannelError, ChannelNotification, ChannelTag, CloseReason, NotificationKind, NotifyId,
    PacketChannel, QueueInfo, ReceivedPacket, Reliability, MAX_PACKET_SIZE,
};
use crate::identity::{PeerId, SocketToken};

#[derive(Debug, Clone)]
struct Packet {
    sender: PeerId,
    socket: SocketToken,
    channel: u8,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inbox {
    packets: VecDeque<Packet>,
    notifications: VecDeque<ChannelNotification>,
}

/// Connection between two peers on one socket name. Keyed with the smaller id first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LinkKey {
    low: PeerId,
    high: PeerId,
    socket: SocketToken,
}

impl LinkKey {
    fn new(a: PeerId, b: PeerId, socket: &SocketToken) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low,
            high,
            socket: socket.clone(),
        }
    }

    fn other(&self, id: &PeerId) -> PeerId {
        if self.low == *id {
            self.high
        } else {
            self.low
        }
    }

    fn involves(&self, id: &PeerId) -> bool {
        self.low == *id || self.high == *id
    }
}

#[derive(Debug)]
struct Link {
    requested_by: PeerId,
    open: bool,
    /// Packets waiting for the link to open, with their destination.
    queued: VecDeque<(PeerId, Packet)>,
}

#[derive(Debug, Default)]
struct Hub {
    inboxes: HashMap<PeerId, Inbox>,
    links: HashMap<LinkKey, Link>,
    subscriptions: HashMap<NotifyId, (PeerId, NotificationKind)>,
    next_notify: u64,
}

impl Hub {
    fn raise(&mut self, target: PeerId, notification: ChannelNotification) {
        let kind = notification.kind();
        let subscribed = self
            .subscriptions
            .values()
            .any(|(peer, k)| *peer == target && *k == kind);
        if subscribed {
            self.inboxes
                .entry(target)
                .or_default()
                .notifications
                .push_back(notification);
        }
    }

    fn deliver(&mut self, to: PeerId, packet: Packet) {
        self.inboxes.entry(to).or_default().packets.push_back(packet);
    }

    fn open(&mut self, key: &LinkKey) {
        let queued = match self.links.get_mut(key) {
            Some(link) => {
                link.open = true;
                std::mem::take(&mut link.queued)
            }
            None => return,
        };
        for (to, packet) in queued {
            self.deliver(to, packet);
        }
    }
}

/// Shared in-memory channel. Every clone talks to the same hub.
#[derive(Debug, Clone, Default)]
pub struct LoopbackChannel {
    hub: Rc<RefCell<Hub>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw packet for `to` as if `sender` had sent it on an open connection.
    pub fn inject_packet(
        &self,
        to: PeerId,
        sender: PeerId,
        socket: &SocketToken,
        channel: u8,
        data: &[u8],
    ) {
        self.hub.borrow_mut().deliver(
            to,
            Packet {
                sender,
                socket: socket.clone(),
                channel,
                data: data.to_vec(),
            },
        );
    }

    /// Raise a notification for `target` (dropped unless it subscribed to that kind).
    pub fn raise(&self, target: PeerId, notification: ChannelNotification) {
        self.hub.borrow_mut().raise(target, notification);
    }

    pub fn is_connected(&self, a: PeerId, b: PeerId, socket: &SocketToken) -> bool {
        self.hub
            .borrow()
            .links
            .get(&LinkKey::new(a, b, socket))
            .is_some_and(|link| link.open)
    }

    pub fn subscription_count(&self, local: &PeerId) -> usize {
        self.hub
            .borrow()
            .subscriptions
            .values()
            .filter(|(peer, _)| peer == local)
            .count()
    }
}

impl PacketChannel for LoopbackChannel {
    fn send_packet(
        &mut self,
        local: &PeerId,
        remote: &PeerId,
        socket: &SocketToken,
        channel: ChannelTag,
        data: &[u8],
        _reliability: Reliability,
        allow_delayed: bool,
    ) -> Result<(), ChannelError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(ChannelError::LimitExceeded);
        }
        if local == remote {
            return Err(ChannelError::InvalidParameters);
        }
        let packet = Packet {
            sender: *local,
            socket: socket.clone(),
            channel: channel.into(),
            data: data.to_vec(),
        };
        let key = LinkKey::new(*local, *remote, socket);

        let mut hub = self.hub.borrow_mut();
        let existing = hub
            .links
            .get(&key)
            .map(|link| (link.open, link.requested_by));
        let Some((open, requested_by)) = existing else {
            if !allow_delayed {
                return Err(ChannelError::NoConnection);
            }
            hub.links.insert(
                key,
                Link {
                    requested_by: *local,
                    open: false,
                    queued: VecDeque::from([(*remote, packet)]),
                },
            );
            hub.raise(
                *remote,
                ChannelNotification::ConnectionRequest {
                    socket: socket.clone(),
                    local: *remote,
                    remote: *local,
                },
            );
            return Ok(());
        };

        if open {
            hub.deliver(*remote, packet);
        } else if requested_by == *local {
            if !allow_delayed {
                return Err(ChannelError::NoConnection);
            }
            if let Some(link) = hub.links.get_mut(&key) {
                link.queued.push_back((*remote, packet));
            }
        } else {
            // Replying to a pending request accepts it.
            hub.open(&key);
            hub.deliver(*remote, packet);
        }
        Ok(())
    }

    fn receive_packet(
        &mut self,
        local: &PeerId,
        buf: &mut [u8],
    ) -> Result<Option<ReceivedPacket>, ChannelError> {
        let mut hub = self.hub.borrow_mut();
        let Some(packet) = hub
            .inboxes
            .get_mut(local)
            .and_then(|inbox| inbox.packets.pop_front())
        else {
            return Ok(None);
        };
        if packet.data.len() > buf.len() {
            return Err(ChannelError::InvalidParameters);
        }
        buf[..packet.data.len()].copy_from_slice(&packet.data);
        Ok(Some(ReceivedPacket {
            sender: packet.sender,
            socket: packet.socket,
            channel: packet.channel,
            len: packet.data.len(),
        }))
    }

    fn accept_connection(
        &mut self,
        local: &PeerId,
        remote: &PeerId,
        socket: &SocketToken,
    ) -> Result<(), ChannelError> {
        if local == remote {
            return Err(ChannelError::InvalidParameters);
        }
        let key = LinkKey::new(*local, *remote, socket);
        let mut hub = self.hub.borrow_mut();
        if !hub.links.contains_key(&key) {
            hub.links.insert(
                key.clone(),
                Link {
                    requested_by: *remote,
                    open: false,
                    queued: VecDeque::new(),
                },
            );
        }
        hub.open(&key);
        Ok(())
    }

    fn close_connections(
        &mut self,
        local: &PeerId,
        socket: &SocketToken,
    ) -> Result<(), ChannelError> {
        let mut hub = self.hub.borrow_mut();
        let closing: Vec<LinkKey> = hub
            .links
            .keys()
            .filter(|key| key.involves(local) && key.socket == *socket)
            .cloned()
            .collect();
        for key in closing {
            hub.links.remove(&key);
            let other = key.other(local);
            hub.raise(
                other,
                ChannelNotification::ConnectionClosed {
                    local: other,
                    remote: *local,
                    reason: CloseReason::ClosedByPeer,
                },
            );
            hub.raise(
                *local,
                ChannelNotification::ConnectionClosed {
                    local: *local,
                    remote: other,
                    reason: CloseReason::ClosedByLocalUser,
                },
            );
        }
        Ok(())
    }

    fn queue_info(&self, local: &PeerId) -> QueueInfo {
        let hub = self.hub.borrow();
        let mut info = QueueInfo::default();
        if let Some(inbox) = hub.inboxes.get(local) {
            info.incoming_count = inbox.packets.len() as u64;
            info.incoming_bytes = inbox.packets.iter().map(|p| p.data.len() as u64).sum();
        }
        for (_, packet) in hub.links.values().flat_map(|link| link.queued.iter()) {
            if packet.sender == *local {
                info.outgoing_count += 1;
                info.outgoing_bytes += packet.data.len() as u64;
            }
        }
        info
    }

    fn subscribe(&mut self, local: &PeerId, kind: NotificationKind) -> NotifyId {
        let mut hub = self.hub.borrow_mut();
        hub.next_notify += 1;
        let id = NotifyId(hub.next_notify);
        hub.subscriptions.insert(id, (*local, kind));
        id
    }

    /// Queued notifications of a kind nobody on that peer listens to any more are dropped.
    fn unsubscribe(&mut self, id: NotifyId) {
        let mut hub = self.hub.borrow_mut();
        let Some((peer, kind)) = hub.subscriptions.remove(&id) else {
            return;
        };
        let still_listening = hub
            .subscriptions
            .values()
            .any(|(p, k)| *p == peer && *k == kind);
        if !still_listening {
            if let Some(inbox) = hub.inboxes.get_mut(&peer) {
                inbox.notifications.retain(|n| n.kind() != kind);
            }
        }
    }

    fn next_notification(&mut self, local: &PeerId) -> Option<ChannelNotification> {
        self.hub
            .borrow_mut()
            .inboxes
            .get_mut(local)
            .and_then(|inbox| inbox.notifications.pop_front())
    }
}
