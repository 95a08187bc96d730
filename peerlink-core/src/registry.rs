//! Peer registry: identity <-> handle mapping, the server peer and pending disconnects.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::identity::{ConnectionHandle, PeerId, SocketToken, SERVER_HANDLE};
use crate::reassembly::ReassemblyBuffer;

/// First handle given to a client peer.
pub const FIRST_CLIENT_HANDLE: ConnectionHandle = 1;

/// A remote endpoint known to the transport.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    handle: ConnectionHandle,
    socket: Option<SocketToken>,
    pub(crate) chunks: ReassemblyBuffer,
}

impl Peer {
    fn new(id: PeerId, handle: ConnectionHandle, socket: Option<SocketToken>) -> Self {
        Self {
            id,
            handle,
            socket,
            chunks: ReassemblyBuffer::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn socket(&self) -> Option<&SocketToken> {
        self.socket.as_ref()
    }

    pub fn set_socket(&mut self, socket: SocketToken) {
        self.socket = Some(socket);
    }

    /// Split message currently being reassembled from this peer.
    pub fn chunks(&self) -> &ReassemblyBuffer {
        &self.chunks
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let socket = self.socket.as_ref().map_or("-", SocketToken::as_str);
        write!(f, "[{}|{}|{}]", self.id, self.handle, socket)
    }
}

/// All peers of one transport instance.
///
/// Handles are sequential from [`FIRST_CLIENT_HANDLE`] and remembered per identity until
/// [`clear`](Self::clear): a peer that reconnects gets its old handle back.
#[derive(Debug)]
pub struct PeerRegistry {
    next_handle: ConnectionHandle,
    server: Option<Peer>,
    clients: BTreeMap<ConnectionHandle, Peer>,
    by_id: HashMap<PeerId, ConnectionHandle>,
    assigned: HashMap<PeerId, ConnectionHandle>,
    pending_disconnects: Vec<ConnectionHandle>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: FIRST_CLIENT_HANDLE,
            server: None,
            clients: BTreeMap::new(),
            by_id: HashMap::new(),
            assigned: HashMap::new(),
            pending_disconnects: Vec::new(),
        }
    }

    /// Install the server peer under [`SERVER_HANDLE`].
    pub fn set_server_peer(&mut self, id: PeerId) {
        self.server = Some(Peer::new(id, SERVER_HANDLE, None));
    }

    pub fn server_peer(&self) -> Option<&Peer> {
        self.server.as_ref()
    }

    pub fn server_peer_mut(&mut self) -> Option<&mut Peer> {
        self.server.as_mut()
    }

    /// Register a client peer that was accepted on `socket`.
    ///
    /// A disconnect still queued for the same handle belongs to the previous connection and
    /// is discarded.
    pub fn add_client_peer(&mut self, id: PeerId, socket: SocketToken) -> &mut Peer {
        let handle = *self.assigned.entry(id).or_insert_with(|| {
            self.next_handle += 1;
            self.next_handle - 1
        });
        let queued = self.pending_disconnects.len();
        self.pending_disconnects.retain(|&h| h != handle);
        if self.pending_disconnects.len() != queued {
            tracing::debug!(handle, "reconnected before disconnect was reported");
        }
        self.by_id.insert(id, handle);
        let peer = Peer::new(id, handle, Some(socket));
        match self.clients.entry(handle) {
            Entry::Occupied(mut e) => {
                tracing::debug!(peer = %e.get(), "peer registered again, replacing");
                e.insert(peer);
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(peer),
        }
    }

    /// Drop a client peer. Its handle stays reserved for its identity.
    pub fn remove_client_peer(&mut self, handle: ConnectionHandle) -> Option<Peer> {
        match self.clients.remove(&handle) {
            Some(peer) => {
                self.by_id.remove(&peer.id);
                Some(peer)
            }
            None => {
                tracing::warn!(handle, "remove of unknown client peer");
                None
            }
        }
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&Peer> {
        if handle == SERVER_HANDLE {
            return self.server.as_ref();
        }
        self.clients.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Peer> {
        if handle == SERVER_HANDLE {
            return self.server.as_mut();
        }
        self.clients.get_mut(&handle)
    }

    pub fn get_by_id(&self, id: &PeerId) -> Option<&Peer> {
        let handle = self.handle_of(id)?;
        self.get(handle)
    }

    pub fn get_by_id_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        let handle = self.handle_of(id)?;
        self.get_mut(handle)
    }

    fn handle_of(&self, id: &PeerId) -> Option<ConnectionHandle> {
        match &self.server {
            Some(server) if server.id == *id => Some(SERVER_HANDLE),
            _ => self.by_id.get(id).copied(),
        }
    }

    /// Registered client peers, ordered by handle.
    pub fn clients(&self) -> impl Iterator<Item = &Peer> {
        self.clients.values()
    }

    pub fn client_handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
        self.clients.keys().copied()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Queue a Disconnect event for `handle`. Returns false if one is already queued.
    pub fn push_pending_disconnect(&mut self, handle: ConnectionHandle) -> bool {
        if self.pending_disconnects.contains(&handle) {
            return false;
        }
        self.pending_disconnects.push(handle);
        true
    }

    /// Most recently queued disconnect first.
    pub fn pop_pending_disconnect(&mut self) -> Option<ConnectionHandle> {
        self.pending_disconnects.pop()
    }

    pub fn pending_disconnects(&self) -> &[ConnectionHandle] {
        &self.pending_disconnects
    }

    /// Forget everything, including remembered handles.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
