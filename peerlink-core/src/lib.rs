//! peerlink: message transport over a size-limited peer-to-peer packet channel.
//! Host-driven: no threads, no I/O of its own; the host polls once per tick.

pub mod channel;
pub mod identity;
pub mod loopback;
pub mod pool;
pub mod reassembly;
pub mod registry;
pub mod settings;
pub mod transport;

pub use channel::{
    ChannelError, ChannelNotification, ChannelTag, PacketChannel, Reliability, MAX_PACKET_SIZE,
};
pub use identity::{ConnectionHandle, PeerId, SocketToken, SERVER_HANDLE};
pub use loopback::LoopbackChannel;
pub use pool::{SplitError, HEADER_SIZE, MAX_CHUNK_COUNT, MAX_MESSAGE_SIZE};
pub use settings::{SettingsError, TransportSettings};
pub use transport::{Delivery, NetworkEvent, PollResult, Transport, TransportError, TransportState};
