//! Peer wire protocol: handshake and framed messages.
//!
//! Decoding never consumes input. Each decoder looks at the front of a
//! buffer and either yields one complete item or reports that more bytes
//! are needed; the caller advances by the item's exact wire size.

pub mod handshake;
pub mod messages;
pub mod types;

pub use handshake::{HEADER_LEN, HandshakeCodec, PEER_ID_LEN};
pub use messages::{MAX_FRAME_LENGTH, MessageCodec};
pub use types::{CLIENT_PREFIX, HandshakeHeader, PeerId, PeerMessage};
