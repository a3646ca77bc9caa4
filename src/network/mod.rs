//! Network layer for presence and call signaling
//!
//! Contains modules for:
//! - Multicast group transport (presence datagrams)
//! - Local address discovery
//! - The presence directory and call handshake
//! - The per-call signaling stream

pub mod discovery;
pub mod multicast;
pub mod presence;
pub mod signaling;

pub use discovery::{get_interface_addresses, resolve_local_address};
pub use multicast::{create_multicast_socket, Datagram, GroupTransport, PresenceLink};
pub use presence::{CallEvent, PeerRecord, PresenceDirectory, PresenceState, Roster};
pub use signaling::{drive_observer, ConnectionEvent, Role, SignalingObserver, SignalingTransport};
