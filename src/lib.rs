//! # LAN Call Signaling
//!
//! Zero-configuration discovery of peers on a local network and a private
//! point-to-point channel for exchanging call-signaling payloads.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               DEVICE X                               │
//! │                                                                      │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │            Presence Directory (network::presence)              │  │
//! │  │   roster ◄── NotifyState / OfferCall / AcceptCall ──► events   │  │
//! │  └───────────────────────────────┬────────────────────────────────┘  │
//! │                                  │                                   │
//! │  ┌───────────────────────────────▼────────────────────────────────┐  │
//! │  │            Group Transport (network::multicast)                │  │
//! │  │            UDP multicast 239.0.0.1:4445                        │  │
//! │  └───────────────────────────────┬────────────────────────────────┘  │
//! │                                  │                                   │
//! │  ┌───────────────────────────────┼────────────────────────────────┐  │
//! │  │        Signaling Transport (network::signaling)                │  │
//! │  │        TCP, one JSON line per offer / answer / candidate       │  │
//! │  └───────────────────────────────┼────────────────────────────────┘  │
//! └──────────────────────────────────┼───────────────────────────────────┘
//!                                    │ LAN
//!                                    ▼
//!                                DEVICE Y
//! ```
//!
//! A call goes through three phases:
//!
//! 1. Both devices announce themselves on the multicast group and build a
//!    roster of who is around.
//! 2. One device offers a call (retransmitted until accepted), the other
//!    accepts it.
//! 3. The accepting side connects to the caller's signaling port and the media
//!    engine exchanges session descriptions and candidates over that stream.

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::net::Ipv4Addr;

    /// Multicast group used for presence messages
    pub const DEFAULT_GROUP_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);

    /// Multicast port used for presence messages
    pub const DEFAULT_GROUP_PORT: u16 = 4445;

    /// Interval between presence announcements
    pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 2000;

    /// Interval between call offer retransmissions
    pub const DEFAULT_OFFER_RETRY_INTERVAL_MS: u64 = 1000;

    /// Largest presence datagram we send or accept
    pub const MAX_PRESENCE_DATAGRAM: usize = 256;

    /// Default signaling listen address
    pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0";

    /// Default signaling TCP port
    pub const DEFAULT_SIGNALING_PORT: u16 = 8888;

    /// Outbound signaling lines buffered per connection
    pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 64;

    /// Multicast TTL; 1 keeps presence on the local segment
    pub const DEFAULT_MULTICAST_TTL: u32 = 1;
}
