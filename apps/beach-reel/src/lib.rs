//! Receiver for multiplexed H.264 picture streams.
//!
//! Bytes come off a socket on a dedicated network thread, are framed by
//! [`protocol::ProtocolReader`], routed per stream id to a decoder
//! [`session::StreamSession`], and the decoded planes are handed to a
//! [`resources::ResourceConsumer`] on whichever thread drives
//! [`host::StreamHost::tick`].

pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod host;
pub mod metrics;
pub mod protocol;
pub mod resources;
pub mod router;
pub mod session;
pub mod telemetry;

pub use config::{Config, Prewarm};
pub use host::{ConnectionEvent, HostError, StreamHost, TickReport};
pub use resources::{Plane, ResourceConsumer};
pub use session::Resolution;
