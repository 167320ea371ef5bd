//! VoMP, the voice-over-mesh protocol: a six-state full-duplex call model
//! with replay protection by per-call session numbers, codec negotiation by
//! bitmap intersection, and fixed-duration audio framing with duplicate
//! suppression. Frames ride the mesh datagram layer; this crate only
//! produces and consumes their payloads.

pub mod call;
pub mod codecs;
pub mod error;
pub mod monitor;
pub mod wire;

pub use call::{Call, CallState, CallTable, VompOut};
pub use codecs::CodecFlags;
pub use error::VompError;
pub use monitor::MonitorSink;
