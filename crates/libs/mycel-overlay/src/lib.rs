//! The overlay mesh engine: interface discovery and lifecycle, the cooperative
//! scheduler that drives it, priority transmit queues with MTU-bounded frame
//! packing, the overlay packet codec, and the port-addressed MDP datagram
//! layer that rhizome and vomp ride on.

pub mod buffer;
pub mod error;
pub mod iface;
pub mod mdp;
pub mod packet;
pub mod queue;
pub mod sched;
pub mod subscriber;

pub use buffer::OverlayBuffer;
pub use error::OverlayError;
pub use iface::{InterfaceManager, InterfaceRule, InterfaceState, InterfaceType, RxEvent};
pub use mdp::MdpPacket;
pub use packet::{AddressContext, OverlayFrame};
pub use queue::{OutboundFrame, OutgoingPacket, TxEngine};
pub use sched::{Alarm, AlarmKind, Scheduler};
pub use subscriber::{Reachability, Subscriber, SubscriberTable};
