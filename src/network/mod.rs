//! Network subsystem: media transport sessions and receive-side jitter buffering

pub mod jitter;
pub mod memory;
pub mod receiver;
pub mod relay;
pub mod sender;
pub mod session;
pub mod transport;

pub use jitter::{JitterBuffer, JitterStats, Released};
pub use memory::MemoryTransport;
pub use receiver::{ReceivedObject, ReceiverStats, SubscriberConfig, SubscriberSession, TrackSubscription};
pub use relay::{nearest_relay, GeoPoint, RelayEndpoint};
pub use sender::{PublisherConfig, PublisherSession, SenderStats, SubscriberStats, TrackStats};
pub use session::SessionState;
pub use transport::{RecvStream, SendStream, Transport};
