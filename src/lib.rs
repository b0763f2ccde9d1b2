//! MQTT 3.1.1 broker with QoS 0/1/2 delivery, retained messages and
//! persistent sessions.
//!
//! The broker implements the full 3.1.1 control packet set and the
//! delivery guarantees built on it:
//!
//! - **QoS 0/1/2**: fire-and-forget, at-least-once (PUBLISH/PUBACK) and
//!   exactly-once (PUBLISH/PUBREC/PUBREL/PUBCOMP) with bounded
//!   dup-retransmission
//! - **Wildcards**: `+` and `#` topic filters matched through a trie
//! - **Retained messages**: one per topic, replayed to new subscribers
//! - **Sessions**: CleanSession=0 state survives disconnects, including
//!   subscriptions and queued QoS >= 1 messages
//!
//! ## Example
//!
//! ```no_run
//! use mammoth::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> mammoth::Result<()> {
//!     let broker = Broker::new(BrokerConfig::new("127.0.0.1:1883"));
//!     broker.serve().await
//! }
//! ```

mod broker;
mod error;
mod inflight;
pub mod protocol;
mod registry;
mod retained;
mod session;
pub mod storage;
pub mod trie;
mod types;

pub use broker::{Broker, BrokerBuilder, BrokerConfig};
pub use error::{Error, Result};
pub use registry::{SubscriptionRegistry, topic_matches, valid_filter};
pub use retained::RetainedStore;
pub use session::{Outgoing, SessionManager};
pub use storage::{MemoryStore, SessionSnapshot, SessionStore};
pub use types::{AllowAll, Authenticator, ConnectReturnCode, Message, PacketType, QoS};
