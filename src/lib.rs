//! # kvsub
//!
//! Client-side pub/sub subscription management for a clustered key-value
//! server.
//!
//! ## Core Concepts
//!
//! - **Channels**: Literal or pattern names; keyspace notification channels fan out to every master
//! - **Handlers**: Callbacks composed per channel; the server sees one subscription per channel
//! - **Endpoints**: The connections a subscription is live on, kept in step across reconnects and failover
//! - **Completions**: Awaitable results of server commands, with a blocking adapter
//!
//! ## Example
//!
//! ```ignore
//! use kvsub::{CommandFlags, Handler, Subscriber, SubscriberConfig};
//!
//! let subscriber = Subscriber::new(topology, SubscriberConfig::default())?;
//!
//! let handler = Handler::new(|channel, payload| {
//!     println!("{channel}: {}", String::from_utf8_lossy(payload));
//! });
//! subscriber.subscribe("news", handler.clone(), CommandFlags::NONE)?;
//!
//! let receivers = subscriber.publish("news", "hello", CommandFlags::NONE)?;
//!
//! subscriber.unsubscribe("news", Some(&handler), CommandFlags::NONE)?;
//! ```

pub mod completion;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod subscriber;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use completion::{Completer, Completion};
pub use dispatch::{DispatchMode, Handler};
pub use endpoint::{Endpoint, ServerEndpoint, Topology};
pub use error::{Result, SubscriberError};
pub use memory::{MemoryEndpoint, MemoryTopology, ReplyMode, SentMessage};
pub use subscriber::{Subscriber, SubscriberConfig, PING_CHANNEL_PREFIX};
pub use subscriptions::{RegistryStats, SubscriptionRegistry, SubscriptionSnapshot};
pub use types::*;
