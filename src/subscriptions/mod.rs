//! Channel subscription tracking.
//!
//! The registry maps each subscribed channel to:
//! - the handlers registered for it
//! - the server endpoints currently holding it live
//!
//! It keeps the server side in step with the client side:
//! - subscribe is sent only when a channel gains its first handler
//! - unsubscribe is sent only when it loses its last one
//! - subscriptions are resent after a reconnect
//! - owners that can no longer carry them are replaced during validation
//!
//! Keyspace notification channels are subscribed on every master rather than
//! on a single selected server.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new(topology, DispatchMode::Background, 1000)?;
//!
//! let handler = Handler::new(|channel, payload| println!("{channel}: {payload:?}"));
//! registry.add_subscription(&Channel::from("news"), handler.clone(), CommandFlags::NONE).wait()?;
//!
//! // From the connection's read loop
//! registry.on_message(&subscribed, &delivered, &payload);
//!
//! // From the reconnect hook and the health-check timer
//! registry.resend_subscriptions(&endpoint);
//! let repaired = registry.validate_subscriptions();
//! ```

mod manager;
mod subscription;
mod types;

pub use manager::SubscriptionRegistry;
pub use types::{RegistryStats, SubscriptionSnapshot};
