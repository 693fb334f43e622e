//! Introspection types for the subscription registry.

use serde::{Deserialize, Serialize};

/// Point-in-time description of one subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// Channel name, lossily decoded as UTF-8.
    pub channel: String,
    pub pattern: bool,
    pub keyspace_notification: bool,
    /// Number of registered handlers.
    pub handlers: usize,
    /// Addresses of the endpoints holding the subscription.
    pub owners: Vec<String>,
}

/// Aggregate counters for a registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub channels: usize,
    pub pattern_channels: usize,
    pub keyspace_channels: usize,
    /// Channels with handlers but no server currently holding them.
    pub unowned_channels: usize,
    pub handlers: usize,
    /// Deliveries handed to handlers.
    pub deliveries: u64,
    /// Handler invocations that panicked.
    pub handler_failures: u64,
    /// Deliveries dropped because the dispatch queue was full.
    pub dropped_deliveries: u64,
}
