//! Registry of subscribed channels.

use crate::completion::Completion;
use crate::dispatch::{DispatchMode, Dispatcher, Handler, PendingDelivery};
use crate::endpoint::{Endpoint, Topology};
use crate::error::{Result, SubscriberError};
use crate::types::{Channel, Command, CommandFlags, ServerPreference};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::subscription::Subscription;
use super::types::{RegistryStats, SubscriptionSnapshot};

/// Maps channels to their subscription state and keeps server-side
/// registrations in line with it.
///
/// The map lock only covers bookkeeping; every network send happens after it
/// has been released.
pub struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<Channel, Arc<Subscription>>>,
    topology: Arc<dyn Topology>,
    dispatcher: Dispatcher,
    /// Set under the map lock by [`SubscriptionRegistry::close`].
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    /// Create a registry routing through `topology`.
    pub fn new(
        topology: Arc<dyn Topology>,
        dispatch_mode: DispatchMode,
        dispatch_capacity: usize,
    ) -> Result<Self> {
        Ok(Self {
            subscriptions: Mutex::new(HashMap::new()),
            topology,
            dispatcher: Dispatcher::new(dispatch_mode, dispatch_capacity)?,
            closed: AtomicBool::new(false),
        })
    }

    /// The topology used for server selection.
    pub fn topology(&self) -> &dyn Topology {
        &*self.topology
    }

    /// Register `handler` for `channel`. Fails with
    /// [`SubscriberError::ShutDown`] once the registry is closed.
    ///
    /// Only the call that creates the channel's record routes a subscribe
    /// command; later handlers piggyback on the live subscription and get an
    /// already-resolved completion.
    pub fn add_subscription(
        &self,
        channel: &Channel,
        handler: Handler,
        flags: CommandFlags,
    ) -> Completion {
        let created = {
            let mut subs = self.subscriptions.lock();
            if self.is_closed() {
                return Completion::failed(SubscriberError::ShutDown);
            }
            match subs.get(channel) {
                Some(existing) => {
                    existing.add_handler(handler);
                    None
                }
                None => {
                    let subscription = Arc::new(Subscription::new(handler, flags.preference));
                    subs.insert(channel.clone(), Arc::clone(&subscription));
                    Some(subscription)
                }
            }
        };

        match created {
            Some(subscription) => {
                tracing::debug!(channel = %channel, "created subscription");
                subscription
                    .subscribe_to_server(channel, flags, false, self.topology())
                    .unwrap_or_else(Completion::done)
            }
            None => Completion::done(),
        }
    }

    /// Remove `handler` from `channel`, or every handler when `None`.
    ///
    /// Unsubscribes from the server only once no handler is left.
    pub fn remove_subscription(
        &self,
        channel: &Channel,
        handler: Option<&Handler>,
        flags: CommandFlags,
    ) -> Completion {
        let removed = {
            let mut subs = self.subscriptions.lock();
            let Some(subscription) = subs.get(channel) else {
                return Completion::done();
            };
            if !subscription.remove_handler(handler) {
                return Completion::done();
            }
            let subscription = subs.remove(channel);
            if let Some(subscription) = &subscription {
                subscription.retire();
            }
            subscription
        };

        match removed {
            Some(subscription) => {
                tracing::debug!(channel = %channel, "removed subscription");
                subscription
                    .unsubscribe_from_server(channel, flags, false)
                    .unwrap_or_else(Completion::done)
            }
            None => Completion::done(),
        }
    }

    /// Wipe every subscription and unsubscribe all owners.
    pub fn remove_all_subscriptions(&self, flags: CommandFlags) -> Completion {
        self.drain(flags, false)
    }

    /// Refuse further subscriptions, then wipe every existing one.
    pub fn close(&self, flags: CommandFlags) -> Completion {
        self.drain(flags, true)
    }

    /// Whether [`SubscriptionRegistry::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn drain(&self, flags: CommandFlags, close: bool) -> Completion {
        let drained: Vec<(Channel, Arc<Subscription>)> = {
            let mut subs = self.subscriptions.lock();
            if close {
                self.closed.store(true, Ordering::SeqCst);
            }
            subs.drain()
                .inspect(|(_, subscription)| subscription.retire())
                .collect()
        };

        if !drained.is_empty() {
            tracing::debug!(channels = drained.len(), "removing all subscriptions");
        }

        let sends = drained
            .iter()
            .filter_map(|(channel, subscription)| {
                subscription.unsubscribe_from_server(channel, flags, false)
            })
            .collect();
        Completion::all(sends)
    }

    /// Re-send subscribe commands for every channel owned by `server`.
    ///
    /// Called after `server` reconnects. Owners are left untouched. Returns
    /// the number of channels resent.
    pub fn resend_subscriptions(&self, server: &Endpoint) -> usize {
        let resent = self
            .snapshot()
            .iter()
            .filter(|(channel, subscription)| subscription.resubscribe(channel, server))
            .count();

        if resent > 0 {
            tracing::debug!(endpoint = %server, channels = resent, "resent subscriptions");
        }
        resent
    }

    /// Repair subscriptions whose owners went away. Returns the number of
    /// channels that needed a command.
    pub fn validate_subscriptions(&self) -> usize {
        let mut repaired = 0;
        for (channel, subscription) in self.snapshot() {
            if subscription.validate(&channel, self.topology()) {
                tracing::debug!(channel = %channel, "repaired subscription");
                repaired += 1;
            }
        }

        if repaired > 0 {
            tracing::info!(channels = repaired, "validated subscriptions");
        }
        repaired
    }

    /// Deliver an inbound message.
    ///
    /// `subscription_channel` is the channel the subscribe was issued for;
    /// for pattern subscriptions `delivered_channel` is the concrete channel
    /// the message was published to. Returns whether a delivery was run or
    /// queued.
    pub fn on_message(
        &self,
        subscription_channel: &Channel,
        delivered_channel: &Channel,
        payload: &[u8],
    ) -> bool {
        let handlers = {
            let subs = self.subscriptions.lock();
            match subs.get(subscription_channel) {
                Some(subscription) => subscription.handlers(),
                None => return false,
            }
        };

        if handlers.is_empty() {
            return false;
        }

        self.dispatcher.submit(PendingDelivery::new(
            delivered_channel.clone(),
            payload.to_vec(),
            handlers,
        ))
    }

    /// Whether the server holding `channel` is connected. For an unknown
    /// channel, or `None`, whether a master could be selected and is connected.
    pub fn subscriber_connected(&self, channel: Option<&Channel>) -> bool {
        if let Some(server) = channel.and_then(|channel| self.subscribed_server(channel)) {
            return server.is_connected();
        }

        let command = channel.map_or(Command::Subscribe, Channel::subscribe_command);
        let flags = CommandFlags::NONE.with_preference(ServerPreference::DemandMaster);
        self.topology
            .select_server(command, flags, channel)
            .is_some_and(|server| server.is_connected())
    }

    /// The endpoint currently holding `channel`, if any.
    pub fn subscribed_server(&self, channel: &Channel) -> Option<Endpoint> {
        let subscription = self.subscriptions.lock().get(channel).cloned()?;
        subscription.owner()
    }

    /// Whether `channel` has a record, owned or not.
    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.subscriptions.lock().contains_key(channel)
    }

    /// Number of subscribed channels.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Describe every subscription, ordered by channel.
    pub fn subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        let mut snapshots: Vec<SubscriptionSnapshot> = self
            .snapshot()
            .into_iter()
            .map(|(channel, subscription)| SubscriptionSnapshot {
                channel: channel.to_string(),
                pattern: channel.is_pattern(),
                keyspace_notification: channel.is_keyspace_notification(),
                handlers: subscription.handler_count(),
                owners: subscription
                    .owners()
                    .iter()
                    .map(|owner| owner.address().to_string())
                    .collect(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.channel.cmp(&b.channel).then(a.pattern.cmp(&b.pattern)));
        snapshots
    }

    /// Channel and dispatch counters.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for (channel, subscription) in self.snapshot() {
            stats.channels += 1;
            if channel.is_pattern() {
                stats.pattern_channels += 1;
            }
            if channel.is_keyspace_notification() {
                stats.keyspace_channels += 1;
            }
            if subscription.owner().is_none() {
                stats.unowned_channels += 1;
            }
            stats.handlers += subscription.handler_count();
        }

        let dispatch = self.dispatcher.stats();
        stats.deliveries = dispatch.completed;
        stats.handler_failures = dispatch.handler_failures;
        stats.dropped_deliveries = dispatch.dropped;
        stats
    }

    /// Stop the dispatcher after letting queued deliveries finish.
    pub fn shutdown_dispatch(&self) {
        self.dispatcher.shutdown();
    }

    /// Copy of the map, so bulk operations run without the registry lock.
    fn snapshot(&self) -> Vec<(Channel, Arc<Subscription>)> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(channel, subscription)| (channel.clone(), Arc::clone(subscription)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEndpoint, MemoryTopology};

    fn registry(endpoints: Vec<Arc<MemoryEndpoint>>) -> SubscriptionRegistry {
        SubscriptionRegistry::new(
            Arc::new(MemoryTopology::new(endpoints)),
            DispatchMode::Inline,
            16,
        )
        .unwrap()
    }

    #[test]
    fn test_add_then_remove() {
        let m1 = MemoryEndpoint::new("m1:6379");
        let registry = registry(vec![m1.clone()]);
        let channel = Channel::from("news");
        let handler = Handler::new(|_, _| {});

        registry
            .add_subscription(&channel, handler.clone(), CommandFlags::NONE)
            .wait()
            .unwrap();
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.subscribed_server(&channel), Some(m1.handle()));

        registry
            .remove_subscription(&channel, Some(&handler), CommandFlags::NONE)
            .wait()
            .unwrap();
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(m1.sent_for(Command::Unsubscribe, &channel), 1);
    }

    #[test]
    fn test_remove_unknown_handler_keeps_channel() {
        let m1 = MemoryEndpoint::new("m1:6379");
        let registry = registry(vec![m1.clone()]);
        let channel = Channel::from("news");

        registry.add_subscription(&channel, Handler::new(|_, _| {}), CommandFlags::NONE);
        let mut completion =
            registry.remove_subscription(&channel, Some(&Handler::new(|_, _| {})), CommandFlags::NONE);

        assert!(completion.is_complete());
        assert!(registry.is_subscribed(&channel));
        assert_eq!(m1.sent_count(Command::Unsubscribe), 0);
    }

    #[test]
    fn test_remove_unknown_channel_is_done() {
        let registry = registry(vec![MemoryEndpoint::new("m1:6379")]);
        let mut completion =
            registry.remove_subscription(&Channel::from("nope"), None, CommandFlags::NONE);
        assert!(completion.is_complete());
    }

    #[test]
    fn test_on_message_unknown_channel() {
        let registry = registry(vec![MemoryEndpoint::new("m1:6379")]);
        let channel = Channel::from("news");
        assert!(!registry.on_message(&channel, &channel, b"hello"));
    }

    #[test]
    fn test_subscriber_connected_without_channel() {
        let m1 = MemoryEndpoint::new("m1:6379");
        let registry = registry(vec![m1.clone()]);
        assert!(registry.subscriber_connected(None));

        m1.set_connected(false);
        assert!(!registry.subscriber_connected(None));
    }

    #[test]
    fn test_closed_registry_refuses_subscriptions() {
        let m1 = MemoryEndpoint::new("m1:6379");
        let registry = registry(vec![m1.clone()]);
        let channel = Channel::from("news");

        registry.add_subscription(&channel, Handler::new(|_, _| {}), CommandFlags::NONE);
        registry.close(CommandFlags::FIRE_AND_FORGET).wait().unwrap();
        assert!(registry.is_closed());
        assert_eq!(m1.sent_for(Command::Unsubscribe, &channel), 1);

        let result = registry
            .add_subscription(&channel, Handler::new(|_, _| {}), CommandFlags::NONE)
            .wait();
        assert!(matches!(result, Err(SubscriberError::ShutDown)));
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(m1.sent_for(Command::Subscribe, &channel), 1);
    }

    #[test]
    fn test_stats_counts_channels() {
        let m1 = MemoryEndpoint::new("m1:6379");
        let registry = registry(vec![m1]);

        registry.add_subscription(&Channel::from("a"), Handler::new(|_, _| {}), CommandFlags::NONE);
        registry.add_subscription(&Channel::from("b.*"), Handler::new(|_, _| {}), CommandFlags::NONE);
        registry.add_subscription(&Channel::from("b.*"), Handler::new(|_, _| {}), CommandFlags::NONE);

        let stats = registry.stats();
        assert_eq!(stats.channels, 2);
        assert_eq!(stats.pattern_channels, 1);
        assert_eq!(stats.handlers, 3);
        assert_eq!(stats.unowned_channels, 0);
    }
}
