//! Caller-facing subscriber tying the registry, dispatcher and topology together.

use crate::completion::Completion;
use crate::dispatch::{DispatchMode, Handler};
use crate::endpoint::{Endpoint, Topology};
use crate::error::{Result, SubscriberError};
use crate::subscriptions::{RegistryStats, SubscriptionRegistry, SubscriptionSnapshot};
use crate::types::{Channel, Command, CommandFlags, Message, Reply};
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Prefix of the throwaway channels used by [`Subscriber::ping`].
pub const PING_CHANNEL_PREFIX: &str = "__kvsub_ping__:";

/// Subscriber configuration.
#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    /// How long synchronous calls wait for the server.
    /// Default: 5s
    pub sync_timeout: Duration,

    /// Where message handlers run.
    /// Default: background worker
    pub dispatch_mode: DispatchMode,

    /// Max queued deliveries before inbound messages are dropped.
    /// Default: 10000
    pub dispatch_queue_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(5),
            dispatch_mode: DispatchMode::Background,
            dispatch_queue_capacity: 10_000,
        }
    }
}

/// The pub/sub side of a client.
///
/// Provides:
/// - Subscribing and unsubscribing handlers, blocking or not
/// - Publishing
/// - Connectivity probes and endpoint introspection
/// - Hooks for the connection layer: inbound messages, reconnects, health checks
///
/// Shutting down (explicitly or on drop) unsubscribes everything
/// fire-and-forget and stops the dispatch worker.
pub struct Subscriber {
    config: SubscriberConfig,
    registry: SubscriptionRegistry,
    shut_down: AtomicBool,
}

impl Subscriber {
    /// Create a subscriber routing through `topology`.
    pub fn new(topology: Arc<dyn Topology>, config: SubscriberConfig) -> Result<Self> {
        let registry = SubscriptionRegistry::new(
            topology,
            config.dispatch_mode,
            config.dispatch_queue_capacity,
        )?;

        Ok(Self {
            config,
            registry,
            shut_down: AtomicBool::new(false),
        })
    }

    /// The configuration this subscriber was created with.
    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// The underlying channel registry.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    // --- Subscriptions ---

    /// Register `handler` for `channel` and wait for the server to confirm,
    /// unless `flags` asks for fire-and-forget.
    pub fn subscribe(
        &self,
        channel: impl Into<Channel>,
        handler: Handler,
        flags: CommandFlags,
    ) -> Result<()> {
        let completion = self.subscribe_async(channel, handler, flags)?;
        self.wait(completion, flags).map(|_| ())
    }

    /// Like [`Subscriber::subscribe`], returning the completion instead of waiting.
    pub fn subscribe_async(
        &self,
        channel: impl Into<Channel>,
        handler: Handler,
        flags: CommandFlags,
    ) -> Result<Completion> {
        self.ensure_running()?;
        let channel = checked(channel.into())?;
        Ok(self.registry.add_subscription(&channel, handler, flags))
    }

    /// Remove `handler` from `channel`; `None` removes every handler.
    pub fn unsubscribe(
        &self,
        channel: impl Into<Channel>,
        handler: Option<&Handler>,
        flags: CommandFlags,
    ) -> Result<()> {
        let completion = self.unsubscribe_async(channel, handler, flags)?;
        self.wait(completion, flags).map(|_| ())
    }

    /// Like [`Subscriber::unsubscribe`], returning the completion instead of waiting.
    pub fn unsubscribe_async(
        &self,
        channel: impl Into<Channel>,
        handler: Option<&Handler>,
        flags: CommandFlags,
    ) -> Result<Completion> {
        self.ensure_running()?;
        let channel = checked(channel.into())?;
        Ok(self.registry.remove_subscription(&channel, handler, flags))
    }

    /// Remove every subscription and wait for the servers to confirm.
    pub fn unsubscribe_all(&self, flags: CommandFlags) -> Result<()> {
        let completion = self.unsubscribe_all_async(flags)?;
        self.wait(completion, flags).map(|_| ())
    }

    /// Like [`Subscriber::unsubscribe_all`], returning the completion instead of waiting.
    pub fn unsubscribe_all_async(&self, flags: CommandFlags) -> Result<Completion> {
        self.ensure_running()?;
        Ok(self.registry.remove_all_subscriptions(flags))
    }

    // --- Publishing ---

    /// Publish `payload` and return the number of clients that received it.
    /// Fire-and-forget publishes return 0.
    pub fn publish(
        &self,
        channel: impl Into<Channel>,
        payload: impl Into<Vec<u8>>,
        flags: CommandFlags,
    ) -> Result<i64> {
        let completion = self.publish_async(channel, payload, flags)?;
        if flags.fire_and_forget {
            return Ok(0);
        }

        let reply = completion.wait_timeout(self.config.sync_timeout)?;
        reply
            .as_integer()
            .ok_or(SubscriberError::UnexpectedReply {
                command: Command::Publish,
                reply,
            })
    }

    /// Send PUBLISH to a selected server and return the raw reply completion.
    pub fn publish_async(
        &self,
        channel: impl Into<Channel>,
        payload: impl Into<Vec<u8>>,
        flags: CommandFlags,
    ) -> Result<Completion> {
        self.ensure_running()?;
        let channel = checked(channel.into())?;

        let server = self
            .registry
            .topology()
            .select_server(Command::Publish, flags, Some(&channel))
            .ok_or(SubscriberError::NoServerAvailable {
                command: Command::Publish,
            })?;

        Ok(server.execute(Message::new(Command::Publish, channel, flags).with_payload(payload)))
    }

    // --- Connectivity & introspection ---

    /// Whether the server holding `channel` is reachable. For an unsubscribed
    /// channel, or `None`, whether a master is available to subscribe on.
    pub fn is_connected(&self, channel: Option<&Channel>) -> bool {
        self.registry.subscriber_connected(channel)
    }

    /// The endpoint that serves, or would serve, a subscription to `channel`.
    pub fn identify_endpoint(
        &self,
        channel: impl Into<Channel>,
        flags: CommandFlags,
    ) -> Result<Option<Endpoint>> {
        self.ensure_running()?;
        let channel = checked(channel.into())?;

        if let Some(owner) = self.registry.subscribed_server(&channel) {
            return Ok(Some(owner));
        }
        Ok(self
            .registry
            .topology()
            .select_server(channel.subscribe_command(), flags, Some(&channel)))
    }

    /// The endpoint currently holding `channel`, if subscribed.
    pub fn subscribed_endpoint(&self, channel: &Channel) -> Option<Endpoint> {
        self.registry.subscribed_server(channel)
    }

    /// Measure a round trip on a subscriber-capable connection.
    ///
    /// The protocol has no PING in subscription context, so this unsubscribes
    /// from a random channel nobody is subscribed to.
    pub fn ping(&self, flags: CommandFlags) -> Result<Duration> {
        self.ensure_running()?;

        let channel = ping_channel();
        let server = self
            .registry
            .topology()
            .select_server(Command::Unsubscribe, flags, Some(&channel))
            .ok_or(SubscriberError::NoServerAvailable {
                command: Command::Unsubscribe,
            })?;

        let message = Message::new(
            Command::Unsubscribe,
            channel,
            flags.with_fire_and_forget(false),
        );
        let started = Instant::now();
        server
            .execute(message)
            .wait_timeout(self.config.sync_timeout)?;
        Ok(started.elapsed())
    }

    /// Number of subscribed channels.
    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    /// Describe every subscription, ordered by channel.
    pub fn subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.registry.subscriptions()
    }

    /// Channel and dispatch counters.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    // --- Connection layer hooks ---

    /// Inbound message from a connection's read loop.
    pub fn on_message(
        &self,
        subscription_channel: &Channel,
        delivered_channel: &Channel,
        payload: &[u8],
    ) -> bool {
        self.registry
            .on_message(subscription_channel, delivered_channel, payload)
    }

    /// `endpoint` finished reconnecting; restore its subscriptions.
    pub fn on_endpoint_connected(&self, endpoint: &Endpoint) -> usize {
        self.registry.resend_subscriptions(endpoint)
    }

    /// Periodic health check. Returns the number of repaired channels.
    pub fn validate_subscriptions(&self) -> usize {
        self.registry.validate_subscriptions()
    }

    // --- Lifecycle ---

    /// Unsubscribe everything (fire-and-forget) and stop dispatching.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let channels = self.registry.subscription_count();
        // Fire-and-forget: the completion is already resolved.
        let _ = self.registry.close(CommandFlags::FIRE_AND_FORGET);
        self.registry.shutdown_dispatch();
        tracing::info!(channels, "subscriber shut down");
    }

    /// Whether [`Subscriber::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(SubscriberError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Block on `completion` unless the call is fire-and-forget.
    fn wait(&self, completion: Completion, flags: CommandFlags) -> Result<Reply> {
        if flags.fire_and_forget {
            return Ok(Reply::Ok);
        }
        completion.wait_timeout(self.config.sync_timeout)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn checked(channel: Channel) -> Result<Channel> {
    if channel.is_empty() {
        Err(SubscriberError::InvalidChannel(
            "channel name must not be empty".to_string(),
        ))
    } else {
        Ok(channel)
    }
}

fn ping_channel() -> Channel {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    Channel::literal(format!("{}{}", PING_CHANNEL_PREFIX, hex::encode(bytes)))
}
