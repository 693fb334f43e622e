//! In-memory endpoints and topology.
//!
//! Records every message instead of talking to a server, and lets tests flip
//! connectivity, role and reply behaviour to simulate failover.

use crate::completion::{Completer, Completion};
use crate::endpoint::{Endpoint, ServerEndpoint, Topology};
use crate::error::SubscriberError;
use crate::types::{Channel, Command, CommandFlags, Message, Reply, ServerPreference};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// How a [`MemoryEndpoint`] answers awaitable sends.
#[derive(Clone, Debug, Default)]
pub enum ReplyMode {
    /// Reply immediately: PUBLISH gets the receiver count, everything else `Ok`.
    #[default]
    Ack,
    /// Reply immediately with a server error.
    Fail(String),
    /// Keep replies pending until [`MemoryEndpoint::release_held`].
    Hold,
}

/// A message as received by a [`MemoryEndpoint`].
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub message: Message,
    pub fire_and_forget: bool,
}

/// An endpoint that records what it is sent.
pub struct MemoryEndpoint {
    address: String,
    connected: AtomicBool,
    selectable: AtomicBool,
    replica: AtomicBool,
    publish_receivers: AtomicI64,
    reply_mode: Mutex<ReplyMode>,
    sent: Mutex<Vec<SentMessage>>,
    held: Mutex<Vec<(Command, Completer)>>,
}

impl MemoryEndpoint {
    /// A connected master.
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            connected: AtomicBool::new(true),
            selectable: AtomicBool::new(true),
            replica: AtomicBool::new(false),
            publish_receivers: AtomicI64::new(0),
            reply_mode: Mutex::new(ReplyMode::Ack),
            sent: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        })
    }

    /// A connected replica.
    pub fn replica(address: impl Into<String>) -> Arc<Self> {
        let endpoint = Self::new(address);
        endpoint.set_replica(true);
        endpoint
    }

    pub fn handle(self: &Arc<Self>) -> Endpoint {
        Endpoint::from_arc(self.clone())
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_selectable(&self, selectable: bool) {
        self.selectable.store(selectable, Ordering::SeqCst);
    }

    pub fn set_replica(&self, replica: bool) {
        self.replica.store(replica, Ordering::SeqCst);
    }

    /// Receiver count returned for PUBLISH.
    pub fn set_publish_receivers(&self, receivers: i64) {
        self.publish_receivers.store(receivers, Ordering::SeqCst);
    }

    pub fn set_reply_mode(&self, mode: ReplyMode) {
        *self.reply_mode.lock() = mode;
    }

    /// Everything received so far, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Number of `command` messages received.
    pub fn sent_count(&self, command: Command) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.command == command)
            .count()
    }

    /// Number of `command` messages received for `channel`.
    pub fn sent_for(&self, command: Command, channel: &Channel) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.command == command && &s.message.channel == channel)
            .count()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Acknowledge every held reply. Returns how many were released.
    pub fn release_held(&self) -> usize {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        let count = held.len();
        for (command, completer) in held {
            completer.complete(Ok(self.ack_for(command)));
        }
        count
    }

    fn ack_for(&self, command: Command) -> Reply {
        match command {
            Command::Publish => Reply::Integer(self.publish_receivers.load(Ordering::SeqCst)),
            _ => Reply::Ok,
        }
    }

    fn record(&self, message: Message, fire_and_forget: bool) {
        self.sent.lock().push(SentMessage {
            message,
            fire_and_forget,
        });
    }
}

impl ServerEndpoint for MemoryEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_selectable(&self, _command: Command) -> bool {
        self.is_connected() && self.selectable.load(Ordering::SeqCst)
    }

    fn is_replica(&self) -> bool {
        self.replica.load(Ordering::SeqCst)
    }

    fn send(&self, message: Message) -> Completion {
        let command = message.command;
        self.record(message, false);

        let mode = self.reply_mode.lock().clone();
        match mode {
            ReplyMode::Ack => Completion::ready(self.ack_for(command)),
            ReplyMode::Fail(error) => Completion::failed(SubscriberError::Server(error)),
            ReplyMode::Hold => {
                let (completer, completion) = Completion::pending();
                self.held.lock().push((command, completer));
                completion
            }
        }
    }

    fn send_fire_and_forget(&self, message: Message) {
        self.record(message, true);
    }
}

/// A mutable list of [`MemoryEndpoint`]s with preference-aware selection.
///
/// Selection picks the first connected, selectable endpoint in insertion
/// order that satisfies the call's [`ServerPreference`].
#[derive(Default)]
pub struct MemoryTopology {
    endpoints: RwLock<Vec<Arc<MemoryEndpoint>>>,
}

impl MemoryTopology {
    pub fn new(endpoints: Vec<Arc<MemoryEndpoint>>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    pub fn add(&self, endpoint: Arc<MemoryEndpoint>) {
        self.endpoints.write().push(endpoint);
    }

    /// Forget the endpoint with `address`. Returns whether one was removed.
    pub fn remove(&self, address: &str) -> bool {
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|e| e.address() != address);
        endpoints.len() != before
    }

    /// Total `command` messages received across all endpoints.
    pub fn total_sent(&self, command: Command) -> usize {
        self.endpoints
            .read()
            .iter()
            .map(|e| e.sent_count(command))
            .sum()
    }
}

impl Topology for MemoryTopology {
    fn select_server(
        &self,
        command: Command,
        flags: CommandFlags,
        _channel: Option<&Channel>,
    ) -> Option<Endpoint> {
        let endpoints = self.endpoints.read();
        let pick = |replica: bool| {
            endpoints
                .iter()
                .find(|e| e.is_replica() == replica && e.is_selectable(command))
                .map(|e| e.handle())
        };

        match flags.preference {
            ServerPreference::PreferMaster => pick(false).or_else(|| pick(true)),
            ServerPreference::DemandMaster => pick(false),
            ServerPreference::PreferReplica => pick(true).or_else(|| pick(false)),
            ServerPreference::DemandReplica => pick(true),
        }
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().iter().map(|e| e.handle()).collect()
    }
}
