//! Per-channel subscription state and routing.

use crate::completion::Completion;
use crate::dispatch::{Handler, HandlerSet};
use crate::endpoint::{Endpoint, Topology};
use crate::types::{Channel, Command, CommandFlags, Message, ServerPreference};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

/// State for one subscribed channel.
///
/// Handlers are only changed while the registry lock is held. The owner list
/// has its own lock, which is never held while taking the registry lock.
pub(crate) struct Subscription {
    handlers: RwLock<HandlerSet>,
    /// Endpoints currently holding this subscription live.
    owners: Mutex<Vec<Endpoint>>,
    /// Routing preference of the call that created the subscription; reused
    /// when validation has to pick a new owner.
    preference: ServerPreference,
    /// Set once removed from the registry. A retired record never gains owners.
    retired: AtomicBool,
}

impl Subscription {
    pub fn new(handler: Handler, preference: ServerPreference) -> Self {
        Self {
            handlers: RwLock::new(HandlerSet::single(handler)),
            owners: Mutex::new(Vec::new()),
            preference,
            retired: AtomicBool::new(false),
        }
    }

    // --- Handlers ---

    pub fn add_handler(&self, handler: Handler) {
        self.handlers.write().add(handler);
    }

    /// Remove one handler, or every handler when `handler` is `None`.
    /// Returns whether no handlers remain.
    pub fn remove_handler(&self, handler: Option<&Handler>) -> bool {
        let mut handlers = self.handlers.write();
        match handler {
            Some(handler) => {
                handlers.remove(handler);
            }
            None => handlers.clear(),
        }
        handlers.is_empty()
    }

    /// Snapshot of the current handlers.
    pub fn handlers(&self) -> HandlerSet {
        self.handlers.read().clone()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Clear every handler and mark the record as removed.
    pub fn retire(&self) {
        self.handlers.write().clear();
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    // --- Owners ---

    /// The first owner, if any.
    pub fn owner(&self) -> Option<Endpoint> {
        self.owners.lock().first().cloned()
    }

    pub fn owners(&self) -> Vec<Endpoint> {
        self.owners.lock().clone()
    }

    pub fn is_owned_by(&self, endpoint: &Endpoint) -> bool {
        self.owners.lock().contains(endpoint)
    }

    // --- Routing ---

    /// Route the subscribe command. Returns `None` if nothing was sent.
    pub fn subscribe_to_server(
        &self,
        channel: &Channel,
        flags: CommandFlags,
        internal: bool,
        topology: &dyn Topology,
    ) -> Option<Completion> {
        let mut owners = self.owners.lock();
        self.subscribe_locked(&mut owners, channel, flags, internal, topology)
    }

    /// Send the unsubscribe command to every owner, then forget them.
    /// Returns `None` if there were no owners.
    pub fn unsubscribe_from_server(
        &self,
        channel: &Channel,
        flags: CommandFlags,
        internal: bool,
    ) -> Option<Completion> {
        let mut owners = self.owners.lock();
        unsubscribe_locked(&mut owners, channel, flags, internal)
    }

    /// Re-send the subscribe command to `server` if it is an owner.
    pub fn resubscribe(&self, channel: &Channel, server: &Endpoint) -> bool {
        let owners = self.owners.lock();
        if self.is_retired() || !owners.contains(server) {
            return false;
        }

        let command = channel.subscribe_command();
        tracing::trace!(channel = %channel, %command, endpoint = %server, "resending subscription");
        server.execute(command_message(
            command,
            channel,
            CommandFlags::FIRE_AND_FORGET,
            true,
        ));
        true
    }

    /// Drop owners that can no longer carry the subscription and route to
    /// fresh ones. Returns whether any command was issued.
    pub fn validate(&self, channel: &Channel, topology: &dyn Topology) -> bool {
        let command = channel.subscribe_command();
        let flags = CommandFlags::FIRE_AND_FORGET.with_preference(self.preference);
        let mut owners = self.owners.lock();
        let mut changed = false;

        if owners
            .iter()
            .any(|owner| !self.is_eligible(channel, owner, command))
        {
            tracing::debug!(channel = %channel, owners = owners.len(), "dropping stale subscription owners");
            changed |= unsubscribe_locked(&mut owners, channel, flags, true).is_some();
        }

        changed |= self
            .subscribe_locked(&mut owners, channel, flags, true, topology)
            .is_some();
        changed
    }

    /// Whether `owner` may keep carrying the subscription. Role changes count:
    /// keyspace channels live on masters only, and a demanded role must still hold.
    fn is_eligible(&self, channel: &Channel, owner: &Endpoint, command: Command) -> bool {
        if !owner.is_selectable(command) {
            return false;
        }
        if channel.is_keyspace_notification() {
            return !owner.is_replica();
        }
        match self.preference {
            ServerPreference::DemandMaster => !owner.is_replica(),
            ServerPreference::DemandReplica => owner.is_replica(),
            ServerPreference::PreferMaster | ServerPreference::PreferReplica => true,
        }
    }

    fn subscribe_locked(
        &self,
        owners: &mut Vec<Endpoint>,
        channel: &Channel,
        flags: CommandFlags,
        internal: bool,
        topology: &dyn Topology,
    ) -> Option<Completion> {
        if self.is_retired() {
            return None;
        }

        let command = channel.subscribe_command();

        if channel.is_keyspace_notification() {
            let mut sends = Vec::new();
            for master in topology.masters(command) {
                if owners.contains(&master) {
                    continue;
                }
                tracing::debug!(channel = %channel, %command, endpoint = %master, "subscribing on master");
                sends.push(master.execute(command_message(command, channel, flags, internal)));
                owners.push(master);
            }

            if sends.is_empty() {
                if owners.is_empty() {
                    log_no_server(channel, command, internal);
                }
                return None;
            }
            return Some(Completion::all(sends));
        }

        if !owners.is_empty() {
            return None;
        }

        let Some(server) = topology.select_server(command, flags, Some(channel)) else {
            log_no_server(channel, command, internal);
            return None;
        };

        tracing::debug!(channel = %channel, %command, endpoint = %server, "subscribing");
        let completion = server.execute(command_message(command, channel, flags, internal));
        owners.push(server);
        Some(completion)
    }
}

fn unsubscribe_locked(
    owners: &mut Vec<Endpoint>,
    channel: &Channel,
    flags: CommandFlags,
    internal: bool,
) -> Option<Completion> {
    if owners.is_empty() {
        return None;
    }

    let command = channel.unsubscribe_command();
    let sends = owners
        .iter()
        .map(|owner| {
            tracing::debug!(channel = %channel, %command, endpoint = %owner, "unsubscribing");
            owner.execute(command_message(command, channel, flags, internal))
        })
        .collect();

    // Only forget owners once every command has been handed off.
    owners.clear();
    Some(Completion::all(sends))
}

fn command_message(command: Command, channel: &Channel, flags: CommandFlags, internal: bool) -> Message {
    Message::new(command, channel.clone(), flags).with_internal(internal)
}

fn log_no_server(channel: &Channel, command: Command, internal: bool) {
    // Validation retries every pass; only user-initiated misses are worth a warning.
    if internal {
        tracing::debug!(channel = %channel, %command, "no server available for subscription");
    } else {
        tracing::warn!(channel = %channel, %command, "no server available for subscription");
    }
}
