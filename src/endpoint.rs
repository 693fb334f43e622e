//! Server endpoints and cluster topology.
//!
//! Connections, server discovery and selection policy live in the surrounding
//! client. The subscriber only needs the narrow view given by
//! [`ServerEndpoint`] and [`Topology`].

use crate::completion::Completion;
use crate::types::{Channel, Command, CommandFlags, Message, Reply};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// One live connection to a cluster node.
pub trait ServerEndpoint: Send + Sync {
    /// Address used for logging and endpoint introspection.
    fn address(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Whether this endpoint may currently carry `command`.
    fn is_selectable(&self, command: Command) -> bool;

    fn is_replica(&self) -> bool;

    /// Send a message and track its reply.
    ///
    /// Must not block; the returned completion resolves when the reply arrives.
    fn send(&self, message: Message) -> Completion;

    /// Send a message without tracking a reply.
    fn send_fire_and_forget(&self, message: Message);
}

/// Non-owning handle to a [`ServerEndpoint`].
///
/// Two handles are equal when they refer to the same endpoint object.
#[derive(Clone)]
pub struct Endpoint(Arc<dyn ServerEndpoint>);

impl Endpoint {
    pub fn new<E: ServerEndpoint + 'static>(endpoint: E) -> Self {
        Self(Arc::new(endpoint))
    }

    pub fn from_arc(endpoint: Arc<dyn ServerEndpoint>) -> Self {
        Self(endpoint)
    }

    /// Send `message`, honouring its fire-and-forget flag.
    pub fn execute(&self, message: Message) -> Completion {
        if message.is_fire_and_forget() {
            self.0.send_fire_and_forget(message);
            Completion::ready(Reply::Ok)
        } else {
            self.0.send(message)
        }
    }

    fn as_thin_ptr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl Deref for Endpoint {
    type Target = dyn ServerEndpoint;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.as_thin_ptr() == other.as_thin_ptr()
    }
}

impl Eq for Endpoint {}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0.address())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.address())
    }
}

/// Snapshot view of the cluster plus the client's server selection policy.
pub trait Topology: Send + Sync {
    /// Pick one server for `command`, or `None` if nothing is usable.
    fn select_server(
        &self,
        command: Command,
        flags: CommandFlags,
        channel: Option<&Channel>,
    ) -> Option<Endpoint>;

    /// Every currently known endpoint, masters and replicas.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Masters able to carry `command`; the fan-out targets for keyspace
    /// notification channels.
    fn masters(&self, command: Command) -> Vec<Endpoint> {
        self.endpoints()
            .into_iter()
            .filter(|endpoint| !endpoint.is_replica() && endpoint.is_selectable(command))
            .collect()
    }
}
