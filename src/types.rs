//! Core types for channels, commands and protocol messages.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Prefix of keyspace notification channels (`__keyspace@<db>__:<key>`).
pub const KEYSPACE_PREFIX: &[u8] = b"__keyspace@";

/// Prefix of keyevent notification channels (`__keyevent@<db>__:<event>`).
pub const KEYEVENT_PREFIX: &[u8] = b"__keyevent@";

/// How a channel name is interpreted when constructing a [`Channel`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatternMode {
    /// Pattern if the name contains a glob metacharacter (`*`, `?`, `[`).
    #[default]
    Auto,
    /// Always a literal channel.
    Literal,
    /// Always a pattern subscription.
    Pattern,
}

/// A pub/sub channel name, literal or pattern.
///
/// Equality, hashing and ordering cover the name and the pattern flag. The
/// keyspace classification is derived from the name and so never disagrees
/// between equal channels.
#[derive(Clone)]
pub struct Channel {
    name: Arc<[u8]>,
    pattern: bool,
    keyspace: bool,
}

impl Channel {
    /// Create a channel, deciding pattern-ness according to `mode`.
    pub fn new(name: impl Into<Vec<u8>>, mode: PatternMode) -> Self {
        let name: Vec<u8> = name.into();
        let pattern = match mode {
            PatternMode::Auto => name.iter().any(|b| matches!(b, b'*' | b'?' | b'[')),
            PatternMode::Literal => false,
            PatternMode::Pattern => true,
        };
        let keyspace = name.starts_with(KEYSPACE_PREFIX) || name.starts_with(KEYEVENT_PREFIX);

        Self {
            name: Arc::from(name),
            pattern,
            keyspace,
        }
    }

    /// A literal channel, even if the name contains glob characters.
    pub fn literal(name: impl Into<Vec<u8>>) -> Self {
        Self::new(name, PatternMode::Literal)
    }

    /// A pattern subscription.
    pub fn pattern(name: impl Into<Vec<u8>>) -> Self {
        Self::new(name, PatternMode::Pattern)
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern
    }

    /// Whether subscriptions to this channel must be fanned out to every master.
    pub fn is_keyspace_notification(&self) -> bool {
        self.keyspace
    }

    /// SUBSCRIBE for literal channels, PSUBSCRIBE for patterns.
    pub fn subscribe_command(&self) -> Command {
        if self.pattern {
            Command::PSubscribe
        } else {
            Command::Subscribe
        }
    }

    /// UNSUBSCRIBE for literal channels, PUNSUBSCRIBE for patterns.
    pub fn unsubscribe_command(&self) -> Command {
        if self.pattern {
            Command::PUnsubscribe
        } else {
            Command::Unsubscribe
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.name == other.name
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.pattern.hash(state);
    }
}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then(self.pattern.cmp(&other.pattern))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pattern {
            write!(f, "Pattern({:?})", String::from_utf8_lossy(&self.name))
        } else {
            write!(f, "Channel({:?})", String::from_utf8_lossy(&self.name))
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.name))
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Channel::new(name, PatternMode::Auto)
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        Channel::new(name, PatternMode::Auto)
    }
}

impl From<&[u8]> for Channel {
    fn from(name: &[u8]) -> Self {
        Channel::new(name, PatternMode::Auto)
    }
}

impl From<Vec<u8>> for Channel {
    fn from(name: Vec<u8>) -> Self {
        Channel::new(name, PatternMode::Auto)
    }
}

impl From<&Channel> for Channel {
    fn from(channel: &Channel) -> Self {
        channel.clone()
    }
}

/// Protocol commands issued by the subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Publish,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::PSubscribe => "PSUBSCRIBE",
            Command::PUnsubscribe => "PUNSUBSCRIBE",
            Command::Publish => "PUBLISH",
        }
    }

    /// Whether this command registers interest in a channel.
    pub fn is_subscribe(self) -> bool {
        matches!(self, Command::Subscribe | Command::PSubscribe)
    }

    /// Whether this command drops interest in a channel.
    pub fn is_unsubscribe(self) -> bool {
        matches!(self, Command::Unsubscribe | Command::PUnsubscribe)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of server a command should be routed to. Interpreted by the
/// topology's server selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ServerPreference {
    #[default]
    PreferMaster,
    DemandMaster,
    PreferReplica,
    DemandReplica,
}

/// Per-call options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags {
    /// Send without tracking the reply. Failures are never reported.
    pub fire_and_forget: bool,

    /// Routing preference handed to server selection.
    pub preference: ServerPreference,
}

impl CommandFlags {
    pub const NONE: CommandFlags = CommandFlags {
        fire_and_forget: false,
        preference: ServerPreference::PreferMaster,
    };

    pub const FIRE_AND_FORGET: CommandFlags = CommandFlags {
        fire_and_forget: true,
        preference: ServerPreference::PreferMaster,
    };

    pub fn with_preference(self, preference: ServerPreference) -> Self {
        Self { preference, ..self }
    }

    pub fn with_fire_and_forget(self, fire_and_forget: bool) -> Self {
        Self {
            fire_and_forget,
            ..self
        }
    }
}

/// A protocol command addressed to one endpoint.
#[derive(Clone, Debug)]
pub struct Message {
    pub command: Command,
    pub channel: Channel,
    pub payload: Option<Vec<u8>>,
    pub flags: CommandFlags,
    /// Issued by resend/validation logic rather than by a caller.
    pub internal: bool,
}

impl Message {
    pub fn new(command: Command, channel: Channel, flags: CommandFlags) -> Self {
        Self {
            command,
            channel,
            payload: None,
            flags,
            internal: false,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.flags.fire_and_forget
    }
}

/// A successful server reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
}

impl Reply {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }
}
