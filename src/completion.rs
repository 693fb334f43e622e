//! Deferred results of network exchanges.
//!
//! Every routing operation returns a [`Completion`] straight away; nothing in
//! the subscriber blocks on the network. Synchronous wrappers call
//! [`Completion::wait_timeout`] on the handle they were given.

use crate::error::{Result, SubscriberError};
use crate::types::Reply;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::time::{Duration, Instant};

/// Handle to the eventual outcome of one or more network exchanges.
pub struct Completion {
    state: State,
}

enum State {
    Ready(Result<Reply>),
    Pending(Receiver<Result<Reply>>),
    /// Resolves once every part has resolved.
    All(Vec<Completion>),
}

/// The resolving side of a pending [`Completion`].
///
/// Dropping it without calling [`Completer::complete`] resolves the
/// completion with [`SubscriberError::ConnectionClosed`].
pub struct Completer {
    sender: Sender<Result<Reply>>,
}

impl Completer {
    pub fn complete(self, result: Result<Reply>) {
        // The waiting side may already have given up.
        let _ = self.sender.send(result);
    }
}

impl Completion {
    /// Create an unresolved completion and the handle that resolves it.
    pub fn pending() -> (Completer, Completion) {
        let (sender, receiver) = bounded(1);
        (
            Completer { sender },
            Completion {
                state: State::Pending(receiver),
            },
        )
    }

    pub fn ready(reply: Reply) -> Self {
        Self {
            state: State::Ready(Ok(reply)),
        }
    }

    /// An already-resolved completion meaning "nothing left to do".
    pub fn done() -> Self {
        Self::ready(Reply::Ok)
    }

    pub fn failed(error: SubscriberError) -> Self {
        Self {
            state: State::Ready(Err(error)),
        }
    }

    /// Join several completions. The result is `Ok` only if every part
    /// succeeds; otherwise it is the first failure, reported after all parts
    /// have resolved.
    pub fn all(mut parts: Vec<Completion>) -> Self {
        match parts.len() {
            0 => Self::done(),
            1 => parts.remove(0),
            _ => Self {
                state: State::All(parts),
            },
        }
    }

    /// Check for a result without blocking.
    pub fn is_complete(&mut self) -> bool {
        let outcome = match &mut self.state {
            State::Ready(_) => return true,
            State::All(parts) => return parts.iter_mut().all(Completion::is_complete),
            State::Pending(receiver) => match receiver.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => Err(SubscriberError::ConnectionClosed),
            },
        };

        self.state = State::Ready(outcome);
        true
    }

    /// Block until resolved.
    pub fn wait(self) -> Result<Reply> {
        match self.state {
            State::Ready(result) => result,
            State::Pending(receiver) => receiver
                .recv()
                .unwrap_or(Err(SubscriberError::ConnectionClosed)),
            State::All(parts) => first_error(parts.into_iter().map(Completion::wait)),
        }
    }

    /// Block until resolved or until `timeout` elapses.
    ///
    /// Timing out does not cancel the exchange; it may still complete later.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Reply> {
        self.wait_until(Instant::now() + timeout, timeout)
    }

    fn wait_until(self, deadline: Instant, timeout: Duration) -> Result<Reply> {
        match self.state {
            State::Ready(result) => result,
            State::Pending(receiver) => match receiver.recv_deadline(deadline) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(SubscriberError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => Err(SubscriberError::ConnectionClosed),
            },
            State::All(parts) => first_error(
                parts
                    .into_iter()
                    .map(|part| part.wait_until(deadline, timeout)),
            ),
        }
    }
}

/// Drive every result to completion and keep the first error.
fn first_error(results: impl Iterator<Item = Result<Reply>>) -> Result<Reply> {
    let mut error = None;
    for result in results {
        if let Err(e) = result {
            error.get_or_insert(e);
        }
    }

    match error {
        Some(e) => Err(e),
        None => Ok(Reply::Ok),
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Ready(Ok(reply)) => write!(f, "Completion(Ready({:?}))", reply),
            State::Ready(Err(e)) => write!(f, "Completion(Failed({}))", e),
            State::Pending(_) => write!(f, "Completion(Pending)"),
            State::All(parts) => write!(f, "Completion(All({}))", parts.len()),
        }
    }
}
