//! Pending Connection Set
//!
//! Holds every in-flight outbound attempt of a session. The event loop
//! calls [`PendingSet::populate_write_set`] before its wait and
//! [`PendingSet::consume_write_set`] after it. Attempts are removed from
//! the set before their callback runs, so a callback never observes its
//! own attempt.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;

use slab::Slab;
use tracing::{debug, trace};

use super::connect::{
    AttemptState, BindSource, ConnectCallback, ConnectOptions, ConnectResult, ConnectionAttempt,
    FastOpen, KernelFastOpen,
};
use super::queue::SharedWriteQueue;
use super::readiness::FdSet;
use super::resolver::Resolve;
use super::socket::{max_unix_path_len, Priority};

/// Opaque reference to a pending attempt.
///
/// Stays safe to use after the attempt finished: a stale handle simply
/// matches nothing, even if its slot was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectHandle {
    key: usize,
    generation: u64,
}

struct Entry {
    generation: u64,
    attempt: ConnectionAttempt,
}

/// Insertion-ordered collection of outbound connection attempts.
pub struct PendingSet {
    entries: Slab<Entry>,
    order: Vec<usize>,
    next_generation: u64,
    resolver: Rc<dyn Resolve>,
    fast_open: Rc<dyn FastOpen>,
    options: ConnectOptions,
    max_fd: RawFd,
}

impl PendingSet {
    pub fn new(resolver: Rc<dyn Resolve>, options: ConnectOptions) -> Self {
        Self {
            entries: Slab::new(),
            order: Vec::new(),
            next_generation: 0,
            resolver,
            fast_open: Rc::new(KernelFastOpen),
            options,
            max_fd: -1,
        }
    }

    /// Replace the kernel fast-open sender.
    pub fn with_fast_open(mut self, fast_open: Rc<dyn FastOpen>) -> Self {
        self.fast_open = fast_open;
        self
    }

    /// Start connecting to `host`/`port`.
    ///
    /// Resolution happens now. Sockets are opened on the next populate, and
    /// the callback fires from a later populate or consume, never from here.
    pub fn begin_connect(
        &mut self,
        host: &str,
        port: &str,
        bind: Option<BindSource>,
        priority: Priority,
        callback: impl FnOnce(ConnectResult) + 'static,
    ) -> ConnectHandle {
        trace!("enter connect_remote {} port {}", host, port);
        let attempt = ConnectionAttempt::remote(
            &*self.resolver,
            host,
            port,
            bind,
            priority,
            Box::new(callback),
        );
        self.insert(attempt)
    }

    /// Start connecting to a Unix-domain stream socket.
    ///
    /// A path longer than the platform limit fails synchronously: the
    /// callback receives the failure before this returns `None`.
    pub fn begin_connect_unix(
        &mut self,
        path: &Path,
        priority: Priority,
        callback: impl FnOnce(ConnectResult) + 'static,
    ) -> Option<ConnectHandle> {
        if path.as_os_str().len() > max_unix_path_len() {
            debug!("streamlocal path too long: {}", path.display());
            callback(ConnectResult::Failed("Stream path too long".to_string()));
            return None;
        }
        let callback: ConnectCallback = Box::new(callback);
        Some(self.insert(ConnectionAttempt::unix(path, priority, callback)))
    }

    fn insert(&mut self, attempt: ConnectionAttempt) -> ConnectHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let key = self.entries.insert(Entry {
            generation,
            attempt,
        });
        self.order.push(key);
        ConnectHandle { key, generation }
    }

    fn get_mut(&mut self, handle: ConnectHandle) -> Option<&mut ConnectionAttempt> {
        self.entries
            .get_mut(handle.key)
            .filter(|e| e.generation == handle.generation)
            .map(|e| &mut e.attempt)
    }

    fn remove(&mut self, key: usize) -> ConnectionAttempt {
        self.order.retain(|&k| k != key);
        self.entries.remove(key).attempt
    }

    pub fn contains(&self, handle: ConnectHandle) -> bool {
        self.state(handle).is_some()
    }

    pub fn state(&self, handle: ConnectHandle) -> Option<AttemptState> {
        self.entries
            .get(handle.key)
            .filter(|e| e.generation == handle.generation)
            .map(|e| e.attempt.state())
    }

    /// Associate the session's outbound queue with an attempt, enabling
    /// fast open. Returns false for a finished attempt.
    pub fn set_write_queue(&mut self, handle: ConnectHandle, queue: SharedWriteQueue) -> bool {
        match self.get_mut(handle) {
            Some(attempt) => {
                attempt.set_write_queue(queue);
                true
            }
            None => false,
        }
    }

    /// Neutralize an attempt's callback. The attempt keeps running; a late
    /// success closes its socket, a late failure is silent.
    pub fn cancel(&mut self, handle: ConnectHandle) -> bool {
        match self.get_mut(handle) {
            Some(attempt) => {
                attempt.cancel();
                true
            }
            None => false,
        }
    }

    /// Advance every attempt without a socket and add pending sockets to `set`.
    ///
    /// Attempts whose candidates ran out are removed and their callback gets
    /// the failure.
    pub fn populate_write_set(&mut self, set: &mut FdSet) {
        for key in self.order.clone() {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            let attempt = &mut entry.attempt;

            if attempt.raw_fd().is_none() {
                attempt.try_next(&*self.resolver, &*self.fast_open, &self.options);
            }

            match attempt.raw_fd() {
                Some(fd) => {
                    set.insert(fd);
                    self.max_fd = self.max_fd.max(fd);
                }
                None => {
                    let mut attempt = self.remove(key);
                    let error = attempt.take_error();
                    debug!("connect to {} failed: {}", attempt.target(), error);
                    attempt.complete(ConnectResult::Failed(error));
                }
            }
        }
    }

    /// Resolve attempts whose socket is in `ready`.
    ///
    /// Successes are removed and handed to their callback; failures close
    /// the socket and wait for the next populate to try another candidate.
    /// Returns the number of attempts completed.
    pub fn consume_write_set(&mut self, ready: &FdSet) -> usize {
        let mut completed = 0;
        for key in self.order.clone() {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            let attempt = &mut entry.attempt;
            let Some(fd) = attempt.raw_fd() else {
                continue;
            };
            if !ready.contains(fd) {
                continue;
            }

            trace!("handling {} socket {}", attempt.target(), fd);
            if let Some(socket) = attempt.check_connected() {
                let attempt = self.remove(key);
                debug!("connected to {} on fd {}", attempt.target(), fd);
                attempt.complete(ConnectResult::Connected(socket));
                completed += 1;
            }
        }
        completed
    }

    /// Highest descriptor this set has registered, for select(2)-style loops.
    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every attempt without invoking callbacks. Open sockets close.
    pub fn clear(&mut self) {
        trace!("clearing {} pending connections", self.entries.len());
        self.order.clear();
        self.entries.clear();
    }
}

impl Drop for PendingSet {
    fn drop(&mut self) {
        self.clear();
    }
}
