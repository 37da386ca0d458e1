//! Readiness sets for the session event loop
//!
//! The forwarding core never waits itself. It only contributes descriptors
//! to an [`FdSet`] and consumes the set the event loop hands back after its
//! multiplexed wait. [`poll_sets`], [`poll_writable`] and [`poll_readable`] are a
//! minimal poll(2) based wait for loops that do not bring their own.

use std::collections::BTreeSet;
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// A set of file descriptors, the moral equivalent of `fd_set`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdSet {
    fds: BTreeSet<RawFd>,
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: RawFd) {
        self.fds.insert(fd);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> bool {
        self.fds.remove(&fd)
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Highest descriptor in the set, for select(2)-style callers.
    pub fn max_fd(&self) -> Option<RawFd> {
        self.fds.iter().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fds.iter().copied()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }
}

impl FromIterator<RawFd> for FdSet {
    fn from_iter<I: IntoIterator<Item = RawFd>>(iter: I) -> Self {
        Self {
            fds: iter.into_iter().collect(),
        }
    }
}

/// Wait until some descriptors in `interest` are writable.
///
/// Errors and hang-ups count as ready, so a failed connect is reported
/// through `SO_ERROR` like a successful one.
pub fn poll_writable(interest: &FdSet, timeout: Option<Duration>) -> io::Result<FdSet> {
    poll_set(interest, PollFlags::POLLOUT, timeout)
}

/// Wait until some descriptors in `interest` are readable (or accepting).
pub fn poll_readable(interest: &FdSet, timeout: Option<Duration>) -> io::Result<FdSet> {
    poll_set(interest, PollFlags::POLLIN, timeout)
}

/// Wait on a read set and a write set at once, as a session loop does.
/// Returns the ready subsets in the same order.
pub fn poll_sets(
    read: &FdSet,
    write: &FdSet,
    timeout: Option<Duration>,
) -> io::Result<(FdSet, FdSet)> {
    let mut interest: Vec<(RawFd, PollFlags)> = Vec::with_capacity(read.len() + write.len());
    for fd in read.iter().chain(write.iter()) {
        let mut events = PollFlags::empty();
        if read.contains(fd) {
            events |= PollFlags::POLLIN;
        }
        if write.contains(fd) {
            events |= PollFlags::POLLOUT;
        }
        if !interest.iter().any(|&(seen, _)| seen == fd) {
            interest.push((fd, events));
        }
    }

    let revents = wait(&interest, timeout)?;

    let mut readable = FdSet::new();
    let mut writable = FdSet::new();
    let failed = PollFlags::POLLERR | PollFlags::POLLHUP;
    for (&(fd, events), r) in interest.iter().zip(revents) {
        if events.contains(PollFlags::POLLIN) && r.intersects(PollFlags::POLLIN | failed) {
            readable.insert(fd);
        }
        if events.contains(PollFlags::POLLOUT) && r.intersects(PollFlags::POLLOUT | failed) {
            writable.insert(fd);
        }
    }
    Ok((readable, writable))
}

fn poll_set(interest: &FdSet, events: PollFlags, timeout: Option<Duration>) -> io::Result<FdSet> {
    let interest: Vec<(RawFd, PollFlags)> = interest.iter().map(|fd| (fd, events)).collect();
    let revents = wait(&interest, timeout)?;

    let ready_mask = events | PollFlags::POLLERR | PollFlags::POLLHUP;
    Ok(interest
        .iter()
        .zip(revents)
        .filter(|(_, r)| r.intersects(ready_mask))
        .map(|(&(fd, _), _)| fd)
        .collect())
}

/// poll(2) over `(fd, events)` pairs; returns each entry's revents.
fn wait(interest: &[(RawFd, PollFlags)], timeout: Option<Duration>) -> io::Result<Vec<PollFlags>> {
    if interest.is_empty() {
        return Ok(Vec::new());
    }

    let mut pollfds: Vec<PollFd<'_>> = interest
        .iter()
        // SAFETY: the caller keeps every registered descriptor open for the
        // duration of the wait; they belong to live attempts or listeners.
        .map(|&(fd, events)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, events))
        .collect();

    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
    };
    poll(&mut pollfds, timeout).map_err(io::Error::from)?;

    Ok(pollfds
        .iter()
        .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
        .collect())
}
