use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

/// Idle connections to one target, oldest first.
#[derive(Debug)]
pub(super) struct IdleConnections<T> {
    inner: Vec<Idle<T>>,
}

impl<T> Default for IdleConnections<T> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<T> IdleConnections<T> {
    pub(super) fn push(&mut self, inner: T, at: Instant) {
        self.inner.push(Idle { at, inner });
    }

    /// Take the youngest connection which is still usable, discarding unusable ones.
    pub(super) fn pop<F>(&mut self, mut usable: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        trace!("checking {} idle connections", self.len());
        while let Some(entry) = self.inner.pop() {
            if usable(&entry.inner) {
                trace!("found idle connection");
                return Some(entry.inner);
            }
            trace!("found closed connection");
        }
        None
    }

    /// When the oldest connection went idle.
    pub(super) fn oldest(&self) -> Option<Instant> {
        self.inner.first().map(|entry| entry.at)
    }

    pub(super) fn pop_oldest(&mut self) -> Option<T> {
        if self.inner.is_empty() {
            return None;
        }
        Some(self.inner.remove(0).inner)
    }

    /// Remove every connection idle for at least `max_inactive`.
    pub(super) fn expire(&mut self, now: Instant, max_inactive: Duration) -> Vec<T> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.inner)
            .into_iter()
            .partition(|entry| now.saturating_duration_since(entry.at) >= max_inactive);
        self.inner = kept;
        expired.into_iter().map(|entry| entry.inner).collect()
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..).map(|entry| entry.inner)
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
