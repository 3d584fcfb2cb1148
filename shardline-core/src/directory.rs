//! Observable directory of business cards
//!
//! A component publishes its card in a [`DirectoryEntry`]; everyone who needs
//! to reach it holds a [`DirectoryView`]. A view distinguishes "not heard of
//! yet" from "known to be gone", which is what lets a client proxy fail fast
//! when the master is definitely absent instead of waiting forever.

use crate::{Error, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Current knowledge about one directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// Nothing has been published yet
    Unknown,
    /// The component was published and has since gone away
    Absent,
    /// The component is live
    Present(T),
}

impl<T> Lookup<T> {
    /// The published value, if live
    pub fn present(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            _ => None,
        }
    }
}

/// Publishing side of a directory entry
#[derive(Debug)]
pub struct DirectoryEntry<T> {
    tx: watch::Sender<Lookup<T>>,
}

impl<T: Clone + Send + Sync + 'static> DirectoryEntry<T> {
    /// Entry with a live value
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(Lookup::Present(value));
        Self { tx }
    }

    /// Entry nothing has been published in yet
    pub fn unknown() -> Self {
        let (tx, _) = watch::channel(Lookup::Unknown);
        Self { tx }
    }

    /// Publish or replace the value
    pub fn publish(&self, value: T) {
        self.tx.send_replace(Lookup::Present(value));
    }

    /// Mark the component as gone
    pub fn retract(&self) {
        self.tx.send_replace(Lookup::Absent);
    }

    /// Forget everything known about the entry
    pub fn reset(&self) {
        self.tx.send_replace(Lookup::Unknown);
    }

    /// Observer handle
    pub fn view(&self) -> DirectoryView<T> {
        DirectoryView {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observing side of a directory entry
#[derive(Debug, Clone)]
pub struct DirectoryView<T> {
    rx: watch::Receiver<Lookup<T>>,
}

impl<T: Clone + Send + Sync + 'static> DirectoryView<T> {
    /// Snapshot of the entry
    pub fn lookup(&self) -> Lookup<T> {
        self.rx.borrow().clone()
    }

    /// Wait until the entry is either present or absent.
    ///
    /// Returns `None` when it is absent. A dropped publisher counts as absent.
    pub async fn wait_known(&self, interruptor: &CancellationToken) -> Result<Option<T>> {
        let mut rx = self.rx.clone();
        tokio::select! {
            result = rx.wait_for(|lookup| !matches!(lookup, Lookup::Unknown)) => {
                let value = match result {
                    Ok(lookup) => lookup.clone().present(),
                    Err(_) => None,
                };
                Ok(value)
            }
            _ = interruptor.cancelled() => Err(Error::Interrupted),
        }
    }

    /// Resolve once the entry is absent or its publisher is gone
    pub async fn wait_absent(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|lookup| matches!(lookup, Lookup::Absent)).await;
    }
}
