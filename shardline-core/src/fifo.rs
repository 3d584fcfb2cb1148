//! FIFO enforcement for one client session
//!
//! The client side owns a [`FifoSource`] and hands out one ticket per
//! operation. The routing side owns the matching [`FifoSink`] and makes every
//! operation wait for its ticket to become current, no matter in which order
//! the requests arrive.
//!
//! Reads and writes use separate tickets. A read ticket records how many
//! writes were issued before it; a write ticket additionally records how many
//! reads were issued since the previous write. Reads issued between the same
//! two writes may therefore run concurrently, while a write waits for every
//! earlier read and write to exit.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies one source/sink pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh session id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Admission ticket for a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadTicket {
    /// Issuing session
    pub session: SessionId,
    /// Writes issued before this read
    pub timestamp: u64,
}

/// Admission ticket for a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTicket {
    /// Issuing session
    pub session: SessionId,
    /// Writes issued before this write
    pub timestamp: u64,
    /// Reads issued since the previous write
    pub preceding_reads: u64,
}

/// Either kind of ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FifoTicket {
    /// Read ticket
    Read(ReadTicket),
    /// Write ticket
    Write(WriteTicket),
}

impl FifoTicket {
    /// Issuing session
    pub fn session(&self) -> SessionId {
        match self {
            Self::Read(t) => t.session,
            Self::Write(t) => t.session,
        }
    }
}

impl From<ReadTicket> for FifoTicket {
    fn from(ticket: ReadTicket) -> Self {
        Self::Read(ticket)
    }
}

impl From<WriteTicket> for FifoTicket {
    fn from(ticket: WriteTicket) -> Self {
        Self::Write(ticket)
    }
}

#[derive(Debug, Default)]
struct SourceState {
    timestamp: u64,
    reads: u64,
}

/// Client-side ticket issuer
#[derive(Debug)]
pub struct FifoSource {
    session: SessionId,
    state: Mutex<SourceState>,
}

impl FifoSource {
    /// Create a source for a fresh session
    pub fn new() -> Self {
        Self {
            session: SessionId::new(),
            state: Mutex::new(SourceState::default()),
        }
    }

    /// Session this source issues tickets for
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Issue a read ticket
    pub fn enter_read(&self) -> ReadTicket {
        let mut state = self.state.lock();
        state.reads += 1;
        ReadTicket {
            session: self.session,
            timestamp: state.timestamp,
        }
    }

    /// Issue a write ticket
    pub fn enter_write(&self) -> WriteTicket {
        let mut state = self.state.lock();
        let ticket = WriteTicket {
            session: self.session,
            timestamp: state.timestamp,
            preceding_reads: state.reads,
        };
        state.timestamp += 1;
        state.reads = 0;
        ticket
    }
}

impl Default for FifoSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct SinkState {
    timestamp: u64,
    finished_reads: u64,
}

#[derive(Debug)]
struct SinkInner {
    session: SessionId,
    state: Mutex<SinkState>,
    changed: Notify,
}

/// Routing-side gate for one session
#[derive(Debug, Clone)]
pub struct FifoSink {
    inner: Arc<SinkInner>,
}

#[derive(Debug, Clone, Copy)]
enum ExitKind {
    Read,
    Write,
}

/// Held while an admitted operation is being ordered.
///
/// Dropping it lets the next operation of the session in.
#[derive(Debug)]
#[must_use = "dropping the exit immediately admits the next operation"]
pub struct FifoExit {
    inner: Arc<SinkInner>,
    kind: ExitKind,
}

impl Drop for FifoExit {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            match self.kind {
                ExitKind::Read => state.finished_reads += 1,
                ExitKind::Write => {
                    state.timestamp += 1;
                    state.finished_reads = 0;
                }
            }
        }
        self.inner.changed.notify_waiters();
    }
}

impl FifoSink {
    /// Create the sink for `session`
    pub fn new(session: SessionId) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                session,
                state: Mutex::new(SinkState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Session this sink gates
    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    /// Writes that have exited so far
    pub fn finished_writes(&self) -> u64 {
        self.inner.state.lock().timestamp
    }

    /// Wait until `ticket` is current and admit the read
    pub async fn enter_read(
        &self,
        ticket: ReadTicket,
        interruptor: &CancellationToken,
    ) -> Result<FifoExit> {
        self.check_session(ticket.session)?;
        self.wait_until(interruptor, |state| {
            if state.timestamp > ticket.timestamp {
                return Err(Error::internal(format!(
                    "read ticket at {} presented after write {} exited",
                    ticket.timestamp, state.timestamp
                )));
            }
            Ok(state.timestamp == ticket.timestamp)
        })
        .await?;
        Ok(self.exit(ExitKind::Read))
    }

    /// Wait until `ticket` is current and admit the write
    pub async fn enter_write(
        &self,
        ticket: WriteTicket,
        interruptor: &CancellationToken,
    ) -> Result<FifoExit> {
        self.check_session(ticket.session)?;
        self.wait_until(interruptor, |state| {
            if state.timestamp > ticket.timestamp
                || (state.timestamp == ticket.timestamp
                    && state.finished_reads > ticket.preceding_reads)
            {
                return Err(Error::internal(format!(
                    "write ticket at {} presented twice",
                    ticket.timestamp
                )));
            }
            Ok(state.timestamp == ticket.timestamp
                && state.finished_reads == ticket.preceding_reads)
        })
        .await?;
        Ok(self.exit(ExitKind::Write))
    }

    /// Admit either kind of ticket
    pub async fn enter(
        &self,
        ticket: FifoTicket,
        interruptor: &CancellationToken,
    ) -> Result<FifoExit> {
        match ticket {
            FifoTicket::Read(t) => self.enter_read(t, interruptor).await,
            FifoTicket::Write(t) => self.enter_write(t, interruptor).await,
        }
    }

    /// Consume a ticket whose operation will never run
    pub async fn skip(&self, ticket: FifoTicket) -> Result<()> {
        let exit = self.enter(ticket, &CancellationToken::new()).await?;
        drop(exit);
        Ok(())
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        if session != self.inner.session {
            return Err(Error::internal(format!(
                "ticket of session {} presented to sink of session {}",
                session, self.inner.session
            )));
        }
        Ok(())
    }

    fn exit(&self, kind: ExitKind) -> FifoExit {
        FifoExit {
            inner: Arc::clone(&self.inner),
            kind,
        }
    }

    async fn wait_until(
        &self,
        interruptor: &CancellationToken,
        ready: impl Fn(&SinkState) -> Result<bool>,
    ) -> Result<()> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            // Register before checking so an exit between check and await is not lost
            notified.as_mut().enable();

            let is_ready = ready(&*self.inner.state.lock())?;
            if is_ready {
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = interruptor.cancelled() => return Err(Error::Interrupted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_order_tickets_enter_immediately() {
        let source = FifoSource::new();
        let sink = FifoSink::new(source.session());
        let never = CancellationToken::new();

        let w = source.enter_write();
        drop(sink.enter_write(w, &never).await.unwrap());
        let r = source.enter_read();
        drop(sink.enter_read(r, &never).await.unwrap());
        assert_eq!(sink.finished_writes(), 1);
    }

    #[tokio::test]
    async fn test_write_waits_for_earlier_read() {
        let source = FifoSource::new();
        let sink = FifoSink::new(source.session());
        let never = CancellationToken::new();

        let r = source.enter_read();
        let w = source.enter_write();

        let writer = {
            let sink = sink.clone();
            let never = never.clone();
            tokio::spawn(async move { sink.enter_write(w, &never).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        drop(sink.enter_read(r, &never).await.unwrap());
        writer.await.unwrap().unwrap();
        assert_eq!(sink.finished_writes(), 1);
    }

    #[tokio::test]
    async fn test_reads_between_writes_run_concurrently() {
        let source = FifoSource::new();
        let sink = FifoSink::new(source.session());
        let never = CancellationToken::new();

        let r1 = source.enter_read();
        let r2 = source.enter_read();
        let a = sink.enter_read(r2, &never).await.unwrap();
        let b = sink.enter_read(r1, &never).await.unwrap();
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_interrupted_wait() {
        let source = FifoSource::new();
        let sink = FifoSink::new(source.session());
        let _first = source.enter_write();
        let second = source.enter_write();

        let interruptor = CancellationToken::new();
        interruptor.cancel();
        let err = sink.enter_write(second, &interruptor).await.unwrap_err();
        assert_eq!(err, Error::Interrupted);
    }

    #[tokio::test]
    async fn test_skip_unblocks_successor() {
        let source = FifoSource::new();
        let sink = FifoSink::new(source.session());
        let never = CancellationToken::new();

        let lost = source.enter_write();
        let next = source.enter_read();
        sink.skip(lost.into()).await.unwrap();
        drop(sink.enter_read(next, &never).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_ticket_rejected() {
        let sink = FifoSink::new(SessionId::new());
        let other = FifoSource::new();
        let err = sink
            .enter_read(other.enter_read(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_reused_write_ticket_rejected() {
        let source = FifoSource::new();
        let sink = FifoSink::new(source.session());
        let never = CancellationToken::new();
        let w = source.enter_write();
        drop(sink.enter_write(w, &never).await.unwrap());
        assert!(sink.enter_write(w, &never).await.is_err());
    }

    fn run_shuffled(ops: Vec<bool>, order: Vec<usize>) -> Vec<usize> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let source = FifoSource::new();
            let sink = FifoSink::new(source.session());
            let tickets: Vec<FifoTicket> = ops
                .iter()
                .map(|is_write| {
                    if *is_write {
                        source.enter_write().into()
                    } else {
                        source.enter_read().into()
                    }
                })
                .collect();

            let entered = Arc::new(Mutex::new(Vec::new()));
            let mut handles = Vec::new();
            for index in order {
                let sink = sink.clone();
                let entered = Arc::clone(&entered);
                let ticket = tickets[index];
                handles.push(tokio::spawn(async move {
                    let exit = sink.enter(ticket, &CancellationToken::new()).await.unwrap();
                    entered.lock().push(index);
                    tokio::task::yield_now().await;
                    drop(exit);
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            let entered = entered.lock().clone();
            entered
        })
    }

    proptest! {
        #[test]
        fn prop_writes_are_admitted_in_issue_order(
            (ops, order) in prop::collection::vec(any::<bool>(), 1..24)
                .prop_flat_map(|ops| {
                    let indices: Vec<usize> = (0..ops.len()).collect();
                    (Just(ops), Just(indices).prop_shuffle())
                })
        ) {
            let entered = run_shuffled(ops.clone(), order);
            prop_assert_eq!(entered.len(), ops.len());
            for (position, index) in entered.iter().enumerate() {
                if ops[*index] {
                    for earlier in &entered[..position] {
                        prop_assert!(earlier < index);
                    }
                    for later in &entered[position + 1..] {
                        prop_assert!(later > index);
                    }
                }
            }
        }
    }
}
