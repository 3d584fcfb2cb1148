//! Client proxy for the master of a region
//!
//! A [`MasterAccess`] is one client session. Callers take a token first (this
//! fixes the operation's place in the session's order) and then run the
//! operation with it. A token pairs the session's FIFO ticket with the
//! caller's [`OrderToken`]; `new_*_token` checks in on a source owned by the
//! session for callers that keep no causal bookkeeping of their own.
//! Requests reach the master in any order; the master's FIFO sink puts them
//! back in ticket order.
//!
//! A token that never reaches the master would block every later operation of
//! the session, so tokens whose operation could not be sent are remembered and
//! released with an `Abandon` message on the next contact. When a different
//! master is published the session starts over; tokens taken before the switch
//! fail with [`Error::CannotPerformQuery`].

use crate::config::{ReadMode, ReplicationConfig};
use crate::directory::DirectoryView;
use crate::fifo::{FifoSource, FifoTicket, ReadTicket, WriteTicket};
use crate::mailbox::{MailboxAddress, MailboxManager};
use crate::order::{OrderSource, OrderToken};
use crate::protocol::{MasterCard, MasterRequest, Payload, Protocol};
use crate::{Error, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Position of a read in the session order
#[derive(Debug)]
#[must_use = "a token that is never used blocks every later operation of the session"]
pub struct ReadToken {
    ticket: ReadTicket,
    order: OrderToken,
}

/// Position of a write in the session order
#[derive(Debug)]
#[must_use = "a token that is never used blocks every later operation of the session"]
pub struct WriteToken {
    ticket: WriteTicket,
    order: OrderToken,
}

struct Session<P: Protocol> {
    master: Option<MailboxAddress<MasterRequest<P>>>,
    source: FifoSource,
    abandoned: Vec<FifoTicket>,
}

/// Client session against the master of one region
pub struct MasterAccess<P: Protocol> {
    mailbox: MailboxManager,
    master: DirectoryView<MasterCard<P>>,
    config: ReplicationConfig,
    session: Mutex<Session<P>>,
    order_source: OrderSource,
}

impl<P: Protocol> MasterAccess<P> {
    /// Open a session against whichever master `master` publishes
    pub fn new(
        mailbox: MailboxManager,
        master: DirectoryView<MasterCard<P>>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            mailbox,
            master,
            config,
            session: Mutex::new(Session {
                master: None,
                source: FifoSource::new(),
                abandoned: Vec::new(),
            }),
            order_source: OrderSource::new(),
        }
    }

    /// Take the next read slot, ordered by the session's own source
    pub fn new_read_token(&self) -> ReadToken {
        let session = self.session.lock();
        ReadToken {
            ticket: session.source.enter_read(),
            order: self.order_source.check_in("read"),
        }
    }

    /// Take the next read slot for an operation the caller checked in on
    /// its own [`OrderSource`]
    pub fn new_read_token_with(&self, order: OrderToken) -> ReadToken {
        ReadToken {
            ticket: self.session.lock().source.enter_read(),
            order,
        }
    }

    /// Take the next write slot, ordered by the session's own source
    pub fn new_write_token(&self) -> WriteToken {
        let session = self.session.lock();
        WriteToken {
            ticket: session.source.enter_write(),
            order: self.order_source.check_in("write"),
        }
    }

    /// Take the next write slot for an operation the caller checked in on
    /// its own [`OrderSource`]
    pub fn new_write_token_with(&self, order: OrderToken) -> WriteToken {
        WriteToken {
            ticket: self.session.lock().source.enter_write(),
            order,
        }
    }

    /// Read at the configured default mode
    pub async fn read(
        &self,
        read: P::Read,
        token: ReadToken,
        interruptor: &CancellationToken,
    ) -> Result<P::ReadResponse> {
        self.read_with_mode(read, self.config.default_read_mode, token, interruptor)
            .await
    }

    /// Read at an explicit mode
    pub async fn read_with_mode(
        &self,
        read: P::Read,
        mode: ReadMode,
        token: ReadToken,
        interruptor: &CancellationToken,
    ) -> Result<P::ReadResponse> {
        let ReadToken { ticket, order } = token;
        self.request(
            ticket.into(),
            |reply| MasterRequest::Read {
                read,
                mode,
                order_token: order,
                ticket,
                reply,
            },
            interruptor,
        )
        .await
    }

    /// Write
    pub async fn write(
        &self,
        write: P::Write,
        token: WriteToken,
        interruptor: &CancellationToken,
    ) -> Result<P::WriteResponse> {
        let WriteToken { ticket, order } = token;
        self.request(
            ticket.into(),
            |reply| MasterRequest::Write {
                write,
                order_token: order,
                ticket,
                reply,
            },
            interruptor,
        )
        .await
    }

    async fn request<R: Payload>(
        &self,
        ticket: FifoTicket,
        build: impl FnOnce(MailboxAddress<Result<R>>) -> MasterRequest<P>,
        interruptor: &CancellationToken,
    ) -> Result<R> {
        let known = tokio::time::timeout(
            self.config.request_timeout,
            self.master.wait_known(interruptor),
        )
        .await;
        let card = match known {
            Ok(Ok(Some(card))) => card,
            Ok(Ok(None)) | Err(_) => {
                self.abandon(ticket);
                return Err(Error::cannot_perform_query("no master is available"));
            }
            Ok(Err(e)) => {
                self.abandon(ticket);
                return Err(e);
            }
        };

        let abandoned = self.bind(&card, ticket)?;
        for stale in abandoned {
            if let Err(e) = self.mailbox.send(&card.requests, &MasterRequest::Abandon { ticket: stale }) {
                tracing::debug!("Abandoned ticket not delivered: {}", e);
                self.abandon(stale);
            }
        }

        if interruptor.is_cancelled() {
            self.abandon(ticket);
            return Err(Error::Interrupted);
        }

        let mut reply_box = self.mailbox.create::<Result<R>>();
        if let Err(e) = self.mailbox.send(&card.requests, &build(reply_box.address())) {
            self.abandon(ticket);
            return Err(Error::cannot_perform_query(format!("master unreachable: {}", e)));
        }

        tokio::select! {
            reply = reply_box.recv() => {
                reply.unwrap_or_else(|| Err(Error::transport("reply mailbox closed")))
            }
            _ = interruptor.cancelled() => Err(Error::Interrupted),
            _ = tokio::time::sleep(self.config.request_timeout) => {
                Err(Error::cannot_perform_query("master did not answer in time"))
            }
            _ = self.master.wait_absent() => {
                Err(Error::cannot_perform_query("master went away"))
            }
        }
    }

    /// Tie the session to `card`'s master and check that `ticket` belongs to
    /// the current session. Returns tickets waiting to be abandoned.
    fn bind(&self, card: &MasterCard<P>, ticket: FifoTicket) -> Result<Vec<FifoTicket>> {
        let mut session = self.session.lock();
        if session.master != Some(card.requests) {
            if let Some(previous) = session.master {
                let disconnect = MasterRequest::Disconnect {
                    session: session.source.session(),
                };
                if let Err(e) = self.mailbox.send(&previous, &disconnect) {
                    tracing::debug!("Disconnect not delivered to previous master: {}", e);
                }
                session.source = FifoSource::new();
                session.abandoned.clear();
                tracing::info!(session = %session.source.session(), "Master changed, starting new session");
            }
            session.master = Some(card.requests);
        }

        if ticket.session() != session.source.session() {
            return Err(Error::cannot_perform_query(
                "token was taken before the master changed",
            ));
        }
        Ok(std::mem::take(&mut session.abandoned))
    }

    fn abandon(&self, ticket: FifoTicket) {
        let mut session = self.session.lock();
        if ticket.session() == session.source.session() {
            session.abandoned.push(ticket);
        }
    }
}

impl<P: Protocol> Drop for MasterAccess<P> {
    fn drop(&mut self) {
        let session = self.session.lock();
        if let Some(master) = session.master {
            let disconnect = MasterRequest::Disconnect {
                session: session.source.session(),
            };
            if let Err(e) = self.mailbox.send(&master, &disconnect) {
                tracing::debug!("Disconnect not delivered: {}", e);
            }
        }
    }
}
