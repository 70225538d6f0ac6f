//! Per-connection event handling.
//!
//! A [`Session`] receives the milter lifecycle events for one connection,
//! builds up a [`MailRecord`] and, at end of message, asks the shared
//! [`FilterEngine`] for a verdict.

use crate::filter::{FilterEngine, Verdict, REJECT_REPLY};
use crate::record::{ConnectionInfo, MailRecord};
use crate::sink::RecordSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reply to the transport for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Continue,
    Accept,
    Reject { reply: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Envelope,
    Headers,
    Decided(Decision),
}

/// Everything sessions share: the engine, where accepted records go, and
/// the session id counter.
pub struct SessionFactory {
    engine: Arc<FilterEngine>,
    sink: Arc<dyn RecordSink>,
    next_id: AtomicU64,
}

impl SessionFactory {
    pub fn new(engine: Arc<FilterEngine>, sink: Arc<dyn RecordSink>) -> Self {
        SessionFactory {
            engine,
            sink,
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connection start. The HELO name starts out as the connecting
    /// hostname and is replaced if the client sends HELO/EHLO.
    pub fn connect(self: &Arc<Self>, hostname: &str, ip: &str, dns: &str) -> (Session, Response) {
        let id = self.allocate_id();
        log::debug!("[{id}] connect from {hostname} [{ip}] ({dns})");
        let connection = ConnectionInfo {
            ip: ip.to_string(),
            helo: hostname.to_string(),
            dns: dns.to_string(),
        };
        let session = Session {
            factory: Arc::clone(self),
            state: SessionState::Connected,
            record: MailRecord::new(id, connection),
        };
        (session, Response::Continue)
    }
}

pub struct Session {
    factory: Arc<SessionFactory>,
    state: SessionState,
    record: MailRecord,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn record(&self) -> &MailRecord {
        &self.record
    }

    pub fn helo(&mut self, name: &str) -> Response {
        log::debug!("[{}] helo {name}", self.id());
        self.record.connection.helo = name.to_string();
        Response::Continue
    }

    pub fn mail(&mut self, sender: &str) -> Response {
        if let SessionState::Decided(_) = self.state {
            self.restart();
        }
        log::debug!("[{}] mail from {sender}", self.id());
        self.record.sender = Some(sender.to_string());
        self.state = SessionState::Envelope;
        Response::Continue
    }

    pub fn rcpt(&mut self, recipient: &str) -> Response {
        log::debug!("[{}] rcpt to {recipient}", self.id());
        self.record.recipients.push(recipient.to_string());
        self.state = SessionState::Envelope;
        Response::Continue
    }

    pub fn header(&mut self, name: &str, value: &str) -> Response {
        log::debug!("[{}] header {name}: {value}", self.id());
        self.record.add_header(name.to_string(), value.to_string());
        self.state = SessionState::Headers;
        Response::Continue
    }

    /// End of message: decide, and hand accepted records to the sink. A
    /// failed write is logged and does not change the verdict.
    /// A message that was already decided keeps its verdict and is not
    /// evaluated or saved again.
    pub fn eom(&mut self) -> Response {
        let id = self.id();
        if let SessionState::Decided(decision) = self.state {
            log::warn!("[{id}] end of message after the message was already decided");
            return match decision {
                Decision::Accept => Response::Accept,
                Decision::Reject => Response::Reject {
                    reply: REJECT_REPLY.to_string(),
                },
            };
        }
        log::debug!(
            "[{id}] deciding mail from '{}' to '{}'",
            self.record.sender_address(),
            self.record.recipient_address()
        );

        match self.factory.engine.evaluate(&mut self.record) {
            Verdict::Reject { actions, reply } => {
                log::info!("[{id}] REJECT actions={actions:?}: {reply}");
                self.state = SessionState::Decided(Decision::Reject);
                Response::Reject { reply }
            }
            Verdict::Accept { actions } => {
                log::info!("[{id}] ACCEPT actions={actions:?}");
                self.state = SessionState::Decided(Decision::Accept);
                if let Err(e) = self.factory.sink.store(&self.record) {
                    log::error!("[{id}] failed to save record: {e:#}");
                }
                Response::Accept
            }
        }
    }

    /// The current message was aborted; keep the connection, drop the rest.
    /// A decided record is never reused, so the next message gets a fresh id.
    pub fn abort(&mut self) {
        if let SessionState::Decided(_) = self.state {
            self.restart();
            return;
        }
        log::debug!("[{}] message aborted", self.id());
        let connection = self.record.connection.clone();
        self.record = MailRecord::new(self.id(), connection);
        self.state = SessionState::Connected;
    }

    /// Start a new transaction on the same connection under a fresh id.
    fn restart(&mut self) {
        let id = self.factory.allocate_id();
        log::debug!("[{}] new transaction as [{id}]", self.id());
        let connection = self.record.connection.clone();
        self.record = MailRecord::new(id, connection);
        self.state = SessionState::Connected;
    }
}
