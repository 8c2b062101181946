//! In-process transport
//!
//! Each connected session gets an unbounded channel; `send` pushes the
//! message onto it. Useful for embedding the broker and for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::message::{AgentId, Message, SessionId};
use crate::broker::session::Session;
use crate::transport::{SendOutcome, Transport};
use crate::utils::TransportError;

#[derive(Debug)]
struct Endpoint {
    agent_id: AgentId,
    sender: mpsc::UnboundedSender<Message>,
    manual_ack: bool,
}

#[derive(Debug, Default)]
pub struct LocalTransport {
    endpoints: DashMap<SessionId, Endpoint>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a receiver to an open session. Messages count as delivered as
    /// soon as they are queued on the channel.
    pub fn connect(&self, session: &Session) -> mpsc::UnboundedReceiver<Message> {
        self.attach(session, false)
    }

    /// Like [`connect`](Self::connect), but every message stays in flight
    /// until the receiver calls `Broker::acknowledge`.
    pub fn connect_manual_ack(&self, session: &Session) -> mpsc::UnboundedReceiver<Message> {
        self.attach(session, true)
    }

    fn attach(&self, session: &Session, manual_ack: bool) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(
            session.id.clone(),
            Endpoint {
                agent_id: session.agent_id.clone(),
                sender: tx,
                manual_ack,
            },
        );
        debug!(agent = %session.agent_id, session = %session.id, "local endpoint attached");
        rx
    }

    pub fn disconnect(&self, session_id: &str) -> bool {
        self.endpoints.remove(session_id).is_some()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, session_id: &str, message: &Message) -> Result<SendOutcome, TransportError> {
        let endpoint = self
            .endpoints
            .get(session_id)
            .ok_or_else(|| TransportError::SessionClosed(session_id.to_string()))?;
        endpoint
            .sender
            .send(message.clone())
            .map_err(|_| TransportError::SessionClosed(session_id.to_string()))?;
        Ok(if endpoint.manual_ack {
            SendOutcome::Pending
        } else {
            SendOutcome::Acked
        })
    }

    fn is_online(&self, agent_id: &str) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.agent_id == agent_id && !e.sender.is_closed())
    }
}
