//! WebSocket transport
//!
//! A small gateway that translates JSON frames into broker operations.
//! Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Require a `hello` frame first and open a broker session for it
//! - Forward client frames to the broker and answer with server frames
//! - Push deliveries, delivery reports and request timeouts to the
//!   connected agent
//!
//! Deliveries written to a socket stay pending until the client sends an
//! `ack` frame for them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::broker::events::BrokerEvent;
use crate::broker::message::{AgentId, Message, Pattern, SessionId};
use crate::broker::session::Session;
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::transport::{SendOutcome, Transport};
use crate::utils::TransportError;

type Outbox = mpsc::UnboundedSender<WsMessage>;

#[derive(Debug)]
struct Connection {
    agent_id: AgentId,
    tx: Outbox,
}

/// Sessions that currently have a WebSocket attached.
#[derive(Debug, Default)]
pub struct WebSocketTransport {
    connections: DashMap<SessionId, Connection>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, session: &Session, tx: Outbox) {
        self.connections.insert(
            session.id.clone(),
            Connection {
                agent_id: session.agent_id.clone(),
                tx,
            },
        );
    }

    fn unregister(&self, session_id: &str) -> bool {
        self.connections.remove(session_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn encode(frame: &ServerFrame) -> Result<WsMessage, serde_json::Error> {
    Ok(WsMessage::text(serde_json::to_string(frame)?))
}

/// Queue a frame on a connection's outbox. Returns `false` once the
/// connection is gone.
fn push(tx: &Outbox, frame: &ServerFrame) -> bool {
    match encode(frame) {
        Ok(msg) => tx.send(msg).is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode server frame");
            true
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, session_id: &str, message: &Message) -> Result<SendOutcome, TransportError> {
        let connection = self
            .connections
            .get(session_id)
            .ok_or_else(|| TransportError::SessionClosed(session_id.to_string()))?;

        let frame = match message.pattern {
            Pattern::Response => ServerFrame::response(message),
            _ => ServerFrame::deliver(message),
        };
        let msg = encode(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
        connection
            .tx
            .send(msg)
            .map_err(|_| TransportError::SessionClosed(session_id.to_string()))?;
        Ok(SendOutcome::Pending)
    }

    fn is_online(&self, agent_id: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.agent_id == agent_id && !c.tx.is_closed())
    }
}

pub async fn start_websocket_server(
    addr: &str,
    broker: Arc<Broker>,
    transport: Arc<WebSocketTransport>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, broker, transport).await
}

/// Accept connections on an already bound listener until the task is
/// dropped.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    transport: Arc<WebSocketTransport>,
) -> std::io::Result<()> {
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let broker = broker.clone();
        let transport = transport.clone();
        spawn(handle_connection(stream, peer, broker, transport));
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    transport: Arc<WebSocketTransport>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let session = match greet(&mut ws_receiver, &broker).await {
        Ok(session) => session,
        Err(reason) => {
            debug!(%peer, %reason, "rejected connection");
            if let Ok(msg) = encode(&ServerFrame::error(reason)) {
                let _ = ws_sender.send(msg).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    let agent = session.agent_id.clone();
    info!(%peer, %agent, session = %session.id, version = %session.version, "agent connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    push(
        &tx,
        &ServerFrame::Welcome {
            session_id: session.id.clone(),
            version: session.version.to_string(),
        },
    );
    transport.register(&session, tx.clone());

    let cleanup_called = Arc::new(AtomicBool::new(false));
    let do_cleanup = {
        let broker = broker.clone();
        let transport = transport.clone();
        let session_id = session.id.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                transport.unregister(&session_id);
                broker.close_session(&session_id);
            }
        }
    };

    {
        let agent = agent.clone();
        let do_cleanup = do_cleanup.clone();

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!(%agent, error = %e, "failed to write to socket");
                    break;
                }
            }
            do_cleanup();
            let _ = ws_sender.close().await;
            debug!(%agent, "send loop closed");
        });
    }

    let reports = spawn(forward_reports(broker.events(), agent.clone(), tx.clone()));

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(frame) => handle_frame(&broker, &agent, frame, &tx).await,
                Err(e) => {
                    debug!(%agent, error = %e, "invalid client frame");
                    push(&tx, &ServerFrame::error(format!("invalid frame: {e}")));
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    info!(%agent, "agent disconnected");
    do_cleanup();
    // The send loop drains and exits once every outbox sender is gone;
    // requests still in flight hold one until they resolve.
    reports.abort();
}

/// Wait for the `hello` frame and open a session for it.
async fn greet(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    broker: &Broker,
) -> Result<Session, String> {
    while let Some(msg) = ws_receiver.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        return match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(ClientFrame::Hello { agent_id, versions }) => broker
                .open_session(&agent_id, &versions)
                .map_err(|e| e.to_string()),
            Ok(_) => Err("expected a hello frame first".to_string()),
            Err(e) => Err(format!("invalid frame: {e}")),
        };
    }
    Err("connection closed before hello".to_string())
}

async fn handle_frame(broker: &Arc<Broker>, agent: &str, frame: ClientFrame, tx: &Outbox) {
    match frame {
        ClientFrame::Hello { .. } => {
            push(tx, &ServerFrame::error("session already open"));
        }

        ClientFrame::Submit { message } => {
            let reply = match broker.submit(agent, message.into()).await {
                Ok(receipt) => ServerFrame::Accepted {
                    message_id: receipt.message_id,
                    duplicate: !receipt.accepted,
                    recipients: receipt.recipients,
                    correlation_id: receipt.correlation_id,
                },
                Err(e) => ServerFrame::error(e),
            };
            push(tx, &reply);
        }

        ClientFrame::Subscribe { pattern } => {
            let reply = match broker.subscribe(agent, &pattern) {
                Ok(_) => ServerFrame::Subscribed { pattern },
                Err(e) => ServerFrame::error(e),
            };
            push(tx, &reply);
        }

        ClientFrame::Unsubscribe { pattern } => {
            let reply = match broker.unsubscribe(agent, &pattern) {
                Ok(_) => ServerFrame::Unsubscribed { pattern },
                Err(e) => ServerFrame::error(e),
            };
            push(tx, &reply);
        }

        ClientFrame::Request { message, timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(broker.config().default_request_timeout);
            let broker = broker.clone();
            let agent = agent.to_string();
            let tx = tx.clone();
            // The reader keeps serving frames while the request waits.
            spawn(async move {
                let reply = match broker.request(&agent, message.into(), timeout).await {
                    Ok(response) => ServerFrame::response(&response),
                    Err(e) => ServerFrame::error(e),
                };
                push(&tx, &reply);
            });
        }

        ClientFrame::Cancel { correlation_id } => {
            if !broker.cancel_request(agent, &correlation_id) {
                push(
                    tx,
                    &ServerFrame::error(format!("no pending request {correlation_id}")),
                );
            }
        }

        ClientFrame::Ack { message_id } => {
            if !broker.acknowledge(agent, &message_id) {
                debug!(%agent, %message_id, "ack for unknown delivery");
            }
        }
    }
}

/// Push delivery reports and request timeouts addressed to `agent` until
/// its connection closes.
async fn forward_reports(mut events: broadcast::Receiver<BrokerEvent>, agent: AgentId, tx: Outbox) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tx.closed() => break,
        };
        match event {
            Ok(BrokerEvent::DeliveryReport {
                sender,
                message_id,
                recipient,
                delivered,
                reason,
            }) if sender == agent => {
                let frame = ServerFrame::Report {
                    message_id,
                    recipient,
                    delivered,
                    reason,
                };
                if !push(&tx, &frame) {
                    break;
                }
            }
            Ok(BrokerEvent::RequestTimedOut {
                correlation_id,
                requester,
            }) if requester == agent => {
                if !push(&tx, &ServerFrame::RequestTimedOut { correlation_id }) {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%agent, skipped, "report forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
