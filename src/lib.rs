//! # AgentBus
//!
//! `agentbus` is a message broker for autonomous agents. Agents open a
//! session, then exchange messages directly, through topic subscriptions,
//! by broadcast, or as request/response pairs. Every delivery is persisted
//! before it is queued, retried with backoff until acknowledged, and moved
//! to a dead-letter store when it cannot be delivered.
//!
//! ## Core Modules
//!
//! - `broker`: validation, routing, per-agent priority queues, delivery and
//!   retry, request correlation, idempotency and sessions.
//! - `config`: layered configuration from `config/default.*` and the
//!   environment.
//! - `persistence`: the `MessageStore` trait and its sled implementation.
//! - `transport`: the `Transport` trait, an in-process transport and a
//!   WebSocket gateway.
//! - `utils`: the error taxonomy and logging setup.
//!
//! ```no_run
//! use agentbus::broker::message::RawMessage;
//! use agentbus::{Broker, BrokerConfig, LocalTransport};
//! use std::sync::Arc;
//!
//! # async fn demo() -> agentbus::Result<()> {
//! let transport = Arc::new(LocalTransport::new());
//! let broker = Broker::builder(BrokerConfig::default())
//!     .transport(transport.clone())
//!     .build()?;
//! broker.spawn_background();
//!
//! broker.open_session("planner", &["2.0".to_string()])?;
//! let worker = broker.open_session("worker", &["2.0".to_string()])?;
//! let mut inbox = transport.connect(&worker);
//!
//! broker
//!     .submit("planner", RawMessage::direct("planner", "worker", b"start"))
//!     .await?;
//! let delivered = inbox.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use broker::{Broker, BrokerBuilder, BrokerConfig, SubmitReceipt};
pub use persistence::{MessageStore, SledStore};
pub use transport::{LocalTransport, Transport, WebSocketTransport};
pub use utils::{BrokerError, Result};
