//! The broker core: validation, idempotency, routing, scheduling, delivery
//! and request/response correlation. Transports drive it through
//! [`Broker`].

pub mod acl;
pub mod correlator;
pub mod delivery;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod message;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod topic;
pub mod validator;

pub use engine::{Broker, BrokerBuilder, BrokerConfig, PendingRequestRecovery, RecoveryReport, SubmitReceipt};
