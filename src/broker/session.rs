//! Sessions and protocol negotiation
//!
//! Sessions belong to the transport collaborator; the core only keeps
//! enough of them to answer "who is known", "who is online" and "which
//! protocol version did this agent negotiate". An agent stays known after
//! its session closes so broadcasts still queue for it.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::message::{AgentId, SessionId};
use crate::utils::NegotiationError;

/// `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
    /// Adds request/response and correlation ids.
    pub const V1_1: ProtocolVersion = ProtocolVersion::new(1, 1);
    /// Adds priorities, idempotency keys, TTLs and delivery confirmation.
    pub const V2_0: ProtocolVersion = ProtocolVersion::new(2, 0);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NegotiationError::InvalidVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Pick the highest version present in both lists.
///
/// Offered entries that do not parse are skipped as long as at least one
/// valid entry remains.
pub fn negotiate(
    offered: &[String],
    supported: &[ProtocolVersion],
) -> Result<ProtocolVersion, NegotiationError> {
    if offered.is_empty() {
        return Err(NegotiationError::EmptyOffer);
    }

    let parsed: Vec<ProtocolVersion> = offered.iter().filter_map(|v| v.parse().ok()).collect();
    if parsed.is_empty() {
        return Err(NegotiationError::InvalidVersion(offered.join(",")));
    }

    parsed
        .into_iter()
        .filter(|v| supported.contains(v))
        .max()
        .ok_or_else(|| NegotiationError::NoCommonVersion {
            offered: offered.to_vec(),
            supported: supported.iter().map(ToString::to_string).collect(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub agent_id: AgentId,
    pub version: ProtocolVersion,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_agent: DashMap<AgentId, Session>,
    supported: Vec<ProtocolVersion>,
}

impl SessionRegistry {
    pub fn new(supported: Vec<ProtocolVersion>) -> Self {
        Self {
            by_agent: DashMap::new(),
            supported,
        }
    }

    pub fn supported_versions(&self) -> &[ProtocolVersion] {
        &self.supported
    }

    /// Negotiate a version and open a session. An existing session for the
    /// same agent is replaced.
    pub fn open(&self, agent_id: &str, offered: &[String]) -> Result<Session, NegotiationError> {
        let version = negotiate(offered, &self.supported)?;
        let session = Session {
            id: format!("session-{}", Uuid::new_v4()),
            agent_id: agent_id.to_string(),
            version,
            online: true,
            last_seen: Utc::now(),
        };
        if let Some(previous) = self.by_agent.insert(agent_id.to_string(), session.clone()) {
            debug!(agent = agent_id, previous = %previous.id, "replacing session");
        }
        info!(agent = agent_id, session = %session.id, %version, "session opened");
        Ok(session)
    }

    /// Close a session. Returns the owning agent when the session was the
    /// agent's current one.
    pub fn close(&self, session_id: &str) -> Option<AgentId> {
        let mut closed = None;
        for mut entry in self.by_agent.iter_mut() {
            if entry.id == session_id && entry.online {
                entry.online = false;
                entry.last_seen = Utc::now();
                closed = Some(entry.agent_id.clone());
                break;
            }
        }
        if let Some(agent) = &closed {
            info!(agent = %agent, session = session_id, "session closed");
        }
        closed
    }

    /// Make an agent known without a live session, as after recovery.
    pub fn remember(&self, agent_id: &str) {
        self.by_agent
            .entry(agent_id.to_string())
            .or_insert_with(|| Session {
                id: String::new(),
                agent_id: agent_id.to_string(),
                version: self.supported.iter().copied().min().unwrap_or(ProtocolVersion::V1_0),
                online: false,
                last_seen: Utc::now(),
            });
    }

    /// The agent's current session, if it is online.
    pub fn current(&self, agent_id: &str) -> Option<Session> {
        self.by_agent
            .get(agent_id)
            .filter(|s| s.online)
            .map(|s| s.clone())
    }

    pub fn negotiated_version(&self, agent_id: &str) -> Result<ProtocolVersion, NegotiationError> {
        self.current(agent_id)
            .map(|s| s.version)
            .ok_or_else(|| NegotiationError::NoSession(agent_id.to_string()))
    }

    pub fn touch(&self, agent_id: &str) {
        if let Some(mut session) = self.by_agent.get_mut(agent_id) {
            session.last_seen = Utc::now();
        }
    }

    pub fn is_online(&self, agent_id: &str) -> bool {
        self.by_agent.get(agent_id).is_some_and(|s| s.online)
    }

    /// Every agent that ever opened a session, online or not, sorted.
    pub fn known_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.by_agent.iter().map(|e| e.key().clone()).collect();
        agents.sort();
        agents
    }
}
