//! Routing
//!
//! Classifies a validated message into the set of recipients it must reach.
//! Routing takes a snapshot of subscriptions and known agents at admission:
//! a subscription added afterwards does not see the message, and one
//! removed afterwards does not recall deliveries already fanned out.

use crate::broker::message::{AgentId, CorrelationId, Destination, Message, Pattern};
use crate::broker::session::SessionRegistry;
use crate::broker::topic::TopicMatcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// One recipient, addressed by id.
    Direct(AgentId),
    /// A topic or broadcast snapshot. May be empty.
    Fanout(Vec<AgentId>),
    /// A response, handed to the correlator instead of a queue.
    Correlate(CorrelationId),
}

impl RoutingDecision {
    pub fn recipients(&self) -> &[AgentId] {
        match self {
            RoutingDecision::Direct(agent) => std::slice::from_ref(agent),
            RoutingDecision::Fanout(agents) => agents,
            RoutingDecision::Correlate(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Router;

impl Router {
    pub fn route(
        &self,
        message: &Message,
        topics: &TopicMatcher,
        sessions: &SessionRegistry,
    ) -> RoutingDecision {
        if message.pattern == Pattern::Response {
            if let Some(id) = &message.correlation_id {
                return RoutingDecision::Correlate(id.clone());
            }
        }
        match &message.destination {
            Destination::Agent(agent) => RoutingDecision::Direct(agent.clone()),
            Destination::Topic(topic) => RoutingDecision::Fanout(topics.matches(topic).into_iter().collect()),
            Destination::Broadcast => RoutingDecision::Fanout(
                sessions
                    .known_agents()
                    .into_iter()
                    .filter(|agent| *agent != message.sender)
                    .collect(),
            ),
        }
    }
}
