//! Authorization hook
//!
//! The broker asks an [`Authorizer`] before admitting a message or a
//! subscription. [`AllowAll`] is the default; [`AclAuthorizer`] checks a
//! per-agent rule table.

use std::collections::HashMap;

use crate::broker::message::{AgentId, Destination};
use crate::broker::topic::TopicPattern;

pub trait Authorizer: Send + Sync + 'static {
    fn can_send(&self, caller: &str, destination: &Destination) -> bool;

    fn can_subscribe(&self, _agent: &str, _pattern: &TopicPattern) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_send(&self, _caller: &str, _destination: &Destination) -> bool {
        true
    }
}

/// What one agent may do. `"*"` in `agents` allows any direct recipient.
#[derive(Debug, Clone, Default)]
pub struct AclRule {
    pub agents: Vec<AgentId>,
    pub publish: Vec<TopicPattern>,
    pub subscribe: Vec<TopicPattern>,
    pub broadcast: bool,
}

/// Deny-by-default rule table. Agents without a rule may do nothing.
#[derive(Debug, Clone, Default)]
pub struct AclAuthorizer {
    rules: HashMap<AgentId, AclRule>,
}

impl AclAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, agent: &str, rule: AclRule) -> Self {
        self.rules.insert(agent.to_string(), rule);
        self
    }
}

impl Authorizer for AclAuthorizer {
    fn can_send(&self, caller: &str, destination: &Destination) -> bool {
        let Some(rule) = self.rules.get(caller) else {
            return false;
        };
        match destination {
            Destination::Agent(agent) => rule.agents.iter().any(|a| a == "*" || a == agent),
            Destination::Topic(topic) => rule.publish.iter().any(|p| p.matches(topic)),
            Destination::Broadcast => rule.broadcast,
        }
    }

    fn can_subscribe(&self, agent: &str, pattern: &TopicPattern) -> bool {
        self.rules
            .get(agent)
            .is_some_and(|rule| rule.subscribe.iter().any(|allowed| allowed.covers(pattern)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> TopicPattern {
        TopicPattern::parse(p).unwrap()
    }

    fn acl() -> AclAuthorizer {
        AclAuthorizer::new().allow(
            "monitor",
            AclRule {
                agents: vec!["pager".into()],
                publish: vec![pattern("alerts.#")],
                subscribe: vec![pattern("metrics.*")],
                broadcast: false,
            },
        )
    }

    #[test]
    fn acl_checks_each_destination_kind() {
        let acl = acl();
        assert!(acl.can_send("monitor", &Destination::Agent("pager".into())));
        assert!(!acl.can_send("monitor", &Destination::Agent("billing".into())));
        assert!(acl.can_send("monitor", &Destination::Topic("alerts.cpu.high".into())));
        assert!(!acl.can_send("monitor", &Destination::Topic("metrics.cpu".into())));
        assert!(!acl.can_send("monitor", &Destination::Broadcast));
        assert!(!acl.can_send("stranger", &Destination::Agent("pager".into())));
    }

    #[test]
    fn subscriptions_must_stay_inside_allowed_patterns() {
        let acl = acl();
        assert!(acl.can_subscribe("monitor", &pattern("metrics.cpu")));
        assert!(acl.can_subscribe("monitor", &pattern("metrics.*")));
        assert!(!acl.can_subscribe("monitor", &pattern("metrics.#")));
        assert!(AllowAll.can_subscribe("anyone", &pattern("#")));
    }
}
