//! Topic management
//!
//! Topics are `.`-separated segments. Subscriptions may use `*` to match
//! exactly one segment and `#`, as the final segment only, to match one or
//! more trailing segments. Matching is case-sensitive.
//!
//! Patterns are compiled once on subscribe into a segment trie, so a publish
//! walks at most one branch per literal segment plus the `*` branch instead
//! of re-parsing every subscription string.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::broker::message::AgentId;
use crate::utils::ValidationError;

pub const SEPARATOR: char = '.';
pub const SINGLE_LEVEL: &str = "*";
pub const MULTI_LEVEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Single,
    Multi,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, ValidationError> {
        let invalid = |reason| ValidationError::InvalidTopic {
            topic: pattern.to_string(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("empty topic"));
        }

        let parts: Vec<&str> = pattern.split(SEPARATOR).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => return Err(invalid("empty segment")),
                SINGLE_LEVEL => Segment::Single,
                MULTI_LEVEL if i + 1 == parts.len() => Segment::Multi,
                MULTI_LEVEL => return Err(invalid("`#` must be the final segment")),
                p if p.contains(['*', '#']) => {
                    return Err(invalid("wildcards must occupy a whole segment"));
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Match a single concrete topic without building a trie.
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split(SEPARATOR).collect();
        let mut i = 0;
        for segment in &self.segments {
            match segment {
                Segment::Multi => return parts.len() > i,
                Segment::Single if i < parts.len() => {}
                Segment::Literal(lit) if i < parts.len() && parts[i] == lit => {}
                _ => return false,
            }
            i += 1;
        }
        i == parts.len()
    }

    /// Whether every topic `other` matches is also matched by `self`.
    pub fn covers(&self, other: &TopicPattern) -> bool {
        let mut theirs = other.segments.iter();
        for segment in &self.segments {
            match (segment, theirs.next()) {
                (Segment::Multi, Some(_)) => return true,
                (Segment::Single, Some(Segment::Single | Segment::Literal(_))) => {}
                (Segment::Literal(a), Some(Segment::Literal(b))) if a == b => {}
                _ => return false,
            }
        }
        theirs.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate a concrete topic used as a publish destination.
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    let pattern = TopicPattern::parse(topic)?;
    if pattern.has_wildcards() {
        return Err(ValidationError::InvalidTopic {
            topic: topic.to_string(),
            reason: "wildcards are only valid in subscriptions",
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    single: Option<Box<Node>>,
    /// Subscribers whose pattern ends exactly here.
    terminal: HashSet<AgentId>,
    /// Subscribers whose pattern is this prefix followed by `#`.
    multi: HashSet<AgentId>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.literals.is_empty()
            && self.single.is_none()
            && self.terminal.is_empty()
            && self.multi.is_empty()
    }

    fn insert(&mut self, segments: &[Segment], agent: &str) -> bool {
        match segments.split_first() {
            None => self.terminal.insert(agent.to_string()),
            Some((Segment::Multi, _)) => self.multi.insert(agent.to_string()),
            Some((Segment::Single, rest)) => self
                .single
                .get_or_insert_with(Box::default)
                .insert(rest, agent),
            Some((Segment::Literal(lit), rest)) => self
                .literals
                .entry(lit.clone())
                .or_default()
                .insert(rest, agent),
        }
    }

    /// Returns whether the subscriber was present. Prunes emptied children.
    fn remove(&mut self, segments: &[Segment], agent: &str) -> bool {
        match segments.split_first() {
            None => self.terminal.remove(agent),
            Some((Segment::Multi, _)) => self.multi.remove(agent),
            Some((Segment::Single, rest)) => {
                let Some(child) = self.single.as_mut() else {
                    return false;
                };
                let removed = child.remove(rest, agent);
                if child.is_empty() {
                    self.single = None;
                }
                removed
            }
            Some((Segment::Literal(lit), rest)) => {
                let Some(child) = self.literals.get_mut(lit) else {
                    return false;
                };
                let removed = child.remove(rest, agent);
                if child.is_empty() {
                    self.literals.remove(lit);
                }
                removed
            }
        }
    }

    fn collect(&self, parts: &[&str], out: &mut BTreeSet<AgentId>) {
        let Some((head, rest)) = parts.split_first() else {
            out.extend(self.terminal.iter().cloned());
            return;
        };
        out.extend(self.multi.iter().cloned());
        if let Some(child) = self.literals.get(*head) {
            child.collect(rest, out);
        }
        if let Some(child) = &self.single {
            child.collect(rest, out);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    root: Node,
    by_agent: HashMap<AgentId, HashSet<TopicPattern>>,
}

/// Maps topics to subscriber agents.
#[derive(Debug, Default)]
pub struct TopicMatcher {
    inner: RwLock<Inner>,
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns `false` when it already existed.
    pub fn subscribe(&self, agent: &str, pattern: &TopicPattern) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let added = inner.root.insert(&pattern.segments, agent);
        inner
            .by_agent
            .entry(agent.to_string())
            .or_default()
            .insert(pattern.clone());
        added
    }

    /// Remove a subscription. Returns `false` when it did not exist.
    pub fn unsubscribe(&self, agent: &str, pattern: &TopicPattern) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.root.remove(&pattern.segments, agent);
        if let Some(patterns) = inner.by_agent.get_mut(agent) {
            patterns.remove(pattern);
            if patterns.is_empty() {
                inner.by_agent.remove(agent);
            }
        }
        removed
    }

    /// Drop every subscription held by `agent`, returning what was removed.
    pub fn remove_agent(&self, agent: &str) -> Vec<TopicPattern> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let patterns: Vec<TopicPattern> = inner
            .by_agent
            .remove(agent)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for pattern in &patterns {
            inner.root.remove(&pattern.segments, agent);
        }
        patterns
    }

    /// Subscribers whose patterns match `topic`.
    pub fn matches(&self, topic: &str) -> BTreeSet<AgentId> {
        let parts: Vec<&str> = topic.split(SEPARATOR).collect();
        let mut out = BTreeSet::new();
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.root.collect(&parts, &mut out);
        out
    }

    pub fn subscriptions(&self, agent: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut patterns: Vec<String> = inner
            .by_agent
            .get(agent)
            .map(|set| set.iter().map(|p| p.raw.clone()).collect())
            .unwrap_or_default();
        patterns.sort();
        patterns
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.root.is_empty()
    }
}
