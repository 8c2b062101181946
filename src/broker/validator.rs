//! Message validation
//!
//! Turns a `RawMessage` into a canonical `Message` or explains why it cannot.
//! Validation is pure: it reads the limits it was built with and the
//! caller's negotiated version, and never touches broker state. Whether a
//! response matches an outstanding request is decided later by the
//! correlator, since a late response is not a malformed one.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::broker::message::{Destination, Message, Pattern, Priority, RawMessage};
use crate::broker::session::ProtocolVersion;
use crate::broker::topic::validate_topic;
use crate::utils::{BrokerError, NegotiationError, ValidationError};

pub const MAX_CORRELATION_ID_LEN: usize = 128;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct Validator {
    max_payload_bytes: usize,
    default_ttl: Duration,
    supported: Vec<ProtocolVersion>,
}

impl Validator {
    pub fn new(max_payload_bytes: usize, default_ttl: Duration, supported: Vec<ProtocolVersion>) -> Self {
        Self {
            max_payload_bytes,
            default_ttl,
            supported,
        }
    }

    pub fn validate(
        &self,
        caller: &str,
        mut raw: RawMessage,
        negotiated: ProtocolVersion,
    ) -> Result<Message, BrokerError> {
        let sender = match raw.sender.as_deref() {
            None => caller.to_string(),
            Some("") => return Err(ValidationError::MissingSender.into()),
            Some(s) if s != caller => {
                return Err(BrokerError::Authorization {
                    caller: caller.to_string(),
                    destination: format!("sender identity {s}"),
                });
            }
            Some(s) => s.to_string(),
        };
        if sender.is_empty() {
            return Err(ValidationError::MissingSender.into());
        }

        let destination = match raw.destination.take() {
            None => return Err(ValidationError::MissingDestination.into()),
            Some(Destination::Agent(id)) if id.is_empty() => {
                return Err(ValidationError::MissingDestination.into());
            }
            Some(Destination::Topic(topic)) => {
                validate_topic(&topic)?;
                Destination::Topic(topic)
            }
            Some(other) => other,
        };

        let pattern = raw.pattern.unwrap_or(match destination {
            Destination::Topic(_) => Pattern::Publish,
            _ => Pattern::FireAndForget,
        });
        match (&destination, pattern) {
            (Destination::Topic(_), Pattern::Publish) => {}
            (Destination::Topic(_), _) => return Err(ValidationError::TopicRequiresPublish.into()),
            (_, Pattern::Publish) => return Err(ValidationError::PublishRequiresTopic.into()),
            (Destination::Broadcast, Pattern::Request | Pattern::Response) => {
                return Err(ValidationError::CorrelationRequiresAgent.into());
            }
            _ => {}
        }

        if raw.payload.len() > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size: raw.payload.len(),
                max: self.max_payload_bytes,
            }
            .into());
        }

        let priority = match raw.priority {
            None => Priority::default(),
            Some(p) => Priority::new(p).ok_or(ValidationError::InvalidPriority(p))?,
        };

        if let Some(id) = &raw.correlation_id {
            check_correlation_id(id)?;
        }
        if pattern == Pattern::Response && raw.correlation_id.is_none() {
            return Err(ValidationError::MissingCorrelationId.into());
        }

        if let Some(key) = &raw.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(ValidationError::InvalidIdempotencyKey.into());
            }
        }

        if raw.ttl_ms == Some(0) {
            return Err(ValidationError::ZeroTtl.into());
        }

        if let Some(declared) = &raw.protocol_version {
            let version: ProtocolVersion = declared
                .parse()
                .map_err(|_| ValidationError::UnsupportedVersion(declared.clone()))?;
            if !self.supported.contains(&version) {
                return Err(ValidationError::UnsupportedVersion(declared.clone()).into());
            }
            if version != negotiated {
                return Err(ValidationError::VersionMismatch {
                    declared: declared.clone(),
                    negotiated: negotiated.to_string(),
                }
                .into());
            }
        }

        check_feature_gates(&raw, pattern, negotiated)?;

        let correlation_id = match (pattern, raw.correlation_id) {
            (Pattern::Request, None) => Some(Uuid::new_v4().to_string()),
            (_, id) => id,
        };

        Ok(Message {
            id: Uuid::new_v4().to_string(),
            sender,
            destination,
            pattern,
            priority,
            idempotency_key: raw.idempotency_key,
            correlation_id,
            payload: raw.payload,
            created_at: Utc::now(),
            ttl_ms: raw
                .ttl_ms
                .unwrap_or(self.default_ttl.as_millis() as u64),
            protocol_version: negotiated.to_string(),
            confirm_delivery: raw.confirm_delivery,
        })
    }
}

fn check_correlation_id(id: &str) -> Result<(), ValidationError> {
    let well_formed = !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::MalformedCorrelationId(id.to_string()))
    }
}

/// Refuse fields the negotiated version cannot carry instead of dropping them.
fn check_feature_gates(
    raw: &RawMessage,
    pattern: Pattern,
    negotiated: ProtocolVersion,
) -> Result<(), NegotiationError> {
    let gate = |used: bool, field: &'static str, required: ProtocolVersion| {
        if used && negotiated < required {
            Err(NegotiationError::UnsupportedField {
                field,
                required: required.to_string(),
                negotiated: negotiated.to_string(),
            })
        } else {
            Ok(())
        }
    };

    gate(
        matches!(pattern, Pattern::Request | Pattern::Response),
        "pattern",
        ProtocolVersion::V1_1,
    )?;
    gate(raw.correlation_id.is_some(), "correlation_id", ProtocolVersion::V1_1)?;
    gate(raw.priority.is_some(), "priority", ProtocolVersion::V2_0)?;
    gate(raw.idempotency_key.is_some(), "idempotency_key", ProtocolVersion::V2_0)?;
    gate(raw.ttl_ms.is_some(), "ttl_ms", ProtocolVersion::V2_0)?;
    gate(raw.confirm_delivery, "confirm_delivery", ProtocolVersion::V2_0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(
            1024,
            Duration::from_secs(60),
            vec![ProtocolVersion::V1_0, ProtocolVersion::V1_1, ProtocolVersion::V2_0],
        )
    }

    fn validate(raw: RawMessage) -> Result<Message, BrokerError> {
        validator().validate("a", raw, ProtocolVersion::V2_0)
    }

    #[test]
    fn assigns_identity_and_defaults() {
        let msg = validate(RawMessage::direct("a", "b", b"hi")).unwrap();
        assert!(!msg.id.is_empty());
        assert_eq!(msg.sender, "a");
        assert_eq!(msg.priority, Priority::default());
        assert_eq!(msg.ttl_ms, 60_000);
        assert_eq!(msg.protocol_version, "2.0");
    }

    #[test]
    fn sender_defaults_to_caller_and_cannot_be_spoofed() {
        let raw = RawMessage {
            sender: None,
            ..RawMessage::direct("a", "b", b"")
        };
        assert_eq!(validate(raw).unwrap().sender, "a");

        let err = validate(RawMessage::direct("mallory", "b", b"")).unwrap_err();
        assert!(matches!(err, BrokerError::Authorization { .. }));
    }

    #[test]
    fn rejects_missing_destination_and_oversized_payload() {
        let raw = RawMessage {
            destination: None,
            ..RawMessage::direct("a", "b", b"")
        };
        assert!(matches!(
            validate(raw),
            Err(BrokerError::Validation(ValidationError::MissingDestination))
        ));
        assert!(matches!(
            validate(RawMessage::direct("a", "", b"")),
            Err(BrokerError::Validation(ValidationError::MissingDestination))
        ));

        let big = vec![0u8; 1025];
        assert!(matches!(
            validate(RawMessage::direct("a", "b", &big)),
            Err(BrokerError::Validation(ValidationError::PayloadTooLarge { size: 1025, max: 1024 }))
        ));
    }

    #[test]
    fn pattern_and_destination_must_agree() {
        let mut raw = RawMessage::publish("a", "alerts.cpu", b"");
        raw.destination = Some(Destination::Agent("b".into()));
        assert!(matches!(
            validate(raw),
            Err(BrokerError::Validation(ValidationError::PublishRequiresTopic))
        ));

        let mut raw = RawMessage::direct("a", "b", b"");
        raw.destination = Some(Destination::Topic("alerts".into()));
        assert!(matches!(
            validate(raw),
            Err(BrokerError::Validation(ValidationError::TopicRequiresPublish))
        ));

        let raw = RawMessage {
            pattern: None,
            ..RawMessage::publish("a", "alerts.cpu", b"")
        };
        assert_eq!(validate(raw).unwrap().pattern, Pattern::Publish);

        assert!(validate(RawMessage::publish("a", "alerts.#", b"")).is_err());
    }

    #[test]
    fn correlation_ids_are_checked() {
        let raw = RawMessage {
            correlation_id: None,
            ..RawMessage::response("a", "b", "x", b"")
        };
        assert!(matches!(
            validate(raw),
            Err(BrokerError::Validation(ValidationError::MissingCorrelationId))
        ));
        assert!(matches!(
            validate(RawMessage::response("a", "b", "has space", b"")),
            Err(BrokerError::Validation(ValidationError::MalformedCorrelationId(_)))
        ));

        let request = validate(RawMessage::request("a", "b", b"")).unwrap();
        assert!(request.correlation_id.is_some(), "requests get a generated id");
    }

    #[test]
    fn priority_and_ttl_ranges() {
        assert!(matches!(
            validate(RawMessage::direct("a", "b", b"").with_priority(4)),
            Err(BrokerError::Validation(ValidationError::InvalidPriority(4)))
        ));
        assert!(matches!(
            validate(RawMessage::direct("a", "b", b"").with_ttl(Duration::ZERO)),
            Err(BrokerError::Validation(ValidationError::ZeroTtl))
        ));
    }

    #[test]
    fn declared_version_must_be_supported_and_negotiated() {
        assert!(matches!(
            validate(RawMessage::direct("a", "b", b"").with_protocol_version("9.9")),
            Err(BrokerError::Validation(ValidationError::UnsupportedVersion(_)))
        ));
        assert!(matches!(
            validate(RawMessage::direct("a", "b", b"").with_protocol_version("1.1")),
            Err(BrokerError::Validation(ValidationError::VersionMismatch { .. }))
        ));
        assert!(validate(RawMessage::direct("a", "b", b"").with_protocol_version("2.0")).is_ok());
    }

    #[test]
    fn fields_beyond_negotiated_version_are_refused() {
        let v = validator();
        let err = v
            .validate("a", RawMessage::direct("a", "b", b"").with_priority(0), ProtocolVersion::V1_1)
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Negotiation(NegotiationError::UnsupportedField { field: "priority", .. })
        ));

        let err = v
            .validate("a", RawMessage::request("a", "b", b""), ProtocolVersion::V1_0)
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Negotiation(NegotiationError::UnsupportedField { field: "pattern", .. })
        ));

        assert!(
            v.validate("a", RawMessage::broadcast("a", b""), ProtocolVersion::V1_0)
                .is_ok()
        );
    }
}
