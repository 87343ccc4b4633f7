// Post-conditions evaluated against a node's signaling log at run completion

use serde::Serialize;

use crate::action::ScriptHost;
use crate::ptt::PttControlType;
use crate::trace::{Direction, RecordKind, SignalingRecord};

/// Which nodes a post-condition applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationPredicate {
    Any,
    Node(String),
}

impl LocationPredicate {
    pub fn applies_to(&self, node: &str) -> bool {
        match self {
            LocationPredicate::Any => true,
            LocationPredicate::Node(id) => id == node,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionFilter {
    #[default]
    Any,
    Sent,
    Received,
}

impl DirectionFilter {
    fn accepts(self, direction: Direction) -> bool {
        match self {
            DirectionFilter::Any => true,
            DirectionFilter::Sent => direction == Direction::Sent,
            DirectionFilter::Received => direction == Direction::Received,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assertion {
    RequestSeen {
        method: String,
        min_count: usize,
        direction: DirectionFilter,
    },
    /// A response with `status`; when `method` is set the CSeq method must match
    ResponseSeen {
        method: Option<String>,
        status: u16,
        direction: DirectionFilter,
    },
    ResponseAbsent {
        status: u16,
    },
    PttSeen {
        control: PttControlType,
    },
    /// Evaluated by the script host
    Script {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostCondition {
    pub description: String,
    pub location: LocationPredicate,
    pub assertion: Assertion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostConditionOutcome {
    pub description: String,
    pub passed: bool,
    pub detail: String,
}

impl PostCondition {
    pub fn new(description: impl Into<String>, assertion: Assertion) -> Self {
        Self {
            description: description.into(),
            location: LocationPredicate::Any,
            assertion,
        }
    }

    pub fn at(mut self, node: impl Into<String>) -> Self {
        self.location = LocationPredicate::Node(node.into());
        self
    }

    pub fn evaluate(&self, records: &[SignalingRecord], host: &dyn ScriptHost) -> PostConditionOutcome {
        let (passed, detail) = match &self.assertion {
            Assertion::RequestSeen {
                method,
                min_count,
                direction,
            } => {
                let count = records
                    .iter()
                    .filter(|r| r.is_request() && direction.accepts(r.direction))
                    .filter(|r| r.method.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(method)))
                    .count();
                (
                    count >= *min_count,
                    format!("{} {} request(s), wanted at least {}", count, method, min_count),
                )
            }
            Assertion::ResponseSeen {
                method,
                status,
                direction,
            } => {
                let seen = records.iter().any(|r| {
                    r.status == Some(*status)
                        && direction.accepts(r.direction)
                        && method.as_ref().map_or(true, |m| {
                            r.method.as_deref().is_some_and(|rm| rm.eq_ignore_ascii_case(m))
                        })
                });
                (seen, format!("response {} seen: {}", status, seen))
            }
            Assertion::ResponseAbsent { status } => {
                let count = records.iter().filter(|r| r.status == Some(*status)).count();
                (count == 0, format!("{} response(s) with status {}", count, status))
            }
            Assertion::PttSeen { control } => {
                let seen = records
                    .iter()
                    .any(|r| r.kind == RecordKind::Ptt && r.ptt == Some(*control));
                (seen, format!("PTT {} seen: {}", control, seen))
            }
            Assertion::Script { name } => match host.evaluate(name, records) {
                Ok(passed) => (passed, format!("script {} returned {}", name, passed)),
                Err(e) => (false, format!("script {} failed: {}", name, e)),
            },
        };
        PostConditionOutcome {
            description: self.description.clone(),
            passed,
            detail,
        }
    }
}

/// Evaluate every post-condition that applies to `node`
pub fn evaluate_all(
    conditions: &[PostCondition],
    node: &str,
    records: &[SignalingRecord],
    host: &dyn ScriptHost,
) -> Vec<PostConditionOutcome> {
    conditions
        .iter()
        .filter(|c| c.location.applies_to(node))
        .map(|c| c.evaluate(records, host))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::ptt::PttPacket;
    use crate::sip::message::{Headers, Method, SipMessage, SipRequest, SipResponse};
    use crate::trace::SignalingLog;
    use crate::trigger::ObservedEvent;

    fn sample_log() -> SignalingLog {
        let log = SignalingLog::new("rfss_2");
        let mut invite = SipRequest::new(Method::Invite, "sip:su_2@rfss_2.p25dr");
        invite.headers.set("CSeq", "1 INVITE".to_string());
        log.record(
            Direction::Received,
            "rfss_1",
            &ObservedEvent::Sip(SipMessage::Request(invite)),
        );
        let mut headers = Headers::new();
        headers.set("CSeq", "1 INVITE".to_string());
        log.record(
            Direction::Sent,
            "rfss_1",
            &ObservedEvent::Sip(SipMessage::Response(SipResponse {
                version: "SIP/2.0".to_string(),
                status_code: 200,
                reason_phrase: "OK".to_string(),
                headers,
                body: None,
            })),
        );
        log.record(
            Direction::Received,
            "rfss_1",
            &ObservedEvent::Ptt(PttPacket::new(PttControlType::SpurtRequest, "c", "su_1", "su_2")),
        );
        log
    }

    #[test]
    fn test_request_seen_counts_by_direction() {
        let records = sample_log().records();
        let host = ActionRegistry::new();
        let received = PostCondition::new(
            "invite received",
            Assertion::RequestSeen {
                method: "invite".into(),
                min_count: 1,
                direction: DirectionFilter::Received,
            },
        );
        assert!(received.evaluate(&records, &host).passed);
        let sent = PostCondition::new(
            "invite sent",
            Assertion::RequestSeen {
                method: "INVITE".into(),
                min_count: 1,
                direction: DirectionFilter::Sent,
            },
        );
        assert!(!sent.evaluate(&records, &host).passed);
    }

    #[test]
    fn test_response_seen_checks_cseq_method() {
        let records = sample_log().records();
        let host = ActionRegistry::new();
        let ok_invite = PostCondition::new(
            "200 to INVITE",
            Assertion::ResponseSeen {
                method: Some("INVITE".into()),
                status: 200,
                direction: DirectionFilter::Any,
            },
        );
        assert!(ok_invite.evaluate(&records, &host).passed);
        let ok_bye = PostCondition::new(
            "200 to BYE",
            Assertion::ResponseSeen {
                method: Some("BYE".into()),
                status: 200,
                direction: DirectionFilter::Any,
            },
        );
        assert!(!ok_bye.evaluate(&records, &host).passed);
    }

    #[test]
    fn test_response_absent_and_ptt_seen() {
        let records = sample_log().records();
        let host = ActionRegistry::new();
        assert!(PostCondition::new("no busy", Assertion::ResponseAbsent { status: 486 })
            .evaluate(&records, &host)
            .passed);
        assert!(!PostCondition::new("no ok", Assertion::ResponseAbsent { status: 200 })
            .evaluate(&records, &host)
            .passed);
        assert!(PostCondition::new(
            "spurt request",
            Assertion::PttSeen {
                control: PttControlType::SpurtRequest
            }
        )
        .evaluate(&records, &host)
        .passed);
    }

    #[test]
    fn test_script_assertion_uses_host() {
        let host = ActionRegistry::new();
        host.register_assertion("three", |records| records.len() == 3);
        let records = sample_log().records();
        let registered = PostCondition::new("three", Assertion::Script { name: "three".into() });
        assert!(registered.evaluate(&records, &host).passed);
        let missing = PostCondition::new("missing", Assertion::Script { name: "nope".into() });
        let outcome = missing.evaluate(&records, &host);
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("failed"));
    }

    #[test]
    fn test_evaluate_all_filters_by_location() {
        let host = ActionRegistry::new();
        let conditions = vec![
            PostCondition::new("here", Assertion::ResponseAbsent { status: 486 }).at("rfss_2"),
            PostCondition::new("elsewhere", Assertion::ResponseAbsent { status: 486 }).at("rfss_1"),
            PostCondition::new("everywhere", Assertion::ResponseAbsent { status: 603 }),
        ];
        let outcomes = evaluate_all(&conditions, "rfss_2", &sample_log().records(), &host);
        let names: Vec<&str> = outcomes.iter().map(|o| o.description.as_str()).collect();
        assert_eq!(names, vec!["here", "everywhere"]);
    }
}
