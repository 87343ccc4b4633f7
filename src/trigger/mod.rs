// Scenario triggers and message-pattern matching

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::ptt::{PttControlType, PttPacket};
use crate::sip::message::{Method, SipMessage};

/// Something a node observed on the wire that message triggers can match
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Sip(SipMessage),
    Ptt(PttPacket),
}

impl ObservedEvent {
    pub fn summary(&self) -> String {
        match self {
            ObservedEvent::Sip(msg) => msg.summary(),
            ObservedEvent::Ptt(packet) => format!("PTT {} ({})", packet.control, packet.session),
        }
    }
}

/// Match value of a message trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePattern {
    Request(Method),
    Response(u16),
    Ptt(PttControlType),
}

impl MessagePattern {
    pub fn matches(&self, event: &ObservedEvent) -> bool {
        match (self, event) {
            (MessagePattern::Request(method), ObservedEvent::Sip(SipMessage::Request(req))) => {
                req.method == *method
            }
            (MessagePattern::Response(status), ObservedEvent::Sip(SipMessage::Response(resp))) => {
                resp.status_code == *status
            }
            (MessagePattern::Ptt(control), ObservedEvent::Ptt(packet)) => packet.control == *control,
            _ => false,
        }
    }
}

impl fmt::Display for MessagePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagePattern::Request(method) => write!(f, "request {}", method),
            MessagePattern::Response(status) => write!(f, "response {}", status),
            MessagePattern::Ptt(control) => write!(f, "ptt {}", control),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    /// Offset in whole seconds
    Time { offset_secs: u64 },
    /// Offset in milliseconds
    FineTime { offset_ms: u64 },
    Message {
        pattern: MessagePattern,
        one_shot: bool,
    },
    /// Runs only when an operator asks for it
    Manual,
}

/// Readiness predicate bound to one scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Scenario ids that must complete before the offset starts counting
    pub preconditions: Vec<String>,
}

impl Trigger {
    pub fn time(offset_secs: u64) -> Self {
        Self::from_kind(TriggerKind::Time { offset_secs })
    }

    pub fn fine_time(offset_ms: u64) -> Self {
        Self::from_kind(TriggerKind::FineTime { offset_ms })
    }

    /// One-shot message trigger
    pub fn message(pattern: MessagePattern) -> Self {
        Self::from_kind(TriggerKind::Message {
            pattern,
            one_shot: true,
        })
    }

    pub fn manual() -> Self {
        Self::from_kind(TriggerKind::Manual)
    }

    fn from_kind(kind: TriggerKind) -> Self {
        Self {
            kind,
            preconditions: Vec::new(),
        }
    }

    /// Clear the one-shot flag of a message trigger. No effect on other kinds.
    pub fn repeating(mut self) -> Self {
        if let TriggerKind::Message { one_shot, .. } = &mut self.kind {
            *one_shot = false;
        }
        self
    }

    pub fn after(mut self, precondition: impl Into<String>) -> Self {
        self.preconditions.push(precondition.into());
        self
    }

    pub fn is_time_triggered(&self) -> bool {
        matches!(
            self.kind,
            TriggerKind::Time { .. } | TriggerKind::FineTime { .. }
        )
    }

    pub fn is_message_triggered(&self) -> bool {
        matches!(self.kind, TriggerKind::Message { .. })
    }

    /// Delay in millisecond granularity. Whole-second offsets are scaled by
    /// 1000, fine offsets are used as is.
    pub fn offset(&self) -> Option<Duration> {
        match self.kind {
            TriggerKind::Time { offset_secs } => {
                Some(Duration::from_millis(offset_secs.saturating_mul(1000)))
            }
            TriggerKind::FineTime { offset_ms } => Some(Duration::from_millis(offset_ms)),
            _ => None,
        }
    }

    /// Time triggers are always ready. Message triggers match the event
    /// against their pattern; a one-shot trigger that already fired for
    /// `domain` stays quiet for that domain. Firing is recorded only when
    /// this returns true.
    pub fn is_ready(
        &self,
        scenario_id: &str,
        domain: &str,
        event: &ObservedEvent,
        fired: &mut FiredRegistry,
    ) -> bool {
        match &self.kind {
            TriggerKind::Time { .. } | TriggerKind::FineTime { .. } => true,
            TriggerKind::Manual => false,
            TriggerKind::Message { pattern, one_shot } => {
                if *one_shot && fired.has_fired(scenario_id, domain) {
                    return false;
                }
                if !pattern.matches(event) {
                    return false;
                }
                fired.record(scenario_id, domain);
                true
            }
        }
    }
}

/// Per-run record of which message triggers fired for which node domain
#[derive(Debug, Default)]
pub struct FiredRegistry {
    fired: HashSet<(String, String)>,
}

impl FiredRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self, scenario_id: &str, domain: &str) -> bool {
        self.fired
            .contains(&(scenario_id.to_string(), domain.to_ascii_lowercase()))
    }

    pub fn record(&mut self, scenario_id: &str, domain: &str) {
        self.fired
            .insert((scenario_id.to_string(), domain.to_ascii_lowercase()));
    }

    pub fn clear(&mut self) {
        self.fired.clear();
    }

    pub fn len(&self) -> usize {
        self.fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fired.is_empty()
    }
}
