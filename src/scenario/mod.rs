// Scenario data model

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use crate::error::IssiTesterError;
use crate::trigger::Trigger;

/// Unit-to-unit call setup
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallSetup {
    pub caller: String,
    pub callee: String,
    /// Overrides the caller's configured transmit priority
    pub priority: Option<u8>,
    pub emergency: bool,
    pub full_duplex: bool,
    pub protected: bool,
    pub availability_check: bool,
    pub in_call_roam: bool,
    pub cancel_after: Option<Duration>,
    pub terminate_after: Option<Duration>,
    /// Unit that sends a talk spurt once the call is confirmed
    pub talk_spurt_sender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupCallSetup {
    pub caller: String,
    pub group: String,
    pub priority: Option<u8>,
    pub emergency: bool,
    pub protected: bool,
    pub cancel_after: Option<Duration>,
    pub terminate_after: Option<Duration>,
    pub talk_spurt_sender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Roaming {
    pub actor: String,
    pub destination: String,
    pub initiated_by_home: bool,
}

/// Opaque action handed to the script host
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptAction {
    /// Actor id (actor scripts) or node id (node scripts)
    pub target: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioKind {
    CallSetup(CallSetup),
    GroupCallSetup(GroupCallSetup),
    Roaming(Roaming),
    ActorScript(ScriptAction),
    NodeScript(ScriptAction),
    CallTerminator { actor: String },
}

impl ScenarioKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ScenarioKind::CallSetup(_) => "call-setup",
            ScenarioKind::GroupCallSetup(_) => "group-call-setup",
            ScenarioKind::Roaming(_) => "roaming",
            ScenarioKind::ActorScript(_) => "actor-script",
            ScenarioKind::NodeScript(_) => "node-script",
            ScenarioKind::CallTerminator { .. } => "call-terminator",
        }
    }

    /// (cancel-after, terminate-after) for the call setup variants
    pub fn call_timers(&self) -> (Option<Duration>, Option<Duration>) {
        match self {
            ScenarioKind::CallSetup(s) => (s.cancel_after, s.terminate_after),
            ScenarioKind::GroupCallSetup(s) => (s.cancel_after, s.terminate_after),
            _ => (None, None),
        }
    }

    /// Actor whose call a synthesized terminator hangs up
    pub fn calling_actor(&self) -> Option<&str> {
        match self {
            ScenarioKind::CallSetup(s) => Some(&s.caller),
            ScenarioKind::GroupCallSetup(s) => Some(&s.caller),
            _ => None,
        }
    }
}

/// A scenario scheduled relative to the completion of another
#[derive(Debug, Clone, PartialEq)]
pub struct PostTrigger {
    pub scenario_id: String,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub description: String,
    pub trigger: Trigger,
    /// Filled in when the test script is built
    pub post_triggers: Vec<PostTrigger>,
    pub kind: ScenarioKind,
}

impl Scenario {
    pub fn new(id: impl Into<String>, trigger: Trigger, kind: ScenarioKind) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            trigger,
            post_triggers: Vec::new(),
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Order two scenarios by trigger offset. Only defined when both are
    /// time triggered.
    pub fn compare(&self, other: &Scenario) -> Result<Ordering, IssiTesterError> {
        match (self.trigger.offset(), other.trigger.offset()) {
            (Some(a), Some(b)) => Ok(a.cmp(&b)),
            _ => Err(IssiTesterError::IncomparableScenarios(
                self.id.clone(),
                other.id.clone(),
            )),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.kind.tag())
    }
}

/// Sort time-triggered scenarios by offset, keeping enumeration order for
/// equal offsets. Any non-time-triggered entry makes the set unorderable.
pub fn sort_by_offset(scenarios: &mut [Scenario]) -> Result<(), IssiTesterError> {
    for pair in scenarios.windows(2) {
        pair[0].compare(&pair[1])?;
    }
    if let Some(first) = scenarios.first() {
        first.compare(first)?;
    }
    scenarios.sort_by_key(|s| s.trigger.offset().unwrap_or_default());
    Ok(())
}
