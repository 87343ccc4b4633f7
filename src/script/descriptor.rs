// JSON test-script descriptors
//
// Stand-in for the XML script/topology files: the same object graph,
// deserialized with serde and lowered into a TestScript.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{TestScript, DEFAULT_COMPLETION_DELAY, DEFAULT_TRACE_WINDOW};
use crate::error::IssiTesterError;
use crate::postcondition::{Assertion, DirectionFilter, LocationPredicate, PostCondition};
use crate::ptt::PttControlType;
use crate::scenario::{CallSetup, GroupCallSetup, Roaming, Scenario, ScenarioKind, ScriptAction};
use crate::sip::message::Method;
use crate::topology::{Topology, TopologyDoc};
use crate::trigger::{MessagePattern, Trigger};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDescriptor {
    Time {
        offset: u64,
        #[serde(default)]
        after: Vec<String>,
    },
    FineTime {
        offset_ms: u64,
        #[serde(default)]
        after: Vec<String>,
    },
    Message {
        #[serde(default)]
        request: Option<String>,
        #[serde(default)]
        response: Option<u16>,
        #[serde(default)]
        ptt: Option<String>,
        #[serde(default = "default_true")]
        one_shot: bool,
        #[serde(default)]
        after: Vec<String>,
    },
    Manual,
}

impl TriggerDescriptor {
    pub fn to_trigger(&self, scenario: &str) -> Result<Trigger, IssiTesterError> {
        let (mut trigger, after) = match self {
            TriggerDescriptor::Time { offset, after } => (Trigger::time(*offset), after.as_slice()),
            TriggerDescriptor::FineTime { offset_ms, after } => {
                (Trigger::fine_time(*offset_ms), after.as_slice())
            }
            TriggerDescriptor::Message {
                request,
                response,
                ptt,
                one_shot,
                after,
            } => {
                let pattern = match (request, response, ptt) {
                    (Some(method), None, None) => MessagePattern::Request(Method::from_token(method)),
                    (None, Some(status), None) => MessagePattern::Response(*status),
                    (None, None, Some(control)) => MessagePattern::Ptt(control.parse::<PttControlType>()?),
                    _ => {
                        return Err(IssiTesterError::ConfigError(format!(
                            "message trigger of {} needs exactly one of request, response or ptt",
                            scenario
                        )))
                    }
                };
                let trigger = Trigger::message(pattern);
                let trigger = if *one_shot { trigger } else { trigger.repeating() };
                (trigger, after.as_slice())
            }
            TriggerDescriptor::Manual => (Trigger::manual(), &[][..]),
        };
        trigger.preconditions = after.to_vec();
        Ok(trigger)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDescriptor {
    CallSetup {
        caller: String,
        callee: String,
        #[serde(default)]
        priority: Option<u8>,
        #[serde(default)]
        emergency: bool,
        #[serde(default)]
        full_duplex: bool,
        #[serde(default)]
        protected: bool,
        #[serde(default)]
        availability_check: bool,
        #[serde(default)]
        in_call_roam: bool,
        #[serde(default)]
        cancel_after_ms: Option<u64>,
        #[serde(default)]
        terminate_after_ms: Option<u64>,
        #[serde(default)]
        talk_spurt_sender: Option<String>,
    },
    GroupCallSetup {
        caller: String,
        group: String,
        #[serde(default)]
        priority: Option<u8>,
        #[serde(default)]
        emergency: bool,
        #[serde(default)]
        protected: bool,
        #[serde(default)]
        cancel_after_ms: Option<u64>,
        #[serde(default)]
        terminate_after_ms: Option<u64>,
        #[serde(default)]
        talk_spurt_sender: Option<String>,
    },
    Roaming {
        actor: String,
        destination: String,
        #[serde(default)]
        initiated_by_home: bool,
    },
    ActorScript {
        actor: String,
        method: String,
    },
    NodeScript {
        node: String,
        method: String,
    },
    CallTerminator {
        actor: String,
    },
}

fn millis(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_millis)
}

impl ActionDescriptor {
    pub fn to_kind(&self) -> ScenarioKind {
        match self.clone() {
            ActionDescriptor::CallSetup {
                caller,
                callee,
                priority,
                emergency,
                full_duplex,
                protected,
                availability_check,
                in_call_roam,
                cancel_after_ms,
                terminate_after_ms,
                talk_spurt_sender,
            } => ScenarioKind::CallSetup(CallSetup {
                caller,
                callee,
                priority,
                emergency,
                full_duplex,
                protected,
                availability_check,
                in_call_roam,
                cancel_after: millis(cancel_after_ms),
                terminate_after: millis(terminate_after_ms),
                talk_spurt_sender,
            }),
            ActionDescriptor::GroupCallSetup {
                caller,
                group,
                priority,
                emergency,
                protected,
                cancel_after_ms,
                terminate_after_ms,
                talk_spurt_sender,
            } => ScenarioKind::GroupCallSetup(GroupCallSetup {
                caller,
                group,
                priority,
                emergency,
                protected,
                cancel_after: millis(cancel_after_ms),
                terminate_after: millis(terminate_after_ms),
                talk_spurt_sender,
            }),
            ActionDescriptor::Roaming {
                actor,
                destination,
                initiated_by_home,
            } => ScenarioKind::Roaming(Roaming {
                actor,
                destination,
                initiated_by_home,
            }),
            ActionDescriptor::ActorScript { actor, method } => {
                ScenarioKind::ActorScript(ScriptAction {
                    target: actor,
                    method,
                })
            }
            ActionDescriptor::NodeScript { node, method } => ScenarioKind::NodeScript(ScriptAction {
                target: node,
                method,
            }),
            ActionDescriptor::CallTerminator { actor } => ScenarioKind::CallTerminator { actor },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub trigger: TriggerDescriptor,
    pub action: ActionDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionDescriptor {
    #[default]
    Any,
    Sent,
    Received,
}

impl From<DirectionDescriptor> for DirectionFilter {
    fn from(d: DirectionDescriptor) -> Self {
        match d {
            DirectionDescriptor::Any => DirectionFilter::Any,
            DirectionDescriptor::Sent => DirectionFilter::Sent,
            DirectionDescriptor::Received => DirectionFilter::Received,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssertionDescriptor {
    RequestSeen {
        method: String,
        #[serde(default = "default_min_count")]
        min_count: usize,
        #[serde(default)]
        direction: DirectionDescriptor,
    },
    ResponseSeen {
        #[serde(default)]
        method: Option<String>,
        status: u16,
        #[serde(default)]
        direction: DirectionDescriptor,
    },
    ResponseAbsent {
        status: u16,
    },
    PttSeen {
        control: String,
    },
    Script {
        name: String,
    },
}

fn default_min_count() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostConditionDescriptor {
    #[serde(default)]
    pub description: String,
    /// Node id, or absent for every node
    #[serde(default)]
    pub node: Option<String>,
    pub assertion: AssertionDescriptor,
}

impl PostConditionDescriptor {
    pub fn to_post_condition(&self) -> Result<PostCondition, IssiTesterError> {
        let assertion = match &self.assertion {
            AssertionDescriptor::RequestSeen {
                method,
                min_count,
                direction,
            } => Assertion::RequestSeen {
                method: method.clone(),
                min_count: *min_count,
                direction: (*direction).into(),
            },
            AssertionDescriptor::ResponseSeen {
                method,
                status,
                direction,
            } => Assertion::ResponseSeen {
                method: method.clone(),
                status: *status,
                direction: (*direction).into(),
            },
            AssertionDescriptor::ResponseAbsent { status } => {
                Assertion::ResponseAbsent { status: *status }
            }
            AssertionDescriptor::PttSeen { control } => Assertion::PttSeen {
                control: control.parse()?,
            },
            AssertionDescriptor::Script { name } => Assertion::Script { name: name.clone() },
        };
        Ok(PostCondition {
            description: self.description.clone(),
            location: match &self.node {
                Some(node) => LocationPredicate::Node(node.clone()),
                None => LocationPredicate::Any,
            },
            assertion,
        })
    }
}

/// A test-script file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptDescriptor {
    pub test_case: String,
    pub description: String,
    pub interactive: bool,
    pub trace_capture: bool,
    pub evaluate_pass_fail: bool,
    pub completion_delay_ms: u64,
    pub trace_window_ms: u64,
    pub scenarios: Vec<ScenarioDescriptor>,
    pub post_conditions: Vec<PostConditionDescriptor>,
    /// Per-test topology embedded in the script, merged last
    pub topology: Option<TopologyDoc>,
}

impl Default for ScriptDescriptor {
    fn default() -> Self {
        Self {
            test_case: String::new(),
            description: String::new(),
            interactive: false,
            trace_capture: true,
            evaluate_pass_fail: true,
            completion_delay_ms: DEFAULT_COMPLETION_DELAY.as_millis() as u64,
            trace_window_ms: DEFAULT_TRACE_WINDOW.as_millis() as u64,
            scenarios: Vec::new(),
            post_conditions: Vec::new(),
            topology: None,
        }
    }
}

impl ScriptDescriptor {
    pub fn load_from_str(json: &str) -> Result<Self, IssiTesterError> {
        serde_json::from_str(json)
            .map_err(|e| IssiTesterError::ConfigError(format!("invalid test script: {}", e)))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, IssiTesterError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IssiTesterError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::load_from_str(&content)
    }

    /// Lower into a validated TestScript. `topology_docs` are merged in
    /// order (system, global, per-test), then the embedded topology.
    pub fn build(
        &self,
        topology_docs: &[TopologyDoc],
        test_number: u32,
    ) -> Result<TestScript, IssiTesterError> {
        let docs = topology_docs.iter().chain(self.topology.iter());
        let topology = Topology::merge(docs)?;

        let mut builder = TestScript::builder(self.test_case.clone(), topology)
            .test_number(test_number)
            .description(self.description.clone())
            .interactive(self.interactive)
            .trace_capture(self.trace_capture)
            .evaluate_pass_fail(self.evaluate_pass_fail)
            .completion_delay(Duration::from_millis(self.completion_delay_ms))
            .trace_window(Duration::from_millis(self.trace_window_ms));

        for descriptor in &self.scenarios {
            let scenario = Scenario::new(
                descriptor.id.clone(),
                descriptor.trigger.to_trigger(&descriptor.id)?,
                descriptor.action.to_kind(),
            )
            .with_description(descriptor.description.clone());
            builder = builder.scenario(scenario);
        }
        for descriptor in &self.post_conditions {
            builder = builder.post_condition(descriptor.to_post_condition()?);
        }
        builder.build()
    }
}

pub fn load_topology_file(path: &Path) -> Result<TopologyDoc, IssiTesterError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        IssiTesterError::ConfigError(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| IssiTesterError::ConfigError(format!("invalid topology {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::two_node_topology_doc;
    use std::io::Write;

    const SCRIPT: &str = r#"{
        "test_case": "unit_call_terminate",
        "trace_window_ms": 20000,
        "scenarios": [
            {
                "id": "setup",
                "trigger": {"type": "time", "offset": 1},
                "action": {"type": "call_setup", "caller": "su_1", "callee": "su_2",
                           "priority": 3, "terminate_after_ms": 5000}
            },
            {
                "id": "on_busy",
                "trigger": {"type": "message", "response": 486, "one_shot": false},
                "action": {"type": "node_script", "node": "rfss_1", "method": "note_busy"}
            }
        ],
        "post_conditions": [
            {"description": "BYE answered", "node": "rfss_2",
             "assertion": {"type": "response_seen", "method": "BYE", "status": 200}}
        ]
    }"#;

    #[test]
    fn test_build_from_json() {
        let descriptor = ScriptDescriptor::load_from_str(SCRIPT).unwrap();
        let script = descriptor.build(&[two_node_topology_doc()], 7).unwrap();
        assert_eq!(script.test_case, "unit_call_terminate");
        assert_eq!(script.test_number, 7);
        assert_eq!(script.trace_window, Duration::from_secs(20));
        assert!(script.evaluate_pass_fail);
        // setup, its synthesized terminator and the message-triggered scenario
        assert_eq!(script.len(), 3);
        assert!(script.scenario("setup.terminate").is_some());
        let on_busy = script.scenario("on_busy").unwrap();
        assert!(on_busy.trigger.is_message_triggered());
        assert_eq!(
            script.post_conditions[0].location,
            LocationPredicate::Node("rfss_2".into())
        );
    }

    #[test]
    fn test_message_trigger_needs_one_pattern() {
        let descriptor = TriggerDescriptor::Message {
            request: Some("INVITE".into()),
            response: Some(200),
            ptt: None,
            one_shot: true,
            after: vec![],
        };
        assert!(descriptor.to_trigger("x").is_err());
    }

    #[test]
    fn test_ptt_trigger_parses_control() {
        let descriptor: TriggerDescriptor =
            serde_json::from_str(r#"{"type": "message", "ptt": "spurt-grant"}"#).unwrap();
        let trigger = descriptor.to_trigger("x").unwrap();
        assert_eq!(
            trigger,
            Trigger::message(MessagePattern::Ptt(PttControlType::SpurtGrant))
        );
    }

    #[test]
    fn test_unknown_field_type_is_config_error() {
        let result = ScriptDescriptor::load_from_str(r#"{"scenarios": [{"id": "a"}]}"#);
        assert!(matches!(result, Err(IssiTesterError::ConfigError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCRIPT.as_bytes()).unwrap();
        let descriptor = ScriptDescriptor::load_from_file(file.path()).unwrap();
        assert_eq!(descriptor.scenarios.len(), 2);
    }

    #[test]
    fn test_embedded_topology_is_merged_last() {
        let mut descriptor = ScriptDescriptor::load_from_str(SCRIPT).unwrap();
        let mut overlay = TopologyDoc::default();
        let mut rfss_2 = two_node_topology_doc().rfss[1].clone();
        rfss_2.rf_resources_available = false;
        overlay.rfss.push(rfss_2);
        descriptor.topology = Some(overlay);
        let script = descriptor.build(&[two_node_topology_doc()], 1).unwrap();
        assert!(!script.topology.rfss("rfss_2").unwrap().rf_resources_available);
    }
}
