// Test script: scenarios, topology and post-conditions for one run

pub mod descriptor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::IssiTesterError;
use crate::postcondition::PostCondition;
use crate::scenario::{PostTrigger, Scenario, ScenarioKind};
use crate::topology::Topology;
use crate::trigger::Trigger;

pub const DEFAULT_COMPLETION_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_TRACE_WINDOW: Duration = Duration::from_secs(30);

/// Suffix of the CallTerminator synthesized for terminate-after
pub const TERMINATOR_SUFFIX: &str = ".terminate";

#[derive(Debug, Clone)]
pub struct TestScript {
    pub test_case: String,
    pub test_number: u32,
    pub description: String,
    scenarios: Vec<Scenario>,
    index: HashMap<String, usize>,
    pub topology: Arc<Topology>,
    pub post_conditions: Vec<PostCondition>,
    pub interactive: bool,
    pub trace_capture: bool,
    pub evaluate_pass_fail: bool,
    pub completion_delay: Duration,
    pub trace_window: Duration,
}

impl TestScript {
    pub fn builder(test_case: impl Into<String>, topology: Topology) -> TestScriptBuilder {
        TestScriptBuilder {
            test_case: test_case.into(),
            test_number: 1,
            description: String::new(),
            topology,
            scenarios: Vec::new(),
            post_conditions: Vec::new(),
            interactive: false,
            trace_capture: true,
            evaluate_pass_fail: true,
            completion_delay: DEFAULT_COMPLETION_DELAY,
            trace_window: DEFAULT_TRACE_WINDOW,
        }
    }

    /// Scenarios in enumeration order
    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn scenario(&self, id: &str) -> Option<&Scenario> {
        self.index.get(id).map(|&i| &self.scenarios[i])
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Time-triggered scenarios with no preconditions, in enumeration order
    pub fn root_time_scenarios(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios
            .iter()
            .filter(|s| s.trigger.is_time_triggered() && s.trigger.preconditions.is_empty())
    }
}

pub struct TestScriptBuilder {
    test_case: String,
    test_number: u32,
    description: String,
    topology: Topology,
    scenarios: Vec<Scenario>,
    post_conditions: Vec<PostCondition>,
    interactive: bool,
    trace_capture: bool,
    evaluate_pass_fail: bool,
    completion_delay: Duration,
    trace_window: Duration,
}

impl TestScriptBuilder {
    pub fn test_number(mut self, number: u32) -> Self {
        self.test_number = number;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    pub fn post_condition(mut self, condition: PostCondition) -> Self {
        self.post_conditions.push(condition);
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn trace_capture(mut self, enabled: bool) -> Self {
        self.trace_capture = enabled;
        self
    }

    pub fn evaluate_pass_fail(mut self, evaluate: bool) -> Self {
        self.evaluate_pass_fail = evaluate;
        self
    }

    pub fn completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    pub fn trace_window(mut self, window: Duration) -> Self {
        self.trace_window = window;
        self
    }

    /// Validate the scenario graph and produce the script. Any error here
    /// is a configuration error; nothing has been scheduled yet.
    pub fn build(self) -> Result<TestScript, IssiTesterError> {
        let mut scenarios = self.scenarios;

        // terminate-after becomes a CallTerminator that runs after the setup
        let mut synthesized = Vec::new();
        for scenario in &scenarios {
            let (cancel_after, terminate_after) = scenario.kind.call_timers();
            if cancel_after.is_some() && terminate_after.is_some() {
                return Err(IssiTesterError::ConflictingCallTimers(scenario.id.clone()));
            }
            if let (Some(delay), Some(caller)) = (terminate_after, scenario.kind.calling_actor()) {
                synthesized.push(
                    Scenario::new(
                        format!("{}{}", scenario.id, TERMINATOR_SUFFIX),
                        Trigger::fine_time(delay.as_millis() as u64).after(scenario.id.clone()),
                        ScenarioKind::CallTerminator {
                            actor: caller.to_string(),
                        },
                    )
                    .with_description(format!("terminate call set up by {}", scenario.id)),
                );
            }
        }
        scenarios.extend(synthesized);

        let mut index = HashMap::with_capacity(scenarios.len());
        for (i, scenario) in scenarios.iter().enumerate() {
            if index.insert(scenario.id.clone(), i).is_some() {
                return Err(IssiTesterError::DuplicateScenario(scenario.id.clone()));
            }
        }

        for scenario in &scenarios {
            check_references(&self.topology, &scenario.kind)?;
            if !scenario.trigger.preconditions.is_empty() && !scenario.trigger.is_time_triggered() {
                return Err(IssiTesterError::NonTimeDependentTrigger(scenario.id.clone()));
            }
            for precondition in &scenario.trigger.preconditions {
                if !index.contains_key(precondition) {
                    return Err(IssiTesterError::UnknownPrecondition {
                        scenario: scenario.id.clone(),
                        precondition: precondition.clone(),
                    });
                }
            }
        }

        // precondition -> dependent edges
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); scenarios.len()];
        for (dependent, scenario) in scenarios.iter().enumerate() {
            for precondition in &scenario.trigger.preconditions {
                edges[index[precondition]].push(dependent);
            }
        }
        if let Some(node) = find_cycle(&edges) {
            return Err(IssiTesterError::DependencyCycle(scenarios[node].id.clone()));
        }

        for (precondition, dependents) in edges.iter().enumerate() {
            let post_triggers: Vec<PostTrigger> = dependents
                .iter()
                .map(|&d| PostTrigger {
                    scenario_id: scenarios[d].id.clone(),
                    delay: scenarios[d].trigger.offset().unwrap_or_default(),
                })
                .collect();
            scenarios[precondition].post_triggers = post_triggers;
        }

        debug!(
            test_case = %self.test_case,
            scenarios = scenarios.len(),
            "test script built"
        );

        Ok(TestScript {
            test_case: self.test_case,
            test_number: self.test_number,
            description: self.description,
            scenarios,
            index,
            topology: Arc::new(self.topology),
            post_conditions: self.post_conditions,
            interactive: self.interactive,
            trace_capture: self.trace_capture,
            evaluate_pass_fail: self.evaluate_pass_fail,
            completion_delay: self.completion_delay,
            trace_window: self.trace_window,
        })
    }
}

fn check_unit(topology: &Topology, id: &str) -> Result<(), IssiTesterError> {
    topology
        .unit(id)
        .map(|_| ())
        .ok_or_else(|| IssiTesterError::UnknownActor(id.to_string()))
}

fn check_references(topology: &Topology, kind: &ScenarioKind) -> Result<(), IssiTesterError> {
    match kind {
        ScenarioKind::CallSetup(setup) => {
            check_unit(topology, &setup.caller)?;
            check_unit(topology, &setup.callee)?;
            if let Some(sender) = &setup.talk_spurt_sender {
                check_unit(topology, sender)?;
            }
        }
        ScenarioKind::GroupCallSetup(setup) => {
            check_unit(topology, &setup.caller)?;
            if topology.group(&setup.group).is_none() {
                return Err(IssiTesterError::UnknownGroup(setup.group.clone()));
            }
        }
        ScenarioKind::Roaming(roaming) => {
            check_unit(topology, &roaming.actor)?;
            if topology.rfss(&roaming.destination).is_none() {
                return Err(IssiTesterError::UnknownNode(roaming.destination.clone()));
            }
        }
        ScenarioKind::ActorScript(action) => check_unit(topology, &action.target)?,
        ScenarioKind::NodeScript(action) => {
            if topology.rfss(&action.target).is_none() {
                return Err(IssiTesterError::UnknownNode(action.target.clone()));
            }
        }
        ScenarioKind::CallTerminator { actor } => check_unit(topology, actor)?,
    }
    Ok(())
}

/// Iterative three-colour DFS. Returns a node on a cycle, if any.
fn find_cycle(edges: &[Vec<usize>]) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }
    let mut marks = vec![Mark::White; edges.len()];
    for root in 0..edges.len() {
        if marks[root] != Mark::White {
            continue;
        }
        let mut stack = vec![(root, 0usize)];
        marks[root] = Mark::Grey;
        while let Some((node, next)) = stack.pop() {
            if next < edges[node].len() {
                stack.push((node, next + 1));
                let child = edges[node][next];
                match marks[child] {
                    Mark::Grey => return Some(child),
                    Mark::White => {
                        marks[child] = Mark::Grey;
                        stack.push((child, 0));
                    }
                    Mark::Black => {}
                }
            } else {
                marks[node] = Mark::Black;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::CallSetup;
    use crate::testutil::two_node_topology;
    use crate::trigger::MessagePattern;
    use crate::sip::message::Method;

    fn call(id: &str, trigger: Trigger) -> Scenario {
        Scenario::new(
            id,
            trigger,
            ScenarioKind::CallSetup(CallSetup {
                caller: "su_1".into(),
                callee: "su_2".into(),
                ..Default::default()
            }),
        )
    }

    fn hang_up(id: &str, trigger: Trigger) -> Scenario {
        Scenario::new(
            id,
            trigger,
            ScenarioKind::CallTerminator {
                actor: "su_1".into(),
            },
        )
    }

    #[test]
    fn test_build_links_post_triggers() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(call("a", Trigger::time(1)))
            .scenario(hang_up("b", Trigger::time(4).after("a")))
            .build()
            .unwrap();
        let a = script.scenario("a").unwrap();
        assert_eq!(
            a.post_triggers,
            vec![PostTrigger {
                scenario_id: "b".into(),
                delay: Duration::from_secs(4)
            }]
        );
        let roots: Vec<&str> = script.root_time_scenarios().map(|s| s.id.as_str()).collect();
        assert_eq!(roots, vec!["a"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = TestScript::builder("tc", two_node_topology())
            .scenario(call("a", Trigger::time(1)))
            .scenario(call("a", Trigger::time(2)))
            .build();
        assert!(matches!(result, Err(IssiTesterError::DuplicateScenario(id)) if id == "a"));
    }

    #[test]
    fn test_cancel_and_terminate_rejected() {
        let scenario = Scenario::new(
            "a",
            Trigger::time(1),
            ScenarioKind::CallSetup(CallSetup {
                caller: "su_1".into(),
                callee: "su_2".into(),
                cancel_after: Some(Duration::from_secs(1)),
                terminate_after: Some(Duration::from_secs(5)),
                ..Default::default()
            }),
        );
        let result = TestScript::builder("tc", two_node_topology())
            .scenario(scenario)
            .build();
        assert!(matches!(result, Err(IssiTesterError::ConflictingCallTimers(id)) if id == "a"));
    }

    #[test]
    fn test_unknown_precondition_rejected() {
        let result = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("b", Trigger::time(1).after("ghost")))
            .build();
        assert!(matches!(
            result,
            Err(IssiTesterError::UnknownPrecondition { precondition, .. }) if precondition == "ghost"
        ));
    }

    #[test]
    fn test_message_trigger_with_precondition_rejected() {
        let result = TestScript::builder("tc", two_node_topology())
            .scenario(call("a", Trigger::time(1)))
            .scenario(hang_up(
                "b",
                Trigger::message(MessagePattern::Request(Method::Bye)).after("a"),
            ))
            .build();
        assert!(matches!(result, Err(IssiTesterError::NonTimeDependentTrigger(id)) if id == "b"));
    }

    #[test]
    fn test_cycle_rejected() {
        let result = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("a", Trigger::time(1).after("c")))
            .scenario(hang_up("b", Trigger::time(1).after("a")))
            .scenario(hang_up("c", Trigger::time(1).after("b")))
            .build();
        assert!(matches!(result, Err(IssiTesterError::DependencyCycle(_))));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("a", Trigger::time(1)))
            .scenario(hang_up("b", Trigger::time(1).after("a")))
            .scenario(hang_up("c", Trigger::time(1).after("a")))
            .scenario(hang_up("d", Trigger::time(1).after("b").after("c")))
            .build()
            .unwrap();
        assert_eq!(script.scenario("a").unwrap().post_triggers.len(), 2);
    }

    #[test]
    fn test_terminate_after_synthesizes_terminator() {
        let scenario = Scenario::new(
            "call",
            Trigger::time(0),
            ScenarioKind::CallSetup(CallSetup {
                caller: "su_1".into(),
                callee: "su_2".into(),
                terminate_after: Some(Duration::from_secs(5)),
                ..Default::default()
            }),
        );
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(scenario)
            .build()
            .unwrap();
        let terminator = script.scenario("call.terminate").unwrap();
        assert_eq!(
            terminator.kind,
            ScenarioKind::CallTerminator {
                actor: "su_1".into()
            }
        );
        assert_eq!(terminator.trigger.offset(), Some(Duration::from_secs(5)));
        assert_eq!(script.scenario("call").unwrap().post_triggers[0].scenario_id, "call.terminate");
    }

    #[test]
    fn test_unknown_actor_rejected() {
        let result = TestScript::builder("tc", two_node_topology())
            .scenario(Scenario::new(
                "a",
                Trigger::time(1),
                ScenarioKind::CallTerminator {
                    actor: "su_99".into(),
                },
            ))
            .build();
        assert!(matches!(result, Err(IssiTesterError::UnknownActor(a)) if a == "su_99"));
    }
}
