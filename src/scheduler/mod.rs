// Per-node test-run scheduler
//
// Owns the registered scenarios of one run, arms timers for time triggers,
// evaluates message triggers against observed traffic and realises
// dependency chains through post-triggers. All scenario execution and
// trigger bookkeeping is serialised by one async lock, so a message
// dispatch never interleaves with a running scenario.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::action::ScriptHost;
use crate::error::IssiTesterError;
use crate::postcondition::{evaluate_all, PostConditionOutcome};
use crate::scenario::Scenario;
use crate::script::TestScript;
use crate::timer::TimerService;
use crate::trace::SignalingLog;
use crate::trigger::{FiredRegistry, ObservedEvent, TriggerKind};

/// Performs the type-specific action of a scenario
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    async fn execute(&self, scenario: &Scenario) -> Result<(), IssiTesterError>;
}

/// When a scenario started executing, relative to run start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioRun {
    pub scenario_id: String,
    pub elapsed: Duration,
}

/// Everything a scheduler needs for one run
pub struct SchedulerParts {
    pub node_id: String,
    pub domain: String,
    pub script: Arc<TestScript>,
    pub executor: Arc<dyn ScenarioExecutor>,
    pub script_host: Arc<dyn ScriptHost>,
    pub log: Arc<SignalingLog>,
    pub timers: Arc<TimerService>,
}

#[derive(Default)]
struct Registry {
    scenarios: HashMap<String, Scenario>,
    /// Scenarios with message triggers, in registration order
    message_triggered: Vec<String>,
    fired: FiredRegistry,
    /// Completed preconditions per dependent scenario
    satisfied: HashMap<String, HashSet<String>>,
}

pub struct Scheduler {
    node_id: String,
    domain: String,
    script: Arc<TestScript>,
    executor: Arc<dyn ScenarioExecutor>,
    script_host: Arc<dyn ScriptHost>,
    log: Arc<SignalingLog>,
    timers: Arc<TimerService>,
    registry: Mutex<Registry>,
    exec_lock: tokio::sync::Mutex<()>,
    gates: DashMap<String, Arc<Semaphore>>,
    started_at: Mutex<Option<Instant>>,
    completed: AtomicBool,
    failed: AtomicBool,
    errors: Mutex<Vec<String>>,
    history: Mutex<Vec<ScenarioRun>>,
    outcomes: Mutex<Vec<PostConditionOutcome>>,
    done_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Create the scheduler and register every scenario of the script
    pub fn new(parts: SchedulerParts) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        let scheduler = Arc::new(Self {
            node_id: parts.node_id,
            domain: parts.domain,
            script: parts.script,
            executor: parts.executor,
            script_host: parts.script_host,
            log: parts.log,
            timers: parts.timers,
            registry: Mutex::new(Registry::default()),
            exec_lock: tokio::sync::Mutex::new(()),
            gates: DashMap::new(),
            started_at: Mutex::new(None),
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            outcomes: Mutex::new(Vec::new()),
            done_tx,
        });
        for scenario in scheduler.script.scenarios() {
            scheduler.register_scenario(scenario.clone());
        }
        scheduler
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn script(&self) -> &Arc<TestScript> {
        &self.script
    }

    /// Add a scenario to this run. Message-triggered scenarios also join
    /// the set consulted by dispatch_message.
    pub fn register_scenario(&self, scenario: Scenario) {
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        if scenario.trigger.is_message_triggered() && !registry.message_triggered.contains(&scenario.id) {
            registry.message_triggered.push(scenario.id.clone());
        }
        registry.scenarios.insert(scenario.id.clone(), scenario);
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().map(|r| r.scenarios.len()).unwrap_or(0)
    }

    fn registered(&self, id: &str) -> Option<Scenario> {
        self.registry
            .lock()
            .ok()
            .and_then(|r| r.scenarios.get(id).cloned())
    }

    fn elapsed(&self) -> Duration {
        self.started_at
            .lock()
            .ok()
            .and_then(|s| s.map(|t| t.elapsed()))
            .unwrap_or_default()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Arm a timer for every precondition-free time-triggered scenario and,
    /// for non-interactive runs, the completion timer.
    pub fn start(self: &Arc<Self>) -> Result<(), IssiTesterError> {
        {
            let mut started = self
                .started_at
                .lock()
                .map_err(|_| IssiTesterError::CallControl("scheduler lock poisoned".into()))?;
            if started.is_some() {
                return Err(IssiTesterError::TestInProgress);
            }
            *started = Some(Instant::now());
        }
        self.log.reset();

        let roots: Vec<(String, Duration)> = self
            .script
            .root_time_scenarios()
            .filter_map(|s| s.trigger.offset().map(|offset| (s.id.clone(), offset)))
            .collect();
        info!(
            node = %self.node_id,
            test_case = %self.script.test_case,
            timed = roots.len(),
            interactive = self.script.interactive,
            "starting test run"
        );

        for (id, offset) in roots {
            if self.script.interactive {
                self.gates.insert(id.clone(), Arc::new(Semaphore::new(0)));
            }
            self.arm(id, offset, true);
        }

        if !self.script.interactive {
            let this = self.clone();
            self.timers.schedule(self.script.trace_window, async move {
                // Detached so that cancel_all inside complete() cannot abort it
                tokio::spawn(async move {
                    this.complete().await;
                });
            });
        }
        Ok(())
    }

    fn arm(self: &Arc<Self>, id: String, delay: Duration, gated: bool) {
        let this = self.clone();
        let scenario_id = id.clone();
        let armed = self.timers.schedule(delay, async move {
            if gated {
                this.interactive_wait(&scenario_id).await;
            }
            this.run_scenario(&scenario_id).await;
        });
        if armed.is_none() {
            debug!(node = %self.node_id, scenario = %id, "timer service closed, not arming");
        }
    }

    /// Interactive runs hold a precondition-free time-triggered scenario
    /// until signal_next releases its gate.
    async fn interactive_wait(&self, id: &str) {
        let Some(gate) = self.gates.get(id).map(|g| g.value().clone()) else {
            return;
        };
        info!(node = %self.node_id, scenario = %id, "waiting for operator");
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        };
        // One release per gated scenario; later signals for it are unknown
        self.gates.remove(id);
    }

    /// Release an interactive gate, or run a manually triggered scenario.
    pub fn signal_next(self: &Arc<Self>, id: &str) -> Result<(), IssiTesterError> {
        if let Some(gate) = self.gates.get(id) {
            gate.add_permits(1);
            return Ok(());
        }
        match self.registered(id) {
            Some(scenario) if scenario.trigger.kind == TriggerKind::Manual => {
                let this = self.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    this.run_scenario(&id).await;
                });
                Ok(())
            }
            _ => Err(IssiTesterError::UnknownScenario(id.to_string())),
        }
    }

    /// Evaluate message triggers against an observed event and run every
    /// scenario whose trigger is ready, in registration order.
    pub async fn dispatch_message(self: &Arc<Self>, domain: &str, event: &ObservedEvent) {
        let _guard = self.exec_lock.lock().await;
        if self.completed.load(Ordering::Acquire) {
            return;
        }
        let ready: Vec<Scenario> = {
            let Ok(mut registry) = self.registry.lock() else {
                return;
            };
            let registry = &mut *registry;
            registry
                .message_triggered
                .iter()
                .filter_map(|id| registry.scenarios.get(id))
                .filter(|s| s.trigger.is_ready(&s.id, domain, event, &mut registry.fired))
                .cloned()
                .collect()
        };
        for scenario in ready {
            debug!(
                node = %self.node_id,
                scenario = %scenario.id,
                event = %event.summary(),
                "message trigger fired"
            );
            self.execute_locked(&scenario).await;
        }
    }

    /// Run one registered scenario now, unless the run already completed
    pub async fn run_scenario(self: &Arc<Self>, id: &str) {
        let _guard = self.exec_lock.lock().await;
        if self.completed.load(Ordering::Acquire) {
            return;
        }
        match self.registered(id) {
            Some(scenario) => self.execute_locked(&scenario).await,
            None => warn!(node = %self.node_id, scenario = %id, "scenario not registered"),
        }
    }

    /// Caller holds exec_lock
    async fn execute_locked(self: &Arc<Self>, scenario: &Scenario) {
        let elapsed = self.elapsed();
        if let Ok(mut history) = self.history.lock() {
            history.push(ScenarioRun {
                scenario_id: scenario.id.clone(),
                elapsed,
            });
        }
        info!(
            node = %self.node_id,
            scenario = %scenario.id,
            kind = scenario.kind.tag(),
            elapsed_ms = elapsed.as_millis() as u64,
            "running scenario"
        );

        let result = AssertUnwindSafe(self.executor.execute(scenario))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.record_failure(&scenario.id, &e.to_string()),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                self.record_failure(&scenario.id, &reason);
            }
        }

        for post in &scenario.post_triggers {
            if self.preconditions_satisfied(&post.scenario_id, &scenario.id) {
                debug!(
                    node = %self.node_id,
                    scenario = %post.scenario_id,
                    after = %scenario.id,
                    delay_ms = post.delay.as_millis() as u64,
                    "arming dependent scenario"
                );
                self.arm(post.scenario_id.clone(), post.delay, false);
            }
        }
    }

    /// Mark `completed` as done for `dependent`. True when every
    /// precondition has completed since the dependent was last armed; the
    /// tally then starts over so a repeating precondition re-arms it.
    fn preconditions_satisfied(&self, dependent: &str, completed: &str) -> bool {
        let Some(required) = self.registered(dependent).map(|s| s.trigger.preconditions) else {
            return false;
        };
        let Ok(mut registry) = self.registry.lock() else {
            return false;
        };
        let done = registry.satisfied.entry(dependent.to_string()).or_default();
        done.insert(completed.to_string());
        if !required.iter().all(|p| done.contains(p)) {
            return false;
        }
        registry.satisfied.remove(dependent);
        true
    }

    fn record_failure(&self, scenario: &str, reason: &str) {
        error!(node = %self.node_id, scenario = %scenario, reason = %reason, "scenario failed");
        self.failed.store(true, Ordering::Release);
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(
                IssiTesterError::ScenarioFailed {
                    scenario: scenario.to_string(),
                    reason: reason.to_string(),
                }
                .to_string(),
            );
        }
    }

    /// Complete the run after the script's completion delay
    pub fn signal_test_completion(self: &Arc<Self>) {
        let this = self.clone();
        let delay = self.script.completion_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.complete().await;
        });
    }

    /// Cancel pending timers, clear registrations and evaluate
    /// post-conditions when the script asks for it. Only the first call
    /// does anything; returns whether this call completed the run.
    pub async fn complete(&self) -> bool {
        self.finish(self.script.evaluate_pass_fail).await
    }

    /// Stop the run without evaluating post-conditions
    pub async fn tear_down(&self) -> bool {
        self.finish(false).await
    }

    async fn finish(&self, evaluate: bool) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let cancelled = self.timers.cancel_all();
        self.gates.clear();
        let _guard = self.exec_lock.lock().await;
        if let Ok(mut registry) = self.registry.lock() {
            registry.scenarios.clear();
            registry.message_triggered.clear();
            registry.fired.clear();
            registry.satisfied.clear();
        }

        if evaluate {
            let records = self.log.records();
            let outcomes = evaluate_all(
                &self.script.post_conditions,
                &self.node_id,
                &records,
                self.script_host.as_ref(),
            );
            for outcome in outcomes.iter().filter(|o| !o.passed) {
                warn!(
                    node = %self.node_id,
                    condition = %outcome.description,
                    detail = %outcome.detail,
                    "post-condition failed"
                );
                self.failed.store(true, Ordering::Release);
                if let Ok(mut errors) = self.errors.lock() {
                    errors.push(format!(
                        "Post-condition failed: {} ({})",
                        outcome.description, outcome.detail
                    ));
                }
            }
            if let Ok(mut stored) = self.outcomes.lock() {
                *stored = outcomes;
            }
        }

        info!(
            node = %self.node_id,
            test_case = %self.script.test_case,
            cancelled_timers = cancelled,
            passed = self.passed(),
            "test run completed"
        );
        let _ = self.done_tx.send(true);
        true
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// True unless a scenario or post-condition failed
    pub fn passed(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    pub fn has_errors(&self) -> bool {
        self.errors.lock().map(|e| !e.is_empty()).unwrap_or(true)
    }

    pub fn error_log(&self) -> String {
        self.errors
            .lock()
            .map(|errors| errors.join("\n"))
            .unwrap_or_default()
    }

    pub fn history(&self) -> Vec<ScenarioRun> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn outcomes(&self) -> Vec<PostConditionOutcome> {
        self.outcomes.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Resolves once the run has completed
    pub async fn wait_completed(&self) {
        let mut rx = self.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::postcondition::{Assertion, PostCondition};
    use crate::scenario::ScenarioKind;
    use crate::sip::message::{Method, SipMessage, SipRequest};
    use crate::testutil::two_node_topology;
    use crate::trace::Direction;
    use crate::trigger::{MessagePattern, Trigger};
    use proptest::prelude::*;

    /// Records executions; fails or panics on request
    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScenarioExecutor for RecordingExecutor {
        async fn execute(&self, scenario: &Scenario) -> Result<(), IssiTesterError> {
            self.executed.lock().unwrap().push(scenario.id.clone());
            match scenario.id.as_str() {
                "fails" => Err(IssiTesterError::CallControl("boom".into())),
                "panics" => panic!("scenario exploded"),
                _ => Ok(()),
            }
        }
    }

    impl RecordingExecutor {
        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
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

    fn scheduler_for(
        script: TestScript,
    ) -> (Arc<Scheduler>, Arc<RecordingExecutor>, Arc<SignalingLog>) {
        let executor = Arc::new(RecordingExecutor::default());
        let log = Arc::new(SignalingLog::new("rfss_1"));
        let scheduler = Scheduler::new(SchedulerParts {
            node_id: "rfss_1".into(),
            domain: "rfss_1.p25dr".into(),
            script: Arc::new(script),
            executor: executor.clone(),
            script_host: Arc::new(ActionRegistry::new()),
            log: log.clone(),
            timers: Arc::new(TimerService::new()),
        });
        (scheduler, executor, log)
    }

    fn invite_event() -> ObservedEvent {
        ObservedEvent::Sip(SipMessage::Request(SipRequest::new(
            Method::Invite,
            "sip:su_2@rfss_2.p25dr",
        )))
    }

    // ===== time triggers =====

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_runs_at_offset_once() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("a", Trigger::time(5)))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(4_990)).await;
        assert!(executor.executed().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executor.executed(), vec!["a"]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(executor.executed(), vec!["a"]);
        assert_eq!(scheduler.history()[0].elapsed, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fine_trigger_uses_raw_millis() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("fine", Trigger::fine_time(250)))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executor.executed(), vec!["fine"]);
        assert_eq!(scheduler.history()[0].elapsed, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let script = TestScript::builder("tc", two_node_topology()).build().unwrap();
        let (scheduler, _, _) = scheduler_for(script);
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(IssiTesterError::TestInProgress)));
    }

    // ===== dependencies =====

    #[tokio::test(start_paused = true)]
    async fn test_dependent_runs_relative_to_precondition() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("a", Trigger::time(2)))
            .scenario(hang_up("b", Trigger::time(3).after("a")))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(executor.executed(), vec!["a", "b"]);
        let history = scheduler.history();
        assert_eq!(history[1].elapsed, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_waits_for_all_preconditions() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("a", Trigger::time(1)))
            .scenario(hang_up("b", Trigger::time(4)))
            .scenario(hang_up("c", Trigger::fine_time(500).after("a").after("b")))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(executor.executed(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.history()[2].elapsed, Duration::from_millis(4_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_scenario_still_arms_dependents() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("fails", Trigger::time(1)))
            .scenario(hang_up("after", Trigger::time(1).after("fails")))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(executor.executed(), vec!["fails", "after"]);
        assert!(!scheduler.passed());
        assert!(scheduler.error_log().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_scenario_is_contained() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("panics", Trigger::time(1)))
            .scenario(hang_up("later", Trigger::time(2)))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(executor.executed(), vec!["panics", "later"]);
        assert!(scheduler.error_log().contains("scenario exploded"));
    }

    // ===== message triggers =====

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_runs_matching_one_shot_once_per_domain() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up(
                "on_invite",
                Trigger::message(MessagePattern::Request(Method::Invite)),
            ))
            .scenario(hang_up("on_ok", Trigger::message(MessagePattern::Response(200))))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();

        scheduler.dispatch_message("rfss_1.p25dr", &invite_event()).await;
        scheduler.dispatch_message("rfss_1.p25dr", &invite_event()).await;
        scheduler.dispatch_message("rfss_2.p25dr", &invite_event()).await;
        assert_eq!(executor.executed(), vec!["on_invite", "on_invite"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_trigger_runs_every_time() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up(
                "every",
                Trigger::message(MessagePattern::Request(Method::Invite)).repeating(),
            ))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        for _ in 0..3 {
            scheduler.dispatch_message("rfss_1.p25dr", &invite_event()).await;
        }
        assert_eq!(executor.executed().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_triggered_scenario_arms_post_triggers() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up(
                "on_invite",
                Trigger::message(MessagePattern::Request(Method::Invite)),
            ))
            .scenario(hang_up("later", Trigger::time(2).after("on_invite")))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.dispatch_message("rfss_1.p25dr", &invite_event()).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(executor.executed(), vec!["on_invite", "later"]);
        assert_eq!(scheduler.history()[1].elapsed, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_precondition_rearms_dependent_each_time() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up(
                "every",
                Trigger::message(MessagePattern::Request(Method::Invite)).repeating(),
            ))
            .scenario(hang_up("dep", Trigger::time(1).after("every")))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        for _ in 0..3 {
            scheduler.dispatch_message("rfss_1.p25dr", &invite_event()).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(
            executor.executed(),
            vec!["every", "dep", "every", "dep", "every", "dep"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_precondition_dependent_rearms_after_both_repeat() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("m1", Trigger::manual()))
            .scenario(hang_up("m2", Trigger::manual()))
            .scenario(hang_up("both", Trigger::time(1).after("m1").after("m2")))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();

        scheduler.run_scenario("m1").await;
        scheduler.run_scenario("m1").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(executor.executed(), vec!["m1", "m1"]);

        scheduler.run_scenario("m2").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(executor.executed(), vec!["m1", "m1", "m2", "both"]);

        scheduler.run_scenario("m2").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(executor.executed().len(), 5);
        scheduler.run_scenario("m1").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(executor.executed().last().map(String::as_str), Some("both"));
        assert_eq!(executor.executed().len(), 7);
    }

    // ===== interactive =====

    #[tokio::test(start_paused = true)]
    async fn test_interactive_waits_for_signal_next() {
        let script = TestScript::builder("tc", two_node_topology())
            .interactive(true)
            .scenario(hang_up("a", Trigger::time(1)))
            .scenario(hang_up("b", Trigger::time(1)))
            .scenario(hang_up("dep", Trigger::time(1).after("a")))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(executor.executed().is_empty());

        scheduler.signal_next("a").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.executed(), vec!["a"]);

        // Dependents are not gated
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(executor.executed(), vec!["a", "dep"]);

        scheduler.signal_next("b").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.executed(), vec!["a", "dep", "b"]);
        assert!(!scheduler.is_completed());

        // A released gate cannot be signalled again
        assert!(matches!(
            scheduler.signal_next("a"),
            Err(IssiTesterError::UnknownScenario(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_next_runs_manual_and_rejects_unknown() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("manual", Trigger::manual()))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        scheduler.signal_next("manual").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.executed(), vec!["manual"]);
        assert!(matches!(
            scheduler.signal_next("ghost"),
            Err(IssiTesterError::UnknownScenario(_))
        ));
    }

    // ===== completion =====

    #[tokio::test(start_paused = true)]
    async fn test_trace_window_completes_run() {
        let script = TestScript::builder("tc", two_node_topology())
            .trace_window(Duration::from_secs(10))
            .scenario(hang_up("a", Trigger::time(1)))
            .build()
            .unwrap();
        let (scheduler, _, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!scheduler.is_completed());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(scheduler.is_completed());
        assert!(scheduler.passed());
        assert_eq!(scheduler.registered_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_cancels_pending_scenarios_and_is_idempotent() {
        let script = TestScript::builder("tc", two_node_topology())
            .scenario(hang_up("a", Trigger::time(1)))
            .scenario(hang_up("late", Trigger::time(20)))
            .post_condition(PostCondition::new(
                "never busy",
                Assertion::ResponseAbsent { status: 486 },
            ))
            .build()
            .unwrap();
        let (scheduler, executor, _) = scheduler_for(script);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(scheduler.complete().await);
        assert!(!scheduler.complete().await);
        assert!(!scheduler.tear_down().await);
        assert_eq!(scheduler.outcomes().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(executor.executed(), vec!["a"]);
        scheduler.dispatch_message("rfss_1.p25dr", &invite_event()).await;
        scheduler.run_scenario("late").await;
        assert_eq!(executor.executed(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_post_condition_fails_run() {
        let script = TestScript::builder("tc", two_node_topology())
            .post_condition(PostCondition::new(
                "saw an INVITE",
                Assertion::RequestSeen {
                    method: "INVITE".into(),
                    min_count: 1,
                    direction: Default::default(),
                },
            ))
            .build()
            .unwrap();
        let (scheduler, _, _) = scheduler_for(script);
        scheduler.start().unwrap();
        scheduler.complete().await;
        assert!(!scheduler.passed());
        assert!(scheduler.error_log().contains("saw an INVITE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_conditions_read_signaling_log() {
        let script = TestScript::builder("tc", two_node_topology())
            .post_condition(PostCondition::new(
                "saw an INVITE",
                Assertion::RequestSeen {
                    method: "INVITE".into(),
                    min_count: 1,
                    direction: Default::default(),
                },
            ))
            .build()
            .unwrap();
        let (scheduler, _, log) = scheduler_for(script);
        scheduler.start().unwrap();
        log.record(Direction::Received, "rfss_2", &invite_event());
        scheduler.complete().await;
        assert!(scheduler.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tear_down_skips_post_conditions() {
        let script = TestScript::builder("tc", two_node_topology())
            .post_condition(PostCondition::new(
                "impossible",
                Assertion::ResponseSeen {
                    method: None,
                    status: 999,
                    direction: Default::default(),
                },
            ))
            .build()
            .unwrap();
        let (scheduler, _, _) = scheduler_for(script);
        scheduler.start().unwrap();
        assert!(scheduler.tear_down().await);
        assert!(scheduler.passed());
        assert!(scheduler.outcomes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_test_completion_waits_for_delay() {
        let script = TestScript::builder("tc", two_node_topology())
            .interactive(true)
            .completion_delay(Duration::from_secs(2))
            .build()
            .unwrap();
        let (scheduler, _, _) = scheduler_for(script);
        scheduler.start().unwrap();
        scheduler.signal_test_completion();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!scheduler.is_completed());
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_completed())
            .await
            .unwrap();
        assert!(scheduler.is_completed());
    }

    // ===== ordering =====

    #[test]
    fn test_earlier_offset_always_runs_first() {
        for _ in 0..100 {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            runtime.block_on(async {
                let script = TestScript::builder("tc", two_node_topology())
                    .scenario(hang_up("ten", Trigger::time(10)))
                    .scenario(hang_up("five", Trigger::time(5)))
                    .build()
                    .unwrap();
                let (scheduler, _, _) = scheduler_for(script);
                scheduler.start().unwrap();
                tokio::time::sleep(Duration::from_secs(11)).await;
                let history = scheduler.history();
                assert_eq!(history.len(), 2);
                assert_eq!(history[0].scenario_id, "five");
                assert!(history[0].elapsed < history[1].elapsed);
            });
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn prop_no_scenario_runs_before_its_offset(offsets in proptest::collection::vec(0u64..5_000, 1..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let history = runtime.block_on(async {
                let mut builder = TestScript::builder("tc", two_node_topology());
                for (i, ms) in offsets.iter().enumerate() {
                    builder = builder.scenario(hang_up(&format!("s{}", i), Trigger::fine_time(*ms)));
                }
                let (scheduler, _, _) = scheduler_for(builder.build().unwrap());
                scheduler.start().unwrap();
                tokio::time::sleep(Duration::from_secs(6)).await;
                scheduler.history()
            });
            prop_assert_eq!(history.len(), offsets.len());
            for run in history {
                let index: usize = run.scenario_id[1..].parse().unwrap();
                prop_assert!(run.elapsed >= Duration::from_millis(offsets[index]));
            }
        }
    }
}
