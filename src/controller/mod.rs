// Node Controller: load / run / query one emulated node's test runs
//
// `LocalNodeController` drives a node in this process. `http` exposes any
// controller over the control-plane wire protocol and `remote` is the
// client side of that protocol.

pub mod http;
pub mod remote;

pub use remote::RemoteNodeController;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::ScriptHost;
use crate::config::LoadRequest;
use crate::error::IssiTesterError;
use crate::rfss::{ActorStatus, GroupServing, MobilityEvent, RfssEmulator, RfssParts};
use crate::scheduler::{Scheduler, SchedulerParts};
use crate::script::descriptor::{load_topology_file, ScriptDescriptor};
use crate::script::TestScript;
use crate::timer::TimerService;
use crate::trace::SignalingLog;
use crate::transport::{Inbound, NodeTransport};

/// Operations a coordinator drives on every participating node
#[async_trait]
pub trait NodeController: Send + Sync {
    fn name(&self) -> &str;
    async fn load_test(&self, request: &LoadRequest) -> Result<(), IssiTesterError>;
    async fn run_test(&self) -> Result<(), IssiTesterError>;
    async fn is_test_completed(&self) -> Result<bool, IssiTesterError>;
    async fn tear_down_current_test(&self) -> Result<(), IssiTesterError>;
    async fn signal_test_completion(&self) -> Result<(), IssiTesterError>;
    async fn signal_next_scenario(&self, scenario_id: &str) -> Result<(), IssiTesterError>;
    /// Pass/fail verdict of the current run
    async fn get_test_results(&self) -> Result<bool, IssiTesterError>;
    async fn get_error_flag(&self) -> Result<bool, IssiTesterError>;
    async fn get_error_log(&self) -> Result<String, IssiTesterError>;
    async fn get_signaling_log(&self) -> Result<String, IssiTesterError>;
    async fn get_ptt_trace(&self) -> Result<String, IssiTesterError>;
    /// Status info as JSON text
    async fn get_status_info(&self) -> Result<String, IssiTesterError>;
}

/// Turns a load request into a validated test script
pub trait ScriptLoader: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<TestScript, IssiTesterError>;
}

/// Reads `<scenario_directory>/<test_case>.json` and the referenced
/// topology files (system, global, per-test, merged in that order)
#[derive(Debug, Clone, Default)]
pub struct JsonScriptLoader {
    pub self_test: bool,
}

impl JsonScriptLoader {
    pub fn new(self_test: bool) -> Self {
        Self { self_test }
    }
}

fn resolve(dir: &Path, reference: &str) -> PathBuf {
    let path = Path::new(reference);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

impl ScriptLoader for JsonScriptLoader {
    fn load(&self, request: &LoadRequest) -> Result<TestScript, IssiTesterError> {
        let dir = Path::new(&request.scenario_directory);
        let descriptor =
            ScriptDescriptor::load_from_file(&resolve(dir, &format!("{}.json", request.test_case)))?;
        let mut docs = Vec::new();
        for reference in [
            &request.system_topology,
            &request.global_topology,
            &request.topology,
        ]
        .into_iter()
        .flatten()
        {
            docs.push(load_topology_file(&resolve(dir, reference))?);
        }
        let mut script = descriptor.build(&docs, request.test_number)?;
        apply_request(&mut script, request, self.self_test);
        Ok(script)
    }
}

/// Run-time flags from the load request override the script's own
pub fn apply_request(script: &mut TestScript, request: &LoadRequest, self_test: bool) {
    script.interactive = script.interactive || request.interactive;
    script.evaluate_pass_fail = request.evaluate_pass_fail;
    if self_test {
        script.topology = Arc::new((*script.topology).clone().with_self_test(true));
    }
}

/// Status info reported by `get-rfss-status-info`
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub test_case: Option<String>,
    pub test_number: Option<u32>,
    pub started: bool,
    pub completed: bool,
    pub passed: bool,
    pub registered_scenarios: usize,
    pub actors: Vec<ActorStatus>,
    pub group_calls: Vec<GroupServing>,
    pub mobility: Vec<MobilityEvent>,
}

struct LoadedTest {
    script: Arc<TestScript>,
    scheduler: Arc<Scheduler>,
    emulator: Arc<RfssEmulator>,
    log: Arc<SignalingLog>,
    started_at: Mutex<Option<Instant>>,
}

impl LoadedTest {
    fn within_run_window(&self, window: Duration) -> bool {
        if self.scheduler.is_completed() {
            return false;
        }
        self.started_at
            .lock()
            .ok()
            .and_then(|s| *s)
            .is_some_and(|started| started.elapsed() < window)
    }
}

/// Node controller for a node emulated in this process
pub struct LocalNodeController {
    node_id: String,
    loader: Arc<dyn ScriptLoader>,
    transport: Arc<dyn NodeTransport>,
    script_host: Arc<dyn ScriptHost>,
    min_run_window: Duration,
    current: RwLock<Option<Arc<LoadedTest>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalNodeController {
    /// Create the controller and start delivering `inbound` signaling to
    /// whatever test is loaded. Messages arriving with no test loaded are
    /// dropped.
    pub fn spawn(
        node_id: impl Into<String>,
        transport: Arc<dyn NodeTransport>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        loader: Arc<dyn ScriptLoader>,
        script_host: Arc<dyn ScriptHost>,
        min_run_window: Duration,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            node_id: node_id.into(),
            loader,
            transport,
            script_host,
            min_run_window,
            current: RwLock::new(None),
            dispatcher: Mutex::new(None),
        });
        let handle = tokio::spawn(dispatch_loop(Arc::downgrade(&controller), inbound));
        if let Ok(mut dispatcher) = controller.dispatcher.lock() {
            *dispatcher = Some(handle);
        }
        controller
    }

    fn current(&self) -> Result<Arc<LoadedTest>, IssiTesterError> {
        self.current
            .read()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(IssiTesterError::NoTestLoaded)
    }

    async fn deliver(&self, inbound: Inbound) {
        let Ok(test) = self.current() else {
            debug!(node = %self.node_id, event = %inbound.event.summary(), "no test loaded, dropping");
            return;
        };
        if !test.scheduler.is_started() || test.scheduler.is_completed() {
            debug!(node = %self.node_id, event = %inbound.event.summary(), "test not running, dropping");
            return;
        }
        test.emulator.handle_inbound(&inbound).await;
        test.scheduler
            .dispatch_message(test.emulator.domain(), &inbound.event)
            .await;
    }

    pub fn status(&self) -> NodeStatus {
        match self.current() {
            Ok(test) => NodeStatus {
                node_id: self.node_id.clone(),
                test_case: Some(test.script.test_case.clone()),
                test_number: Some(test.script.test_number),
                started: test.scheduler.is_started(),
                completed: test.scheduler.is_completed(),
                passed: test.scheduler.passed(),
                registered_scenarios: test.scheduler.registered_count(),
                actors: test.emulator.actor_status(),
                group_calls: test.emulator.group_calls(),
                mobility: test.emulator.mobility_events(),
            },
            Err(_) => NodeStatus {
                node_id: self.node_id.clone(),
                test_case: None,
                test_number: None,
                started: false,
                completed: false,
                passed: false,
                registered_scenarios: 0,
                actors: Vec::new(),
                group_calls: Vec::new(),
                mobility: Vec::new(),
            },
        }
    }

    /// Scheduler of the loaded test, for callers in this process
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.current().ok().map(|t| t.scheduler.clone())
    }

    pub fn emulator(&self) -> Option<Arc<RfssEmulator>> {
        self.current().ok().map(|t| t.emulator.clone())
    }
}

async fn dispatch_loop(controller: Weak<LocalNodeController>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(message) = inbound.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.deliver(message).await;
    }
}

impl Drop for LocalNodeController {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl NodeController for LocalNodeController {
    fn name(&self) -> &str {
        &self.node_id
    }

    async fn load_test(&self, request: &LoadRequest) -> Result<(), IssiTesterError> {
        let previous = self.current().ok();
        if let Some(previous) = &previous {
            if previous.within_run_window(self.min_run_window) {
                warn!(node = %self.node_id, test_case = %previous.script.test_case, "load rejected, test in progress");
                return Err(IssiTesterError::TestInProgress);
            }
        }
        let script = Arc::new(self.loader.load(request)?);
        if let Some(previous) = previous {
            previous.scheduler.tear_down().await;
        }

        let timers = Arc::new(TimerService::new());
        let log = Arc::new(SignalingLog::new(self.node_id.clone()));
        log.set_capture(script.trace_capture);
        let emulator = RfssEmulator::new(RfssParts {
            node_id: self.node_id.clone(),
            script: script.clone(),
            transport: self.transport.clone(),
            timers: timers.clone(),
            log: log.clone(),
            script_host: self.script_host.clone(),
        })?;
        let scheduler = Scheduler::new(SchedulerParts {
            node_id: self.node_id.clone(),
            domain: emulator.domain().to_string(),
            script: script.clone(),
            executor: emulator.clone(),
            script_host: self.script_host.clone(),
            log: log.clone(),
            timers,
        });
        info!(
            node = %self.node_id,
            test_case = %script.test_case,
            test_number = script.test_number,
            scenarios = script.len(),
            "test loaded"
        );
        let loaded = Arc::new(LoadedTest {
            script,
            scheduler,
            emulator,
            log,
            started_at: Mutex::new(None),
        });
        if let Ok(mut current) = self.current.write() {
            *current = Some(loaded);
        }
        Ok(())
    }

    async fn run_test(&self) -> Result<(), IssiTesterError> {
        let test = self.current()?;
        test.emulator.power_up()?;
        test.scheduler.start()?;
        if let Ok(mut started) = test.started_at.lock() {
            *started = Some(Instant::now());
        }
        Ok(())
    }

    async fn is_test_completed(&self) -> Result<bool, IssiTesterError> {
        Ok(self.current()?.scheduler.is_completed())
    }

    /// Idempotent; logs and results stay readable until the next load
    async fn tear_down_current_test(&self) -> Result<(), IssiTesterError> {
        if let Ok(test) = self.current() {
            if test.scheduler.tear_down().await {
                info!(node = %self.node_id, test_case = %test.script.test_case, "test torn down");
            }
        }
        Ok(())
    }

    async fn signal_test_completion(&self) -> Result<(), IssiTesterError> {
        self.current()?.scheduler.signal_test_completion();
        Ok(())
    }

    async fn signal_next_scenario(&self, scenario_id: &str) -> Result<(), IssiTesterError> {
        self.current()?.scheduler.signal_next(scenario_id)
    }

    async fn get_test_results(&self) -> Result<bool, IssiTesterError> {
        Ok(self.current()?.scheduler.passed())
    }

    async fn get_error_flag(&self) -> Result<bool, IssiTesterError> {
        Ok(self.current()?.scheduler.has_errors())
    }

    async fn get_error_log(&self) -> Result<String, IssiTesterError> {
        Ok(self.current()?.scheduler.error_log())
    }

    async fn get_signaling_log(&self) -> Result<String, IssiTesterError> {
        Ok(self.current()?.log.sip_trace())
    }

    async fn get_ptt_trace(&self) -> Result<String, IssiTesterError> {
        Ok(self.current()?.log.ptt_trace())
    }

    async fn get_status_info(&self) -> Result<String, IssiTesterError> {
        serde_json::to_string_pretty(&self.status())
            .map_err(|e| IssiTesterError::ParseError(format!("status encode error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::scenario::{Scenario, ScenarioKind};
    use crate::testutil::{two_node_topology, FixedScriptLoader};
    use crate::transport::LoopbackNetwork;
    use crate::trigger::Trigger;

    fn request(test_case: &str) -> LoadRequest {
        LoadRequest {
            test_case: test_case.to_string(),
            ..Default::default()
        }
    }

    fn controller_with(script: TestScript, window: Duration) -> Arc<LocalNodeController> {
        let network = LoopbackNetwork::new();
        let (endpoint, rx) = network.attach("rfss_1");
        LocalNodeController::spawn(
            "rfss_1",
            Arc::new(endpoint),
            rx,
            Arc::new(FixedScriptLoader::new(script)),
            Arc::new(ActionRegistry::new()),
            window,
        )
    }

    fn short_script() -> TestScript {
        TestScript::builder("tc_short", two_node_topology())
            .trace_window(Duration::from_secs(5))
            .scenario(Scenario::new(
                "hang_up",
                Trigger::time(1),
                ScenarioKind::CallTerminator {
                    actor: "su_1".into(),
                },
            ))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries_before_load_report_no_test() {
        let controller = controller_with(short_script(), Duration::ZERO);
        assert!(matches!(
            controller.run_test().await,
            Err(IssiTesterError::NoTestLoaded)
        ));
        assert!(matches!(
            controller.get_error_log().await,
            Err(IssiTesterError::NoTestLoaded)
        ));
        // Tear-down with nothing loaded is a no-op
        controller.tear_down_current_test().await.unwrap();
        let status: serde_json::Value =
            serde_json::from_str(&controller.get_status_info().await.unwrap()).unwrap();
        assert_eq!(status["test_case"], serde_json::Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_run_complete_cycle() {
        let controller = controller_with(short_script(), Duration::ZERO);
        controller.load_test(&request("tc_short")).await.unwrap();
        assert!(!controller.is_test_completed().await.unwrap());
        controller.run_test().await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(controller.is_test_completed().await.unwrap());
        assert!(controller.get_test_results().await.unwrap());
        assert!(!controller.get_error_flag().await.unwrap());

        let status: serde_json::Value =
            serde_json::from_str(&controller.get_status_info().await.unwrap()).unwrap();
        assert_eq!(status["test_case"], "tc_short");
        assert_eq!(status["completed"], true);
        assert_eq!(status["actors"][0]["id"], "su_1");
        assert_eq!(status["actors"][0]["state"], "ON");
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_rejected_within_run_window() {
        let controller = controller_with(short_script(), Duration::from_secs(60));
        controller.load_test(&request("tc_short")).await.unwrap();
        controller.run_test().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            controller.load_test(&request("tc_short")).await,
            Err(IssiTesterError::TestInProgress)
        ));

        // Completion frees the node even inside the window
        tokio::time::sleep(Duration::from_secs(5)).await;
        controller.load_test(&request("tc_short")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tear_down_is_idempotent_and_keeps_logs() {
        let controller = controller_with(short_script(), Duration::ZERO);
        controller.load_test(&request("tc_short")).await.unwrap();
        controller.run_test().await.unwrap();
        controller.tear_down_current_test().await.unwrap();
        controller.tear_down_current_test().await.unwrap();
        assert!(controller.is_test_completed().await.unwrap());
        assert_eq!(controller.get_error_log().await.unwrap(), "");
        assert_eq!(controller.get_signaling_log().await.unwrap(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_next_unknown_scenario_is_error() {
        let controller = controller_with(short_script(), Duration::ZERO);
        controller.load_test(&request("tc_short")).await.unwrap();
        controller.run_test().await.unwrap();
        assert!(matches!(
            controller.signal_next_scenario("nope").await,
            Err(IssiTesterError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_apply_request_overrides_flags() {
        let mut script = short_script();
        let request = LoadRequest {
            interactive: true,
            evaluate_pass_fail: false,
            ..request("tc_short")
        };
        apply_request(&mut script, &request, true);
        assert!(script.interactive);
        assert!(!script.evaluate_pass_fail);
        assert!(script.topology.self_test);
    }

    #[test]
    fn test_json_loader_reads_script_and_topology() {
        let dir = tempfile::tempdir().unwrap();
        let topology = crate::testutil::two_node_topology_doc();
        std::fs::write(
            dir.path().join("system.json"),
            serde_json::to_string(&topology).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("tc_json.json"),
            r#"{
                "test_case": "tc_json",
                "scenarios": [{
                    "id": "call",
                    "trigger": {"type": "time", "offset": 2},
                    "action": {"type": "call_setup", "caller": "su_1", "callee": "su_2"}
                }]
            }"#,
        )
        .unwrap();
        let request = LoadRequest {
            scenario_directory: dir.path().display().to_string(),
            test_case: "tc_json".to_string(),
            test_number: 4,
            system_topology: Some("system.json".to_string()),
            ..Default::default()
        };
        let script = JsonScriptLoader::new(false).load(&request).unwrap();
        assert_eq!(script.test_case, "tc_json");
        assert_eq!(script.test_number, 4);
        assert_eq!(script.len(), 1);
        assert!(script.topology.unit("su_2").is_some());
    }

    #[test]
    fn test_json_loader_missing_script_is_config_error() {
        let err = JsonScriptLoader::default().load(&request("absent")).unwrap_err();
        assert!(err.is_configuration_error());
    }
}
