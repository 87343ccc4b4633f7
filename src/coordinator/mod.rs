// Test coordinator module
//
// Fans load / run / tear-down out to every participating node, forwards
// interactive steps, polls for completion and aggregates the verdict.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::action::ScriptHost;
use crate::config::CoordinatorConfig;
use crate::controller::{JsonScriptLoader, LocalNodeController, NodeController, RemoteNodeController};
use crate::error::IssiTesterError;
use crate::transport::LoopbackNetwork;

/// Aggregate outcome of one coordinated run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// A node could not be reached; says nothing about the protocol test
    CommunicationError,
}

/// 各ノードの結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: String,
    pub completed: bool,
    /// None when the verdict could not be fetched
    pub passed: Option<bool>,
    pub error_flag: bool,
    pub error_log: String,
    pub sip_trace: String,
    pub ptt_trace: String,
    pub status: Option<serde_json::Value>,
    pub communication_error: Option<String>,
}

/// 試験結果レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub test_case: String,
    pub test_number: u32,
    pub verdict: Verdict,
    pub timed_out: bool,
    pub nodes: Vec<NodeReport>,
    pub communication_errors: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Pass only when at least one node reported and every node passed.
/// Communication faults take precedence over a protocol verdict.
pub fn aggregate(nodes: &[NodeReport], communication_errors: &[String]) -> Verdict {
    if !communication_errors.is_empty() || nodes.iter().any(|n| n.communication_error.is_some()) {
        return Verdict::CommunicationError;
    }
    if !nodes.is_empty() && nodes.iter().all(|n| n.passed == Some(true)) {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

/// JSON結果をファイルに書き出す
pub fn write_report(report: &TestReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn unix_now() -> String {
    use std::time::SystemTime;
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

pub struct TestCoordinator {
    config: CoordinatorConfig,
    nodes: Vec<Arc<dyn NodeController>>,
    shutdown_flag: Arc<AtomicBool>,
}

impl TestCoordinator {
    pub fn new(config: CoordinatorConfig, nodes: Vec<Arc<dyn NodeController>>) -> Self {
        Self {
            config,
            nodes,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build controllers from the configuration. Nodes with a URL are
    /// reached over HTTP; the rest run in this process on a shared loopback
    /// network.
    pub fn from_config(
        config: CoordinatorConfig,
        script_host: Arc<dyn ScriptHost>,
    ) -> Result<Self, IssiTesterError> {
        config
            .validate()
            .map_err(|errors| IssiTesterError::ConfigError(errors.join("; ")))?;
        let mut nodes: Vec<Arc<dyn NodeController>> = Vec::with_capacity(config.nodes.len());
        let mut network = None;
        let loader = Arc::new(JsonScriptLoader::new(config.self_test));
        for endpoint in &config.nodes {
            match &endpoint.url {
                Some(url) => nodes.push(Arc::new(RemoteNodeController::new(
                    endpoint.name.clone(),
                    url.clone(),
                    config.request_timeout(),
                )?)),
                None => {
                    let network = network.get_or_insert_with(LoopbackNetwork::new);
                    let (transport, inbound) = network.attach(&endpoint.name);
                    nodes.push(LocalNodeController::spawn(
                        endpoint.name.clone(),
                        Arc::new(transport),
                        inbound,
                        loader.clone(),
                        script_host.clone(),
                        Duration::ZERO,
                    ));
                }
            }
        }
        Ok(Self::new(config, nodes))
    }

    pub fn nodes(&self) -> &[Arc<dyn NodeController>] {
        &self.nodes
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Setting the flag makes a running `run` tear the test down
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    pub async fn load_all(&self) -> Result<(), IssiTesterError> {
        let request = &self.config.test;
        let results = join_all(self.nodes.iter().map(|n| n.load_test(request))).await;
        first_error(results)
    }

    pub async fn run_all(&self) -> Result<(), IssiTesterError> {
        let results = join_all(self.nodes.iter().map(|n| n.run_test())).await;
        first_error(results)
    }

    /// Tear down everywhere, returning the nodes that could not be reached
    pub async fn tear_down_all(&self) -> Vec<String> {
        let results = join_all(self.nodes.iter().map(|n| n.tear_down_current_test())).await;
        errors_of(results)
    }

    pub async fn signal_completion_all(&self) -> Result<(), IssiTesterError> {
        let results = join_all(self.nodes.iter().map(|n| n.signal_test_completion())).await;
        first_error(results)
    }

    /// Forward one interactive step to every node
    pub async fn signal_next(&self, scenario_id: &str) -> Result<(), IssiTesterError> {
        let results = join_all(self.nodes.iter().map(|n| n.signal_next_scenario(scenario_id))).await;
        first_error(results)
    }

    pub async fn all_completed(&self) -> Result<bool, IssiTesterError> {
        let results = join_all(self.nodes.iter().map(|n| n.is_test_completed())).await;
        let mut all = true;
        for result in results {
            all &= result?;
        }
        Ok(all)
    }

    /// Status info text of every node
    pub async fn status_all(&self) -> Vec<(String, Result<String, IssiTesterError>)> {
        let results = join_all(self.nodes.iter().map(|n| n.get_status_info())).await;
        self.nodes
            .iter()
            .map(|n| n.name().to_string())
            .zip(results)
            .collect()
    }

    /// Load, run and wait for every node, then collect the report.
    /// With `steps`, each received scenario id is forwarded as an
    /// interactive step; closing the channel signals test completion.
    pub async fn run(
        &self,
        steps: Option<mpsc::UnboundedReceiver<String>>,
    ) -> Result<TestReport, IssiTesterError> {
        let started_at = unix_now();
        let mut communication_errors = Vec::new();
        info!(
            test_case = %self.config.test.test_case,
            test_number = self.config.test.test_number,
            nodes = self.nodes.len(),
            "starting coordinated run"
        );

        if let Err(e) = self.load_and_start().await {
            if !e.is_communication_error() {
                self.tear_down_all().await;
                return Err(e);
            }
            warn!(error = %e, "run aborted");
            communication_errors.push(e.to_string());
            communication_errors.extend(self.tear_down_all().await);
            return Ok(self.report(started_at, false, communication_errors).await);
        }

        let timed_out = match self.wait(steps).await {
            Ok(timed_out) => timed_out,
            Err(e) => {
                warn!(error = %e, "lost contact while waiting for completion");
                communication_errors.push(e.to_string());
                false
            }
        };
        if timed_out {
            warn!(timeout_secs = self.config.run_timeout_secs, "run timed out, tearing down");
        }
        // Results stay queryable after tear-down
        communication_errors.extend(self.tear_down_all().await);
        Ok(self.report(started_at, timed_out, communication_errors).await)
    }

    async fn load_and_start(&self) -> Result<(), IssiTesterError> {
        self.load_all().await?;
        self.run_all().await
    }

    /// Returns true when the run timed out or was interrupted
    async fn wait(&self, mut steps: Option<mpsc::UnboundedReceiver<String>>) -> Result<bool, IssiTesterError> {
        let deadline = Instant::now() + self.config.run_timeout();
        let poll = self.config.poll_interval();
        loop {
            if self.all_completed().await? {
                return Ok(false);
            }
            if self.shutdown_flag.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return Ok(true);
            }
            let step = match steps.as_mut() {
                Some(rx) => tokio::select! {
                    step = rx.recv() => Some(step),
                    _ = tokio::time::sleep(poll) => None,
                },
                None => {
                    tokio::time::sleep(poll).await;
                    None
                }
            };
            match step {
                Some(Some(id)) => {
                    info!(scenario = %id, "forwarding interactive step");
                    match self.signal_next(&id).await {
                        Ok(()) => {}
                        Err(e @ IssiTesterError::CommunicationError { status: 0, .. })
                        | Err(e @ IssiTesterError::NetworkError(_)) => return Err(e),
                        // A rejected step (e.g. unknown scenario) leaves the run going
                        Err(e) => warn!(scenario = %id, error = %e, "step rejected"),
                    }
                }
                Some(None) => {
                    info!("operator finished, signalling completion");
                    steps = None;
                    self.signal_completion_all().await?;
                }
                None => {}
            }
        }
    }

    async fn report(
        &self,
        started_at: String,
        timed_out: bool,
        communication_errors: Vec<String>,
    ) -> TestReport {
        let nodes = join_all(self.nodes.iter().map(|n| collect_node(n.as_ref()))).await;
        let mut verdict = aggregate(&nodes, &communication_errors);
        if timed_out && verdict == Verdict::Pass {
            verdict = Verdict::Fail;
        }
        info!(
            test_case = %self.config.test.test_case,
            verdict = ?verdict,
            timed_out,
            "coordinated run finished"
        );
        TestReport {
            test_case: self.config.test.test_case.clone(),
            test_number: self.config.test.test_number,
            verdict,
            timed_out,
            nodes,
            communication_errors,
            started_at,
            finished_at: unix_now(),
        }
    }
}

async fn collect_node(node: &dyn NodeController) -> NodeReport {
    let mut report = NodeReport {
        node: node.name().to_string(),
        completed: false,
        passed: None,
        error_flag: false,
        error_log: String::new(),
        sip_trace: String::new(),
        ptt_trace: String::new(),
        status: None,
        communication_error: None,
    };
    let collected = async {
        report.completed = node.is_test_completed().await?;
        report.passed = Some(node.get_test_results().await?);
        report.error_flag = node.get_error_flag().await?;
        report.error_log = node.get_error_log().await?;
        report.sip_trace = node.get_signaling_log().await?;
        report.ptt_trace = node.get_ptt_trace().await?;
        report.status = serde_json::from_str(&node.get_status_info().await?).ok();
        Ok::<(), IssiTesterError>(())
    }
    .await;
    if let Err(e) = collected {
        if e.is_communication_error() {
            report.communication_error = Some(e.to_string());
        } else {
            report.error_log = e.to_string();
            report.error_flag = true;
        }
    }
    report
}

fn first_error(results: Vec<Result<(), IssiTesterError>>) -> Result<(), IssiTesterError> {
    results.into_iter().collect()
}

fn errors_of(results: Vec<Result<(), IssiTesterError>>) -> Vec<String> {
    results
        .into_iter()
        .filter_map(|r| r.err())
        .map(|e| e.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::config::{LoadRequest, NodeEndpoint};
    use crate::scenario::{CallSetup, Scenario, ScenarioKind};
    use crate::script::TestScript;
    use crate::testutil::{two_node_topology, FixedScriptLoader};
    use crate::trigger::Trigger;

    fn node_report(node: &str, passed: Option<bool>) -> NodeReport {
        NodeReport {
            node: node.to_string(),
            completed: true,
            passed,
            error_flag: false,
            error_log: String::new(),
            sip_trace: String::new(),
            ptt_trace: String::new(),
            status: None,
            communication_error: None,
        }
    }

    // ===== aggregate テスト =====

    #[test]
    fn test_aggregate_requires_every_node_to_pass() {
        let both = [node_report("rfss_1", Some(true)), node_report("rfss_2", Some(true))];
        assert_eq!(aggregate(&both, &[]), Verdict::Pass);

        let one_failed = [node_report("rfss_1", Some(true)), node_report("rfss_2", Some(false))];
        assert_eq!(aggregate(&one_failed, &[]), Verdict::Fail);

        let unknown = [node_report("rfss_1", None)];
        assert_eq!(aggregate(&unknown, &[]), Verdict::Fail);
    }

    #[test]
    fn test_aggregate_without_nodes_fails() {
        assert_eq!(aggregate(&[], &[]), Verdict::Fail);
    }

    #[test]
    fn test_aggregate_communication_error_is_distinct() {
        let mut unreachable = node_report("rfss_2", None);
        unreachable.communication_error = Some("connection refused".into());
        let nodes = [node_report("rfss_1", Some(true)), unreachable];
        assert_eq!(aggregate(&nodes, &[]), Verdict::CommunicationError);
        assert_eq!(
            aggregate(&[node_report("rfss_1", Some(true))], &["lost".into()]),
            Verdict::CommunicationError
        );
    }

    // ===== write_report テスト =====

    #[test]
    fn test_write_report_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = TestReport {
            test_case: "tc".into(),
            test_number: 1,
            verdict: Verdict::Pass,
            timed_out: false,
            nodes: vec![node_report("rfss_1", Some(true))],
            communication_errors: Vec::new(),
            started_at: "0".into(),
            finished_at: "1".into(),
        };
        write_report(&report, &path).unwrap();
        let loaded: TestReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn test_write_report_invalid_path() {
        let report = TestReport {
            test_case: "tc".into(),
            test_number: 1,
            verdict: Verdict::Fail,
            timed_out: false,
            nodes: Vec::new(),
            communication_errors: Vec::new(),
            started_at: "0".into(),
            finished_at: "1".into(),
        };
        assert!(write_report(&report, Path::new("/nonexistent/dir/report.json")).is_err());
    }

    // ===== 実行テスト =====

    fn config(names: &[&str]) -> CoordinatorConfig {
        CoordinatorConfig {
            test: LoadRequest {
                test_case: "tc_coord".into(),
                ..Default::default()
            },
            nodes: names
                .iter()
                .map(|n| NodeEndpoint {
                    name: n.to_string(),
                    url: None,
                })
                .collect(),
            poll_interval_ms: 100,
            run_timeout_secs: 60,
            ..Default::default()
        }
    }

    fn call_script(interactive: bool) -> TestScript {
        TestScript::builder("tc_coord", two_node_topology())
            .interactive(interactive)
            .trace_window(Duration::from_secs(10))
            .completion_delay(Duration::from_secs(5))
            .scenario(Scenario::new(
                "call",
                Trigger::time(1),
                ScenarioKind::CallSetup(CallSetup {
                    caller: "su_1".into(),
                    callee: "su_2".into(),
                    terminate_after: Some(Duration::from_secs(2)),
                    ..Default::default()
                }),
            ))
            .build()
            .unwrap()
    }

    fn coordinator_for(script: TestScript, names: &[&str]) -> TestCoordinator {
        let network = LoopbackNetwork::new();
        let loader = Arc::new(FixedScriptLoader::new(script));
        let nodes: Vec<Arc<dyn NodeController>> = names
            .iter()
            .map(|name| {
                let (transport, inbound) = network.attach(name);
                let node: Arc<dyn NodeController> = LocalNodeController::spawn(
                    *name,
                    Arc::new(transport),
                    inbound,
                    loader.clone(),
                    Arc::new(ActionRegistry::new()),
                    Duration::ZERO,
                );
                node
            })
            .collect();
        TestCoordinator::new(config(names), nodes)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_two_local_nodes_passes() {
        let coordinator = coordinator_for(call_script(false), &["rfss_1", "rfss_2"]);
        let report = coordinator.run(None).await.unwrap();
        assert_eq!(report.verdict, Verdict::Pass, "{:?}", report);
        assert!(!report.timed_out);
        assert_eq!(report.nodes.len(), 2);
        assert!(report.nodes.iter().all(|n| n.completed));
        assert!(report.nodes[0].sip_trace.contains("INVITE"));
        assert!(report.nodes[1].sip_trace.contains("BYE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interactive_steps_are_forwarded() {
        let coordinator = coordinator_for(call_script(true), &["rfss_1", "rfss_2"]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("call".to_string()).unwrap();
        drop(tx);
        let report = coordinator.run(Some(rx)).await.unwrap();
        assert_eq!(report.verdict, Verdict::Pass, "{:?}", report);
        assert!(report.nodes[0].sip_trace.contains("INVITE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_interactive_without_steps() {
        let mut coordinator = coordinator_for(call_script(true), &["rfss_1", "rfss_2"]);
        coordinator.config.run_timeout_secs = 5;
        // Steps channel left open and never fed
        let (_tx, rx) = mpsc::unbounded_channel::<String>();
        let report = coordinator.run(Some(rx)).await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.verdict, Verdict::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_aborts_run() {
        let coordinator = coordinator_for(call_script(false), &["rfss_1", "rfss_9"]);
        let err = coordinator.run(None).await.unwrap_err();
        assert!(matches!(err, IssiTesterError::UnknownNode(_)));
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let err = TestCoordinator::from_config(
            CoordinatorConfig::default(),
            Arc::new(ActionRegistry::new()),
        )
        .err()
        .unwrap();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_from_config_builds_local_and_remote_nodes() {
        let mut config = config(&["rfss_1"]);
        config.nodes.push(NodeEndpoint {
            name: "rfss_2".into(),
            url: Some("http://127.0.0.1:9".into()),
        });
        let coordinator =
            TestCoordinator::from_config(config, Arc::new(ActionRegistry::new())).unwrap();
        let names: Vec<&str> = coordinator.nodes().iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["rfss_1", "rfss_2"]);
    }
}
