// Configuration manager module
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::IssiTesterError;

/// テストのロード要求（全ノード共通のスクリプト/トポロジ参照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadRequest {
    pub scenario_directory: String,
    pub test_case: String,
    pub test_number: u32,
    /// テスト個別トポロジ（scenario_directory からの相対パス可）
    pub topology: Option<String>,
    pub global_topology: Option<String>,
    pub system_topology: Option<String>,
    pub interactive: bool,
    pub evaluate_pass_fail: bool,
}

impl Default for LoadRequest {
    fn default() -> Self {
        Self {
            scenario_directory: ".".to_string(),
            test_case: String::new(),
            test_number: 1,
            topology: None,
            global_topology: None,
            system_topology: None,
            interactive: false,
            evaluate_pass_fail: true,
        }
    }
}

impl LoadRequest {
    /// 制御プレーンのクエリパラメータへ変換する
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("scenario-directory".to_string(), self.scenario_directory.clone()),
            ("test-case".to_string(), self.test_case.clone()),
            ("test-number".to_string(), self.test_number.to_string()),
            ("interactive".to_string(), self.interactive.to_string()),
            ("evaluate-pass-fail".to_string(), self.evaluate_pass_fail.to_string()),
        ];
        for (name, value) in [
            ("topology", &self.topology),
            ("global-topology", &self.global_topology),
            ("system-topology", &self.system_topology),
        ] {
            if let Some(value) = value {
                params.push((name.to_string(), value.clone()));
            }
        }
        params
    }

    /// クエリパラメータから復元する。未指定の項目は既定値
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, IssiTesterError> {
        let defaults = LoadRequest::default();
        let flag = |name: &str, default: bool| -> Result<bool, IssiTesterError> {
            match params.get(name) {
                None => Ok(default),
                Some(v) => v.parse().map_err(|_| {
                    IssiTesterError::ConfigError(format!("{} must be true or false, got '{}'", name, v))
                }),
            }
        };
        let test_number = match params.get("test-number") {
            None => defaults.test_number,
            Some(v) => v.parse().map_err(|_| {
                IssiTesterError::ConfigError(format!("test-number must be a number, got '{}'", v))
            })?,
        };
        let request = LoadRequest {
            scenario_directory: params
                .get("scenario-directory")
                .cloned()
                .unwrap_or(defaults.scenario_directory),
            test_case: params.get("test-case").cloned().unwrap_or_default(),
            test_number,
            topology: params.get("topology").cloned(),
            global_topology: params.get("global-topology").cloned(),
            system_topology: params.get("system-topology").cloned(),
            interactive: flag("interactive", defaults.interactive)?,
            evaluate_pass_fail: flag("evaluate-pass-fail", defaults.evaluate_pass_fail)?,
        };
        if request.test_case.is_empty() {
            return Err(IssiTesterError::ConfigError("test-case is required".to_string()));
        }
        Ok(request)
    }
}

/// 参加ノードの接続先。url が無いノードはプロセス内でエミュレートする
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeEndpoint {
    pub name: String,
    pub url: Option<String>,
}

/// コーディネータ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(flatten)]
    pub test: LoadRequest,
    pub nodes: Vec<NodeEndpoint>,
    pub poll_interval_ms: u64,
    pub run_timeout_secs: u64,
    pub request_timeout_ms: u64,
    pub self_test: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            test: LoadRequest::default(),
            nodes: Vec::new(),
            poll_interval_ms: 500,
            run_timeout_secs: 300,
            request_timeout_ms: 5_000,
            self_test: false,
        }
    }
}

impl CoordinatorConfig {
    /// 設定値のバリデーション
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.test.test_case.is_empty() {
            errors.push("test_case must not be empty".to_string());
        }
        if self.test.scenario_directory.is_empty() {
            errors.push("scenario_directory must not be empty".to_string());
        }
        if self.nodes.is_empty() {
            errors.push("at least one node is required".to_string());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.name.is_empty() {
                errors.push(format!("nodes[{}].name must not be empty", i));
            }
            if self.nodes[..i].iter().any(|n| n.name == node.name) {
                errors.push(format!("node '{}' is listed twice", node.name));
            }
            if let Some(url) = &node.url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(format!("nodes[{}].url must be an http(s) URL", i));
                }
            }
        }
        if self.poll_interval_ms == 0 {
            errors.push("poll_interval_ms must be greater than 0".to_string());
        }
        if self.run_timeout_secs == 0 {
            errors.push("run_timeout_secs must be greater than 0".to_string());
        }
        if self.request_timeout_ms == 0 {
            errors.push("request_timeout_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// ノードサーバ（issi-node）設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeServerConfig {
    pub node_id: String,
    pub control_host: String,
    pub control_port: u16,
    pub signaling_host: String,
    pub signaling_port: u16,
    /// ノードID → シグナリングアドレス（"host:port"）
    pub peers: BTreeMap<String, String>,
    /// 直前の試験開始からこの時間内の再ロードは拒否する
    pub min_run_window_ms: u64,
    pub self_test: bool,
}

impl Default for NodeServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            control_host: "127.0.0.1".to_string(),
            control_port: 8080,
            signaling_host: "127.0.0.1".to_string(),
            signaling_port: 5060,
            peers: BTreeMap::new(),
            min_run_window_ms: 0,
            self_test: false,
        }
    }
}

impl NodeServerConfig {
    /// 設定値のバリデーション
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node_id.is_empty() {
            errors.push("node_id must not be empty".to_string());
        }
        if self.control_port == 0 {
            errors.push("control_port must be greater than 0".to_string());
        }
        if self.signaling_port == 0 {
            errors.push("signaling_port must be greater than 0".to_string());
        }
        if self.control_port == self.signaling_port && self.control_host == self.signaling_host {
            errors.push("control and signaling endpoints must differ".to_string());
        }
        for (node, addr) in &self.peers {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("peers.{} is not a host:port address: '{}'", node, addr));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn control_addr(&self) -> Result<SocketAddr, IssiTesterError> {
        parse_addr(&self.control_host, self.control_port)
    }

    pub fn signaling_addr(&self) -> Result<SocketAddr, IssiTesterError> {
        parse_addr(&self.signaling_host, self.signaling_port)
    }

    /// ピアのシグナリングアドレス。自ノードも含める
    pub fn peer_addrs(&self) -> Result<HashMap<String, SocketAddr>, IssiTesterError> {
        let mut peers = HashMap::new();
        for (node, addr) in &self.peers {
            let addr = addr.parse().map_err(|_| {
                IssiTesterError::ConfigError(format!("invalid peer address for {}: {}", node, addr))
            })?;
            peers.insert(node.clone(), addr);
        }
        peers
            .entry(self.node_id.clone())
            .or_insert(self.signaling_addr()?);
        Ok(peers)
    }

    pub fn min_run_window(&self) -> Duration {
        Duration::from_millis(self.min_run_window_ms)
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, IssiTesterError> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|_| IssiTesterError::ConfigError(format!("invalid address {}:{}", host, port)))
}

fn parse_and_validate<T, F>(json: &str, validate: F) -> Result<T, IssiTesterError>
where
    T: serde::de::DeserializeOwned,
    F: Fn(&T) -> Result<(), Vec<String>>,
{
    let config: T = serde_json::from_str(json)
        .map_err(|e| IssiTesterError::ConfigError(format!("JSON parse error: {}", e)))?;

    validate(&config).map_err(|errors| {
        IssiTesterError::ConfigError(format!("Validation errors: {}", errors.join("; ")))
    })?;

    Ok(config)
}

fn read_config(path: &Path) -> Result<String, IssiTesterError> {
    std::fs::read_to_string(path).map_err(|e| {
        IssiTesterError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// JSON文字列からコーディネータ設定を読み込み、バリデーションを実行する
pub fn load_from_str(json: &str) -> Result<CoordinatorConfig, IssiTesterError> {
    parse_and_validate(json, CoordinatorConfig::validate)
}

/// JSONファイルからコーディネータ設定を読み込み、バリデーションを実行する
pub fn load_from_file(path: &Path) -> Result<CoordinatorConfig, IssiTesterError> {
    load_from_str(&read_config(path)?)
}

/// JSON文字列からノード設定を読み込み、バリデーションを実行する
pub fn load_node_config_from_str(json: &str) -> Result<NodeServerConfig, IssiTesterError> {
    parse_and_validate(json, NodeServerConfig::validate)
}

/// JSONファイルからノード設定を読み込み、バリデーションを実行する
pub fn load_node_config_from_file(path: &Path) -> Result<NodeServerConfig, IssiTesterError> {
    load_node_config_from_str(&read_config(path)?)
}
