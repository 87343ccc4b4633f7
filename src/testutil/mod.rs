use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::LoadRequest;
use crate::controller::ScriptLoader;
use crate::error::IssiTesterError;
use crate::ptt::PttPacket;
use crate::script::TestScript;
use crate::sip::message::SipMessage;
use crate::topology::{GroupConfig, RfssConfig, SuConfig, Topology, TopologyDoc};
use crate::transport::{PttTransport, SendFuture, SignalingTransport};
use crate::trigger::ObservedEvent;

/// テスト用の 2 ノード構成
/// - rfss_1 (rfss_1.p25dr): su_1 のホーム、group_1 のホーム
/// - rfss_2 (rfss_2.p25dr): su_2, su_3 のホーム
pub fn two_node_topology_doc() -> TopologyDoc {
    let rfss = |id: &str| RfssConfig {
        id: id.to_string(),
        domain: format!("{}.p25dr", id),
        ..Default::default()
    };
    let unit = |id: &str, home: &str, priority: u8| SuConfig {
        id: id.to_string(),
        home_rfss: home.to_string(),
        transmit_priority: priority,
        ..Default::default()
    };
    TopologyDoc {
        rfss: vec![rfss("rfss_1"), rfss("rfss_2")],
        units: vec![
            unit("su_1", "rfss_1", 3),
            unit("su_2", "rfss_2", 1),
            unit("su_3", "rfss_2", 1),
        ],
        groups: vec![GroupConfig {
            id: "group_1".to_string(),
            home_rfss: "rfss_1".to_string(),
            members: vec!["su_1".into(), "su_2".into(), "su_3".into()],
        }],
    }
}

/// two_node_topology_doc をマージ済みのトポロジ
pub fn two_node_topology() -> Topology {
    let doc = two_node_topology_doc();
    match Topology::merge([&doc]) {
        Ok(topology) => topology,
        Err(e) => panic!("fixture topology is invalid: {}", e),
    }
}

/// テスト用の共通記録トランスポート
/// - 送信イベントの記録（宛先ノード付き）
/// - 送信カウント
/// - オプションの失敗注入
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, ObservedEvent)>>,
    pub send_count: AtomicUsize,
    pub should_fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// should_fail フラグを設定する
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// 送信成功したイベント数
    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 送信されたイベントの要約（宛先, summary）
    pub fn sent_summaries(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .map(|(node, event)| (node.clone(), event.summary()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn push(&self, to_node: &str, event: ObservedEvent) -> Result<(), IssiTesterError> {
        self.send_count.fetch_add(1, Ordering::Relaxed);
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(IssiTesterError::NetworkError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "recording transport failure",
            )));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((to_node.to_string(), event));
        }
        Ok(())
    }
}

impl SignalingTransport for RecordingTransport {
    fn send_sip<'a>(&'a self, to_node: &'a str, message: SipMessage) -> SendFuture<'a> {
        Box::pin(async move { self.push(to_node, ObservedEvent::Sip(message)) })
    }
}

impl PttTransport for RecordingTransport {
    fn send_ptt<'a>(&'a self, to_node: &'a str, packet: PttPacket) -> SendFuture<'a> {
        Box::pin(async move { self.push(to_node, ObservedEvent::Ptt(packet)) })
    }
}

/// 常に同じスクリプトを返すローダー。リクエストのフラグは通常どおり適用する
pub struct FixedScriptLoader {
    script: TestScript,
    self_test: bool,
    loads: AtomicUsize,
}

impl FixedScriptLoader {
    pub fn new(script: TestScript) -> Self {
        Self {
            script,
            self_test: false,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn self_test(mut self, enabled: bool) -> Self {
        self.self_test = enabled;
        self
    }

    /// load が呼ばれた回数
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl ScriptLoader for FixedScriptLoader {
    fn load(&self, request: &LoadRequest) -> Result<TestScript, IssiTesterError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let mut script = self.script.clone();
        script.test_number = request.test_number;
        crate::controller::apply_request(&mut script, request, self.self_test);
        Ok(script)
    }
}
