use clap::Parser;
use issi_tester::action::ActionRegistry;
use issi_tester::config::load_node_config_from_file;
use issi_tester::controller::{http, JsonScriptLoader, LocalNodeController, NodeController};
use issi_tester::transport::{UdpNodeTransport, UdpTransport};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "issi-node")]
struct Args {
    /// JSON設定ファイルパス
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // 設定ファイルの読み込み（バリデーション込み）
    let config = match load_node_config_from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    let (signaling_addr, control_addr, peers) =
        match (config.signaling_addr(), config.control_addr(), config.peer_addrs()) {
            (Ok(s), Ok(c), Ok(p)) => (s, c, p),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                eprintln!("Invalid address: {}", e);
                std::process::exit(1);
            }
        };

    // UDPシグナリングトランスポートの初期化
    let udp = match UdpTransport::bind(signaling_addr).await {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to bind UDP socket on {}: {}", signaling_addr, e);
            std::process::exit(1);
        }
    };
    let transport = Arc::new(UdpNodeTransport::new(udp, peers));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let receiver = transport.spawn_receiver(inbound_tx);

    // ノードコントローラの生成
    let controller = LocalNodeController::spawn(
        config.node_id.clone(),
        transport,
        inbound_rx,
        Arc::new(JsonScriptLoader::new(config.self_test)),
        Arc::new(ActionRegistry::new()),
        config.min_run_window(),
    );

    // HTTP制御プレーンの起動
    let listener = match TcpListener::bind(control_addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind control endpoint on {}: {}", control_addr, e);
            std::process::exit(1);
        }
    };
    let server_controller: Arc<dyn NodeController> = controller.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = http::serve(listener, server_controller).await {
            eprintln!("Control plane stopped: {}", e);
        }
    });

    // シャットダウンフラグの設定
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();

    // ctrlc によるシグナルハンドリング（SIGINT/SIGTERM）
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived shutdown signal, stopping...");
        shutdown_flag.store(true, Ordering::SeqCst);
    }) {
        eprintln!("Failed to set signal handler: {}", e);
        std::process::exit(1);
    }

    eprintln!(
        "Node {} control plane on http://{}, signaling on {}",
        config.node_id, control_addr, signaling_addr
    );

    while !shutdown.load(Ordering::SeqCst) && !server.is_finished() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = controller.tear_down_current_test().await;
    server.abort();
    receiver.abort();
    eprintln!("Node {} shutting down.", config.node_id);
}
