use clap::Parser;
use issi_tester::action::ActionRegistry;
use issi_tester::cli::{exit_code, run_validate, Cli, EXIT_COMMUNICATION_ERROR, EXIT_TEST_FAILED};
use issi_tester::config;
use issi_tester::coordinator::{write_report, TestCoordinator};
use issi_tester::error::IssiTesterError;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli {
        Cli::Run {
            config: config_path,
            interactive,
            output,
        } => run_test(&config_path, interactive, output.as_deref()).await,
        Cli::Validate { script, topology } => run_validate(&script, &topology).map(|summary| {
            println!("{}", summary);
            0
        }),
        Cli::Status { config: config_path } => run_status(&config_path).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            let code = if e.is_communication_error() {
                EXIT_COMMUNICATION_ERROR
            } else {
                EXIT_TEST_FAILED
            };
            std::process::exit(code);
        }
    }
}

/// 標準入力の各行をシナリオ ID として送る。EOF でチャネルを閉じる
fn spawn_stdin_steps() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let id = line.trim();
            if id.is_empty() {
                continue;
            }
            if tx.send(id.to_string()).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_test(
    config_path: &Path,
    interactive: bool,
    output: Option<&Path>,
) -> Result<i32, IssiTesterError> {
    let mut cfg = config::load_from_file(config_path)?;
    cfg.test.interactive |= interactive;
    let interactive = cfg.test.interactive;

    let coordinator = TestCoordinator::from_config(cfg, Arc::new(ActionRegistry::new()))?;
    let shutdown = coordinator.shutdown_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived shutdown signal, stopping...");
        shutdown.store(true, Ordering::Relaxed);
    })
    .map_err(|e| IssiTesterError::ConfigError(format!("Failed to set signal handler: {}", e)))?;

    if interactive {
        eprintln!("Interactive mode: enter a scenario id per line, EOF to finish");
    }
    let steps = interactive.then(spawn_stdin_steps);
    let report = coordinator.run(steps).await?;

    for node in &report.nodes {
        let verdict = match node.passed {
            Some(true) => "PASS",
            Some(false) => "FAIL",
            None => "UNKNOWN",
        };
        eprintln!("{}: {}", node.node, verdict);
        if !node.error_log.is_empty() {
            eprintln!("{}", node.error_log);
        }
        if let Some(e) = &node.communication_error {
            eprintln!("  communication error: {}", e);
        }
    }
    for e in &report.communication_errors {
        eprintln!("communication error: {}", e);
    }
    eprintln!(
        "{} #{}: {:?}{}",
        report.test_case,
        report.test_number,
        report.verdict,
        if report.timed_out { " (timed out)" } else { "" }
    );

    if let Some(path) = output {
        write_report(&report, path)
            .map_err(|e| IssiTesterError::ConfigError(format!("Failed to write report: {}", e)))?;
    }
    Ok(exit_code(report.verdict))
}

async fn run_status(config_path: &Path) -> Result<i32, IssiTesterError> {
    let cfg = config::load_from_file(config_path)?;
    let coordinator = TestCoordinator::from_config(cfg, Arc::new(ActionRegistry::new()))?;
    let mut code = 0;
    for (node, status) in coordinator.status_all().await {
        match status {
            Ok(info) => println!("{}:\n{}", node, info),
            Err(e) => {
                eprintln!("{}: {}", node, e);
                code = EXIT_COMMUNICATION_ERROR;
            }
        }
    }
    Ok(code)
}
