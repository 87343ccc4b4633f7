// CLI subcommand definitions using clap derive macros
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::coordinator::Verdict;
use crate::error::IssiTesterError;
use crate::script::descriptor::{load_topology_file, ScriptDescriptor};

/// 試験失敗時の終了コード
pub const EXIT_TEST_FAILED: i32 = 1;
/// ノードと通信できなかった場合の終了コード（試験失敗とは区別する）
pub const EXIT_COMMUNICATION_ERROR: i32 = 2;

/// ISSI 適合性試験コーディネータ
#[derive(Parser, Debug, PartialEq)]
#[command(name = "issi-tester")]
pub enum Cli {
    /// 全ノードに試験をロードして実行する
    Run {
        /// コーディネータ設定 JSON ファイル
        #[arg(long)]
        config: PathBuf,
        /// 対話モード（標準入力の各行を次に実行するシナリオ ID とする）
        #[arg(long)]
        interactive: bool,
        /// JSON結果出力先
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// 試験スクリプトを検証する（実行はしない）
    Validate {
        /// 試験スクリプト JSON ファイル
        script: PathBuf,
        /// マージするトポロジファイル（指定順: system, global, 個別）
        #[arg(long)]
        topology: Vec<PathBuf>,
    },
    /// 各ノードの状態を表示する
    Status {
        /// コーディネータ設定 JSON ファイル
        #[arg(long)]
        config: PathBuf,
    },
}

/// 判定結果から終了コードを決める
pub fn exit_code(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Pass => 0,
        Verdict::Fail => EXIT_TEST_FAILED,
        Verdict::CommunicationError => EXIT_COMMUNICATION_ERROR,
    }
}

/// validateサブコマンドの実行
///
/// スクリプトとトポロジを読み込んで TestScript を構築し、
/// 構成エラーがあればそのまま返す。成功時は概要を返す。
pub fn run_validate(script: &Path, topologies: &[PathBuf]) -> Result<String, IssiTesterError> {
    let descriptor = ScriptDescriptor::load_from_file(script)?;
    let docs = topologies
        .iter()
        .map(|path| load_topology_file(path))
        .collect::<Result<Vec<_>, _>>()?;
    let built = descriptor.build(&docs, 1)?;
    Ok(format!(
        "{}: {} scenarios, {} post-conditions, {} nodes, {} units",
        built.test_case,
        built.len(),
        built.post_conditions.len(),
        built.topology.rfss_nodes().len(),
        built.topology.units().len()
    ))
}
