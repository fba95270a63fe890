mod chat;
mod chunker;
mod config;
mod dialogue;
mod embedding;
mod pipeline;
mod policy_index;
mod report;
mod scoring;
mod transcribe_backend;
mod transcript;
mod types;
mod whisper_api;

use anyhow::{Context, Result};
use config::Config;
use env_logger::Env;
use std::path::Path;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

#[tokio::main]
async fn main() -> Result<()> {
    // .env があれば環境変数として読み込む
    dotenv::dotenv().ok();

    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        anyhow::bail!("コマンドを指定してください");
    }

    // 設定ファイル生成モード
    if args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    let command = args[1].as_str();
    log::info!("call-audit を起動します");

    match command {
        "run" => {
            let audio_path = file_arg(&args, "run")?;
            let config = Config::load_or_default(config_arg(&args, 3))?;
            let shutdown = install_shutdown_handler()?;
            pipeline::run_full(&config, audio_path, &shutdown).await
        }
        "transcribe" => {
            let audio_path = file_arg(&args, "transcribe")?;
            let config = Config::load_or_default(config_arg(&args, 3))?;
            pipeline::run_transcribe(&config, audio_path).await.map(|_| ())
        }
        "clean" => {
            let config = Config::load_or_default(config_arg(&args, 2))?;
            pipeline::run_clean(&config).map(|_| ())
        }
        "label" => {
            let config = Config::load_or_default(config_arg(&args, 2))?;
            pipeline::run_label(&config).await.map(|_| ())
        }
        "score" => {
            let config = Config::load_or_default(config_arg(&args, 2))?;
            let shutdown = install_shutdown_handler()?;
            pipeline::run_score(&config, &shutdown).await.map(|_| ())
        }
        "report" => {
            let config = Config::load_or_default(config_arg(&args, 2))?;
            pipeline::run_report(&config)
        }
        "index-policies" => {
            let policy_path = file_arg(&args, "index-policies")?;
            let config = Config::load_or_default(config_arg(&args, 3))?;
            pipeline::run_index_policies(&config, policy_path)
                .await
                .map(|_| ())
        }
        _ => {
            print_usage();
            anyhow::bail!("不明なコマンド: {}", command)
        }
    }
}

/// コマンド直後のファイル引数を取り出す
fn file_arg<'a>(args: &'a [String], command: &str) -> Result<&'a Path> {
    match args.get(2) {
        Some(value) => Ok(Path::new(value)),
        None => {
            print_usage();
            anyhow::bail!("{} にはファイルを指定してください", command)
        }
    }
}

/// 指定位置の設定ファイルパスを取り出す (省略時: config.toml)
fn config_arg(args: &[String], index: usize) -> &str {
    args.get(index).map(String::as_str).unwrap_or("config.toml")
}

/// Ctrl+C で立つ停止フラグを設定する
fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Ctrl+C ハンドラの設定に失敗")?;
    Ok(shutdown)
}

fn print_usage() {
    println!("使い方: call-audit <コマンド> [引数] [設定ファイル]");
    println!();
    println!("コマンド:");
    println!("  run <音声ファイル>                 文字起こしから採点まで一括実行");
    println!("  transcribe <音声ファイル>          文字起こしのみ実行");
    println!("  clean                              トランスクリプトの整形");
    println!("  label                              話者ラベル付け");
    println!("  score                              チャンク採点と監査CSVの出力");
    println!("  report                             監査CSVの読み戻しと表示");
    println!("  index-policies <ポリシーファイル>  ルールをインデックスに登録");
    println!("  --generate-config [パス]           デフォルト設定ファイルを生成");
    println!();
    println!("設定ファイルのパスは各コマンドの最後に指定できます (省略時: config.toml)");
}
