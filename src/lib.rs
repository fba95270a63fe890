//! call-audit - コールセンター通話のコンプライアンス監査パイプライン
//!
//! このクレートは、通話録音の音声ファイルから文字起こし、話者ラベル付け、
//! ルールに基づくLLM採点までを行い、監査結果をCSVとして出力するシステムを
//! 提供します。
//!
//! # 主な機能
//!
//! - **音声文字起こし**: Whisper API (Groq / OpenAI) による通話録音の文字起こし
//! - **トランスクリプト整形**: ノイズ表記の除去と空白・句読点の正規化
//! - **話者ラベル付け**: LLMによる Agent / Customer の対話形式への整形
//! - **チャンク採点**: ルール検索付きのLLM採点（共感度・プロ意識・コンプライアンス）
//! - **ルール検索**: Pineconeインデックスからの関連コンプライアンスルール取得
//! - **CSVレポート**: チャンク毎の結果と最終集計の書き出し・読み戻し
//!
//! # アーキテクチャ
//!
//! ```text
//! [Audio File] → [WhisperApiBackend] → [clean_transcript]
//!                                             ↓
//!                [parse_dialogue] ← [label_dialogue]
//!                       ↓
//!                [chunk_turns] → [ChunkScorer] ← [RuleRetrieval] ← [PolicyIndex]
//!                                      ↓
//!                           [audit_results.csv] → [print_summary]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use call_audit::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod chat;
pub mod chunker;
pub mod config;
pub mod dialogue;
pub mod embedding;
pub mod pipeline;
pub mod policy_index;
pub mod report;
pub mod scoring;
pub mod transcribe_backend;
pub mod transcript;
pub mod types;
pub mod whisper_api;
