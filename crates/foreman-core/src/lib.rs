//! foreman-core
//!
//! Orchestration kernel for long-running, multi-phase tasks executed by a
//! pool of rate-limited external workers.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, transition, phase, errors, events）
//! - **ports**: 抽象化レイヤー（Clock, EventSink, IdGenerator, TaskStore, WorkerProvider）
//! - **store**: InMemoryTaskStore（状態機械と依存関係）
//! - **scheduler**: 優先度キュー、リソース分類、research トリガー
//! - **dispatch**: ワーカープールとフェーズ駆動
//! - **idempotency**: 冪等キーとキャッシュ
//! - **guardrail**: ポリシーカタログ、チェック、コマンド安全性、ハッシュチェーン台帳
//! - **gate**: フェーズ実行ゲート（テンプレート検出、コンテキスト、記録）
//! - **loop_detector**: 同一状態の繰り返し検出
//! - **app**: 構築と実行ループ
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod gate;
pub mod guardrail;
pub mod idempotency;
pub mod loop_detector;
pub mod ports;
pub mod scheduler;
pub mod store;

pub use self::app::{Kernel, KernelBuilder, RunOutcome, RunStop};
pub use self::config::KernelConfig;
pub use self::domain::{KernelError, Phase, Task, TaskId, TaskStatus};
