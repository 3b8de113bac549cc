//! App - アプリケーション層
//!
//! ports とコアのコンポーネントを組み合わせて実行単位にまとめる。
//!
//! # 主要コンポーネント
//! - **KernelBuilder**: 構築とワイヤリング（Fail-fast 検証）
//! - **Supervisor**: 割り当て→駆動→ループ検出の実行ループ
//! - **KernelStatus**: 状態の一覧

pub mod builder;
pub mod status;
pub mod supervisor;

pub use self::builder::{BuildError, Kernel, KernelBuilder};
pub use self::status::KernelStatus;
pub use self::supervisor::{RunOutcome, RunStop, Supervisor};
