//! StateStore - タスク記録と遷移履歴
//!
//! - memory: `TaskStore` の in-memory 実装
//! - dependency: 依存グラフ（循環検出）
//! - filter: 一覧フィルタと scheduling buckets
//! - snapshot: JSON スナップショット

pub mod dependency;
pub mod filter;
pub mod memory;
pub mod snapshot;

pub use self::dependency::DependencyGraph;
pub use self::filter::{SchedulingBuckets, TaskFilter};
pub use self::memory::InMemoryTaskStore;
pub use self::snapshot::StoreSnapshot;
