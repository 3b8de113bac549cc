//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部（ストレージ、ワーカー、証跡シンク、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod task_store;
pub mod worker;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_sink::{EventSink, JsonlEventSink, MemoryEventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
pub use self::worker::{WorkerError, WorkerProvider, WorkerRequest, WorkerResponse};
