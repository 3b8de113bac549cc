//! Domain model (ids, tasks, transitions, phases, errors, events).

pub mod errors;
pub mod events;
pub mod ids;
pub mod phase;
pub mod signature;
pub mod task;
pub mod transition;

pub use self::errors::{ErrorKind, KernelError};
pub use self::events::DomainEvent;
pub use self::ids::{ExecutionId, Id, IdMarker, TaskId, TransitionId};
pub use self::phase::{Phase, PhaseExecutionRecord};
pub use self::signature::{LoopSignature, LoopSnapshot};
pub use self::task::{NewTask, Task, TaskStatus, meta};
pub use self::transition::TaskTransition;
