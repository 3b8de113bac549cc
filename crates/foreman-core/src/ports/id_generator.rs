//! IdGenerator port - ID 生成の抽象化
//!
//! Kernel-minted ids are ULIDs whose timestamp part comes from the injected
//! clock, so ids sort the same way the records they name were appended.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{ExecutionId, TransitionId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn transition_id(&self) -> TransitionId;

    fn execution_id(&self) -> ExecutionId;
}

/// ULID ベースの ID 生成器
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn transition_id(&self) -> TransitionId {
        TransitionId::from(self.next())
    }

    fn execution_id(&self) -> ExecutionId {
        ExecutionId::from(self.next())
    }
}
