//! Stage that only waits

use std::time::Duration;

use async_trait::async_trait;

use crate::ack::AckPayload;
use crate::scenario::Properties;
use crate::stage::{DistStage, StageError, WorkerContext};

/// Registered stage type
pub const SLEEP: &str = "sleep";

/// Waits for `duration` on every executing worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepStage {
    duration: Duration,
}

impl SleepStage {
    /// Sleep for a fixed duration
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Build the stage from evaluated properties; `duration` is mandatory
    pub fn from_properties(properties: &Properties) -> Result<Self, StageError> {
        properties
            .duration("duration")?
            .map(Self::new)
            .ok_or_else(|| StageError::MissingProperty("duration".into()))
    }
}

#[async_trait]
impl DistStage for SleepStage {
    fn name(&self) -> &str {
        SLEEP
    }

    async fn execute_on_worker(&self, context: &WorkerContext<'_>) -> Result<AckPayload, StageError> {
        tracing::debug!(
            worker_index = context.state.worker_index(),
            duration_ms = self.duration.as_millis() as u64,
            "Sleeping"
        );
        tokio::time::sleep(self.duration).await;
        Ok(AckPayload::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use crate::state::WorkerState;

    #[test]
    fn test_duration_is_mandatory() {
        assert!(matches!(
            SleepStage::from_properties(&Properties::new()),
            Err(StageError::MissingProperty(_))
        ));
        assert_eq!(
            SleepStage::from_properties(&Properties::new().with("duration", "2s")).unwrap(),
            SleepStage::new(Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps() {
        let state = WorkerState::new(0, 1);
        let capabilities = Capabilities::new();
        let context = WorkerContext {
            state: &state,
            capabilities: &capabilities,
            executing_workers: &[0],
        };
        let started = tokio::time::Instant::now();
        SleepStage::new(Duration::from_secs(5))
            .execute_on_worker(&context)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
