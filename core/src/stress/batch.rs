//! Transaction batch buffered by one engine thread

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::request::{Operation, Request};
use crate::traits::Transaction;

/// Open transaction with the requests issued inside it
///
/// Requests are buffered until the batch closes, so a batch opened
/// during warmup leaves no trace in the statistics.
pub(crate) struct TxBatch {
    pub(crate) transaction: Box<dyn Transaction>,
    remaining: usize,
    operations: usize,
    last_operation: Option<Operation>,
    opened: Instant,
    opened_at: DateTime<Utc>,
    requests: Option<Vec<Request>>,
}

impl TxBatch {
    /// Batch of up to `size` operations; `recording` tells whether the
    /// thread was measuring when it opened
    pub(crate) fn open(
        transaction: Box<dyn Transaction>,
        size: usize,
        opened: Instant,
        opened_at: DateTime<Utc>,
        recording: bool,
    ) -> Self {
        Self {
            transaction,
            remaining: size,
            operations: 0,
            last_operation: None,
            opened,
            opened_at,
            requests: recording.then(Vec::new),
        }
    }

    /// Buffer a request issued inside the batch
    pub(crate) fn push(&mut self, request: Request) {
        if let Some(requests) = self.requests.as_mut() {
            requests.push(request);
        }
    }

    /// Account for a finished user operation; failures end the batch
    pub(crate) fn operation_done(&mut self, operation: &Operation, successful: bool) {
        self.operations += 1;
        self.last_operation = Some(operation.clone());
        self.remaining = if successful {
            self.remaining.saturating_sub(1)
        } else {
            0
        };
    }

    /// Whether the batch must be closed now
    pub(crate) fn is_full(&self) -> bool {
        self.remaining == 0
    }

    /// Time since the batch opened
    pub(crate) fn elapsed(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Wall-clock time the batch opened
    pub(crate) fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// The operation, if the batch held exactly one
    pub(crate) fn single_operation(&self) -> Option<&Operation> {
        match self.operations {
            1 => self.last_operation.as_ref(),
            _ => None,
        }
    }

    /// Buffered requests, `None` when the batch opened outside measurement
    pub(crate) fn take_requests(&mut self) -> Option<Vec<Request>> {
        self.requests.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::OperationError;
    use async_trait::async_trait;

    struct NoopTransaction;

    #[async_trait]
    impl Transaction for NoopTransaction {
        async fn begin(&mut self) -> Result<(), OperationError> {
            Ok(())
        }
        async fn commit(&mut self) -> Result<(), OperationError> {
            Ok(())
        }
        async fn rollback(&mut self) -> Result<(), OperationError> {
            Ok(())
        }
    }

    const PUT: Operation = Operation::from_static("BasicOperations.Put");

    fn batch(size: usize, recording: bool) -> TxBatch {
        TxBatch::open(Box::new(NoopTransaction), size, Instant::now(), Utc::now(), recording)
    }

    #[test]
    fn test_batch_fills_after_size_operations() {
        let mut batch = batch(3, true);
        batch.operation_done(&PUT, true);
        batch.operation_done(&PUT, true);
        assert!(!batch.is_full());
        batch.operation_done(&PUT, true);
        assert!(batch.is_full());
        assert!(batch.single_operation().is_none());
    }

    #[test]
    fn test_failure_closes_batch_early() {
        let mut batch = batch(10, true);
        batch.operation_done(&PUT, false);
        assert!(batch.is_full());
        assert_eq!(batch.single_operation(), Some(&PUT));
    }

    #[test]
    fn test_requests_discarded_when_not_recording() {
        let mut batch = batch(2, false);
        batch.push(Request::start());
        assert!(batch.take_requests().is_none());

        let mut recorded = self::batch(2, true);
        recorded.push(Request::start());
        assert_eq!(recorded.take_requests().unwrap().len(), 1);
    }
}
