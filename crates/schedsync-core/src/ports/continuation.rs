//! ContinuationTrigger port - 残りの仕事を次の invocation に引き継ぐ
//!
//! 進捗は TaskStore にしか無いので、trigger は batch id だけ渡せば十分です。

use async_trait::async_trait;

use crate::domain::BatchId;

#[async_trait]
pub trait ContinuationTrigger: Send + Sync {
    async fn schedule(&self, batch_id: BatchId) -> std::io::Result<()>;
}

/// Leaves continuation to an external scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopContinuation;

#[async_trait]
impl ContinuationTrigger for NoopContinuation {
    async fn schedule(&self, _batch_id: BatchId) -> std::io::Result<()> {
        Ok(())
    }
}
