//! ContinuationDriver - 1 invocation 分の制御ループ
//!
//! 1. stale な processing を pending に戻す
//! 2. process_next を繰り返す
//!    - バッチ完了 / タスク数上限 / 残り時間不足 で止まる
//!    - 残り時間 < これまでで一番遅かったタスク + 安全マージン なら次を claim しない
//! 3. 仕事が残っていれば ContinuationTrigger に引き継ぐ
//!
//! 実行中のタスクを途中で止めることはありません（判定はタスクの間だけ）。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::coordinator::{BatchCoordinator, TaskResult};
use crate::domain::BatchId;
use crate::ports::ContinuationTrigger;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Wall-clock budget of one invocation.
    pub budget: Duration,
    /// Kept free at the end of the budget on top of the slowest task seen.
    pub safety_margin: Duration,
    pub max_tasks: Option<u32>,
    pub stale_after: chrono::Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(840),
            safety_margin: Duration::from_secs(30),
            max_tasks: None,
            stale_after: chrono::Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    BatchDone,
    TaskCap,
    BudgetExhausted,
    /// Store or claim failure; the next invocation picks up from the store.
    ContinueLater(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverReport {
    pub batch_id: BatchId,
    pub processed: u32,
    pub completed: u32,
    pub failed: u32,
    pub stale_reset: usize,
    pub has_more: bool,
    pub stop: StopReason,
    pub continuation_scheduled: bool,
}

impl DriverReport {
    fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            processed: 0,
            completed: 0,
            failed: 0,
            stale_reset: 0,
            has_more: true,
            stop: StopReason::BatchDone,
            continuation_scheduled: false,
        }
    }
}

pub struct ContinuationDriver {
    coordinator: Arc<BatchCoordinator>,
    trigger: Arc<dyn ContinuationTrigger>,
    settings: DriverSettings,
}

impl ContinuationDriver {
    pub fn new(
        coordinator: Arc<BatchCoordinator>,
        trigger: Arc<dyn ContinuationTrigger>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            coordinator,
            trigger,
            settings,
        }
    }

    #[instrument(skip(self), fields(budget_secs = self.settings.budget.as_secs()))]
    pub async fn run(&self, batch_id: BatchId) -> DriverReport {
        let started = Instant::now();
        let mut report = DriverReport::new(batch_id);

        match self
            .coordinator
            .reset_stale(batch_id, self.settings.stale_after)
            .await
        {
            Ok(n) => report.stale_reset = n,
            Err(e) => {
                error!(error = %e, "stale recovery failed; continue later");
                report.stop = StopReason::ContinueLater(e.to_string());
                return report;
            }
        }

        let mut slowest = Duration::ZERO;
        report.stop = loop {
            // 1 invocation で最低 1 タスクは必ず進める
            if report.processed > 0 {
                if let Some(cap) = self.settings.max_tasks {
                    if report.processed >= cap {
                        break StopReason::TaskCap;
                    }
                }
                let remaining = self.settings.budget.saturating_sub(started.elapsed());
                if remaining < slowest + self.settings.safety_margin {
                    break StopReason::BudgetExhausted;
                }
            }

            let task_started = Instant::now();
            let step = match self.coordinator.process_next(batch_id).await {
                Ok(step) => step,
                Err(e) => {
                    error!(error = %e, "store failure; continue later");
                    break StopReason::ContinueLater(e.to_string());
                }
            };
            slowest = slowest.max(task_started.elapsed());

            if let Some(p) = &step.processed {
                report.processed += 1;
                match p.result {
                    TaskResult::Completed { .. } => report.completed += 1,
                    TaskResult::Failed { .. } => report.failed += 1,
                    TaskResult::Lost => {}
                }
            }
            if !step.has_more {
                report.has_more = false;
                break StopReason::BatchDone;
            }
        };

        // store 障害時は外部スケジューラに任せる（ここで自分を即再起動しない）
        if report.processed > 0
            && matches!(report.stop, StopReason::TaskCap | StopReason::BudgetExhausted)
        {
            match self.trigger.schedule(batch_id).await {
                Ok(()) => report.continuation_scheduled = true,
                Err(e) => warn!(error = %e, "could not schedule continuation"),
            }
        }

        info!(
            processed = report.processed,
            completed = report.completed,
            failed = report.failed,
            stop = ?report.stop,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "invocation finished"
        );
        report
    }
}
