//! App - アプリケーション層
//!
//! ports を組み合わせてバッチの処理を組み立てます。
//!
//! # 主要コンポーネント
//! - **BatchCoordinator**: バッチ作成、レッスン削除、1 タスク分の claim→scrape→persist→complete
//! - **ContinuationDriver**: 1 invocation 分の制御ループ（時間予算・上限・継続トリガー）
//! - **BatchStatusReport**: 進捗と失敗タスクの一覧

pub mod coordinator;
pub mod driver;
pub mod status;

pub use self::coordinator::{
    BatchCoordinator, CoordinatorSettings, ProcessedTask, StepReport, TaskResult, site_offset,
    with_store_retry,
};
pub use self::driver::{ContinuationDriver, DriverReport, DriverSettings, StopReason};
pub use self::status::{BatchStatusReport, FailedTask};
