//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryLessonStore**: テスト・ドライラン用
//! - **SqliteTaskStore / SqliteLessonStore**: CLI 用の正本（invocation をまたいで残る）
//! - **FixtureLauncher**: 用意した HTML を返すブラウザ
//! - **ChromeLauncher**: headless_chrome（`chrome` feature）
//! - **StaticDirectory / JsonFileDirectory**: スタジオ一覧
//! - **SelfExecContinuation**: CLI を子プロセスとして再実行する継続トリガー

pub mod directory;
pub mod fixture_pages;
pub mod inmem_lesson_store;
pub mod inmem_task_store;
pub mod self_exec;
pub mod sqlite;

#[cfg(feature = "chrome")]
pub mod chrome;

pub use self::directory::{JsonFileDirectory, StaticDirectory};
pub use self::fixture_pages::{FixtureLauncher, FixturePage};
pub use self::inmem_lesson_store::InMemoryLessonStore;
pub use self::inmem_task_store::InMemoryTaskStore;
pub use self::self_exec::SelfExecContinuation;
pub use self::sqlite::{SqliteDb, SqliteLessonStore, SqliteTaskStore};

#[cfg(feature = "chrome")]
pub use self::chrome::ChromeLauncher;
