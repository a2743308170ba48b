//! schedsync-core
//!
//! スタジオのレッスン時間割を (location, date) 単位のタスクに分けて取得するための部品。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, batch, lesson, retry, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, LessonStore, BrowserLauncher, ContinuationTrigger, など）
//! - **scrape**: 1 タスク分の抽出（ブラウザ操作 → HTML パース → 正規化）
//! - **app**: BatchCoordinator / ContinuationDriver / ステータスレポート
//! - **impls**: ports の実装（in-memory, SQLite, fixture, headless_chrome）
//! - **config**: 環境変数からの設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod scrape;

pub use config::{Config, ConfigError, LocationSource};
