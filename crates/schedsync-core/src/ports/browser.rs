//! Browser port - ヘッドレスブラウザのセッション
//!
//! セッションは排他的なリソースです（1 プロセス内で同時に 1 タスクだけが使う）。
//! ExtractionWorker がタスクごとに `open()` し、どの経路で抜けても `close()` します。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ScrapeError;

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PageSession>, ScrapeError>;
}

#[async_trait]
pub trait PageSession: Send {
    /// Load `url` and wait for the navigation to settle.
    async fn navigate(&mut self, url: &str) -> Result<(), ScrapeError>;

    /// `Ok(true)` once `selector` matches, `Ok(false)` if it did not appear
    /// within `timeout`.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, ScrapeError>;

    /// Rendered document HTML.
    async fn content(&mut self) -> Result<String, ScrapeError>;

    /// Release the session. Must not fail; teardown problems are logged.
    async fn close(self: Box<Self>);
}
