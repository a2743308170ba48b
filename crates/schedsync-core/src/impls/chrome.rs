//! headless_chrome launcher (feature = "chrome")
//!
//! headless_chrome の API はブロッキングなので、各ステージを `spawn_blocking` に逃がします。
//! ステージのタイムアウトは呼び出し側 (ExtractionWorker) が `tokio::time::timeout` で掛けます。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, warn};

use crate::domain::{ScrapeError, ScrapeStage};
use crate::ports::{BrowserLauncher, PageSession};

#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    pub headless: bool,
    /// Upper bound for chrome's own waits (navigation, element lookup).
    pub default_timeout: Duration,
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self {
            headless: true,
            default_timeout: Duration::from_secs(30),
        }
    }
}

async fn blocking<T, F>(stage: ScrapeStage, f: F) -> Result<T, ScrapeError>
where
    F: FnOnce() -> Result<T, ScrapeError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ScrapeError::Session(format!("{stage}: worker thread failed: {e}")))?
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn open(&self) -> Result<Box<dyn PageSession>, ScrapeError> {
        let headless = self.headless;
        let timeout = self.default_timeout;
        let (browser, tab) = blocking(ScrapeStage::Launch, move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .build()
                .map_err(|e| ScrapeError::Session(format!("launch options: {e}")))?;
            let browser =
                Browser::new(options).map_err(|e| ScrapeError::Session(format!("launch: {e}")))?;
            let tab = browser
                .new_tab()
                .map_err(|e| ScrapeError::Session(format!("new tab: {e}")))?;
            tab.set_default_timeout(timeout);
            Ok((browser, tab))
        })
        .await?;

        Ok(Box::new(ChromeSession { browser, tab }))
    }
}

struct ChromeSession {
    browser: Browser,
    tab: Arc<Tab>,
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), ScrapeError> {
        let tab = Arc::clone(&self.tab);
        let url = url.to_string();
        blocking(ScrapeStage::Navigate, move || {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| ScrapeError::Navigation(format!("{url}: {e}")))
        })
        .await
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, ScrapeError> {
        let tab = Arc::clone(&self.tab);
        let selector = selector.to_string();
        blocking(ScrapeStage::WaitForRender, move || {
            match tab.wait_for_element_with_custom_timeout(&selector, timeout) {
                Ok(_) => Ok(true),
                Err(e) => {
                    debug!(%selector, error = %e, "selector did not appear");
                    Ok(false)
                }
            }
        })
        .await
    }

    async fn content(&mut self) -> Result<String, ScrapeError> {
        let tab = Arc::clone(&self.tab);
        blocking(ScrapeStage::ReadContent, move || {
            tab.get_content()
                .map_err(|e| ScrapeError::Session(format!("read content: {e}")))
        })
        .await
    }

    async fn close(self: Box<Self>) {
        let ChromeSession { browser, tab } = *self;
        let res = tokio::task::spawn_blocking(move || {
            let closed = tab.close(true);
            drop(browser);
            closed
        })
        .await;
        match res {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "chrome tab close failed"),
            Err(e) => warn!(error = %e, "chrome teardown thread failed"),
        }
    }
}
