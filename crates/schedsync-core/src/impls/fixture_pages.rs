//! Fixture browser - URL ごとに用意した HTML を返すだけの launcher
//!
//! テストとドライランで使います。実ブラウザは `chrome` feature 側。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tokio::sync::Mutex;

use crate::domain::{ScrapeError, ScrapeStage};
use crate::ports::{BrowserLauncher, PageSession};

/// What a fixture URL does when visited.
#[derive(Debug, Clone)]
pub enum FixturePage {
    Html(String),
    NavError(String),
    /// Navigation never settles; the caller's stage timeout fires.
    Hang,
}

#[derive(Default)]
struct FixtureState {
    pages: HashMap<String, VecDeque<FixturePage>>,
    visits: Vec<String>,
}

/// Serves canned pages. Each URL has a queue of responses; the last one
/// repeats forever.
#[derive(Clone, Default)]
pub struct FixtureLauncher {
    state: Arc<Mutex<FixtureState>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl FixtureLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn serve(&self, url: impl Into<String>, page: FixturePage) {
        let mut st = self.state.lock().await;
        st.pages.entry(url.into()).or_default().push_back(page);
    }

    pub async fn serve_html(&self, url: impl Into<String>, html: impl Into<String>) {
        self.serve(url, FixturePage::Html(html.into())).await;
    }

    pub async fn visits(&self) -> Vec<String> {
        self.state.lock().await.visits.clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    async fn next_page(&self, url: &str) -> Option<FixturePage> {
        let mut st = self.state.lock().await;
        st.visits.push(url.to_string());
        let queue = st.pages.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl BrowserLauncher for FixtureLauncher {
    async fn open(&self) -> Result<Box<dyn PageSession>, ScrapeError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixtureSession {
            launcher: self.clone(),
            document: None,
        }))
    }
}

struct FixtureSession {
    launcher: FixtureLauncher,
    document: Option<String>,
}

#[async_trait]
impl PageSession for FixtureSession {
    async fn navigate(&mut self, url: &str) -> Result<(), ScrapeError> {
        match self.launcher.next_page(url).await {
            Some(FixturePage::Html(html)) => {
                self.document = Some(html);
                Ok(())
            }
            Some(FixturePage::NavError(msg)) => Err(ScrapeError::Navigation(msg)),
            Some(FixturePage::Hang) => std::future::pending().await,
            None => Err(ScrapeError::Navigation(format!("404 for {url}"))),
        }
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<bool, ScrapeError> {
        let Some(doc) = &self.document else {
            return Ok(false);
        };
        let sel = Selector::parse(selector).map_err(|e| ScrapeError::Session(format!(
            "{}: bad selector '{selector}': {e}",
            ScrapeStage::WaitForRender
        )))?;
        Ok(Html::parse_document(doc).select(&sel).next().is_some())
    }

    async fn content(&mut self) -> Result<String, ScrapeError> {
        self.document
            .clone()
            .ok_or_else(|| ScrapeError::Session("no document loaded".to_string()))
    }

    async fn close(self: Box<Self>) {
        self.launcher.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_pages_then_sticky_last() {
        let launcher = FixtureLauncher::new();
        launcher
            .serve("u", FixturePage::NavError("reset".to_string()))
            .await;
        launcher.serve_html("u", "<div class='schedule'></div>").await;

        let mut s = launcher.open().await.unwrap();
        assert!(matches!(s.navigate("u").await, Err(ScrapeError::Navigation(_))));
        s.navigate("u").await.unwrap();
        s.navigate("u").await.unwrap();
        assert!(s.wait_for(".schedule", Duration::ZERO).await.unwrap());
        assert!(!s.wait_for(".lesson", Duration::ZERO).await.unwrap());
        s.close().await;

        assert_eq!(launcher.visits().await.len(), 3);
        assert_eq!((launcher.opened(), launcher.closed()), (1, 1));
    }

    #[tokio::test]
    async fn unknown_url_is_a_navigation_error() {
        let launcher = FixtureLauncher::new();
        let mut s = launcher.open().await.unwrap();
        assert!(matches!(s.navigate("nope").await, Err(ScrapeError::Navigation(_))));
        assert!(s.content().await.is_err());
        s.close().await;
    }
}
