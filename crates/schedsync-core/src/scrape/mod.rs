//! Extraction Worker - 1 タスク（location, date）分のスクレイプ
//!
//! ステートマシン: launch → navigate → wait-for-render → read-content → parse → normalize
//!
//! - ブラウザの各ステージには上限時間があり、超えたら `ScrapeError::Timeout`
//! - セッションはタスクごとに開き、どの経路で抜けても閉じる
//! - 一時的な失敗（timeout / navigation / session）は RetryPolicy でリトライ、
//!   構造エラーは即座に返す
//!
//! バッチのことは何も知りません。

pub mod normalize;
pub mod parse;
pub mod selectors;

pub use normalize::{NOMINAL_TOTAL_SEATS, PLACEHOLDER_AVAILABLE_SEATS};
pub use selectors::SelectorSet;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::domain::{LessonRecord, LocationCode, RetryPolicy, ScrapeError, ScrapeStage};
use crate::ports::{BrowserLauncher, Clock, PageSession};

use self::parse::ParsedPage;
use self::selectors::CompiledSelectors;

const RENDER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct StageTimeouts {
    pub launch: Duration,
    pub navigate: Duration,
    pub render: Duration,
    pub read: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            launch: Duration::from_secs(30),
            navigate: Duration::from_secs(30),
            render: Duration::from_secs(20),
            read: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Contains `{location}` and `{date}` (YYYY-MM-DD).
    pub url_template: String,
    pub selectors: SelectorSet,
    pub timeouts: StageTimeouts,
    pub retry: RetryPolicy,
}

impl ExtractionConfig {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            selectors: SelectorSet::default(),
            timeouts: StageTimeouts::default(),
            retry: RetryPolicy::scrape_default(),
        }
    }

    pub fn target_url(&self, location: &LocationCode, date: NaiveDate) -> String {
        self.url_template
            .replace("{location}", location.as_str())
            .replace("{date}", &date.format("%Y-%m-%d").to_string())
    }
}

/// Result of one successful extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub lessons: Vec<LessonRecord>,
    pub quarantined: usize,
    pub attempts: u32,
}

/// Seam used by the coordinator; the real one is `ExtractionWorker`.
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, location: &LocationCode, date: NaiveDate) -> Result<Extraction, ScrapeError>;
}

pub struct ExtractionWorker {
    launcher: Arc<dyn BrowserLauncher>,
    clock: Arc<dyn Clock>,
    config: ExtractionConfig,
    selectors: CompiledSelectors,
}

impl ExtractionWorker {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        clock: Arc<dyn Clock>,
        config: ExtractionConfig,
    ) -> Result<Self, ScrapeError> {
        let selectors = config.selectors.compile()?;
        Ok(Self {
            launcher,
            clock,
            config,
            selectors,
        })
    }

    async fn attempt(
        &self,
        location: &LocationCode,
        date: NaiveDate,
    ) -> Result<(Vec<LessonRecord>, usize), ScrapeError> {
        let t = &self.config.timeouts;
        let mut session = bounded(ScrapeStage::Launch, t.launch, self.launcher.open()).await?;
        let result = self.drive(session.as_mut(), location, date).await;
        session.close().await;
        result
    }

    async fn drive(
        &self,
        session: &mut dyn PageSession,
        location: &LocationCode,
        date: NaiveDate,
    ) -> Result<(Vec<LessonRecord>, usize), ScrapeError> {
        let t = &self.config.timeouts;
        let url = self.config.target_url(location, date);

        bounded(ScrapeStage::Navigate, t.navigate, session.navigate(&url)).await?;

        // session 側の待ちが先に false を返せるよう、外側の上限には少し余裕を持たせる
        let rendered = bounded(
            ScrapeStage::WaitForRender,
            t.render + RENDER_GRACE,
            session.wait_for(&self.config.selectors.container, t.render),
        )
        .await?;

        let html = bounded(ScrapeStage::ReadContent, t.read, session.content()).await?;

        match parse::parse_document(&html, &self.selectors) {
            ParsedPage::Schedule(slots) => {
                let raw_count = slots.len();
                let out = normalize::normalize(location, date, slots, self.clock.now());
                if raw_count > 0 && out.lessons.is_empty() {
                    return Err(ScrapeError::Structure(format!(
                        "all {raw_count} slots malformed at {url}"
                    )));
                }
                Ok((out.lessons, out.quarantined))
            }
            ParsedPage::MissingContainer => Err(ScrapeError::Structure(format!(
                "'{}' not found at {url}",
                self.config.selectors.container
            ))),
            // 何も描画されていない: まだロード中とみなす
            ParsedPage::Blank if !rendered => Err(ScrapeError::Timeout {
                stage: ScrapeStage::WaitForRender,
                timeout: t.render,
            }),
            ParsedPage::Blank => Err(ScrapeError::Structure(format!("empty document at {url}"))),
        }
    }
}

#[async_trait::async_trait]
impl Extractor for ExtractionWorker {
    async fn extract(&self, location: &LocationCode, date: NaiveDate) -> Result<Extraction, ScrapeError> {
        let policy = &self.config.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(location, date).await {
                Ok((lessons, quarantined)) => {
                    debug!(%location, %date, lessons = lessons.len(), quarantined, attempts, "extracted");
                    return Ok(Extraction {
                        lessons,
                        quarantined,
                        attempts,
                    });
                }
                Err(e) if e.is_transient() && policy.should_retry(attempts) => {
                    let delay = policy.next_delay(attempts);
                    warn!(%location, %date, attempts, error = %e, ?delay, "transient scrape failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn bounded<T, F>(stage: ScrapeStage, limit: Duration, fut: F) -> Result<T, ScrapeError>
where
    F: Future<Output = Result<T, ScrapeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(ScrapeError::Timeout {
            stage,
            timeout: limit,
        }),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Three slots: exact count, full, and flag-only.
    pub const THREE_SLOT_PAGE: &str = r#"<html><body>
      <div class="schedule">
        <div class="lesson" style="background-color:#f5a623;color:#fff">
          <span class="time">10:00 - 10:45</span>
          <span class="program">BB2 HOUSE 1</span>
          <span class="instructor">Aki</span>
          <span class="status">残り2席</span>
        </div>
        <div class="lesson full">
          <span class="time">11:00 - 11:45</span>
          <span class="program">BSL Deep 2</span>
          <span class="instructor">Mei</span>
          <span class="status">満席</span>
        </div>
        <div class="lesson" data-available="true">
          <span class="time">12:30 - 13:15</span>
          <span class="program">BSW Hip Hop 1</span>
          <span class="instructor">Ren</span>
        </div>
      </div>
    </body></html>"#;

    pub const EMPTY_SCHEDULE_PAGE: &str =
        r#"<html><body><div class="schedule"><p>レッスンはありません</p></div></body></html>"#;

    pub const MAINTENANCE_PAGE: &str =
        r#"<html><body><h1>ただいまメンテナンス中です</h1></body></html>"#;
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::impls::{FixtureLauncher, FixturePage};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    const TEMPLATE: &str = "https://studio.test/{location}/{date}";

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn url() -> String {
        "https://studio.test/ginza/2026-10-18".to_string()
    }

    fn worker(launcher: &FixtureLauncher) -> ExtractionWorker {
        let mut config = ExtractionConfig::new(TEMPLATE);
        config.retry = RetryPolicy::immediate(3);
        config.timeouts = StageTimeouts {
            launch: Duration::from_millis(200),
            navigate: Duration::from_millis(50),
            render: Duration::from_millis(50),
            read: Duration::from_millis(200),
        };
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap()));
        ExtractionWorker::new(Arc::new(launcher.clone()), clock, config).unwrap()
    }

    #[test]
    fn url_template_is_filled() {
        let config = ExtractionConfig::new(TEMPLATE);
        assert_eq!(config.target_url(&LocationCode::new("ginza"), date()), url());
    }

    #[tokio::test]
    async fn three_slot_fixture() {
        let launcher = FixtureLauncher::new();
        launcher.serve_html(url(), THREE_SLOT_PAGE).await;

        let out = worker(&launcher)
            .extract(&LocationCode::new("ginza"), date())
            .await
            .unwrap();

        let seats: Vec<_> = out
            .lessons
            .iter()
            .map(|l| (l.lesson_name.as_str(), l.available_seats, l.seats_exact))
            .collect();
        assert_eq!(
            seats,
            vec![
                ("BB2 HOUSE 1", 2, true),
                ("BSL Deep 2", 0, true),
                ("BSW Hip Hop 1", PLACEHOLDER_AVAILABLE_SEATS, false),
            ]
        );
        assert_eq!(out.lessons[0].lesson_id(), "2026-10-18#10:00#BB2 HOUSE 1");
        assert_eq!(out.lessons[0].background_color.as_deref(), Some("#f5a623"));
        assert!(!out.lessons[1].is_available);
        assert_eq!(out.attempts, 1);
        assert_eq!((launcher.opened(), launcher.closed()), (1, 1));
    }

    #[tokio::test]
    async fn empty_schedule_is_a_valid_result() {
        let launcher = FixtureLauncher::new();
        launcher.serve_html(url(), EMPTY_SCHEDULE_PAGE).await;

        let out = worker(&launcher)
            .extract(&LocationCode::new("ginza"), date())
            .await
            .unwrap();
        assert!(out.lessons.is_empty());
        assert_eq!(out.quarantined, 0);
    }

    #[tokio::test]
    async fn missing_container_is_structural_and_not_retried() {
        let launcher = FixtureLauncher::new();
        launcher.serve_html(url(), MAINTENANCE_PAGE).await;

        let err = worker(&launcher)
            .extract(&LocationCode::new("ginza"), date())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Structure(_)));
        assert_eq!(launcher.visits().await.len(), 1);
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn all_malformed_slots_is_structural() {
        let launcher = FixtureLauncher::new();
        launcher
            .serve_html(
                url(),
                r#"<div class="schedule"><div class="lesson"><span class="time">TBD</span></div></div>"#,
            )
            .await;

        let err = worker(&launcher)
            .extract(&LocationCode::new("ginza"), date())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Structure(_)));
    }

    #[tokio::test]
    async fn transient_navigation_failure_is_retried() {
        let launcher = FixtureLauncher::new();
        launcher
            .serve(url(), FixturePage::NavError("net::ERR_CONNECTION_RESET".to_string()))
            .await;
        launcher.serve_html(url(), THREE_SLOT_PAGE).await;

        let out = worker(&launcher)
            .extract(&LocationCode::new("ginza"), date())
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
        assert_eq!(out.lessons.len(), 3);
        assert_eq!((launcher.opened(), launcher.closed()), (2, 2));
    }

    #[tokio::test]
    async fn hanging_navigation_times_out_after_all_attempts() {
        let launcher = FixtureLauncher::new();
        launcher.serve(url(), FixturePage::Hang).await;

        let err = worker(&launcher)
            .extract(&LocationCode::new("ginza"), date())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScrapeError::Timeout {
                stage: ScrapeStage::Navigate,
                ..
            }
        ));
        assert_eq!(launcher.visits().await.len(), 3);
        assert_eq!((launcher.opened(), launcher.closed()), (3, 3));
    }

    #[tokio::test]
    async fn blank_page_counts_as_render_timeout() {
        let launcher = FixtureLauncher::new();
        launcher.serve_html(url(), "<html><body></body></html>").await;

        let err = worker(&launcher)
            .extract(&LocationCode::new("ginza"), date())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScrapeError::Timeout {
                stage: ScrapeStage::WaitForRender,
                ..
            }
        ));
        assert!(err.is_transient());
    }
}
