//! schedsync - バッチ作成・タスク処理・状態確認の CLI
//!
//! 状態は全部 SQLite（`SCHEDSYNC_DB_PATH`）にあるので、各サブコマンドは
//! 独立した invocation として何度でも呼べます。stdout は JSON / ID だけ、ログは stderr。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use schedsync_core::Config;
use schedsync_core::app::{BatchCoordinator, ContinuationDriver};
use schedsync_core::config::LocationSource;
use schedsync_core::domain::{BatchId, LessonScope, LocationCode};
use schedsync_core::impls::{
    FixtureLauncher, JsonFileDirectory, SelfExecContinuation, SqliteDb, SqliteLessonStore,
    SqliteTaskStore, StaticDirectory,
};
use schedsync_core::ports::{
    BrowserLauncher, ContinuationTrigger, LocationDirectory, NoopContinuation, SystemClock,
    UlidGenerator,
};
use schedsync_core::scrape::ExtractionWorker;

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "schedsync", version, about = "Studio schedule batch refresher")]
struct Cli {
    /// `<location>_<YYYY-MM-DD>.html` files served instead of a real browser
    #[arg(long, global = true)]
    fixture_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a batch for every configured location and print its id
    InitBatch {
        #[arg(long)]
        horizon_days: Option<u32>,
    },
    /// Delete stored lessons (all, or one location)
    ClearLessons {
        #[arg(long)]
        location: Option<String>,
    },
    /// Work through pending tasks of a batch within one time budget
    ProcessTask {
        batch_id: BatchId,
        #[arg(long)]
        max_tasks: Option<u32>,
        #[arg(long)]
        budget_secs: Option<u64>,
        /// Re-exec this binary in the background when work remains
        #[arg(long = "continue")]
        continue_: bool,
    },
    BatchStatus {
        batch_id: BatchId,
        #[arg(long)]
        json: bool,
    },
    /// failed -> pending
    ResetFailed { batch_id: BatchId },
    /// processing tasks older than SCHEDSYNC_STALE_AFTER_SECS -> pending
    ResetStale { batch_id: BatchId },
    Lessons {
        #[arg(long, conflicts_with = "stats")]
        location: Option<String>,
        #[arg(long, requires = "location", conflicts_with = "stats")]
        date: Option<NaiveDate>,
        #[arg(long)]
        stats: bool,
    },
    /// Drop task/batch records past their TTL
    PurgeExpired,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,schedsync_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `--fixture-dir` のファイルを、設定の URL テンプレートで組み立てた URL に割り当てる
async fn load_fixtures(config: &Config, dir: &Path) -> anyhow::Result<FixtureLauncher> {
    let extraction = config.extraction();
    let launcher = FixtureLauncher::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading fixture dir {}", dir.display()))?;

    let mut served = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("html") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((code, date)) = stem
            .rsplit_once('_')
            .and_then(|(code, date)| Some((code, date.parse::<NaiveDate>().ok()?)))
        else {
            warn!(file = %path.display(), "skipping fixture with unexpected name");
            continue;
        };
        let html = std::fs::read_to_string(&path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        let url = extraction.target_url(&LocationCode::new(code), date);
        launcher.serve_html(url, html).await;
        served += 1;
    }
    info!(served, dir = %dir.display(), "fixture pages loaded");
    Ok(launcher)
}

async fn browser(config: &Config, fixture_dir: Option<&Path>) -> anyhow::Result<Arc<dyn BrowserLauncher>> {
    if let Some(dir) = fixture_dir {
        return Ok(Arc::new(load_fixtures(config, dir).await?));
    }

    #[cfg(feature = "chrome")]
    {
        Ok(Arc::new(schedsync_core::impls::ChromeLauncher {
            default_timeout: config.nav_timeout,
            ..Default::default()
        }))
    }

    #[cfg(not(feature = "chrome"))]
    anyhow::bail!("no browser available: pass --fixture-dir or build with `--features chrome`")
}

fn directory(config: &Config) -> anyhow::Result<Arc<dyn LocationDirectory>> {
    let directory: Arc<dyn LocationDirectory> = match &config.locations {
        LocationSource::Inline(raw) => {
            Arc::new(StaticDirectory::parse_inline(raw).context("parsing SCHEDSYNC_LOCATIONS")?)
        }
        LocationSource::JsonFile(path) => Arc::new(JsonFileDirectory::new(path.clone())),
    };
    Ok(directory)
}

fn coordinator(
    config: &Config,
    db: &SqliteDb,
    launcher: Arc<dyn BrowserLauncher>,
) -> anyhow::Result<BatchCoordinator> {
    let clock = Arc::new(SystemClock);
    let extractor = ExtractionWorker::new(launcher, clock.clone(), config.extraction())
        .context("compiling schedule selectors")?;

    Ok(BatchCoordinator::new(
        Arc::new(SqliteTaskStore::new(db.clone())),
        Arc::new(SqliteLessonStore::new(db.clone())),
        Arc::new(extractor),
        Arc::new(UlidGenerator::new(SystemClock)),
        clock,
        config.coordinator(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    let db = SqliteDb::open(&config.db_path, SQLITE_BUSY_TIMEOUT)
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    // スクレイプしないコマンドでは空の fixture で十分
    let launcher: Arc<dyn BrowserLauncher> = match &cli.command {
        Command::ProcessTask { .. } => browser(&config, cli.fixture_dir.as_deref()).await?,
        _ => Arc::new(FixtureLauncher::new()),
    };
    let coordinator = coordinator(&config, &db, launcher)?;

    match cli.command {
        Command::InitBatch { horizon_days } => {
            let locations = directory(&config)?
                .locations()
                .await
                .context("loading locations")?;
            let batch_id = coordinator
                .initialize_batch(&locations, horizon_days.unwrap_or(config.horizon_days))
                .await
                .context("initializing batch")?;
            println!("{batch_id}");
        }

        Command::ClearLessons { location } => {
            let scope = match location {
                Some(code) => LessonScope::Locations(vec![LocationCode::new(code)]),
                None => LessonScope::All,
            };
            let removed = coordinator
                .clear_lessons_for_scope(&scope)
                .await
                .context("clearing lessons")?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }

        Command::ProcessTask {
            batch_id,
            max_tasks,
            budget_secs,
            continue_,
        } => {
            let mut settings = config.driver();
            if let Some(secs) = budget_secs {
                settings.budget = Duration::from_secs(secs);
            }
            settings.max_tasks = max_tasks;

            let trigger: Arc<dyn ContinuationTrigger> = if continue_ {
                let mut args = Vec::new();
                if let Some(n) = max_tasks {
                    args.extend(["--max-tasks".to_string(), n.to_string()]);
                }
                if let Some(secs) = budget_secs {
                    args.extend(["--budget-secs".to_string(), secs.to_string()]);
                }
                if let Some(dir) = &cli.fixture_dir {
                    args.extend(["--fixture-dir".to_string(), dir.display().to_string()]);
                }
                Arc::new(
                    SelfExecContinuation::current_exe()
                        .context("locating the running executable")?
                        .with_args(args),
                )
            } else {
                Arc::new(NoopContinuation)
            };

            let driver = ContinuationDriver::new(Arc::new(coordinator), trigger, settings);
            let report = driver.run(batch_id).await;
            print_json(&report)?;
        }

        Command::BatchStatus { batch_id, json } => {
            let report = coordinator
                .status_report(batch_id)
                .await
                .with_context(|| format!("reading status of {batch_id}"))?;
            if json {
                print_json(&report)?;
            } else {
                print!("{}", report.render());
            }
        }

        Command::ResetFailed { batch_id } => {
            let reset = coordinator.reset_failed(batch_id).await?;
            print_json(&serde_json::json!({ "batch_id": batch_id, "reset": reset }))?;
        }

        Command::ResetStale { batch_id } => {
            let reset = coordinator
                .reset_stale(batch_id, config.driver().stale_after)
                .await?;
            print_json(&serde_json::json!({ "batch_id": batch_id, "reset": reset }))?;
        }

        Command::Lessons {
            location,
            date,
            stats,
        } => {
            let store = coordinator.lesson_store();
            if stats {
                print_json(&store.stats().await?)?;
            } else {
                let lessons = match (location, date) {
                    (Some(code), Some(date)) => store.query(&LocationCode::new(code), date).await?,
                    (Some(code), None) => {
                        let code = LocationCode::new(code);
                        store
                            .query_all()
                            .await?
                            .into_iter()
                            .filter(|l| l.location_code == code)
                            .collect()
                    }
                    _ => store.query_all().await?,
                };
                print_json(&lessons)?;
            }
        }

        Command::PurgeExpired => {
            let purged = coordinator.purge_expired().await?;
            print_json(&serde_json::json!({ "purged": purged }))?;
        }
    }

    Ok(())
}
