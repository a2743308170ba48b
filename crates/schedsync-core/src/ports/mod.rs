//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（SQLite, ヘッドレスブラウザ, スタジオ一覧など）への
//! インターフェースです。コンポーネントは `Arc<dyn ...>` をコンストラクタで受け取り、
//! プロセス全体のシングルトンは持ちません。

pub mod browser;
pub mod clock;
pub mod continuation;
pub mod id_generator;
pub mod lesson_store;
pub mod location_directory;
pub mod task_store;

pub use self::browser::{BrowserLauncher, PageSession};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::continuation::{ContinuationTrigger, NoopContinuation};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lesson_store::LessonStore;
pub use self::location_directory::LocationDirectory;
pub use self::task_store::{MAX_CLAIM_RACES, TaskStore};
