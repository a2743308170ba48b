//! Errors - エラー型と分類
//!
//! - task-scoped（ScrapeError）は TaskRecord の errorMessage に落とし込み、バッチは続行
//! - store-scoped（StoreError）は driver の invocation を止めて「あとで続行」にする

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::ids::{BatchId, TaskKey};
use super::state::TaskStatus;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: ストア側の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// A status change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for task {key}: {from} -> {to}")]
pub struct InvalidTransition {
    pub key: TaskKey,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    Write(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("lost the claim race on {batch_id} {attempts} times in a row")]
    ClaimConflict { batch_id: BatchId, attempts: u32 },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("task {key} not found in {batch_id}")]
    NotFound { batch_id: BatchId, key: TaskKey },

    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    /// A persisted row is missing required fields or carries an unknown value.
    #[error("record failed schema validation: {0}")]
    Schema(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Write(_) | StoreError::Read(_) => ErrorKind::Infrastructure,
            StoreError::ClaimConflict { .. } => ErrorKind::Transient,
            StoreError::InvalidTransition(_)
            | StoreError::NotFound { .. }
            | StoreError::BatchNotFound(_)
            | StoreError::Schema(_) => ErrorKind::Permanent,
        }
    }

    /// Eligible for the store retry loop.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}

/// Where in the extraction state machine an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeStage {
    Launch,
    Navigate,
    WaitForRender,
    ReadContent,
    Parse,
}

impl fmt::Display for ScrapeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrapeStage::Launch => "launch",
            ScrapeStage::Navigate => "navigate",
            ScrapeStage::WaitForRender => "wait-for-render",
            ScrapeStage::ReadContent => "read-content",
            ScrapeStage::Parse => "parse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScrapeError {
    #[error("{stage} timed out after {}ms", timeout.as_millis())]
    Timeout { stage: ScrapeStage, timeout: Duration },

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser session error: {0}")]
    Session(String),

    /// Selector set not found at all; most likely a layout change on the site.
    #[error("schedule structure not found: {0}")]
    Structure(String),
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::Timeout { .. } | ScrapeError::Navigation(_) | ScrapeError::Session(_) => {
                ErrorKind::Transient
            }
            ScrapeError::Structure(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("location directory is empty")]
    NoLocations,

    #[error("horizon must be at least one day")]
    InvalidHorizon,

    #[error("location directory failed: {0}")]
    Directory(String),
}
