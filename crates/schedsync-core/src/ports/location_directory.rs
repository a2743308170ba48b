//! LocationDirectory port - バッチで列挙するスタジオ一覧

use async_trait::async_trait;

use crate::domain::{BatchError, LocationRef};

#[async_trait]
pub trait LocationDirectory: Send + Sync {
    async fn locations(&self) -> Result<Vec<LocationRef>, BatchError>;
}
