use anyhow::Result;
use sqlx::SqliteConnection;

use crate::errors::AppError;
use crate::storage::timers;
use crate::types::{Priority, SlaPolicy};

/// Selects the active policy for a priority. A missing policy surfaces as
/// `AppError::NoPolicyForPriority` inside the returned error.
pub async fn resolve(conn: &mut SqliteConnection, priority: Priority) -> Result<SlaPolicy> {
    timers::active_policy_for_priority(conn, priority)
        .await?
        .ok_or_else(|| AppError::NoPolicyForPriority(priority).into())
}
