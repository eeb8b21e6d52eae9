use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::sla::SlaTimer;
use crate::types::{Priority, SlaPolicy};

const TIMER_COLUMNS: &str = "id, ticket_id, policy_id, first_response_due_at, first_responded_at, resolution_due_at, resolved_at, paused_at, total_paused_seconds, first_response_breached, resolution_breached, version";

pub async fn active_policy_for_priority(
    conn: &mut SqliteConnection,
    priority: Priority,
) -> Result<Option<SlaPolicy>> {
    // Several active policies for one priority: the most recently edited wins.
    let row = sqlx::query(
        r#"
        SELECT id, name, priority, first_response_hours, resolution_hours, active
        FROM sla_policies
        WHERE priority = ?1 AND active = 1
        ORDER BY updated_at DESC, id DESC
        LIMIT 1;
        "#,
    )
    .bind(priority.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("loading active sla policy")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let raw_priority: String = row.get(2);
    Ok(Some(SlaPolicy {
        id: row.get(0),
        name: row.get(1),
        priority: raw_priority.parse().map_err(|e: String| anyhow!(e))?,
        first_response_hours: row.get(3),
        resolution_hours: row.get(4),
        active: row.get(5),
    }))
}

pub async fn insert(conn: &mut SqliteConnection, timer: &SlaTimer) -> Result<SlaTimer> {
    let res = sqlx::query(
        r#"
        INSERT INTO sla_timers (
            ticket_id, policy_id, first_response_due_at, first_responded_at, resolution_due_at,
            resolved_at, paused_at, total_paused_seconds, first_response_breached, resolution_breached, version
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0);
        "#,
    )
    .bind(timer.ticket_id)
    .bind(timer.policy_id)
    .bind(timer.first_response_due_at)
    .bind(timer.first_responded_at)
    .bind(timer.resolution_due_at)
    .bind(timer.resolved_at)
    .bind(timer.paused_at)
    .bind(timer.total_paused_seconds)
    .bind(timer.first_response_breached)
    .bind(timer.resolution_breached)
    .execute(&mut *conn)
    .await
    .context("inserting sla timer")?;

    Ok(SlaTimer {
        id: res.last_insert_rowid(),
        version: 0,
        ..timer.clone()
    })
}

pub async fn get_for_ticket(
    conn: &mut SqliteConnection,
    ticket_id: i64,
) -> Result<Option<SlaTimer>> {
    let row = sqlx::query(&format!(
        "SELECT {TIMER_COLUMNS} FROM sla_timers WHERE ticket_id = ?1"
    ))
    .bind(ticket_id)
    .fetch_optional(&mut *conn)
    .await
    .context("loading sla timer for ticket")?;
    Ok(row.as_ref().map(timer_from_row))
}

pub async fn get(conn: &mut SqliteConnection, timer_id: i64) -> Result<Option<SlaTimer>> {
    let row = sqlx::query(&format!("SELECT {TIMER_COLUMNS} FROM sla_timers WHERE id = ?1"))
        .bind(timer_id)
        .fetch_optional(&mut *conn)
        .await
        .context("loading sla timer")?;
    Ok(row.as_ref().map(timer_from_row))
}

/// Timers whose resolution milestone is still outstanding.
pub async fn list_unresolved(conn: &mut SqliteConnection) -> Result<Vec<SlaTimer>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {TIMER_COLUMNS} FROM sla_timers
        WHERE resolved_at IS NULL
          AND (first_response_breached = 0 OR resolution_breached = 0)
        ORDER BY id ASC
        "#
    ))
    .fetch_all(&mut *conn)
    .await
    .context("listing unresolved sla timers")?;
    Ok(rows.iter().map(timer_from_row).collect())
}

/// Writes the whole timer if nobody else wrote it since it was read.
/// Returns false on a version mismatch. Breach flags are OR-ed so a stale
/// writer can never clear a latched flag.
pub async fn update_versioned(conn: &mut SqliteConnection, timer: &SlaTimer) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE sla_timers SET
            first_responded_at = ?1,
            resolved_at = ?2,
            paused_at = ?3,
            total_paused_seconds = ?4,
            first_response_breached = MAX(first_response_breached, ?5),
            resolution_breached = MAX(resolution_breached, ?6),
            version = version + 1
        WHERE id = ?7 AND version = ?8;
        "#,
    )
    .bind(timer.first_responded_at)
    .bind(timer.resolved_at)
    .bind(timer.paused_at)
    .bind(timer.total_paused_seconds)
    .bind(timer.first_response_breached)
    .bind(timer.resolution_breached)
    .bind(timer.id)
    .bind(timer.version)
    .execute(&mut *conn)
    .await
    .context("updating sla timer")?;
    Ok(res.rows_affected() == 1)
}

fn timer_from_row(row: &SqliteRow) -> SlaTimer {
    SlaTimer {
        id: row.get(0),
        ticket_id: row.get(1),
        policy_id: row.get(2),
        first_response_due_at: row.get(3),
        first_responded_at: row.get(4),
        resolution_due_at: row.get(5),
        resolved_at: row.get(6),
        paused_at: row.get(7),
        total_paused_seconds: row.get(8),
        first_response_breached: row.get(9),
        resolution_breached: row.get(10),
        version: row.get(11),
    }
}
