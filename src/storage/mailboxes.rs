use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::warn;

use crate::types::{now_ts, Cursor, Mailbox, MailboxKind};

const MAILBOX_COLUMNS: &str = "id, kind, address, polling_interval_secs, active, last_checked_at, cursor, settings, deactivated_reason";

pub async fn list_active(conn: &mut SqliteConnection) -> Result<Vec<Mailbox>> {
    let rows = sqlx::query(&format!(
        "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE active = 1 ORDER BY id ASC"
    ))
    .fetch_all(&mut *conn)
    .await
    .context("listing active mailboxes")?;

    let mut mailboxes = Vec::with_capacity(rows.len());
    for row in rows {
        match mailbox_from_row(&row) {
            Ok(mailbox) => mailboxes.push(mailbox),
            Err(e) => warn!(error = %e, "Skipping unreadable mailbox row"),
        }
    }
    Ok(mailboxes)
}

pub async fn get(conn: &mut SqliteConnection, mailbox_id: i64) -> Result<Option<Mailbox>> {
    let row = sqlx::query(&format!(
        "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?1"
    ))
    .bind(mailbox_id)
    .fetch_optional(&mut *conn)
    .await
    .context("loading mailbox")?;

    row.as_ref().map(mailbox_from_row).transpose()
}

pub async fn insert(
    conn: &mut SqliteConnection,
    kind: MailboxKind,
    address: &str,
    polling_interval_secs: i64,
    settings: &serde_json::Value,
) -> Result<i64> {
    let now = now_ts();
    let res = sqlx::query(
        r#"
        INSERT INTO mailboxes (kind, address, polling_interval_secs, active, settings, created_at, updated_at)
        VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5);
        "#,
    )
    .bind(kind.as_str())
    .bind(address)
    .bind(polling_interval_secs)
    .bind(settings.to_string())
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("inserting mailbox")?;
    Ok(res.last_insert_rowid())
}

/// Advances the cursor of an active mailbox. Only called once the whole
/// batch is committed. Returns `false` when the mailbox was deactivated.
pub async fn update_cursor(
    conn: &mut SqliteConnection,
    mailbox_id: i64,
    cursor: &Cursor,
    last_checked_at: i64,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE mailboxes
        SET cursor = ?1, last_checked_at = ?2, updated_at = ?3
        WHERE id = ?4 AND active = 1;
        "#,
    )
    .bind(cursor.as_str())
    .bind(last_checked_at)
    .bind(now_ts())
    .bind(mailbox_id)
    .execute(&mut *conn)
    .await
    .context("updating mailbox cursor")?;
    Ok(res.rows_affected() > 0)
}

pub async fn deactivate(conn: &mut SqliteConnection, mailbox_id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE mailboxes
        SET active = 0, deactivated_reason = ?1, updated_at = ?2
        WHERE id = ?3;
        "#,
    )
    .bind(reason)
    .bind(now_ts())
    .bind(mailbox_id)
    .execute(&mut *conn)
    .await
    .context("deactivating mailbox")?;
    Ok(())
}

fn mailbox_from_row(row: &SqliteRow) -> Result<Mailbox> {
    let kind: String = row.get(1);
    let kind = kind
        .parse::<MailboxKind>()
        .map_err(|e| anyhow::anyhow!(e))?;
    let settings: String = row.get(7);
    let settings = serde_json::from_str(&settings).unwrap_or(serde_json::Value::Null);
    Ok(Mailbox {
        id: row.get(0),
        kind,
        address: row.get(2),
        polling_interval_secs: row.get(3),
        active: row.get(4),
        last_checked_at: row.get(5),
        cursor: row.get::<Option<String>, _>(6).map(Cursor),
        settings,
        deactivated_reason: row.get(8),
    })
}
