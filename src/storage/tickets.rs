use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::types::{
    now_ts, Attachment, Message, MessageKind, NewMessage, Priority, Sender, Ticket, TicketStatus,
};

const TICKET_COLUMNS: &str =
    "t.id, t.subject, t.status, t.priority, t.customer_id, t.assignee_id, t.mailbox_id, t.created_at, t.last_activity_at";

pub struct NewTicket<'a> {
    pub subject: &'a str,
    pub priority: Priority,
    pub customer_id: i64,
    pub mailbox_id: Option<i64>,
    pub created_at: i64,
}

pub async fn find_user_by_email(conn: &mut SqliteConnection, email: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT id FROM users WHERE email = ?1")
        .bind(email)
        .fetch_optional(&mut *conn)
        .await
        .context("looking up user by email")?;
    Ok(row.map(|r| r.get(0)))
}

pub async fn get_or_create_customer(
    conn: &mut SqliteConnection,
    email: &str,
    name: Option<&str>,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO customers (email, name, created_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(email) DO NOTHING;
        "#,
    )
    .bind(email)
    .bind(name)
    .bind(now_ts())
    .execute(&mut *conn)
    .await
    .context("inserting customer")?;

    let row = sqlx::query("SELECT id FROM customers WHERE email = ?1")
        .bind(email)
        .fetch_one(&mut *conn)
        .await
        .context("loading customer id")?;
    Ok(row.get(0))
}

pub async fn insert(conn: &mut SqliteConnection, ticket: NewTicket<'_>) -> Result<Ticket> {
    let res = sqlx::query(
        r#"
        INSERT INTO tickets (subject, status, priority, customer_id, mailbox_id, created_at, last_activity_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6);
        "#,
    )
    .bind(ticket.subject)
    .bind(TicketStatus::Open.as_str())
    .bind(ticket.priority.as_str())
    .bind(ticket.customer_id)
    .bind(ticket.mailbox_id)
    .bind(ticket.created_at)
    .execute(&mut *conn)
    .await
    .context("inserting ticket")?;

    Ok(Ticket {
        id: res.last_insert_rowid(),
        subject: ticket.subject.to_string(),
        status: TicketStatus::Open,
        priority: ticket.priority,
        customer_id: ticket.customer_id,
        assignee_id: None,
        mailbox_id: ticket.mailbox_id,
        created_at: ticket.created_at,
        last_activity_at: ticket.created_at,
    })
}

pub async fn get(conn: &mut SqliteConnection, ticket_id: i64) -> Result<Option<Ticket>> {
    let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets t WHERE t.id = ?1"))
        .bind(ticket_id)
        .fetch_optional(&mut *conn)
        .await
        .context("loading ticket")?;
    row.as_ref().map(ticket_from_row).transpose()
}

/// Loads a ticket after taking the write lock, so a transaction that goes on
/// to write never has to upgrade a stale read snapshot.
pub async fn get_for_update(conn: &mut SqliteConnection, ticket_id: i64) -> Result<Option<Ticket>> {
    let res = sqlx::query("UPDATE tickets SET status = status WHERE id = ?1")
        .bind(ticket_id)
        .execute(&mut *conn)
        .await
        .context("locking ticket")?;
    if res.rows_affected() == 0 {
        return Ok(None);
    }
    get(conn, ticket_id).await
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Ticket>> {
    let rows = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets t ORDER BY t.id ASC"))
        .fetch_all(&mut *conn)
        .await
        .context("listing tickets")?;
    rows.iter().map(ticket_from_row).collect()
}

pub async fn find_by_thread_key(
    conn: &mut SqliteConnection,
    thread_key: &str,
) -> Result<Option<Ticket>> {
    let row = sqlx::query(&format!(
        "SELECT {TICKET_COLUMNS} FROM tickets t JOIN thread_keys k ON k.ticket_id = t.id WHERE k.thread_key = ?1"
    ))
    .bind(thread_key)
    .fetch_optional(&mut *conn)
    .await
    .context("finding ticket by thread key")?;
    row.as_ref().map(ticket_from_row).transpose()
}

pub async fn register_thread_key(
    conn: &mut SqliteConnection,
    thread_key: &str,
    ticket_id: i64,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO thread_keys (thread_key, ticket_id) VALUES (?1, ?2)")
        .bind(thread_key)
        .bind(ticket_id)
        .execute(&mut *conn)
        .await
        .context("registering thread key")?;
    Ok(())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    ticket_id: i64,
    status: TicketStatus,
) -> Result<()> {
    sqlx::query("UPDATE tickets SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(ticket_id)
        .execute(&mut *conn)
        .await
        .context("updating ticket status")?;
    Ok(())
}

/// Moves `last_activity_at` forward; never backwards.
pub async fn touch_activity(conn: &mut SqliteConnection, ticket_id: i64, at: i64) -> Result<()> {
    sqlx::query("UPDATE tickets SET last_activity_at = MAX(last_activity_at, ?1) WHERE id = ?2")
        .bind(at)
        .bind(ticket_id)
        .execute(&mut *conn)
        .await
        .context("touching ticket activity")?;
    Ok(())
}

pub async fn insert_message(
    conn: &mut SqliteConnection,
    ticket_id: i64,
    message: &NewMessage,
) -> Result<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO messages (ticket_id, sender_kind, sender_id, kind, body_text, body_html, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);
        "#,
    )
    .bind(ticket_id)
    .bind(message.sender.kind())
    .bind(message.sender.id())
    .bind(message.kind.as_str())
    .bind(&message.body_text)
    .bind(&message.body_html)
    .bind(message.created_at)
    .execute(&mut *conn)
    .await
    .context("inserting message")?;
    let message_id = res.last_insert_rowid();

    for attachment in &message.attachments {
        sqlx::query(
            r#"
            INSERT INTO attachments (message_id, filename, content_type, size_bytes, content)
            VALUES (?1, ?2, ?3, ?4, ?5);
            "#,
        )
        .bind(message_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(attachment.size_bytes() as i64)
        .bind(&attachment.content)
        .execute(&mut *conn)
        .await
        .context("inserting attachment")?;
    }

    Ok(message_id)
}

pub async fn list_messages(conn: &mut SqliteConnection, ticket_id: i64) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        r#"
        SELECT id, ticket_id, sender_kind, sender_id, kind, body_text, body_html, created_at
        FROM messages
        WHERE ticket_id = ?1
        ORDER BY created_at ASC, id ASC;
        "#,
    )
    .bind(ticket_id)
    .fetch_all(&mut *conn)
    .await
    .context("listing messages")?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get(0);
        let sender_kind: String = row.get(2);
        let sender = Sender::from_parts(&sender_kind, row.get(3))
            .ok_or_else(|| anyhow!("message {id} has unknown sender kind {sender_kind}"))?;
        let kind: String = row.get(4);

        let attachment_rows = sqlx::query(
            "SELECT filename, content_type, content FROM attachments WHERE message_id = ?1 ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .context("listing attachments")?;

        messages.push(Message {
            id,
            ticket_id: row.get(1),
            sender,
            kind: MessageKind::from_str_lossy(&kind),
            body_text: row.get(5),
            body_html: row.get(6),
            created_at: row.get(7),
            attachments: attachment_rows
                .into_iter()
                .map(|a| Attachment {
                    filename: a.get(0),
                    content_type: a.get(1),
                    content: a.get(2),
                })
                .collect(),
        });
    }
    Ok(messages)
}

/// Claims the dedup key for an inbound message. Returns false when the
/// `(mailbox_id, external_id)` pair was already ingested.
pub async fn claim_external_id(
    conn: &mut SqliteConnection,
    mailbox_id: i64,
    external_id: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO ingested_messages (mailbox_id, external_id, ingested_at) VALUES (?1, ?2, ?3)",
    )
    .bind(mailbox_id)
    .bind(external_id)
    .bind(now_ts())
    .execute(&mut *conn)
    .await
    .context("claiming dedup key")?;
    Ok(res.rows_affected() == 1)
}

pub async fn link_external_id(
    conn: &mut SqliteConnection,
    mailbox_id: i64,
    external_id: &str,
    message_id: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE ingested_messages SET message_id = ?1 WHERE mailbox_id = ?2 AND external_id = ?3",
    )
    .bind(message_id)
    .bind(mailbox_id)
    .bind(external_id)
    .execute(&mut *conn)
    .await
    .context("linking dedup key")?;
    Ok(())
}
