use anyhow::{Context, Result};
use dirs::home_dir;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use super::{mailboxes, tickets, timers};
use crate::sla::SlaTimer;
use crate::types::{now_ts, Cursor, Mailbox, MailboxKind, Message, Priority, SlaPolicy, Ticket};

const DB_FILE_NAME: &str = "deskpoll.db";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    pub async fn new_default(data_dir: Option<&Path>) -> Result<Self> {
        let base = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating data directory {}", dir.display()))?;
                dir.to_path_buf()
            }
            None => default_data_dir()?,
        };
        Self::open(&base.join(DB_FILE_NAME)).await
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let url = format!("sqlite://{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("parsing sqlite url {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: db_path.to_path_buf(),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context("beginning transaction")
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS customers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                name TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                name TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS mailboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                address TEXT NOT NULL,
                polling_interval_secs INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                last_checked_at INTEGER,
                cursor TEXT,
                settings TEXT NOT NULL DEFAULT '{}',
                deactivated_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                customer_id INTEGER NOT NULL,
                assignee_id INTEGER,
                mailbox_id INTEGER,
                created_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL,
                FOREIGN KEY (customer_id) REFERENCES customers(id),
                FOREIGN KEY (assignee_id) REFERENCES users(id) ON DELETE SET NULL,
                FOREIGN KEY (mailbox_id) REFERENCES mailboxes(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);

            CREATE TABLE IF NOT EXISTS thread_keys (
                thread_key TEXT PRIMARY KEY,
                ticket_id INTEGER NOT NULL,
                FOREIGN KEY (ticket_id) REFERENCES tickets(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_thread_keys_ticket ON thread_keys(ticket_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL,
                sender_kind TEXT NOT NULL,
                sender_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                body_text TEXT NOT NULL,
                body_html TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (ticket_id) REFERENCES tickets(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_ticket ON messages(ticket_id, created_at);

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content BLOB NOT NULL,
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS ingested_messages (
                mailbox_id INTEGER NOT NULL,
                external_id TEXT NOT NULL,
                message_id INTEGER,
                ingested_at INTEGER NOT NULL,
                PRIMARY KEY (mailbox_id, external_id),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS sla_policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                priority TEXT NOT NULL,
                first_response_hours INTEGER NOT NULL,
                resolution_hours INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sla_policies_priority ON sla_policies(priority, active);

            CREATE TABLE IF NOT EXISTS sla_timers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL UNIQUE,
                policy_id INTEGER NOT NULL,
                first_response_due_at INTEGER NOT NULL,
                first_responded_at INTEGER,
                resolution_due_at INTEGER NOT NULL,
                resolved_at INTEGER,
                paused_at INTEGER,
                total_paused_seconds INTEGER NOT NULL DEFAULT 0,
                first_response_breached INTEGER NOT NULL DEFAULT 0,
                resolution_breached INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (ticket_id) REFERENCES tickets(id) ON DELETE CASCADE,
                FOREIGN KEY (policy_id) REFERENCES sla_policies(id)
            );
            CREATE INDEX IF NOT EXISTS idx_sla_timers_open ON sla_timers(resolved_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("running migrations")?;

        Ok(())
    }

    pub async fn list_active_mailboxes(&self) -> Result<Vec<Mailbox>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        mailboxes::list_active(&mut conn).await
    }

    pub async fn get_mailbox(&self, mailbox_id: i64) -> Result<Option<Mailbox>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        mailboxes::get(&mut conn, mailbox_id).await
    }

    pub async fn is_mailbox_active(&self, mailbox_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT active FROM mailboxes WHERE id = ?1")
            .bind(mailbox_id)
            .fetch_optional(&self.pool)
            .await
            .context("checking mailbox active flag")?;
        Ok(row.map(|r| r.get::<bool, _>(0)).unwrap_or(false))
    }

    pub async fn insert_mailbox(
        &self,
        kind: MailboxKind,
        address: &str,
        polling_interval_secs: i64,
        settings: &serde_json::Value,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        mailboxes::insert(&mut conn, kind, address, polling_interval_secs, settings).await
    }

    pub async fn update_cursor(
        &self,
        mailbox_id: i64,
        cursor: &Cursor,
        last_checked_at: i64,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        mailboxes::update_cursor(&mut conn, mailbox_id, cursor, last_checked_at).await
    }

    pub async fn deactivate_mailbox(&self, mailbox_id: i64, reason: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        mailboxes::deactivate(&mut conn, mailbox_id, reason).await
    }

    pub async fn get_active_policy_for_priority(
        &self,
        priority: Priority,
    ) -> Result<Option<SlaPolicy>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        timers::active_policy_for_priority(&mut conn, priority).await
    }

    pub async fn insert_policy(
        &self,
        name: &str,
        priority: Priority,
        first_response_hours: i64,
        resolution_hours: i64,
    ) -> Result<i64> {
        let now = now_ts();
        let res = sqlx::query(
            r#"
            INSERT INTO sla_policies (name, priority, first_response_hours, resolution_hours, active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5);
            "#,
        )
        .bind(name)
        .bind(priority.as_str())
        .bind(first_response_hours)
        .bind(resolution_hours)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("inserting sla policy")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn insert_user(&self, email: &str, name: Option<&str>) -> Result<i64> {
        let res = sqlx::query("INSERT INTO users (email, name, created_at) VALUES (?1, ?2, ?3)")
            .bind(email)
            .bind(name)
            .bind(now_ts())
            .execute(&self.pool)
            .await
            .context("inserting user")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        tickets::get(&mut conn, ticket_id).await
    }

    pub async fn find_ticket_by_thread_key(&self, thread_key: &str) -> Result<Option<Ticket>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        tickets::find_by_thread_key(&mut conn, thread_key).await
    }

    pub async fn list_tickets(&self) -> Result<Vec<Ticket>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        tickets::list(&mut conn).await
    }

    pub async fn list_messages(&self, ticket_id: i64) -> Result<Vec<Message>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        tickets::list_messages(&mut conn, ticket_id).await
    }

    pub async fn get_timer_for_ticket(&self, ticket_id: i64) -> Result<Option<SlaTimer>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        timers::get_for_ticket(&mut conn, ticket_id).await
    }
}

pub(crate) fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("DESKPOLL_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating DESKPOLL_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join("deskpoll");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/deskpoll; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("deskpoll-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}
