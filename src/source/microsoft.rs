//! Microsoft Graph adapter. The cursor is the delta (or next) link returned
//! by the folder's message delta query.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{settings, sort_chronologically, FetchBatch, MailSource};
use crate::errors::{AppError, AppResult};
use crate::oauth::TokenCache;
use crate::sanitize::normalize;
use crate::types::{now_ts, Cursor, Mailbox, MailboxKind, NormalizedMessage};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const MAX_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct GraphSettings {
    tenant_id: String,
    client_id: String,
    /// Environment variable holding the app's client secret.
    client_secret_env: String,
    #[serde(default = "default_folder")]
    folder: String,
    #[serde(default = "default_backfill_days")]
    backfill_days: i64,
}

fn default_folder() -> String {
    "inbox".to_string()
}

fn default_backfill_days() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
struct DeltaPage {
    #[serde(default)]
    value: Vec<DeltaItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaItem {
    id: String,
    received_date_time: Option<String>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

pub struct MicrosoftSource {
    client: reqwest::Client,
    tokens: Arc<TokenCache>,
}

impl MicrosoftSource {
    pub fn new(tokens: Arc<TokenCache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens,
        }
    }

    async fn token(&self, settings: &GraphSettings) -> AppResult<String> {
        let secret = std::env::var(&settings.client_secret_env).map_err(|_| {
            AppError::SourceConfigInvalid(format!(
                "client secret variable {} is not set",
                settings.client_secret_env
            ))
        })?;
        self.tokens
            .microsoft_token(&settings.tenant_id, &settings.client_id, &secret)
            .await
    }

    async fn get(
        &self,
        settings: &GraphSettings,
        token: &str,
        url: &str,
        page_size: usize,
    ) -> AppResult<reqwest::Response> {
        let res = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("Prefer", format!("odata.maxpagesize={page_size}"))
            .send()
            .await
            .map_err(|e| AppError::SourceUnavailable(format!("Graph request failed: {e}")))?;

        if res.status() == StatusCode::UNAUTHORIZED {
            self.tokens
                .invalidate(&format!(
                    "microsoft:{}:{}",
                    settings.tenant_id, settings.client_id
                ))
                .await;
        }
        Ok(res)
    }

    /// Walks delta pages until the delta link, or stops early when another
    /// page could push the batch past `limit`. Returns `None` when the stored
    /// sync state has expired.
    async fn changes(
        &self,
        settings: &GraphSettings,
        token: &str,
        start: &str,
        limit: usize,
    ) -> AppResult<Option<(Vec<DeltaItem>, String)>> {
        let page_size = limit.clamp(1, MAX_PAGE_SIZE);
        let mut items = Vec::new();
        let mut url = start.to_string();

        loop {
            let res = self.get(settings, token, &url, page_size).await?;
            let status = res.status();
            if status == StatusCode::GONE || status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            check_status(status)?;

            let page: DeltaPage = res
                .json()
                .await
                .map_err(|e| AppError::SourceUnavailable(format!("decoding delta page: {e}")))?;
            items.extend(page.value.into_iter().filter(|item| item.removed.is_none()));

            match (page.next_link, page.delta_link) {
                // Next links resume mid-round, so they are valid cursors too.
                (Some(next), _) if items.len() + page_size > limit => return Ok(Some((items, next))),
                (Some(next), _) => url = next,
                (None, Some(delta)) => return Ok(Some((items, delta))),
                (None, None) => {
                    return Err(AppError::SourceUnavailable(
                        "delta page carried neither next nor delta link".into(),
                    ))
                }
            }
        }
    }

    async fn fetch_mime(
        &self,
        settings: &GraphSettings,
        token: &str,
        mailbox: &Mailbox,
        item: &DeltaItem,
    ) -> AppResult<Option<NormalizedMessage>> {
        let url = format!(
            "{GRAPH_BASE}/users/{}/messages/{}/$value",
            mailbox.address, item.id
        );
        let res = self.get(settings, token, &url, MAX_PAGE_SIZE).await?;
        if res.status() == StatusCode::NOT_FOUND {
            debug!(mailbox = mailbox.id, message = %item.id, "Message vanished before fetch");
            return Ok(None);
        }
        check_status(res.status())?;
        let bytes = res
            .bytes()
            .await
            .map_err(|e| AppError::SourceUnavailable(format!("reading MIME body: {e}")))?;

        let received_at = item
            .received_date_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or_else(now_ts);

        match normalize(&bytes, &item.id, received_at) {
            Ok(mut message) => {
                message.received_at = received_at;
                // Graph ids change when a message moves folders.
                if let Some(message_id) = &message.message_id {
                    message.external_id = message_id.clone();
                }
                Ok(Some(message))
            }
            Err(e) => {
                warn!(mailbox = mailbox.id, message = %item.id, error = %e, "Skipping unparsable message");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MailSource for MicrosoftSource {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Microsoft
    }

    async fn fetch_since(
        &self,
        mailbox: &Mailbox,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> AppResult<FetchBatch> {
        let settings: GraphSettings = settings(mailbox)?;
        let token = self.token(&settings).await?;

        let resumed = match cursor {
            Some(cursor) => self.changes(&settings, &token, cursor.as_str(), limit).await?,
            None => None,
        };
        let (items, next_cursor) = match resumed {
            Some(found) => found,
            None => {
                if cursor.is_some() {
                    info!(mailbox = mailbox.id, "Graph sync state expired; starting a new round");
                }
                let start = initial_delta_url(&mailbox.address, &settings, Utc::now())?;
                self.changes(&settings, &token, &start, limit)
                    .await?
                    .ok_or_else(|| {
                        AppError::SourceConfigInvalid(format!(
                            "folder {} not found for {}",
                            settings.folder, mailbox.address
                        ))
                    })?
            }
        };

        let mut messages = Vec::with_capacity(items.len());
        for item in &items {
            if let Some(message) = self.fetch_mime(&settings, &token, mailbox, item).await? {
                messages.push(message);
            }
        }
        sort_chronologically(&mut messages);

        Ok(FetchBatch {
            messages,
            cursor: Cursor::new(next_cursor),
        })
    }
}

/// Graph throttles with 429 and 503, so only explicit refusals are permanent.
fn check_status(status: StatusCode) -> AppResult<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => Err(AppError::SourceConfigInvalid(
            format!("Graph rejected request with status {status}"),
        )),
        _ => Err(AppError::SourceUnavailable(format!(
            "Graph responded with status {status}"
        ))),
    }
}

fn initial_delta_url(address: &str, settings: &GraphSettings, now: DateTime<Utc>) -> AppResult<String> {
    let since = now - Duration::days(settings.backfill_days.max(1));
    let mut url = Url::parse(&format!(
        "{GRAPH_BASE}/users/{address}/mailFolders/{}/messages/delta",
        settings.folder
    ))
    .map_err(|e| AppError::SourceConfigInvalid(format!("invalid Graph url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("$select", "id,receivedDateTime")
        .append_pair(
            "$filter",
            &format!("receivedDateTime ge {}", since.format("%Y-%m-%dT%H:%M:%SZ")),
        );
    Ok(url.to_string())
}
