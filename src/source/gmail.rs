//! Gmail REST adapter. The cursor is a Gmail `historyId`.
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{settings, sort_chronologically, FetchBatch, MailSource};
use crate::errors::{AppError, AppResult};
use crate::oauth::TokenCache;
use crate::sanitize::normalize;
use crate::types::{now_ts, Cursor, Mailbox, MailboxKind, NormalizedMessage};

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[derive(Debug, Deserialize)]
struct GmailSettings {
    #[serde(default = "default_label")]
    label: String,
    /// How far back the first poll of a new mailbox reaches.
    #[serde(default = "default_backfill_days")]
    backfill_days: u32,
}

fn default_label() -> String {
    "INBOX".to_string()
}

fn default_backfill_days() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    id: String,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    internal_date: Option<String>,
    raw: Option<String>,
}

pub struct GmailSource {
    client: reqwest::Client,
    tokens: Arc<TokenCache>,
}

impl GmailSource {
    pub fn new(tokens: Arc<TokenCache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        mailbox: &Mailbox,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> AppResult<Option<T>> {
        let res = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::SourceUnavailable(format!("Gmail request failed: {e}")))?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.tokens
                .invalidate(&format!("google:{}", mailbox.address))
                .await;
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        res.json::<T>()
            .await
            .map(Some)
            .map_err(|e| AppError::SourceUnavailable(format!("decoding Gmail response: {e}")))
    }

    /// Message ids added since `start`, oldest first, plus the history id
    /// that covers them. `None` when Gmail no longer has that history.
    async fn history_since(
        &self,
        mailbox: &Mailbox,
        token: &str,
        label: &str,
        start: &str,
        limit: usize,
    ) -> AppResult<Option<(Vec<String>, String)>> {
        let url = format!("{API_BASE}/history");
        let mut ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut covered = start.to_string();

        loop {
            let mut query = vec![
                ("startHistoryId", start.to_string()),
                ("historyTypes", "messageAdded".to_string()),
                ("labelId", label.to_string()),
            ];
            if let Some(page) = &page_token {
                query.push(("pageToken", page.clone()));
            }

            let Some(page) = self
                .get_json::<HistoryPage>(mailbox, token, &url, &query)
                .await?
            else {
                return Ok(None);
            };

            for record in page.history {
                if !ids.is_empty() && ids.len() + record.messages_added.len() > limit {
                    return Ok(Some((ids, covered)));
                }
                for added in record.messages_added {
                    if !ids.contains(&added.message.id) {
                        ids.push(added.message.id);
                    }
                }
                covered = record.id;
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    if let Some(latest) = page.history_id {
                        covered = latest;
                    }
                    return Ok(Some((ids, covered)));
                }
            }
        }
    }

    /// First poll (or expired history): recent messages of the label and
    /// the current history id as the baseline.
    async fn initial_listing(
        &self,
        mailbox: &Mailbox,
        token: &str,
        settings: &GmailSettings,
        limit: usize,
    ) -> AppResult<(Vec<String>, String)> {
        let profile: Profile = self
            .get_json(mailbox, token, &format!("{API_BASE}/profile"), &[])
            .await?
            .ok_or_else(|| AppError::SourceConfigInvalid("Gmail profile not found".into()))?;

        let query = vec![
            ("labelIds", settings.label.clone()),
            ("maxResults", limit.to_string()),
            ("q", format!("newer_than:{}d", settings.backfill_days.max(1))),
        ];
        let list: ListPage = self
            .get_json(mailbox, token, &format!("{API_BASE}/messages"), &query)
            .await?
            .unwrap_or(ListPage {
                messages: Vec::new(),
            });

        // Listing is newest first.
        let ids = list.messages.into_iter().rev().map(|m| m.id).collect();
        Ok((ids, profile.history_id))
    }

    async fn fetch_message(
        &self,
        mailbox: &Mailbox,
        token: &str,
        id: &str,
    ) -> AppResult<Option<NormalizedMessage>> {
        let url = format!("{API_BASE}/messages/{id}");
        let Some(payload) = self
            .get_json::<RawMessage>(mailbox, token, &url, &[("format", "raw".to_string())])
            .await?
        else {
            debug!(mailbox = mailbox.id, message = %id, "Message vanished before fetch");
            return Ok(None);
        };

        let Some(raw) = payload.raw else {
            return Ok(None);
        };
        let bytes = match decode_raw(&raw) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(mailbox = mailbox.id, message = %id, error = %e, "Undecodable Gmail payload");
                return Ok(None);
            }
        };
        let received_at = payload
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .map(|ms| ms / 1000)
            .unwrap_or_else(now_ts);

        match normalize(&bytes, &payload.id, received_at) {
            Ok(mut message) => {
                message.received_at = received_at;
                Ok(Some(message))
            }
            Err(e) => {
                warn!(mailbox = mailbox.id, message = %id, error = %e, "Skipping unparsable message");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MailSource for GmailSource {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Gmail
    }

    async fn fetch_since(
        &self,
        mailbox: &Mailbox,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> AppResult<FetchBatch> {
        let settings: GmailSettings = settings(mailbox)?;
        let token = self.tokens.google_token(&mailbox.address).await?;

        let history = match cursor {
            Some(cursor) => {
                self.history_since(mailbox, &token, &settings.label, cursor.as_str(), limit)
                    .await?
            }
            None => None,
        };
        let (ids, history_id) = match history {
            Some(found) => found,
            None => {
                if cursor.is_some() {
                    info!(mailbox = mailbox.id, "Gmail history expired; relisting label");
                }
                self.initial_listing(mailbox, &token, &settings, limit).await?
            }
        };

        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(message) = self.fetch_message(mailbox, &token, id).await? {
                messages.push(message);
            }
        }
        sort_chronologically(&mut messages);

        // History ids only grow; never hand back an older cursor.
        let cursor = match cursor.and_then(|c| c.as_str().parse::<u64>().ok()) {
            Some(previous) if history_id.parse::<u64>().map(|h| h < previous).unwrap_or(false) => {
                previous.to_string()
            }
            _ => history_id,
        };

        Ok(FetchBatch {
            messages,
            cursor: Cursor::new(cursor),
        })
    }
}

/// Gmail reasons that come back as 403 but only mean "slow down".
const THROTTLE_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "quotaExceeded",
];

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ErrorReason {
    #[serde(default)]
    reason: String,
}

/// Maps a failed Gmail response to the source error taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> AppError {
    let throttled = || {
        serde_json::from_str::<ErrorBody>(body)
            .unwrap_or_default()
            .error
            .errors
            .iter()
            .any(|e| THROTTLE_REASONS.contains(&e.reason.as_str()))
    };
    match status {
        StatusCode::FORBIDDEN if throttled() => {
            AppError::SourceUnavailable(format!("Gmail throttled the request ({status})"))
        }
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => AppError::SourceConfigInvalid(
            format!("Gmail rejected request with status {status}"),
        ),
        _ => AppError::SourceUnavailable(format!("Gmail responded with status {status}")),
    }
}

fn decode_raw(raw: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=').as_bytes())
}
