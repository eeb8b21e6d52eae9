//! Mail source adapters: one capability, one implementation per mailbox kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult};
use crate::types::{Cursor, Mailbox, MailboxKind, NormalizedMessage};

pub mod gmail;
pub mod imap;
pub mod microsoft;

/// Messages newer than the input cursor, oldest first, plus the cursor that
/// covers exactly those messages.
#[derive(Clone, Debug)]
pub struct FetchBatch {
    pub messages: Vec<NormalizedMessage>,
    pub cursor: Cursor,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    fn kind(&self) -> MailboxKind;

    /// Fails with `AppError::SourceUnavailable` for transient problems and
    /// `AppError::SourceConfigInvalid` for permanent ones.
    async fn fetch_since(
        &self,
        mailbox: &Mailbox,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> AppResult<FetchBatch>;
}

/// Dispatches a mailbox to the adapter for its kind.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<MailboxKind, Arc<dyn MailSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn MailSource>) {
        self.sources.insert(source.kind(), source);
    }

    pub fn with(mut self, source: Arc<dyn MailSource>) -> Self {
        self.register(source);
        self
    }

    pub fn for_mailbox(&self, mailbox: &Mailbox) -> AppResult<Arc<dyn MailSource>> {
        self.sources.get(&mailbox.kind).cloned().ok_or_else(|| {
            AppError::SourceConfigInvalid(format!("no adapter for mailbox kind {}", mailbox.kind))
        })
    }
}

/// Orders a batch chronologically; ties keep provider order.
pub(crate) fn sort_chronologically(messages: &mut [NormalizedMessage]) {
    messages.sort_by_key(|m| m.received_at);
}

/// Reads the adapter-specific settings object of a mailbox.
pub(crate) fn settings<T: serde::de::DeserializeOwned>(mailbox: &Mailbox) -> AppResult<T> {
    serde_json::from_value(mailbox.settings.clone()).map_err(|e| {
        AppError::SourceConfigInvalid(format!(
            "mailbox {} has invalid {} settings: {e}",
            mailbox.id, mailbox.kind
        ))
    })
}
