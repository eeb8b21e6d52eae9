//! IMAP adapter (LOGIN over implicit TLS) using async-imap with tokio-rustls.
//!
//! Cursor format: `<uidvalidity>:<last_uid>`.
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::StreamExt;
use rustls_native_certs::load_native_certs;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use super::{settings, sort_chronologically, FetchBatch, MailSource};
use crate::errors::{AppError, AppResult};
use crate::oauth::stored_secret;
use crate::sanitize::normalize;
use crate::types::{now_ts, Cursor, Mailbox, MailboxKind, NormalizedMessage};

type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

const PASSWORD_SERVICE: &str = "deskpoll-imap";

#[derive(Debug, Deserialize)]
struct ImapSettings {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: Option<String>,
    #[serde(default = "default_folder")]
    folder: String,
    /// Name of an environment variable holding the password. Falls back to
    /// the OS keyring entry for the mailbox address.
    password_env: Option<String>,
}

fn default_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Default)]
pub struct ImapSource;

#[async_trait]
impl MailSource for ImapSource {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Imap
    }

    async fn fetch_since(
        &self,
        mailbox: &Mailbox,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> AppResult<FetchBatch> {
        let settings: ImapSettings = settings(mailbox)?;
        let username = settings
            .username
            .clone()
            .unwrap_or_else(|| mailbox.address.clone());
        let password = resolve_password(&settings, &mailbox.address)?;

        let connect_start = Instant::now();
        let mut session = connect(&settings, &username, &password).await?;
        debug!(
            mailbox = mailbox.id,
            elapsed_ms = ?connect_start.elapsed().as_millis(),
            "IMAP session established"
        );

        let result = fetch_new(&mut session, mailbox, &settings.folder, cursor, limit).await;
        if let Err(e) = session.logout().await {
            debug!(mailbox = mailbox.id, error = %e, "IMAP logout failed");
        }
        result
    }
}

fn resolve_password(settings: &ImapSettings, address: &str) -> AppResult<String> {
    if let Some(var) = &settings.password_env {
        return std::env::var(var).map_err(|_| {
            AppError::SourceConfigInvalid(format!("password variable {var} is not set"))
        });
    }
    stored_secret(PASSWORD_SERVICE, address)?.ok_or_else(|| {
        AppError::SourceConfigInvalid(format!("no stored IMAP password for {address}"))
    })
}

async fn connect(settings: &ImapSettings, username: &str, password: &str) -> AppResult<ImapSession> {
    let tls_stream = open_tls(&settings.host, settings.port)
        .await
        .map_err(|e| AppError::SourceUnavailable(format!("{e:#}")))?;

    let mut client = Client::new(tls_stream.compat());

    let _greeting = client
        .read_response()
        .await
        .map_err(|e| AppError::SourceUnavailable(format!("reading IMAP greeting: {e}")))?
        .ok_or_else(|| {
            AppError::SourceUnavailable("unexpected end of stream, expected greeting".into())
        })?;

    client
        .login(username, password)
        .await
        .map_err(|(err, _client)| match err {
            async_imap::error::Error::Io(e) => {
                AppError::SourceUnavailable(format!("IMAP login I/O: {e}"))
            }
            other => AppError::SourceConfigInvalid(format!("IMAP login rejected: {other}")),
        })
}

/// Only a server refusal names a bad folder; transport failures are retried.
fn select_error(folder: &str, err: async_imap::error::Error) -> AppError {
    use async_imap::error::Error;
    match err {
        Error::No(reason) | Error::Bad(reason) => {
            AppError::SourceConfigInvalid(format!("selecting folder {folder}: {reason}"))
        }
        Error::Validate(e) => {
            AppError::SourceConfigInvalid(format!("invalid folder name {folder}: {e}"))
        }
        other => AppError::SourceUnavailable(format!("selecting folder {folder}: {other}")),
    }
}

async fn open_tls(
    host: &str,
    port: u16,
) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = RootCertStore::empty();
    for cert in load_native_certs().context("failed to load native certs")? {
        root_store
            .add(&tokio_rustls::rustls::Certificate(cert.0))
            .context("failed to add cert to root store")?;
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let server_name = ServerName::try_from(host).context("invalid DNS name")?;
    connector
        .connect(server_name, tcp)
        .await
        .context("starting TLS for IMAP")
}

async fn fetch_new(
    session: &mut ImapSession,
    mailbox: &Mailbox,
    folder: &str,
    cursor: Option<&Cursor>,
    limit: usize,
) -> AppResult<FetchBatch> {
    let selected = session
        .select(folder)
        .await
        .map_err(|e| select_error(folder, e))?;
    let uidvalidity = selected.uid_validity.unwrap_or(0);

    let mut last_uid = 0;
    if let Some((stored_validity, stored_uid)) = cursor.and_then(|c| parse_cursor(c.as_str())) {
        if stored_validity == uidvalidity {
            last_uid = stored_uid;
        } else {
            warn!(
                mailbox = mailbox.id,
                old_uidvalidity = stored_validity,
                new_uidvalidity = uidvalidity,
                "UIDVALIDITY changed; rescanning folder"
            );
        }
    }

    let query = format!("UID {}:*", last_uid + 1);
    let found = session
        .uid_search(&query)
        .await
        .map_err(|e| AppError::SourceUnavailable(format!("UID SEARCH {query}: {e}")))?;

    // `n:*` always matches the highest UID, even when it is below n.
    let mut new_uids: Vec<u32> = found.into_iter().filter(|uid| *uid > last_uid).collect();
    new_uids.sort_unstable();
    new_uids.truncate(limit);

    let Some(&highest) = new_uids.last() else {
        return Ok(FetchBatch {
            messages: Vec::new(),
            cursor: Cursor::new(format_cursor(uidvalidity, last_uid)),
        });
    };

    let raw_fetches = fetch_raw(session, &new_uids).await?;
    debug!(
        mailbox = mailbox.id,
        count = raw_fetches.len(),
        "Fetched raw messages, starting parallel parse"
    );

    let mailbox_id = mailbox.id;
    let mut messages = tokio::task::spawn_blocking(move || parse_all(mailbox_id, uidvalidity, raw_fetches))
        .await
        .map_err(|e| AppError::Unexpected(format!("IMAP parse task failed: {e}")))?;
    sort_chronologically(&mut messages);

    Ok(FetchBatch {
        messages,
        cursor: Cursor::new(format_cursor(uidvalidity, highest)),
    })
}

async fn fetch_raw(
    session: &mut ImapSession,
    uids: &[u32],
) -> AppResult<Vec<(u32, Vec<u8>, Option<i64>)>> {
    let uid_seq = build_uid_sequence(uids);
    let mut stream = session
        .uid_fetch(&uid_seq, "(UID INTERNALDATE BODY.PEEK[])")
        .await
        .map_err(|e| AppError::SourceUnavailable(format!("UID FETCH: {e}")))?;

    let mut raw_fetches = Vec::with_capacity(uids.len());
    while let Some(fetch_result) = stream.next().await {
        let fetch = fetch_result
            .map_err(|e| AppError::SourceUnavailable(format!("reading FETCH response: {e}")))?;
        let Some(uid) = fetch.uid else {
            continue;
        };
        let body = fetch.body().unwrap_or(&[]).to_vec();
        let internal_date = fetch.internal_date().map(|dt| dt.timestamp());
        raw_fetches.push((uid, body, internal_date));
    }
    Ok(raw_fetches)
}

fn parse_all(
    mailbox_id: i64,
    uidvalidity: u32,
    raw_fetches: Vec<(u32, Vec<u8>, Option<i64>)>,
) -> Vec<NormalizedMessage> {
    use rayon::prelude::*;

    let fetched_at = now_ts();
    raw_fetches
        .into_par_iter()
        .filter_map(|(uid, body, internal_date)| {
            let fallback_id = format!("{uidvalidity}:{uid}");
            match normalize(&body, &fallback_id, internal_date.unwrap_or(fetched_at)) {
                Ok(mut message) => {
                    if let Some(date) = internal_date {
                        message.received_at = date;
                    }
                    if let Some(message_id) = &message.message_id {
                        message.external_id = message_id.clone();
                    }
                    Some(message)
                }
                Err(e) => {
                    warn!(mailbox = mailbox_id, uid, error = %e, "Skipping unparsable message");
                    None
                }
            }
        })
        .collect()
}

fn build_uid_sequence(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn parse_cursor(raw: &str) -> Option<(u32, u32)> {
    let (validity, uid) = raw.split_once(':')?;
    Some((validity.parse().ok()?, uid.parse().ok()?))
}

pub(crate) fn format_cursor(uidvalidity: u32, last_uid: u32) -> String {
    format!("{uidvalidity}:{last_uid}")
}
