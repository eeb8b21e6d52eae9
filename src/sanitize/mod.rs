use anyhow::{Context, Result};
use html2text::from_read;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{Attachment, NormalizedMessage};

static MESSAGE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^<>\s]+)>").expect("valid regex"));

/// Turns a raw RFC 822 message into the provider-agnostic form.
///
/// `external_id` is the provider's stable id for the message;
/// `fallback_received_at` is used when the provider reports no date and the
/// `Date` header is missing or unparsable.
pub fn normalize(
    raw: &[u8],
    external_id: &str,
    fallback_received_at: i64,
) -> Result<NormalizedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .with_context(|| format!("parsing MIME for message {external_id}"))?;

    let (from_address, from_name) = parse_from(&parsed)
        .filter(|(addr, _)| !addr.is_empty())
        .with_context(|| format!("message {external_id} has no From address"))?;
    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "(No Subject)".to_string());

    let received_at = parsed
        .headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .unwrap_or(fallback_received_at);

    let body_html = find_part(&parsed, "text/html").map(|html| html.trim().to_string());
    let body_text = match find_part(&parsed, "text/plain") {
        Some(text) => text,
        None => match &body_html {
            Some(html) => html_to_text(html.as_bytes()),
            None => String::from_utf8_lossy(raw).to_string(),
        },
    };

    let mut attachments = Vec::new();
    collect_attachments(&parsed, &mut attachments);

    Ok(NormalizedMessage {
        external_id: external_id.to_string(),
        message_id: parsed
            .headers
            .get_first_value("Message-ID")
            .and_then(|v| message_ids(&v).into_iter().next()),
        from_address,
        from_name,
        subject,
        body_text: body_text.trim().to_string(),
        body_html,
        received_at,
        attachments,
        in_reply_to: parsed
            .headers
            .get_first_value("In-Reply-To")
            .and_then(|v| message_ids(&v).into_iter().next()),
        references: parsed
            .headers
            .get_first_value("References")
            .map(|v| message_ids(&v))
            .unwrap_or_default(),
    })
}

/// Message ids without angle brackets, in header order. Bare ids without
/// brackets are accepted when the header holds nothing else.
pub fn message_ids(header: &str) -> Vec<String> {
    let ids: Vec<String> = MESSAGE_ID_RE
        .captures_iter(header)
        .map(|c| c[1].to_string())
        .collect();
    if !ids.is_empty() {
        return ids;
    }
    let bare = header.trim();
    if !bare.is_empty() && !bare.contains(char::is_whitespace) {
        return vec![bare.to_string()];
    }
    Vec::new()
}

fn parse_from(parsed: &ParsedMail) -> Option<(String, Option<String>)> {
    let header = parsed.headers.get_all_headers("From").into_iter().next()?;
    let addrs = mailparse::addrparse_header(header).ok()?;
    match addrs.iter().next()? {
        mailparse::MailAddr::Single(info) => {
            Some((info.addr.to_ascii_lowercase(), info.display_name.clone()))
        }
        mailparse::MailAddr::Group(group) => group
            .addrs
            .first()
            .map(|info| (info.addr.to_ascii_lowercase(), info.display_name.clone())),
    }
}

fn find_part(parsed: &ParsedMail, mimetype: &str) -> Option<String> {
    if parsed.subparts.is_empty() {
        if parsed.ctype.mimetype.eq_ignore_ascii_case(mimetype)
            && parsed.get_content_disposition().disposition != DispositionType::Attachment
        {
            return parsed.get_body().ok();
        }
        return None;
    }

    parsed.subparts.iter().find_map(|part| find_part(part, mimetype))
}

fn collect_attachments(parsed: &ParsedMail, out: &mut Vec<Attachment>) {
    for part in &parsed.subparts {
        if !part.subparts.is_empty() {
            collect_attachments(part, out);
            continue;
        }
        let disposition = part.get_content_disposition();
        if disposition.disposition != DispositionType::Attachment {
            continue;
        }
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| "attachment".to_string());
        out.push(Attachment {
            filename,
            content_type: part.ctype.mimetype.clone(),
            content: part.get_body_raw().unwrap_or_default(),
        });
    }
}

fn html_to_text(html: &[u8]) -> String {
    from_read(html, 80).unwrap_or_default()
}
