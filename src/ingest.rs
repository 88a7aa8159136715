//! Raw message ingestion.
//!
//! Turns a fetched RFC 2822 message into the parsed representation that gets
//! committed: envelope headers, a sanitized HTML body, a snippet and the MIME
//! part table. Pure parsing, no network and no database access; failures are
//! reported to the caller which quarantines the raw bytes and moves on.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};

use crate::blob::data_sha256;
use crate::html;

/// Header carrying the client-assigned id of locally composed mail,
/// used to reconcile the server copy with the already stored message.
pub const LOCAL_ID_HEADER: &str = "X-Mailmirror-Id";

/// A parsed mailbox from an address header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub addr: String,
}

/// Provider-side identifiers of a fetched message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderIds {
    /// X-GM-MSGID, stable across folders.
    pub g_msgid: Option<u64>,
    /// X-GM-THRID.
    pub g_thrid: Option<u64>,
}

/// One MIME part of an ingested message.
#[derive(Debug, Clone)]
pub struct IngestedBlock {
    /// Position in the MIME tree walk, stable for a given raw message.
    pub walk_index: u32,
    pub content_type: String,
    pub filename: Option<String>,
    pub content_disposition: Option<String>,
    pub content_id: Option<String>,
    pub size: usize,
    pub data_sha256: String,
    /// Decoded part payload, stored in the blob store by the committer.
    pub data: Vec<u8>,
}

/// The fully parsed form of one raw message.
#[derive(Debug, Clone)]
pub struct IngestedMessage {
    pub subject: Option<String>,
    pub from_addr: Vec<Address>,
    pub sender_addr: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to_addr: Vec<Address>,
    pub cc_addr: Vec<Address>,
    pub bcc_addr: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id_header: Option<String>,
    /// Value of [`LOCAL_ID_HEADER`], if the message was composed locally.
    pub local_id: Option<String>,
    pub received_date: DateTime<Utc>,
    pub size: usize,
    /// SHA-256 of the raw message, also the blob key of the full body.
    pub data_sha256: String,
    pub sanitized_body: String,
    pub snippet: String,
    /// True if some part could not be decoded and was stored lossily.
    pub decode_error: bool,
    pub g_msgid: Option<u64>,
    pub g_thrid: Option<u64>,
    pub labels: Vec<String>,
    pub is_draft: bool,
    pub is_sent: bool,
    pub blocks: Vec<IngestedBlock>,
}

/// Parses one raw message fetched with the given INTERNALDATE, provider ids
/// and Gmail labels.
pub fn ingest(
    raw: &[u8],
    received_date: DateTime<Utc>,
    ids: ProviderIds,
    labels: &[String],
) -> Result<IngestedMessage> {
    let mail = mailparse::parse_mail(raw).context("failed to parse message")?;

    let mut decode_error = false;
    let mut html_parts: Vec<String> = Vec::new();
    let mut text_parts: Vec<String> = Vec::new();
    let mut blocks = vec![headers_block(&mail)?];

    // The headers block owns walk index 0; the MIME parts start at 1. A
    // multipart root is not walked itself, only its subtree.
    let mut walk_index = 1u32;
    if mail.ctype.mimetype.to_ascii_lowercase().starts_with("multipart/") {
        for sub in &mail.subparts {
            collect_parts(
                sub,
                &mut walk_index,
                &mut blocks,
                &mut html_parts,
                &mut text_parts,
                &mut decode_error,
            );
        }
    } else {
        collect_parts(
            &mail,
            &mut walk_index,
            &mut blocks,
            &mut html_parts,
            &mut text_parts,
            &mut decode_error,
        );
    }

    let sanitized_body = if !html_parts.is_empty() {
        html::strip_gmail_quote(&html_parts.join("<br>"))
    } else {
        html::plaintext_to_html(&text_parts.join("\n"))
    };
    let snippet = html::make_snippet(&sanitized_body);

    let headers = &mail.headers;
    let is_draft = labels.iter().any(|l| l == "\\Draft");
    let is_sent = labels.iter().any(|l| l == "\\Sent");

    Ok(IngestedMessage {
        subject: headers.get_first_value("Subject"),
        from_addr: parse_addrs(&mail, "From"),
        sender_addr: parse_addrs(&mail, "Sender"),
        reply_to: parse_addrs(&mail, "Reply-To"),
        to_addr: parse_addrs(&mail, "To"),
        cc_addr: parse_addrs(&mail, "Cc"),
        bcc_addr: parse_addrs(&mail, "Bcc"),
        in_reply_to: headers.get_first_value("In-Reply-To"),
        message_id_header: headers
            .get_first_value("Message-ID")
            .map(|v| v.trim().to_string()),
        local_id: headers
            .get_first_value(LOCAL_ID_HEADER)
            .map(|v| v.trim().to_string()),
        received_date,
        size: raw.len(),
        data_sha256: data_sha256(raw),
        sanitized_body,
        snippet,
        decode_error,
        g_msgid: ids.g_msgid,
        g_thrid: ids.g_thrid,
        labels: labels.to_vec(),
        is_draft,
        is_sent,
        blocks,
    })
}

fn parse_addrs(mail: &ParsedMail<'_>, header: &str) -> Vec<Address> {
    let Some(value) = mail.headers.get_first_header(header) else {
        return Vec::new();
    };
    let Ok(list) = mailparse::addrparse_header(value) else {
        return Vec::new();
    };
    let mut res = Vec::new();
    for addr in list.iter() {
        match addr {
            MailAddr::Single(info) => res.push(Address {
                name: info.display_name.clone(),
                addr: info.addr.clone(),
            }),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    res.push(Address {
                        name: info.display_name.clone(),
                        addr: info.addr.clone(),
                    });
                }
            }
        }
    }
    res
}

/// Builds the synthetic part holding all message headers, JSON-serialized
/// as a list of (name, value) pairs to keep order and duplicates.
fn headers_block(mail: &ParsedMail<'_>) -> Result<IngestedBlock> {
    let pairs: Vec<(String, String)> = mail
        .headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect();
    let data = serde_json::to_vec(&pairs).context("failed to encode headers")?;
    Ok(IngestedBlock {
        walk_index: 0,
        content_type: "application/json".to_string(),
        filename: None,
        content_disposition: None,
        content_id: None,
        size: data.len(),
        data_sha256: data_sha256(&data),
        data,
    })
}

/// Normalizes mac/win newlines to `\n`.
fn normalize_newlines(data: Vec<u8>) -> Vec<u8> {
    if !data.contains(&b'\r') {
        return data;
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' {
            out.push(b'\n');
            if data.get(i + 1) == Some(&b'\n') {
                i += 1;
            }
        } else {
            out.push(data[i]);
        }
        i += 1;
    }
    out
}

fn collect_parts(
    part: &ParsedMail<'_>,
    walk_index: &mut u32,
    blocks: &mut Vec<IngestedBlock>,
    html_parts: &mut Vec<String>,
    text_parts: &mut Vec<String>,
    decode_error: &mut bool,
) {
    let index = *walk_index;
    *walk_index += 1;

    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    if mimetype.starts_with("multipart/") {
        for sub in &part.subparts {
            collect_parts(sub, walk_index, blocks, html_parts, text_parts, decode_error);
        }
        return;
    }

    // Decode the transfer encoding; charset problems fall back to the raw
    // bytes and flag the message. Newlines are normalized before hashing so
    // the same content hashes the same regardless of wire line endings.
    let data = match part.get_body_raw() {
        Ok(data) => data,
        Err(_) => {
            *decode_error = true;
            part.raw_bytes.to_vec()
        }
    };
    let data = normalize_newlines(data);

    if mimetype == "text/html" || mimetype == "text/plain" {
        let text = match part.get_body() {
            Ok(text) => text,
            Err(_) => {
                *decode_error = true;
                String::from_utf8_lossy(&data).into_owned()
            }
        };
        // IMAP servers normalize to CRLF; strip the CRs and the trailing
        // newline that belongs to the MIME boundary.
        let text = text.replace('\r', "").trim_end_matches('\n').to_string();
        if mimetype == "text/html" {
            html_parts.push(text);
        } else {
            text_parts.push(text);
        }
    }

    let disposition = part.get_content_disposition();
    let disposition_str = match disposition.disposition {
        mailparse::DispositionType::Attachment => Some("attachment".to_string()),
        mailparse::DispositionType::Inline => Some("inline".to_string()),
        _ => None,
    };
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let content_id = part
        .headers
        .get_first_value("Content-ID")
        .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string());

    blocks.push(IngestedBlock {
        walk_index: index,
        content_type: mimetype,
        filename,
        content_disposition: disposition_str,
        content_id,
        size: data.len(),
        data_sha256: data_sha256(&data),
        data,
    });
}
