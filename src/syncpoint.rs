//! Syncpoint codec
//!
//! A syncpoint is a regular self-addressed mail message appended to the
//! remote folder after a remote push. Its body is a JSON object
//! `{"seen": [...], "trash": [...]}` and its `X-Norless` header carries
//! the identity of the replica that authored it, letting other replicas
//! replay the change set and letting the author skip its own messages.

use crate::error::{Error, Result};
use chrono::Utc;
use mail_parser::{Address, HeaderValue, Message, MessageParser};
use serde::{Deserialize, Serialize};

/// Header carrying the author's replica identity.
pub const REPLICA_HEADER: &str = "X-Norless";
/// Header embedding the local msgkey into uploaded messages.
pub const MSGKEY_HEADER: &str = "X-Norless-Id";
/// Self-address used for syncpoint messages.
pub const ADDRESS: &str = "norless@fake.org";
/// Subject line of syncpoint messages.
pub const SUBJECT: &str = "norless syncpoint";

/// The change set recorded by one remote push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changes {
    #[serde(default)]
    pub seen: Vec<i64>,
    #[serde(default)]
    pub trash: Vec<i64>,
}

impl Changes {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty() && self.trash.is_empty()
    }
}

/// A decoded syncpoint. `changes` is `None` when the body failed to
/// parse as JSON; callers log that and treat the message as ordinary
/// mail.
#[derive(Debug, Clone)]
pub struct Syncpoint {
    pub replica_id: String,
    pub changes: Option<Changes>,
}

/// Serialize a change set as a complete RFC 5322 message.
pub fn encode(replica_id: &str, changes: &Changes) -> Result<Vec<u8>> {
    let payload =
        serde_json::to_string(changes).map_err(|e| Error::Parse(e.to_string()))?;
    let date = Utc::now().to_rfc2822();
    let message = format!(
        "Date: {date}\r\n\
         From: {ADDRESS}\r\n\
         To: {ADDRESS}\r\n\
         Subject: {SUBJECT}\r\n\
         {REPLICA_HEADER}: {replica_id}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: application/json\r\n\
         \r\n\
         {payload}"
    );
    Ok(message.into_bytes())
}

/// Decode a fetched message as a syncpoint.
///
/// Returns `None` when the replica header is absent (the message is
/// ordinary mail).
#[must_use]
pub fn decode(raw: &[u8]) -> Option<Syncpoint> {
    let message = MessageParser::default().parse(raw)?;
    let replica_id = header_text(&message, REPLICA_HEADER)?;
    let changes = body(raw).and_then(|b| serde_json::from_slice(b).ok());
    Some(Syncpoint {
        replica_id,
        changes,
    })
}

/// Extract the msgkey embedded into an uploaded message, preferring
/// `X-Norless-Id` and falling back to `Message-ID`.
#[must_use]
pub fn embedded_msgkey(raw_headers: &[u8]) -> Option<String> {
    let message = MessageParser::default().parse(raw_headers)?;
    header_text(&message, MSGKEY_HEADER)
        .or_else(|| header_text(&message, "Message-ID"))
}

/// Bare address of the `From` header, used to match locally added
/// messages to the account that should upload them.
#[must_use]
pub fn from_addr(raw: &[u8]) -> Option<String> {
    let message = MessageParser::default().parse(raw)?;
    match message.header("From")? {
        HeaderValue::Address(Address::List(addrs)) => addrs
            .first()
            .and_then(|a| a.address.as_ref())
            .map(ToString::to_string),
        HeaderValue::Address(Address::Group(groups)) => groups
            .first()
            .and_then(|g| g.addresses.first())
            .and_then(|a| a.address.as_ref())
            .map(ToString::to_string),
        HeaderValue::Text(text) => Some(text.trim().to_string()),
        _ => None,
    }
}

/// Replace (or insert) a header in a raw message, preserving the rest
/// of the header block and the body untouched.
#[must_use]
pub fn replace_header(raw: &[u8], name: &str, value: &str) -> Vec<u8> {
    let (headers, body) = split_message(raw);
    let eol: &[u8] = if headers.windows(2).any(|w| w == b"\r\n") {
        b"\r\n"
    } else {
        b"\n"
    };

    let mut out = Vec::with_capacity(raw.len() + name.len() + value.len() + 4);
    let mut skipping_continuation = false;
    for line in split_lines(headers) {
        if line_names_header(line, name) {
            skipping_continuation = true;
            continue;
        }
        if skipping_continuation && line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
            continue;
        }
        skipping_continuation = false;
        out.extend_from_slice(line);
        out.extend_from_slice(eol);
    }
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(eol);
    out.extend_from_slice(eol);
    out.extend_from_slice(body);
    out
}

/// The message body after the first blank line, if any.
fn body(raw: &[u8]) -> Option<&[u8]> {
    find_split(raw).map(|(_, body_start)| &raw[body_start..])
}

/// Split a message into its header block (no trailing blank line) and
/// body. A message without a blank line is all headers.
fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    match find_split(raw) {
        Some((headers_end, body_start)) => (&raw[..headers_end], &raw[body_start..]),
        None => (raw, &[]),
    }
}

fn find_split(raw: &[u8]) -> Option<(usize, usize)> {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = raw.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if c < l => Some((c, c + 4)),
        (Some(c), None) => Some((c, c + 4)),
        (_, Some(l)) => Some((l, l + 2)),
        (None, None) => None,
    }
}

fn split_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

fn line_names_header(line: &[u8], name: &str) -> bool {
    if line.len() <= name.len() || line[name.len()] != b':' {
        return false;
    }
    line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
}

fn header_text(message: &Message, name: &str) -> Option<String> {
    match message.header(name)? {
        HeaderValue::Text(text) => Some(text.trim().to_string()),
        _ => None,
    }
}
