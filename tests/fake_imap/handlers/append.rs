//! APPEND command handler.
//!
//! APPEND is the one command whose payload arrives as an IMAP literal:
//! the command line ends with `{<length>}`, the server answers with a
//! `+` continuation, and the client then sends exactly `length` raw
//! bytes followed by CRLF. This handler parses the command line
//! leniently (tolerating any flag list and optional internal date) so
//! it keeps working whatever exact shape the client library emits.

use crate::fake_imap::io::{read_line, write_line};
use crate::fake_imap::mailbox::Mailbox;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

/// Parsed form of an APPEND command line.
#[derive(Debug, PartialEq, Eq)]
pub struct AppendRequest {
    pub folder: String,
    pub seen: bool,
    pub literal_len: usize,
    /// LITERAL+ style (`{n+}`): the client does not wait for a
    /// continuation.
    pub non_sync: bool,
}

/// Handle APPEND: continuation, literal, then storage under the
/// folder's next uid.
pub async fn handle_append<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    line: &str,
    mailbox: &Mutex<Mailbox>,
    stream: &mut BufReader<S>,
) {
    let Some(request) = parse_append(line) else {
        let resp = format!("{tag} BAD Malformed APPEND\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    if !request.non_sync {
        if write_line(stream, "+ Ready for literal data\r\n")
            .await
            .is_err()
        {
            return;
        }
    }

    let mut raw = vec![0u8; request.literal_len];
    if stream.read_exact(&mut raw).await.is_err() {
        return;
    }
    // The literal is followed by the command-terminating CRLF.
    let _ = read_line(stream).await;

    let stored = {
        let mut guard = mailbox.lock().unwrap();
        guard
            .get_folder_mut(&request.folder)
            .map(|folder| folder.add_email(raw, request.seen))
    };

    let resp = match stored {
        Some(_) => format!("{tag} OK APPEND completed\r\n"),
        None => format!("{tag} NO APPEND failed: no such folder\r\n"),
    };
    let _ = write_line(stream, &resp).await;
}

/// Parse `<tag> APPEND <mailbox> [flags] [date] {<n>[+]}` without
/// insisting on one exact argument layout.
pub fn parse_append(line: &str) -> Option<AppendRequest> {
    let line = line.trim_end();

    let open = line.rfind('{')?;
    let close = line.rfind('}')?;
    if close < open {
        return None;
    }
    let mut literal = &line[open + 1..close];
    let non_sync = literal.ends_with('+');
    if non_sync {
        literal = &literal[..literal.len() - 1];
    }
    let literal_len: usize = literal.parse().ok()?;

    let mut rest = line.split_whitespace();
    let _tag = rest.next()?;
    let command = rest.next()?;
    if !command.eq_ignore_ascii_case("APPEND") {
        return None;
    }

    // The mailbox argument starts right after the APPEND token.
    let after = line[..open].split_once(command)?.1.trim_start();
    let folder = if let Some(stripped) = after.strip_prefix('"') {
        stripped.split_once('"')?.0.to_string()
    } else {
        after.split_whitespace().next()?.to_string()
    };

    Some(AppendRequest {
        folder,
        seen: line.contains("\\Seen"),
        literal_len,
        non_sync,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_mailbox_with_flags() {
        let request =
            parse_append("A3 APPEND \"INBOX\" (\\Seen) {310}\r\n").unwrap();
        assert_eq!(request.folder, "INBOX");
        assert!(request.seen);
        assert_eq!(request.literal_len, 310);
        assert!(!request.non_sync);
    }

    #[test]
    fn parses_bare_mailbox_without_flags() {
        let request = parse_append("A3 APPEND Sent {12}\r\n").unwrap();
        assert_eq!(request.folder, "Sent");
        assert!(!request.seen);
        assert_eq!(request.literal_len, 12);
    }

    #[test]
    fn parses_non_sync_literal() {
        let request = parse_append("A3 APPEND INBOX {5+}\r\n").unwrap();
        assert!(request.non_sync);
        assert_eq!(request.literal_len, 5);
    }

    #[test]
    fn tolerates_internal_date() {
        let request = parse_append(
            "A3 APPEND \"INBOX\" (\\Seen) \"01-Jan-2024 10:00:00 +0000\" {44}\r\n",
        )
        .unwrap();
        assert_eq!(request.folder, "INBOX");
        assert!(request.seen);
        assert_eq!(request.literal_len, 44);
    }

    #[test]
    fn rejects_non_append() {
        assert!(parse_append("A3 FETCH 1 (UID)").is_none());
    }
}
