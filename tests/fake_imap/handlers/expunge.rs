//! EXPUNGE command handler.
//!
//! Permanently removes every `\Deleted` message from the selected
//! folder, reporting each removal as an untagged `* <seq> EXPUNGE`
//! before the tagged OK.

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn handle_expunge<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    mailbox: &Mutex<Mailbox>,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder_name) = selected_folder else {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let expunged_seqs = {
        let mut guard = mailbox.lock().unwrap();
        match guard.get_folder_mut(folder_name) {
            Some(folder) => {
                let seqs: Vec<usize> = folder
                    .emails
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.deleted)
                    .map(|(idx, _)| idx + 1)
                    .collect();
                folder.emails.retain(|e| !e.deleted);
                Some(seqs)
            }
            None => None,
        }
    };

    match expunged_seqs {
        Some(seqs) => {
            // Report in descending order so each sequence number is
            // valid at the moment it is sent.
            for seq in seqs.iter().rev() {
                let line = format!("* {seq} EXPUNGE\r\n");
                if write_line(stream, &line).await.is_err() {
                    return;
                }
            }
            let resp = format!("{tag} OK EXPUNGE completed\r\n");
            let _ = write_line(stream, &resp).await;
        }
        None => {
            let resp = format!("{tag} BAD Folder not found\r\n");
            let _ = write_line(stream, &resp).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    async fn run(mailbox: &Mutex<Mailbox>, selected: Option<&str>) -> String {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);

        handle_expunge("A1", mailbox, selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn removes_only_deleted_messages() {
        let mut mailbox = MailboxBuilder::new()
            .folder("INBOX")
            .email(1, true, b"keep")
            .email(2, true, b"drop")
            .build();
        mailbox
            .get_folder_mut("INBOX")
            .unwrap()
            .emails[1]
            .deleted = true;
        let mailbox = Mutex::new(mailbox);

        let output = run(&mailbox, Some("INBOX")).await;
        assert!(output.contains("* 2 EXPUNGE"));
        assert!(output.contains("A1 OK EXPUNGE completed"));

        let guard = mailbox.lock().unwrap();
        let folder = guard.get_folder("INBOX").unwrap();
        assert_eq!(folder.emails.len(), 1);
        assert_eq!(folder.emails[0].uid, 1);
    }

    #[tokio::test]
    async fn nothing_deleted_is_still_ok() {
        let mailbox = Mutex::new(
            MailboxBuilder::new()
                .folder("INBOX")
                .email(1, true, b"keep")
                .build(),
        );

        let output = run(&mailbox, Some("INBOX")).await;
        assert!(!output.contains("EXPUNGE\r\n* "));
        assert!(output.contains("A1 OK EXPUNGE completed"));
    }
}
