//! CAPABILITY command handler.

use crate::fake_imap::io::write_line;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn handle_capability<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    stream: &mut BufReader<S>,
) {
    let _ = write_line(stream, "* CAPABILITY IMAP4rev1 AUTH=XOAUTH2\r\n").await;
    let resp = format!("{tag} OK CAPABILITY completed\r\n");
    let _ = write_line(stream, &resp).await;
}
