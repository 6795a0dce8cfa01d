//! In-process fake IMAP server for integration testing
//!
//! Speaks enough of RFC 3501 to exercise the synchronizer end to end:
//! greeting, LOGIN or AUTHENTICATE, and the UID-addressed command set
//! (SEARCH, FETCH, STORE, COPY, EXPUNGE, APPEND) with real state
//! mutation behind them.
//!
//! ## Command format
//!
//! Every client command starts with a **tag** the server echoes in
//! its completion response:
//!
//! ```text
//!   Client:  A0001 LOGIN user pass
//!   Server:  A0001 OK LOGIN completed
//! ```
//!
//! Lines prefixed with `*` are **untagged** responses sent before the
//! final tagged OK/NO/BAD. Message bodies travel as **counted
//! literals**: `{bytecount}` followed by exactly that many raw bytes.
//! APPEND uses a literal in the client-to-server direction, which is
//! why the session loop reads raw bytes rather than strings.
//!
//! ## Modes
//!
//! [`FakeImapServer::start`] serves plain TCP; [`start_tls`] wraps
//! every connection in implicit TLS with a fresh self-signed
//! certificate whose DER is exposed so tests can pin its fingerprint.
//!
//! [`start_tls`]: FakeImapServer::start_tls

use super::handlers::{
    StoreArgs, handle_append, handle_authenticate, handle_capability, handle_expunge,
    handle_fetch, handle_list, handle_login, handle_logout, handle_noop,
    handle_select, handle_uid_copy, handle_uid_search, handle_uid_store,
};
use super::io::{read_line, write_line};
use super::mailbox::Mailbox;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// A fake IMAP server on localhost with an OS-assigned port.
pub struct FakeImapServer {
    port: u16,
    mailbox: Arc<Mutex<Mailbox>>,
    cert_der: Option<Vec<u8>>,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a plain-TCP server with the given mailbox state.
    pub async fn start(mailbox: Mailbox) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let mailbox = Arc::new(Mutex::new(mailbox));

        let accept_mailbox = mailbox.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let mailbox = accept_mailbox.clone();
                tokio::spawn(async move {
                    run_session(stream, &mailbox).await;
                });
            }
        });

        Self {
            port,
            mailbox,
            cert_der: None,
            _handle: handle,
        }
    }

    /// Start an implicit-TLS server with a fresh self-signed
    /// certificate. The certificate DER is available through
    /// [`cert_der`](Self::cert_der) so tests can compute the pin the
    /// client must be configured with.
    pub async fn start_tls(mailbox: Mailbox) -> Self {
        // Multiple tests race to install the process-wide provider;
        // losing the race is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der.into())
            .expect("build server TLS config");
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let mailbox = Arc::new(Mutex::new(mailbox));
        let accept_mailbox = mailbox.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let mailbox = accept_mailbox.clone();
                tokio::spawn(async move {
                    let Ok(tls_stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    run_session(tls_stream, &mailbox).await;
                });
            }
        });

        Self {
            port,
            mailbox,
            cert_der: Some(cert_der.as_ref().to_vec()),
            _handle: handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Snapshot of the current mailbox state, for assertions.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.lock().unwrap().clone()
    }

    /// Mutate the live mailbox state, e.g. to simulate changes made
    /// by another mail client between sync runs.
    pub fn with_mailbox(&self, mutate: impl FnOnce(&mut Mailbox)) {
        mutate(&mut self.mailbox.lock().unwrap());
    }

    /// DER of the TLS certificate (TLS mode only).
    pub fn cert_der(&self) -> Option<&[u8]> {
        self.cert_der.as_deref()
    }
}

/// Extract the folder name from a parsed `imap_types::Mailbox`.
fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Run the IMAP command loop over an established stream.
///
/// Uses `imap-codec`'s `CommandCodec` for the one-line commands.
/// APPEND (client-side literal) and AUTHENTICATE (SASL exchange) are
/// routed by their command token before parsing, since both continue
/// past the first line.
async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(stream: S, mailbox: &Mutex<Mailbox>) {
    let mut reader = BufReader::new(stream);

    if write_line(&mut reader, "* OK IMAP4rev1 Fake server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    let codec = CommandCodec::default();
    let mut selected_folder: Option<String> = None;

    loop {
        let Ok(Some(line)) = read_line(&mut reader).await else {
            break;
        };
        let text = String::from_utf8_lossy(&line).into_owned();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut tokens = trimmed.split_whitespace();
        let tag_token = tokens.next().unwrap_or("*").to_string();
        let command_token = tokens.next().unwrap_or("").to_uppercase();

        if command_token == "APPEND" {
            handle_append(&tag_token, &text, mailbox, &mut reader).await;
            continue;
        }
        if command_token == "AUTHENTICATE" {
            if !handle_authenticate(&tag_token, &mut reader).await {
                break;
            }
            continue;
        }

        let Ok((_, command)) = codec.decode(&line) else {
            let resp = format!("{tag_token} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();

        // Snapshot for the read-only handlers; write handlers lock
        // the live state themselves.
        let snap = mailbox.lock().unwrap().clone();

        match command.body {
            CommandBody::Capability => {
                handle_capability(tag, &mut reader).await;
            }
            CommandBody::Noop => {
                handle_noop(tag, &mut reader).await;
            }
            CommandBody::Login { .. } => {
                if !handle_login(tag, &mut reader).await {
                    break;
                }
            }
            CommandBody::List { .. } => {
                handle_list(tag, &snap, &mut reader).await;
            }
            CommandBody::Select { mailbox: mb, .. } => {
                let name = mailbox_name(&mb);
                selected_folder = handle_select(tag, &name, &snap, &mut reader).await;
            }
            CommandBody::Search {
                criteria,
                uid: true,
                ..
            } => {
                handle_uid_search(
                    tag,
                    criteria.as_ref(),
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Fetch {
                sequence_set, uid, ..
            } => {
                handle_fetch(
                    tag,
                    &sequence_set,
                    uid,
                    &text,
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Store {
                ref sequence_set,
                uid: true,
                ref kind,
                ref response,
                ref flags,
                ..
            } => {
                let args = StoreArgs {
                    sequence_set,
                    kind,
                    response,
                    flags,
                };
                handle_uid_store(
                    tag,
                    &args,
                    mailbox,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Copy {
                ref sequence_set,
                mailbox: ref dest_mb,
                uid: true,
                ..
            } => {
                let dest_name = mailbox_name(dest_mb);
                handle_uid_copy(
                    tag,
                    sequence_set,
                    &dest_name,
                    mailbox,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Expunge => {
                handle_expunge(tag, mailbox, selected_folder.as_deref(), &mut reader)
                    .await;
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
