//! Per-account IMAP session and per-folder operations
//!
//! [`ImapAccount`] owns one authenticated session, established on
//! first use, and caches the currently selected folder so repeated
//! operations on one folder do not re-SELECT. [`FolderClient`] is a
//! short-lived view binding the session to one remote folder.
//!
//! Every round trip runs under the account's configured timeout;
//! hitting it is fatal for the account (but not for its siblings).

use crate::config::AccountConfig;
use crate::connection::{self, ImapSession};
use crate::error::{Error, Result};
use crate::syncpoint;
use async_imap::types::{Fetch, Flag};
use futures::TryStreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const FETCH_QUERY: &str = "(UID FLAGS BODY.PEEK[])";

/// A message as fetched from the server: UID, wire flags, and the body
/// with CRLF normalized to LF.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub body: Vec<u8>,
}

impl FetchedMessage {
    /// Whether the server reports the message as read.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.flags.iter().any(|f| f == "\\Seen")
    }
}

/// A message to upload, identified by its Maildir msgkey.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub msgkey: String,
    pub body: Vec<u8>,
}

/// One remote folder as reported by LIST.
#[derive(Debug, Clone)]
pub struct FolderInfo {
    pub flags: String,
    pub separator: String,
    pub name: String,
}

/// A stateful handle to one account's IMAP server.
pub struct ImapAccount {
    config: Arc<AccountConfig>,
    timeout: Duration,
    token_cache: Option<PathBuf>,
    session: Option<ImapSession>,
    selected: Option<(String, u32)>,
}

impl ImapAccount {
    #[must_use]
    pub const fn new(
        config: Arc<AccountConfig>,
        timeout: Duration,
        token_cache: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            timeout,
            token_cache,
            session: None,
            selected: None,
        }
    }

    /// The account configuration this session belongs to.
    #[must_use]
    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    /// Establish and authenticate the session now. Called eagerly by
    /// the engine so transport and authentication failures surface
    /// before any folder work starts.
    pub async fn connect(&mut self) -> Result<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Bind this session to one folder.
    pub fn folder(&mut self, name: &str) -> FolderClient<'_> {
        FolderClient {
            account: self,
            name: name.to_string(),
        }
    }

    /// All folders reported by `LIST "" *`.
    pub async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let timeout = self.timeout;
        let session = self.ensure_connected().await?;
        let names: Vec<async_imap::types::Name> = timed(timeout, async {
            let stream = session.list(Some(""), Some("*")).await?;
            stream.try_collect().await
        })
        .await?;

        Ok(names
            .iter()
            .map(|name| FolderInfo {
                flags: name
                    .attributes()
                    .iter()
                    .map(|attr| format!("{attr:?}"))
                    .collect::<Vec<_>>()
                    .join(" "),
                separator: name.delimiter().unwrap_or("/").to_string(),
                name: name.name().to_string(),
            })
            .collect())
    }

    /// Log out politely; errors are ignored since the work is done.
    pub async fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
        self.selected = None;
    }

    async fn ensure_connected(&mut self) -> Result<&mut ImapSession> {
        if self.session.is_none() {
            let session = match tokio::time::timeout(
                self.timeout,
                connection::connect(&self.config, self.token_cache.clone()),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(Error::Timeout(self.timeout)),
            };
            self.session = Some(session);
        }
        Ok(self.session.as_mut().expect("session just established"))
    }

    /// SELECT a folder unless it is already selected; returns the
    /// EXISTS count reported at selection time.
    async fn select(&mut self, folder: &str) -> Result<u32> {
        if let Some((name, exists)) = &self.selected {
            if name == folder {
                return Ok(*exists);
            }
        }
        let timeout = self.timeout;
        let session = self.ensure_connected().await?;
        let mailbox = timed(timeout, session.select(folder)).await?;
        let exists = mailbox.exists;
        self.selected = Some((folder.to_string(), exists));
        debug!("selected {folder} ({exists} messages)");
        Ok(exists)
    }
}

/// Folder-scoped operations on an [`ImapAccount`].
pub struct FolderClient<'a> {
    account: &'a mut ImapAccount,
    name: String,
}

impl FolderClient<'_> {
    /// `(total, unseen)` for this folder.
    pub async fn status(&mut self) -> Result<(u32, u32)> {
        let total = self.account.select(&self.name).await?;
        let timeout = self.account.timeout;
        let session = self.account.ensure_connected().await?;
        let unseen = timed(timeout, session.uid_search("UNSEEN")).await?;
        Ok((total, unseen.len() as u32))
    }

    /// Fetch messages past `last_uid`, or the last `last_n` messages
    /// when no uid horizon is known yet.
    ///
    /// The `UID n:*` search is open-ended and always reports at least
    /// the boundary message, so results are filtered to strictly
    /// greater uids. Messages come back in ascending uid order.
    pub async fn fetch(&mut self, last_n: u32, last_uid: i64) -> Result<Vec<FetchedMessage>> {
        let total = self.account.select(&self.name).await?;
        let timeout = self.account.timeout;
        let session = self.account.ensure_connected().await?;

        let fetches: Vec<Fetch> = if last_uid > 0 {
            let query = format!("UID {}:*", last_uid + 1);
            let found = timed(timeout, session.uid_search(&query)).await?;
            let mut uids: Vec<u32> = found
                .into_iter()
                .filter(|uid| i64::from(*uid) > last_uid)
                .collect();
            uids.sort_unstable();
            if uids.is_empty() {
                return Ok(Vec::new());
            }
            let set = uid_set(&uids);
            let limit = per_message_budget(timeout, uids.len());
            timed(limit, async {
                let stream = session.uid_fetch(&set, FETCH_QUERY).await?;
                stream.try_collect().await
            })
            .await?
        } else {
            if total == 0 {
                return Ok(Vec::new());
            }
            let start = total.saturating_sub(last_n).max(1);
            let range = format!("{start}:{total}");
            let limit = per_message_budget(timeout, last_n as usize);
            timed(limit, async {
                let stream = session.fetch(&range, FETCH_QUERY).await?;
                stream.try_collect().await
            })
            .await?
        };

        let mut messages: Vec<FetchedMessage> = fetches
            .iter()
            .filter_map(|fetch| {
                let Some(uid) = fetch.uid else {
                    warn!("FETCH response without UID, skipping");
                    return None;
                };
                let Some(body) = fetch.body() else {
                    warn!("FETCH response without body for uid {uid}, skipping");
                    return None;
                };
                Some(FetchedMessage {
                    uid,
                    flags: fetch.flags().map(|f| flag_string(&f)).collect(),
                    body: normalize_newlines(body),
                })
            })
            .collect();
        messages.sort_unstable_by_key(|m| m.uid);
        Ok(messages)
    }

    /// Current server flags for a set of uids. Uids unknown to the
    /// server are simply absent from the result.
    pub async fn get_flags(&mut self, uids: &[i64]) -> Result<HashMap<i64, Vec<String>>> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }
        self.account.select(&self.name).await?;
        let timeout = self.account.timeout;
        let session = self.account.ensure_connected().await?;

        let set = int_set(uids);
        let fetches: Vec<Fetch> = timed(timeout, async {
            let stream = session.uid_fetch(&set, "(UID FLAGS)").await?;
            stream.try_collect().await
        })
        .await?;

        let mut flags = HashMap::new();
        for fetch in &fetches {
            if let Some(uid) = fetch.uid {
                flags.insert(
                    i64::from(uid),
                    fetch.flags().map(|f| flag_string(&f)).collect(),
                );
            }
        }
        Ok(flags)
    }

    /// Mark uids as read on the server.
    pub async fn seen(&mut self, uids: &[i64]) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.account.select(&self.name).await?;
        let timeout = self.account.timeout;
        let session = self.account.ensure_connected().await?;

        let set = int_set(uids);
        timed(timeout, async {
            let stream = session.uid_store(&set, "+FLAGS (\\Seen)").await?;
            stream.try_collect::<Vec<_>>().await.map(|_| ())
        })
        .await
    }

    /// Move uids to the trash folder: COPY, mark `\Deleted`, EXPUNGE.
    pub async fn trash(&mut self, uids: &[i64], trash_folder: &str) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.account.select(&self.name).await?;
        let timeout = self.account.timeout;
        let session = self.account.ensure_connected().await?;

        let set = int_set(uids);
        timed(timeout, session.uid_copy(&set, trash_folder)).await?;
        timed(timeout, async {
            let stream = session.uid_store(&set, "+FLAGS (\\Deleted)").await?;
            stream.try_collect::<Vec<_>>().await.map(|_| ())
        })
        .await?;
        timed(timeout, async {
            let stream = session.expunge().await?;
            stream.try_collect::<Vec<_>>().await.map(|_| ())
        })
        .await?;

        // The EXISTS count cached at selection time is stale now.
        self.account.selected = None;
        Ok(())
    }

    /// Append one fully formed message (used for syncpoints), marked
    /// read so other agents' mail readers do not highlight it.
    pub async fn append_raw(&mut self, body: &[u8]) -> Result<()> {
        self.account.select(&self.name).await?;
        let timeout = self.account.timeout;
        let name = self.name.clone();
        let session = self.account.ensure_connected().await?;
        timed(
            timeout,
            session.append(&name, Some("(\\Seen)"), None, body),
        )
        .await
    }

    /// Upload locally added messages.
    ///
    /// Each message gets its msgkey embedded as `X-Norless-Id` and
    /// `Message-ID` (replacing prior values) before APPEND. The
    /// server-assigned uids are recovered afterwards by searching past
    /// `last_uid` and reading back headers; pairs are matched by the
    /// embedded msgkey.
    pub async fn append_messages(
        &mut self,
        messages: &[OutgoingMessage],
        last_uid: i64,
    ) -> Result<Vec<(i64, String)>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        self.account.select(&self.name).await?;
        let timeout = self.account.timeout;
        let name = self.name.clone();
        let session = self.account.ensure_connected().await?;

        let mut submitted = HashSet::new();
        for message in messages {
            let body = syncpoint::replace_header(
                &syncpoint::replace_header(
                    &message.body,
                    syncpoint::MSGKEY_HEADER,
                    &message.msgkey,
                ),
                "Message-ID",
                &message.msgkey,
            );
            timed(
                timeout,
                session.append(&name, Some("(\\Seen)"), None, &body),
            )
            .await?;
            submitted.insert(message.msgkey.clone());
        }

        // UIDPLUS is not assumed, so the new uids are discovered by
        // searching past the old horizon and reading the headers back.
        let last = last_uid.max(0);
        let query = format!("UID {}:*", last + 1);
        let found = timed(timeout, session.uid_search(&query)).await?;
        let mut uids: Vec<u32> = found
            .into_iter()
            .filter(|uid| i64::from(*uid) > last)
            .collect();
        uids.sort_unstable();
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uid_set(&uids);
        let fetches: Vec<Fetch> = timed(per_message_budget(timeout, uids.len()), async {
            let stream = session.uid_fetch(&set, "(UID BODY.PEEK[HEADER])").await?;
            stream.try_collect().await
        })
        .await?;

        let mut stored = Vec::new();
        for fetch in &fetches {
            let (Some(uid), Some(header)) = (fetch.uid, fetch.header()) else {
                continue;
            };
            if let Some(msgkey) = syncpoint::embedded_msgkey(header) {
                if submitted.contains(&msgkey) {
                    stored.push((i64::from(uid), msgkey));
                }
            }
        }
        Ok(stored)
    }
}

async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, async_imap::error::Error>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Error::Imap(err.to_string())),
        Err(_) => Err(Error::Timeout(limit)),
    }
}

/// Body transfers get a per-message slice of the configured timeout
/// rather than one flat budget.
fn per_message_budget(timeout: Duration, count: usize) -> Duration {
    timeout.saturating_mul(count.max(1) as u32)
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn int_set(uids: &[i64]) -> String {
    uids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn flag_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

fn normalize_newlines(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut idx = 0;
    while idx < body.len() {
        if body[idx] == b'\r' && body.get(idx + 1) == Some(&b'\n') {
            idx += 1;
            continue;
        }
        out.push(body[idx]);
        idx += 1;
    }
    out
}
