//! The synchronization engine
//!
//! Four commands over the same building blocks:
//!
//! - **pull**: mirror remote messages into Maildirs and replay other
//!   replicas' syncpoints, one worker task per account.
//! - **remote push**: turn locally observed seen/deleted state into
//!   STORE/COPY/EXPUNGE on the server, then append a syncpoint
//!   recording the change set.
//! - **upload new**: APPEND Maildir-originated messages and learn
//!   their server uids.
//! - **check**: report unread counts per Maildir.
//!
//! Every command takes the app-wide lock first, so pull and remote
//! push for one folder can never overlap.

use crate::config::{AccountConfig, Config, MaildirRef, SyncRule};
use crate::error::Result;
use crate::flag;
use crate::imap::{FetchedMessage, FolderClient, ImapAccount, OutgoingMessage};
use crate::lock::AppLock;
use crate::maildir::Maildir;
use crate::state::{State, StateDir};
use crate::syncpoint::{self, Changes};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct SyncEngine {
    config: Config,
    state_dir: StateDir,
    maildirs: HashMap<PathBuf, Arc<Maildir>>,
    lock_path: PathBuf,
    sequential: bool,
    quiet: bool,
}

impl SyncEngine {
    /// Build an engine: open the state directory and one shared handle
    /// per distinct Maildir path.
    pub fn new(config: Config) -> Result<Self> {
        let state_dir = StateDir::new(&config.state_dir)?;
        let lock_path = AppLock::path_for(&config.state_dir);

        let mut maildirs = HashMap::new();
        for rule in &config.sync_rules {
            if !maildirs.contains_key(&rule.maildir.path) {
                let handle = Arc::new(Maildir::open(&rule.maildir.path)?);
                maildirs.insert(rule.maildir.path.clone(), handle);
            }
        }

        Ok(Self {
            config,
            state_dir,
            maildirs,
            lock_path,
            sequential: false,
            quiet: false,
        })
    }

    /// Process accounts one after another instead of concurrently.
    #[must_use]
    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    /// Suppress the per-folder push summary lines.
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Mirror remote folders into the local Maildirs.
    pub async fn pull(&self) -> Result<()> {
        let _lock = AppLock::acquire(&self.lock_path, false)?;
        let jobs = self.account_jobs();

        if self.sequential {
            for job in jobs {
                job.pull().await;
            }
        } else {
            let mut handles = Vec::new();
            for job in jobs {
                handles.push(tokio::spawn(job.pull()));
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    error!("pull worker panicked: {err}");
                }
            }
        }
        Ok(())
    }

    /// Push locally observed seen/deleted state to the servers.
    pub async fn remote_push(&self) -> Result<()> {
        let _lock = AppLock::acquire(&self.lock_path, true)?;

        for (name, rules) in self.config.rules_by_account() {
            let Some(account) = self.config.accounts.get(&name).cloned() else {
                continue;
            };
            let mut imap = self.session_for(&account);
            if let Err(err) = imap.connect().await {
                error!("account {name}: {err}");
                continue;
            }
            for rule in &rules {
                if let Err(err) = self.push_folder(&mut imap, rule).await {
                    error!("account {name} folder {}: {err}", rule.folder);
                    if err.is_account_fatal() {
                        break;
                    }
                }
            }
            imap.logout().await;
        }
        Ok(())
    }

    /// Upload messages another program dropped into `sync_new`
    /// Maildirs.
    pub async fn upload_new(&self) -> Result<()> {
        let _lock = AppLock::acquire(&self.lock_path, false)?;

        let mut groups: BTreeMap<String, Vec<SyncRule>> = BTreeMap::new();
        for rule in &self.config.sync_rules {
            if rule.maildir.sync_new {
                groups
                    .entry(rule.maildir.name.clone())
                    .or_default()
                    .push(rule.clone());
            }
        }

        for (maildir_name, rules) in groups {
            if let Err(err) = self.upload_maildir(&rules).await {
                error!("maildir {maildir_name}: {err}");
            }
        }
        Ok(())
    }

    /// Print unread counts; returns whether any unread message exists.
    pub fn check(&self) -> Result<bool> {
        let _lock = AppLock::acquire(&self.lock_path, false)?;

        let mut counted_paths = HashSet::new();
        let mut any_unread = false;
        for rule in &self.config.sync_rules {
            if !counted_paths.insert(rule.maildir.path.clone()) {
                continue;
            }
            let maildir = self.maildir(&rule.maildir);
            let unread = maildir
                .entries()?
                .iter()
                .filter(|(_, flags)| !flag::is_seen(flags))
                .count();
            if unread > 0 {
                println!("{}\t{unread}", rule.maildir.name);
                any_unread = true;
            }
        }
        Ok(any_unread)
    }

    /// List each account's remote folders.
    pub async fn show_folders(&self) -> Result<()> {
        for (name, account) in &self.config.accounts {
            println!("{name}");
            let mut imap = self.session_for(account);
            match imap.list_folders().await {
                Ok(folders) => {
                    for folder in folders {
                        println!(
                            "   [{}] {}\t({})",
                            folder.separator, folder.name, folder.flags
                        );
                    }
                }
                Err(err) => error!("account {name}: {err}"),
            }
            imap.logout().await;
        }
        Ok(())
    }

    fn session_for(&self, account: &Arc<AccountConfig>) -> ImapAccount {
        ImapAccount::new(
            Arc::clone(account),
            self.config.timeout,
            Some(self.state_dir.token_cache(&account.name)),
        )
    }

    fn maildir(&self, mdref: &MaildirRef) -> Arc<Maildir> {
        Arc::clone(
            self.maildirs
                .get(&mdref.path)
                .expect("maildir handles are created for every rule at startup"),
        )
    }

    fn account_jobs(&self) -> Vec<AccountJob> {
        let mut jobs = Vec::new();
        for (name, rules) in self.config.rules_by_account() {
            let Some(account) = self.config.accounts.get(&name).cloned() else {
                continue;
            };
            let rules = rules
                .into_iter()
                .map(|rule| {
                    let maildir = self.maildir(&rule.maildir);
                    (rule, maildir)
                })
                .collect();
            jobs.push(AccountJob {
                account,
                rules,
                state_dir: self.state_dir.clone(),
                fetch_last: self.config.fetch_last,
                timeout: self.config.timeout,
            });
        }
        jobs
    }

    async fn push_folder(&self, imap: &mut ImapAccount, rule: &SyncRule) -> Result<()> {
        let maildir = self.maildir(&rule.maildir);
        let mut state = self.state_dir.open(&rule.account, &rule.folder)?;

        let (seen, trash, stale) = maildir_changes(&maildir, &state)?;
        if !stale.is_empty() {
            // Locally added rows whose file vanished before upload;
            // nothing exists remotely, so just forget them.
            debug!("dropping {} stale local rows", stale.len());
            state.remove_many(&stale)?;
        }
        if seen.is_empty() && trash.is_empty() {
            return Ok(());
        }

        let replica_id = imap.config().replica_id.clone();
        let mut folder = imap.folder(&rule.folder);

        if !seen.is_empty() {
            folder.seen(&seen).await?;
            for uid in &seen {
                if let Some(row) = state.get(*uid).cloned() {
                    state.put(
                        *uid,
                        &row.msgkey,
                        &flag::union(&row.flags, "S"),
                        row.is_syncpoint,
                    )?;
                }
            }
        }

        if !trash.is_empty() {
            folder.trash(&trash, &rule.trash).await?;
            state.remove_many(&trash)?;
        }

        let changes = Changes {
            seen: seen.clone(),
            trash: trash.clone(),
        };
        let body = syncpoint::encode(&replica_id, &changes)?;
        folder.append_raw(&body).await?;

        if !self.quiet {
            println!(
                "{}: seen {}, trash {}",
                rule.account,
                seen.len(),
                trash.len()
            );
        }
        Ok(())
    }

    async fn upload_maildir(&self, rules: &[SyncRule]) -> Result<()> {
        let Some(first) = rules.first() else {
            return Ok(());
        };
        let maildir = self.maildir(&first.maildir);

        let mut state_keys = HashSet::new();
        for rule in rules {
            let state = self.state_dir.open(&rule.account, &rule.folder)?;
            for row in state.entries() {
                state_keys.insert(row.msgkey.clone());
            }
        }

        let new_keys: Vec<String> = maildir
            .keys()?
            .into_iter()
            .filter(|key| !state_keys.contains(key))
            .collect();
        if new_keys.is_empty() {
            return Ok(());
        }
        info!("{} new local messages in {}", new_keys.len(), first.maildir.name);

        let mut by_addr: BTreeMap<String, Vec<OutgoingMessage>> = BTreeMap::new();
        for key in new_keys {
            let Some(entry) = maildir.get(&key)? else {
                continue;
            };
            let addr = syncpoint::from_addr(&entry.body).unwrap_or_default();
            by_addr.entry(addr).or_default().push(OutgoingMessage {
                msgkey: key,
                body: entry.body,
            });
        }

        let mut sessions: HashMap<String, ImapAccount> = HashMap::new();
        for (addr, messages) in by_addr {
            let matching = rules.iter().find(|rule| {
                self.config
                    .accounts
                    .get(&rule.account)
                    .is_some_and(|a| a.from_addr.as_deref() == Some(addr.as_str()))
            });

            let Some(rule) = matching else {
                // No account claims this sender. Record the messages
                // under synthetic negative uids so they are not
                // re-examined on every run.
                warn!(
                    "unknown sender address {addr:?}, marking {} messages handled",
                    messages.len()
                );
                let Some(rule) = rules.last() else { continue };
                let mut state = self.state_dir.open(&rule.account, &rule.folder)?;
                let mut next = state.min_uid().min(0) - 1;
                for message in &messages {
                    state.put(next, &message.msgkey, "S", false)?;
                    next -= 1;
                }
                continue;
            };

            let Some(account) = self.config.accounts.get(&rule.account) else {
                continue;
            };
            if !sessions.contains_key(&rule.account) {
                let mut imap = self.session_for(account);
                imap.connect().await?;
                sessions.insert(rule.account.clone(), imap);
            }
            let imap = sessions
                .get_mut(&rule.account)
                .expect("session inserted above");

            let mut state = self.state_dir.open(&rule.account, &rule.folder)?;
            let mut folder = imap.folder(&rule.folder);
            let stored = folder.append_messages(&messages, state.max_uid()).await?;
            info!(
                "uploaded {} messages to {} {}",
                stored.len(),
                rule.account,
                rule.folder
            );
            for (uid, msgkey) in stored {
                state.put(uid, &msgkey, "S", false)?;
            }
        }

        for (_, mut imap) in sessions {
            imap.logout().await;
        }
        Ok(())
    }
}

/// Per-account pull work, detached from the engine so it can run as
/// its own task. Errors are logged, never propagated: one account
/// failing must not abort its siblings.
struct AccountJob {
    account: Arc<AccountConfig>,
    rules: Vec<(SyncRule, Arc<Maildir>)>,
    state_dir: StateDir,
    fetch_last: u32,
    timeout: Duration,
}

impl AccountJob {
    async fn pull(self) {
        let mut imap = ImapAccount::new(
            Arc::clone(&self.account),
            self.timeout,
            Some(self.state_dir.token_cache(&self.account.name)),
        );
        if let Err(err) = imap.connect().await {
            error!("account {}: {err}", self.account.name);
            return;
        }

        for (rule, maildir) in &self.rules {
            if let Err(err) = self.pull_folder(&mut imap, rule, maildir).await {
                error!("account {} folder {}: {err}", rule.account, rule.folder);
                if err.is_account_fatal() {
                    break;
                }
            }
        }
        imap.logout().await;
    }

    async fn pull_folder(
        &self,
        imap: &mut ImapAccount,
        rule: &SyncRule,
        maildir: &Maildir,
    ) -> Result<()> {
        let mut state = self.state_dir.open(&rule.account, &rule.folder)?;
        let max_uid = state.max_uid();
        // On a cold store every fetched syncpoint is recorded but not
        // applied; replaying history into an empty Maildir would
        // resurrect nothing and delete nothing useful.
        let skip_syncpoints = max_uid == 0;

        let mut folder = imap.folder(&rule.folder);
        let messages = folder.fetch(self.fetch_last, max_uid).await?;
        if !messages.is_empty() {
            info!(
                "account {} folder {}: {} new messages",
                rule.account,
                rule.folder,
                messages.len()
            );
        }

        for message in &messages {
            let uid = i64::from(message.uid);
            let mut ordinary = true;

            if let Some(sp) = syncpoint::decode(&message.body) {
                if skip_syncpoints || sp.replica_id == self.account.replica_id {
                    debug!("uid {uid}: recording syncpoint without applying");
                    state.put(uid, "", "S", true)?;
                    continue;
                }
                match sp.changes {
                    Some(changes) => {
                        debug!(
                            "uid {uid}: applying syncpoint from {}",
                            sp.replica_id
                        );
                        apply_syncpoint(maildir, &mut state, &changes)?;
                        state.put(uid, "", "S", true)?;
                        ordinary = false;
                    }
                    None => {
                        warn!(
                            "uid {uid}: malformed syncpoint payload from {}, \
                             storing as ordinary mail",
                            sp.replica_id
                        );
                    }
                }
            }

            if ordinary {
                store_message(maildir, &mut state, message)?;
            }
        }

        if !rule.maildir.sync_new {
            reconcile_unseen(&mut folder, maildir, &mut state).await?;
        }
        Ok(())
    }
}

/// Mirror one fetched message into the Maildir and state.
fn store_message(
    maildir: &Maildir,
    state: &mut State,
    message: &FetchedMessage,
) -> Result<()> {
    let flags = if message.is_seen() { "S" } else { "" };
    let uid = i64::from(message.uid);

    match state.get(uid).cloned() {
        Some(row) => {
            if !flag::same(&row.flags, flags) {
                if maildir.get_flags(&row.msgkey)?.is_some() {
                    maildir.set_flags(&row.msgkey, flags)?;
                } else {
                    debug!("uid {uid}: local copy is gone, not reconciling flags");
                }
            }
        }
        None => {
            let msgkey = maildir.add(&message.body, flags)?;
            state.put(uid, &msgkey, flags, false)?;
        }
    }
    Ok(())
}

/// Replay another replica's change set locally.
fn apply_syncpoint(maildir: &Maildir, state: &mut State, changes: &Changes) -> Result<()> {
    for uid in &changes.trash {
        let Some(row) = state.get(*uid).cloned() else {
            continue;
        };
        if row.is_syncpoint {
            continue;
        }
        maildir.discard(&row.msgkey)?;
        state.remove(*uid)?;
    }

    for uid in &changes.seen {
        let Some(row) = state.get(*uid).cloned() else {
            continue;
        };
        if row.is_syncpoint {
            continue;
        }
        if maildir.contains(&row.msgkey)? {
            maildir.add_flags(&row.msgkey, "S")?;
            state.put(*uid, &row.msgkey, &flag::union(&row.flags, "S"), false)?;
        } else {
            state.remove(*uid)?;
        }
    }
    Ok(())
}

/// For mirror-only Maildirs: rows that never got flags may have been
/// read or deleted on the server since; ask once for their current
/// flags and catch up.
async fn reconcile_unseen(
    folder: &mut FolderClient<'_>,
    maildir: &Maildir,
    state: &mut State,
) -> Result<()> {
    let unseen: Vec<_> = state
        .entries()
        .filter(|row| row.flags.is_empty() && !row.is_syncpoint)
        .cloned()
        .collect();

    let mut present = Vec::new();
    for row in unseen {
        if maildir.contains(&row.msgkey)? {
            present.push(row);
        }
    }
    if present.is_empty() {
        return Ok(());
    }

    let uids: Vec<i64> = present.iter().map(|row| row.uid).collect();
    let server_flags = folder.get_flags(&uids).await?;

    for row in present {
        match server_flags.get(&row.uid) {
            None => {
                debug!("uid {}: gone from server, discarding locally", row.uid);
                maildir.discard(&row.msgkey)?;
                state.remove(row.uid)?;
            }
            Some(flags) if flags.iter().any(|f| f == "\\Seen") => {
                maildir.add_flags(&row.msgkey, "S")?;
                let current = maildir
                    .get_flags(&row.msgkey)?
                    .unwrap_or_else(|| "S".to_string());
                state.put(row.uid, &row.msgkey, &current, false)?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Diff the Maildir against the recorded state.
///
/// Returns `(seen, trash, stale)`: uids newly read locally, server
/// uids whose local file is gone, and synthetic local uids whose file
/// is gone (nothing to do remotely for those).
fn maildir_changes(
    maildir: &Maildir,
    state: &State,
) -> Result<(Vec<i64>, Vec<i64>, Vec<i64>)> {
    let mut seen = Vec::new();
    let mut trash = Vec::new();
    let mut stale = Vec::new();

    for row in state.entries() {
        if row.is_syncpoint {
            continue;
        }
        match maildir.get_flags(&row.msgkey)? {
            None => {
                if row.uid > 0 {
                    trash.push(row.uid);
                } else {
                    stale.push(row.uid);
                }
            }
            Some(mflags) => {
                if flag::is_seen(&mflags) && !flag::is_seen(&row.flags) {
                    seen.push(row.uid);
                }
            }
        }
    }
    Ok((seen, trash, stale))
}
