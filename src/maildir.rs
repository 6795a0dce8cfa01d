//! Maildir++ message store
//!
//! A single directory tree `root/{new,cur,tmp}` holding one file per
//! message. New messages are written to `tmp/`, synced, then hard-linked
//! into their final location and the tmp file unlinked, so a message
//! never appears half-written. Flags are encoded in the filename after
//! the `:2,` info separator; flag changes are renames.
//!
//! The handle is safe to share across workers: the in-memory table of
//! contents and every mutating filesystem operation live behind one
//! internal lock.

use crate::error::{Error, Result};
use crate::flag;
use gethostname::gethostname;
use std::collections::HashMap;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide counter feeding msgkey generation. Keys stay unique
/// within a process even when several handles point at one directory.
static COUNTER: AtomicU64 = AtomicU64::new(0);

const DIR_MODE: u32 = 0o700;
const MSG_MODE: u32 = 0o600;

/// A message read back from the store: its key, current flags, and the
/// raw RFC 5322 bytes.
#[derive(Debug, Clone)]
pub struct MailEntry {
    pub msgkey: String,
    pub flags: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct TocEntry {
    path: PathBuf,
    flags: String,
}

/// Table of contents: msgkey to on-disk location, built lazily by
/// scanning `new/` and `cur/`.
type Toc = HashMap<String, TocEntry>;

pub struct Maildir {
    root: PathBuf,
    path_new: PathBuf,
    path_cur: PathBuf,
    path_tmp: PathBuf,
    host: String,
    pid: u32,
    toc: Mutex<Option<Toc>>,
}

impl Maildir {
    /// Open a Maildir, creating `new/`, `cur/` and `tmp/` (mode 0o700)
    /// if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let path_new = root.join("new");
        let path_cur = root.join("cur");
        let path_tmp = root.join("tmp");

        let mut builder = DirBuilder::new();
        builder.recursive(true).mode(DIR_MODE);
        for dir in [&path_tmp, &path_new, &path_cur] {
            builder.create(dir)?;
        }

        let host = gethostname()
            .to_string_lossy()
            .replace(['.', ':'], "-");

        Ok(Self {
            root,
            path_new,
            path_cur,
            path_tmp,
            host,
            pid: process::id(),
            toc: Mutex::new(None),
        })
    }

    /// The root of this Maildir.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Store a message, returning its generated msgkey.
    ///
    /// Messages whose flags contain `S` land in `cur/`, everything else
    /// in `new/`. The tmp file is left behind if the final link fails;
    /// an orphaned tmp file is harmless and gets swept externally.
    pub fn add(&self, message: &[u8], flags: &str) -> Result<String> {
        let mut guard = self.toc.lock().unwrap();

        let (key, tmp_path) = loop {
            let key = self.next_key();
            let tmp_path = self.path_tmp.join(&key);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(MSG_MODE)
                .open(&tmp_path)
            {
                Ok(mut file) => {
                    file.write_all(message)?;
                    file.sync_all()?;
                    break (key, tmp_path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        };

        let flags = flag::canonical(flags);
        let dest = self.dest_path(&key, &flags);
        fs::hard_link(&tmp_path, &dest)?;
        fs::remove_file(&tmp_path)?;

        if let Some(toc) = guard.as_mut() {
            toc.insert(
                key.clone(),
                TocEntry {
                    path: dest,
                    flags,
                },
            );
        }

        Ok(key)
    }

    /// Remove a message. Idempotent: an unknown key or an already
    /// missing file is not an error.
    pub fn discard(&self, msgkey: &str) -> Result<()> {
        let mut guard = self.toc.lock().unwrap();
        let toc = self.loaded(&mut guard)?;

        if let Some(entry) = toc.get(msgkey) {
            match fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            toc.remove(msgkey);
        }
        Ok(())
    }

    /// Current flags of a message, or `None` if the key is unknown.
    pub fn get_flags(&self, msgkey: &str) -> Result<Option<String>> {
        let mut guard = self.toc.lock().unwrap();
        let toc = self.loaded(&mut guard)?;
        Ok(toc.get(msgkey).map(|e| e.flags.clone()))
    }

    /// Add flags to a message (union with the existing set). Moves the
    /// file between `new/` and `cur/` when the seen marker appears.
    pub fn add_flags(&self, msgkey: &str, flags: &str) -> Result<()> {
        let mut guard = self.toc.lock().unwrap();
        let toc = self.loaded(&mut guard)?;
        let entry = toc
            .get(msgkey)
            .ok_or_else(|| Error::NotFound(msgkey.to_string()))?;

        let merged = flag::union(&entry.flags, flags);
        if merged == entry.flags {
            return Ok(());
        }
        self.rename_to_flags(toc, msgkey, &merged)
    }

    /// Replace a message's flags exactly.
    pub fn set_flags(&self, msgkey: &str, flags: &str) -> Result<()> {
        let mut guard = self.toc.lock().unwrap();
        let toc = self.loaded(&mut guard)?;
        let entry = toc
            .get(msgkey)
            .ok_or_else(|| Error::NotFound(msgkey.to_string()))?;

        let flags = flag::canonical(flags);
        if flags == entry.flags {
            return Ok(());
        }
        self.rename_to_flags(toc, msgkey, &flags)
    }

    /// Whether a message with this key is present.
    pub fn contains(&self, msgkey: &str) -> Result<bool> {
        let mut guard = self.toc.lock().unwrap();
        let toc = self.loaded(&mut guard)?;
        Ok(toc.contains_key(msgkey))
    }

    /// Snapshot of `(msgkey, flags)` for every known message.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut guard = self.toc.lock().unwrap();
        let toc = self.loaded(&mut guard)?;
        Ok(toc
            .iter()
            .map(|(key, entry)| (key.clone(), entry.flags.clone()))
            .collect())
    }

    /// Snapshot of all known msgkeys.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut guard = self.toc.lock().unwrap();
        let toc = self.loaded(&mut guard)?;
        Ok(toc.keys().cloned().collect())
    }

    /// Read a message back, or `None` if the key is unknown.
    pub fn get(&self, msgkey: &str) -> Result<Option<MailEntry>> {
        let (path, flags) = {
            let mut guard = self.toc.lock().unwrap();
            let toc = self.loaded(&mut guard)?;
            match toc.get(msgkey) {
                Some(entry) => (entry.path.clone(), entry.flags.clone()),
                None => return Ok(None),
            }
        };
        let body = fs::read(path)?;
        Ok(Some(MailEntry {
            msgkey: msgkey.to_string(),
            flags,
            body,
        }))
    }

    /// Drop the cached table of contents; the next operation rescans
    /// the directory.
    pub fn invalidate(&self) {
        *self.toc.lock().unwrap() = None;
    }

    fn loaded<'a>(&self, guard: &'a mut MutexGuard<'_, Option<Toc>>) -> Result<&'a mut Toc> {
        if guard.is_none() {
            let mut toc = Toc::new();
            for dir in [&self.path_new, &self.path_cur] {
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    let (key, flags) = parse_name(&name);
                    toc.insert(
                        key.to_string(),
                        TocEntry {
                            path: entry.path(),
                            flags: flags.to_string(),
                        },
                    );
                }
            }
            **guard = Some(toc);
        }
        Ok(guard.as_mut().expect("toc just loaded"))
    }

    fn next_key(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("{secs}.Q{counter}P{pid}.{host}", pid = self.pid, host = self.host)
    }

    fn dest_path(&self, key: &str, flags: &str) -> PathBuf {
        if flags.is_empty() {
            return self.path_new.join(key);
        }
        let dir = if flag::is_seen(flags) {
            &self.path_cur
        } else {
            &self.path_new
        };
        dir.join(format!("{key}:2,{flags}"))
    }

    fn rename_to_flags(&self, toc: &mut Toc, msgkey: &str, flags: &str) -> Result<()> {
        let entry = toc
            .get(msgkey)
            .ok_or_else(|| Error::NotFound(msgkey.to_string()))?;
        let new_path = self.dest_path(msgkey, flags);
        fs::rename(&entry.path, &new_path)?;
        toc.insert(
            msgkey.to_string(),
            TocEntry {
                path: new_path,
                flags: flags.to_string(),
            },
        );
        Ok(())
    }
}

/// Split a Maildir filename into `(msgkey, flags)`.
///
/// The msgkey is the basename stripped of any `:2,<flags>` suffix.
fn parse_name(name: &str) -> (&str, &str) {
    match name.split_once(':') {
        Some((key, info)) => {
            let flags = info.strip_prefix("2,").unwrap_or("");
            (key, flags)
        }
        None => (name, ""),
    }
}
