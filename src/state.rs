//! Per-(account, folder) sync state
//!
//! Maps a remote UID to the local msgkey, the last flags pushed or
//! observed, and whether the row describes a syncpoint message. The
//! store is a plain record-oriented file: one line per row, fields
//! tab-joined as `<uid>\t<msgkey>\t<flags>\t<'1'|'0'>`.
//!
//! Durability: every logical batch rewrites a sibling temp file, syncs
//! it, and renames it over the store, so a crash leaves either the old
//! or the new contents. Handles are not shared between workers; the
//! engine opens one per (account, folder).

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// One row of sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    /// Server-assigned UID when positive; synthetic (negative) for
    /// messages that originated locally and have not been uploaded.
    pub uid: i64,
    /// Maildir msgkey; empty for syncpoint rows.
    pub msgkey: String,
    /// Flag letters last recorded for this message.
    pub flags: String,
    /// Whether the remote message is a syncpoint.
    pub is_syncpoint: bool,
}

impl StateEntry {
    fn encode(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.uid,
            self.msgkey,
            self.flags,
            if self.is_syncpoint { '1' } else { '0' }
        )
    }

    fn decode(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        let (Some(uid), Some(msgkey), Some(flags), Some(check)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(Error::State(format!("malformed record: {line:?}")));
        };
        let uid = uid
            .parse::<i64>()
            .map_err(|e| Error::State(format!("bad uid in record {line:?}: {e}")))?;
        Ok(Self {
            uid,
            msgkey: msgkey.to_string(),
            flags: flags.to_string(),
            is_syncpoint: check == "1",
        })
    }
}

/// Durable uid → row store for one (account, folder) pair.
pub struct State {
    path: PathBuf,
    rows: BTreeMap<i64, StateEntry>,
}

impl State {
    /// Open a store, loading any existing records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows = match fs::read_to_string(&path) {
            Ok(contents) => {
                let mut rows = BTreeMap::new();
                for line in contents.lines().filter(|l| !l.is_empty()) {
                    let entry = StateEntry::decode(line)?;
                    rows.insert(entry.uid, entry);
                }
                rows
            }
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, rows })
    }

    /// Look up a row by uid.
    #[must_use]
    pub fn get(&self, uid: i64) -> Option<&StateEntry> {
        self.rows.get(&uid)
    }

    /// All rows, in ascending uid order.
    pub fn entries(&self) -> impl Iterator<Item = &StateEntry> {
        self.rows.values()
    }

    /// Insert or replace a row and flush.
    pub fn put(
        &mut self,
        uid: i64,
        msgkey: &str,
        flags: &str,
        is_syncpoint: bool,
    ) -> Result<()> {
        self.rows.insert(
            uid,
            StateEntry {
                uid,
                msgkey: msgkey.to_string(),
                flags: flags.to_string(),
                is_syncpoint,
            },
        );
        self.flush()
    }

    /// Remove a row and flush. A missing uid is a no-op.
    pub fn remove(&mut self, uid: i64) -> Result<()> {
        if self.rows.remove(&uid).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    /// Remove a batch of rows with a single flush.
    pub fn remove_many(&mut self, uids: &[i64]) -> Result<()> {
        let mut changed = false;
        for uid in uids {
            changed |= self.rows.remove(uid).is_some();
        }
        if changed {
            self.flush()?;
        }
        Ok(())
    }

    /// Largest stored uid, 0 when empty.
    #[must_use]
    pub fn max_uid(&self) -> i64 {
        self.rows.keys().next_back().copied().unwrap_or(0)
    }

    /// Smallest stored uid, 0 when empty.
    #[must_use]
    pub fn min_uid(&self) -> i64 {
        self.rows.keys().next().copied().unwrap_or(0)
    }

    fn flush(&self) -> Result<()> {
        let tmp = self.path.with_extension("db.tmp");
        let mut file = File::create(&tmp)?;
        for entry in self.rows.values() {
            writeln!(file, "{}", entry.encode())?;
        }
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Opens per-(account, folder) stores inside one state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Create the state directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The directory holding the store files.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Open the store for one (account, folder) pair. Folder names may
    /// contain the IMAP hierarchy separator; slashes become colons in
    /// the file name.
    pub fn open(&self, account: &str, folder: &str) -> Result<State> {
        let file = format!("{account}-{}.db", folder.replace('/', ":"));
        State::open(self.root.join(file))
    }

    /// Path of the token cache file for an account.
    #[must_use]
    pub fn token_cache(&self, account: &str) -> PathBuf {
        self.root.join(format!("{account}.token"))
    }
}
