//! Synchronizer configuration
//!
//! A TOML file describes the engine settings, the local Maildirs, the
//! IMAP accounts, and the folder-to-Maildir sync rules. Everything is
//! validated up front; a malformed configuration is fatal at startup.

use crate::auth::{Secret, TokenProvider};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default config location, overridable with `NORLESS_CONFIG` (a
/// `.env` file is honored).
#[must_use]
pub fn default_path() -> PathBuf {
    dotenvy::dotenv().ok();
    env::var("NORLESS_CONFIG").map_or_else(
        |_| expand("~/.config/norless.toml"),
        PathBuf::from,
    )
}

/// How the server certificate is verified when TLS is enabled.
#[derive(Debug, Clone)]
pub enum Tls {
    /// Plain TCP, no TLS.
    Plain,
    /// TLS, certificate pinned by its SHA-1 fingerprint
    /// (`AA:BB:...` hex pairs, case-insensitive).
    Fingerprint(String),
    /// TLS, certificate chain verified against a PEM CA bundle.
    CaFile(PathBuf),
}

/// Authentication strategy applied on first use of a session.
#[derive(Debug, Clone)]
pub enum Auth {
    /// Plain LOGIN with a resolved secret.
    Login(Secret),
    /// XOAUTH2 SASL with a bearer token source.
    XOAuth2(TokenProvider),
}

/// One IMAP account. Immutable after startup.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
    pub tls: Tls,
    /// Address matched against `From` when uploading local messages.
    pub from_addr: Option<String>,
    /// Identity written into syncpoints authored here.
    pub replica_id: String,
}

/// A local Maildir referenced by sync rules.
#[derive(Debug, Clone)]
pub struct MaildirRef {
    pub name: String,
    pub path: PathBuf,
    /// Whether messages added locally get uploaded to the remote.
    pub sync_new: bool,
}

/// account + remote folder → local Maildir.
#[derive(Debug, Clone)]
pub struct SyncRule {
    pub account: String,
    pub folder: String,
    pub maildir: Arc<MaildirRef>,
    pub trash: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub fetch_last: u32,
    pub timeout: Duration,
    pub accounts: BTreeMap<String, Arc<AccountConfig>>,
    pub maildirs: BTreeMap<String, Arc<MaildirRef>>,
    pub sync_rules: Vec<SyncRule>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents)
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut maildirs = BTreeMap::new();
        for (name, md) in raw.maildirs {
            maildirs.insert(
                name.clone(),
                Arc::new(MaildirRef {
                    name,
                    path: expand(&md.path),
                    sync_new: md.sync_new,
                }),
            );
        }

        let mut accounts = BTreeMap::new();
        let mut sync_rules = Vec::new();
        for (name, acc) in raw.accounts {
            let auth = acc.auth(&name)?;
            let tls = acc.tls_mode(&name)?;
            let port = acc.port.unwrap_or(match tls {
                Tls::Plain => 143,
                _ => 993,
            });

            for rule in &acc.sync {
                let maildir = maildirs.get(&rule.maildir).ok_or_else(|| {
                    Error::Config(format!(
                        "account {name}: sync rule references unknown maildir {}",
                        rule.maildir
                    ))
                })?;
                sync_rules.push(SyncRule {
                    account: name.clone(),
                    folder: rule.folder.clone(),
                    maildir: Arc::clone(maildir),
                    trash: acc.trash.clone(),
                });
            }

            accounts.insert(
                name.clone(),
                Arc::new(AccountConfig {
                    name: name.clone(),
                    host: acc.host,
                    port,
                    user: acc.user,
                    auth,
                    tls,
                    from_addr: acc.from,
                    replica_id: acc.replica_id,
                }),
            );
        }

        Ok(Self {
            state_dir: expand(&raw.norless.state_dir),
            fetch_last: raw.norless.fetch_last,
            timeout: Duration::from_secs(raw.norless.timeout),
            accounts,
            maildirs,
            sync_rules,
        })
    }

    /// Keep only the named account and its sync rules.
    pub fn restrict_to(&mut self, account: &str) -> Result<()> {
        if !self.accounts.contains_key(account) {
            return Err(Error::Config(format!("no such account: {account}")));
        }
        self.accounts.retain(|name, _| name == account);
        self.sync_rules.retain(|rule| rule.account == account);
        Ok(())
    }

    /// Sync rules grouped by account, preserving rule order.
    #[must_use]
    pub fn rules_by_account(&self) -> BTreeMap<String, Vec<SyncRule>> {
        let mut grouped: BTreeMap<String, Vec<SyncRule>> = BTreeMap::new();
        for rule in &self.sync_rules {
            grouped
                .entry(rule.account.clone())
                .or_default()
                .push(rule.clone());
        }
        grouped
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

const fn default_true() -> bool {
    true
}

const fn default_fetch_last() -> u32 {
    500
}

const fn default_timeout() -> u64 {
    5
}

fn default_trash() -> String {
    "Trash".to_string()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    norless: RawSettings,
    #[serde(default)]
    maildirs: BTreeMap<String, RawMaildir>,
    #[serde(default)]
    accounts: BTreeMap<String, RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    state_dir: String,
    #[serde(default = "default_fetch_last")]
    fetch_last: u32,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct RawMaildir {
    path: String,
    #[serde(default)]
    sync_new: bool,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    user: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_cmd: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    token_cmd: Option<String>,
    #[serde(default = "default_true")]
    tls: bool,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    cafile: Option<String>,
    #[serde(default)]
    from: Option<String>,
    replica_id: String,
    #[serde(default = "default_trash")]
    trash: String,
    #[serde(default)]
    sync: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    folder: String,
    maildir: String,
}

impl RawAccount {
    fn auth(&self, name: &str) -> Result<Auth> {
        let keys = [
            self.password.is_some(),
            self.password_cmd.is_some(),
            self.token.is_some(),
            self.token_cmd.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if keys != 1 {
            return Err(Error::Config(format!(
                "account {name}: exactly one of password, password_cmd, \
                 token, token_cmd must be set"
            )));
        }

        Ok(if let Some(password) = &self.password {
            Auth::Login(Secret::Raw(password.clone()))
        } else if let Some(cmd) = &self.password_cmd {
            Auth::Login(Secret::Command(cmd.clone()))
        } else if let Some(token) = &self.token {
            Auth::XOAuth2(TokenProvider::Static(token.clone()))
        } else if let Some(cmd) = &self.token_cmd {
            Auth::XOAuth2(TokenProvider::Command(cmd.clone()))
        } else {
            unreachable!("auth key count checked above")
        })
    }

    fn tls_mode(&self, name: &str) -> Result<Tls> {
        if !self.tls {
            return Ok(Tls::Plain);
        }
        if let Some(fingerprint) = &self.fingerprint {
            return Ok(Tls::Fingerprint(fingerprint.clone()));
        }
        if let Some(cafile) = &self.cafile {
            return Ok(Tls::CaFile(expand(cafile)));
        }
        Err(Error::Config(format!(
            "account {name}: TLS requires a fingerprint or a cafile"
        )))
    }
}
