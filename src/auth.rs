//! Authentication material
//!
//! Secrets for plain LOGIN and bearer tokens for XOAUTH2. Token
//! acquisition itself lives outside this crate: a token is either
//! passed through from configuration or produced by a user-supplied
//! command, and refreshed tokens are cached ahead of expiry so repeated
//! runs do not shell out every time.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// A LOGIN secret: literal, or the trimmed stdout of a command.
#[derive(Debug, Clone)]
pub enum Secret {
    Raw(String),
    Command(String),
}

impl Secret {
    pub async fn resolve(&self) -> Result<String> {
        match self {
            Self::Raw(secret) => Ok(secret.clone()),
            Self::Command(cmd) => Ok(run_command(cmd).await?.trim().to_string()),
        }
    }
}

/// Where XOAUTH2 bearer tokens come from.
#[derive(Debug, Clone)]
pub enum TokenProvider {
    /// A token obtained elsewhere and passed through as-is.
    Static(String),
    /// A command whose stdout is either a raw token or a JSON object
    /// `{"access_token": "...", "expires_in": 3600}`.
    Command(String),
}

/// Bearer-token source with a refresh-ahead file cache.
///
/// Command-produced tokens are cached until 90% of their lifetime has
/// passed; the cache file holds the expiry epoch on the first line and
/// the token on the second.
#[derive(Debug, Clone)]
pub struct TokenSource {
    provider: TokenProvider,
    cache_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

const fn default_expires_in() -> u64 {
    3600
}

impl TokenSource {
    #[must_use]
    pub const fn new(provider: TokenProvider, cache_file: Option<PathBuf>) -> Self {
        Self {
            provider,
            cache_file,
        }
    }

    /// A currently valid bearer token.
    pub async fn token(&self) -> Result<String> {
        let cmd = match &self.provider {
            TokenProvider::Static(token) => return Ok(token.clone()),
            TokenProvider::Command(cmd) => cmd,
        };

        if let Some(token) = self.cached() {
            debug!("using cached bearer token");
            return Ok(token);
        }

        let output = run_command(cmd).await?;
        let (token, expires_in) = match serde_json::from_str::<TokenResponse>(&output)
        {
            Ok(response) => (response.access_token, response.expires_in),
            Err(_) => (output.trim().to_string(), default_expires_in()),
        };
        if token.is_empty() {
            return Err(Error::Config(
                "token command produced an empty token".to_string(),
            ));
        }

        self.store(&token, expires_in);
        Ok(token)
    }

    fn cached(&self) -> Option<String> {
        let contents = fs::read_to_string(self.cache_file.as_ref()?).ok()?;
        let (expiry, token) = contents.split_once('\n')?;
        let expiry: u64 = expiry.trim().parse().ok()?;
        let token = token.trim();
        if expiry > now_secs() && !token.is_empty() {
            Some(token.to_string())
        } else {
            None
        }
    }

    fn store(&self, token: &str, expires_in: u64) {
        let Some(path) = &self.cache_file else {
            return;
        };
        // Refresh ahead: drop the cache at 90% of the lifetime.
        let expiry = now_secs() + expires_in * 9 / 10;
        if let Err(err) = fs::write(path, format!("{expiry}\n{token}\n")) {
            warn!("cannot cache bearer token at {}: {err}", path.display());
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

async fn run_command(cmd: &str) -> Result<String> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|e| Error::Config(format!("cannot run {cmd:?}: {e}")))?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "{cmd:?} exited with {}",
            output.status
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|e| Error::Config(format!("{cmd:?} produced non-UTF-8 output: {e}")))
}

/// XOAUTH2 SASL authenticator.
///
/// Wire format per the Google/Microsoft XOAUTH2 mechanism:
/// `base64("user=" user "\x01auth=Bearer " token "\x01\x01")`.
#[derive(Debug, Clone)]
pub struct XOAuth2Authenticator {
    username: String,
    access_token: String,
}

impl XOAuth2Authenticator {
    #[must_use]
    pub fn new(username: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            access_token: access_token.into(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let auth_string = format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.username, self.access_token
        );
        BASE64.encode(auth_string).into_bytes()
    }
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = Vec<u8>;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.encode()
    }
}
