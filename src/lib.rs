#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Bidirectional IMAP to Maildir synchronizer.
//!
//! Mirrors remote IMAP folders into local Maildirs, pushes locally
//! observed seen/deleted state back to the server on demand, and
//! uploads messages dropped into a Maildir by another program. Local
//! changes are additionally recorded as self-addressed "syncpoint"
//! messages on the server, so multiple replicas discover each other's
//! actions without talking to one another.

pub mod auth;
pub mod config;
pub mod connection;
mod error;
pub mod flag;
pub mod imap;
pub mod lock;
pub mod maildir;
pub mod state;
pub mod sync;
pub mod syncpoint;

pub use config::{AccountConfig, Auth, Config, MaildirRef, SyncRule, Tls};
pub use error::{Error, Result};
pub use imap::{FetchedMessage, FolderClient, FolderInfo, ImapAccount, OutgoingMessage};
pub use lock::AppLock;
pub use maildir::{MailEntry, Maildir};
pub use state::{State, StateDir, StateEntry};
pub use sync::SyncEngine;
pub use syncpoint::Changes;
