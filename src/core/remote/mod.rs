//! Seams between the engine and whatever actually moves bytes.
//!
//! A [`RemoteConnector`] yields authenticated [`RemoteSession`]s; a session runs
//! commands and hands out [`FileChannel`]s. The local filesystem implements
//! [`FileChannel`] too, so the transfer engine is direction-agnostic.
//!
//! All methods here are blocking. Async callers go through the session manager,
//! which moves them onto the blocking pool.

mod local;
pub mod simulated;
pub mod ssh;

use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::models::{Digest, DigestAlgorithm};
use crate::core::verifier;
use crate::error::Result;

pub use local::LocalChannel;

/// Where and as whom to connect. Built from connection configuration, never mutated.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteEndpoint {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub use_agent: bool,
    /// Key passphrase supplied for this run only.
    #[serde(skip)]
    pub passphrase: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl RemoteEndpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            user: user.into(),
            identity_file: None,
            use_agent: true,
            passphrase: None,
        }
    }

    /// Registry key: one live session per distinct value.
    pub fn id(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("identity_file", &self.identity_file)
            .field("use_agent", &self.use_agent)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl std::fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id())
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_file: bool,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub stat: FileStat,
}

impl DirEntry {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Write half of a channel that can push written bytes to stable storage.
pub trait ChannelWriter: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
}

/// Random-access file operations against one side of a transfer.
pub trait FileChannel: Send {
    /// `Ok(None)` when nothing exists at `path`.
    fn stat(&mut self, path: &Path) -> io::Result<Option<FileStat>>;

    fn list(&mut self, dir: &Path) -> io::Result<Vec<DirEntry>>;

    fn open_read(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn Read + Send>>;

    /// Open for writing positioned at `offset`, discarding anything beyond it.
    fn open_write(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn ChannelWriter>>;

    /// Removing a missing file is not an error.
    fn remove(&mut self, path: &Path) -> io::Result<()>;

    /// Replaces `to` if it exists.
    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()>;

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()>;

    fn set_modified(&mut self, _path: &Path, _modified: DateTime<Utc>) -> io::Result<()> {
        Ok(())
    }

    /// Content digest of `path`. Streams the file through the channel unless the
    /// backend can compute it closer to the data.
    fn digest(&mut self, path: &Path, algorithm: DigestAlgorithm) -> io::Result<Digest> {
        let reader = self.open_read(path, 0)?;
        verifier::digest_reader(reader, algorithm)
    }
}

/// One authenticated connection. Shared across tasks; implementations
/// multiplex sub-channels internally.
pub trait RemoteSession: Send + Sync {
    /// Run `command` to completion. Implementations check `cancel` between
    /// reads and close the channel when it fires.
    fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<CommandOutput>;

    fn open_file_channel(&self) -> Result<Box<dyn FileChannel>>;

    /// Cheap round trip used to decide whether an idle session is still usable.
    fn ping(&self) -> bool;

    fn close(&self);
}

pub trait RemoteConnector: Send + Sync {
    fn connect(&self, endpoint: &RemoteEndpoint) -> Result<Arc<dyn RemoteSession>>;
}

/// Quote a value for inclusion in a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | '@' | '+' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
