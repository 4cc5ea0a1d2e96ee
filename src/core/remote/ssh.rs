//! SSH/SFTP backend built on libssh2.
//!
//! Authentication order: a running key agent first, then an explicit identity
//! file (or the usual `~/.ssh` keys) decrypted with the supplied passphrase.
//!
//! Each session holds two transports to the host. File work runs on a blocking
//! SFTP transport; commands run on a non-blocking one that is polled, so a quiet
//! or chatty command never pins the connection and cancellation takes effect
//! between polls.

use chrono::{DateTime, TimeZone, Utc};
use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ChannelWriter, CommandOutput, DirEntry, FileChannel, FileStat, RemoteConnector, RemoteEndpoint, RemoteSession,
    shell_quote,
};
use crate::core::models::{Digest, DigestAlgorithm};
use crate::core::verifier;
use crate::error::{Error, Result};

/// SFTP read/write buffer (32KB, the protocol's usual packet payload).
const SFTP_BUFFER_SIZE: usize = 32 * 1024;

const DEFAULT_KEYS: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// Command output read buffer.
const EXEC_BUFFER_SIZE: usize = 16 * 1024;

// Poll back-off while a command is quiet.
const MIN_POLL: Duration = Duration::from_millis(1);
const MAX_POLL: Duration = Duration::from_millis(20);

/// How long a cancelled command gets to acknowledge the channel close.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

// libssh2 session error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_CHANNEL_FAILURE: i32 = -21;
const LIBSSH2_ERROR_CHANNEL_CLOSED: i32 = -26;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;
const LIBSSH2_FX_NO_CONNECTION: i32 = 6;
const LIBSSH2_FX_CONNECTION_LOST: i32 = 7;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

/// Asks the operator for a key passphrase when none was supplied.
pub trait PassphrasePrompt: Send + Sync {
    fn passphrase(&self, key: &Path) -> Option<String>;
}

pub struct SshConnector {
    connect_timeout: Duration,
    keepalive: Duration,
    prompt: Option<Arc<dyn PassphrasePrompt>>,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, keepalive: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PassphrasePrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    fn open_tcp(&self, endpoint: &RemoteEndpoint) -> Result<TcpStream> {
        let unreachable = |cause: String| Error::Unreachable {
            endpoint: endpoint.id(),
            cause,
        };
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| unreachable(format!("cannot resolve {}: {e}", endpoint.host)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => last_error = Some(e),
            }
        }
        Err(unreachable(match last_error {
            Some(e) => e.to_string(),
            None => format!("{} resolved to no addresses", endpoint.host),
        }))
    }

    /// Returns the passphrase that unlocked the accepted key, if one was needed.
    fn authenticate(&self, session: &Session, endpoint: &RemoteEndpoint) -> Result<Option<String>> {
        let mut attempts: Vec<String> = Vec::new();

        if endpoint.use_agent {
            match session.userauth_agent(&endpoint.user) {
                Ok(()) if session.authenticated() => {
                    debug!(endpoint = %endpoint.id(), "Authenticated with key agent");
                    return Ok(None);
                }
                Ok(()) => attempts.push("agent: no identity accepted".to_string()),
                Err(e) => attempts.push(format!("agent: {}", e.message())),
            }
        }

        for key in candidate_keys(endpoint) {
            let mut passphrase = endpoint.passphrase.clone();
            let mut prompted = false;
            loop {
                match session.userauth_pubkey_file(&endpoint.user, None, &key, passphrase.as_deref()) {
                    Ok(()) if session.authenticated() => {
                        debug!(endpoint = %endpoint.id(), key = %key.display(), "Authenticated with identity file");
                        return Ok(passphrase);
                    }
                    Ok(()) => {
                        attempts.push(format!("{}: not accepted", key.display()));
                        break;
                    }
                    Err(e) => {
                        attempts.push(format!("{}: {}", key.display(), e.message()));
                        // An encrypted key without a passphrase fails locally; ask once.
                        let needs_passphrase = passphrase.is_none() && !prompted;
                        match (&self.prompt, needs_passphrase) {
                            (Some(prompt), true) => {
                                prompted = true;
                                passphrase = prompt.passphrase(&key);
                                if passphrase.is_none() {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                }
            }
        }

        if attempts.is_empty() {
            attempts.push("no agent and no identity file available".to_string());
        }
        Err(Error::Authentication {
            endpoint: endpoint.id(),
            cause: attempts.join("; "),
        })
    }
}

fn candidate_keys(endpoint: &RemoteEndpoint) -> Vec<PathBuf> {
    if let Some(key) = &endpoint.identity_file {
        return vec![expand_local_home(key)];
    }
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_KEYS
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|p| p.exists())
        .collect()
}

fn expand_local_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl SshConnector {
    fn open_session(&self, endpoint: &RemoteEndpoint) -> Result<(Session, Option<String>)> {
        let tcp = self.open_tcp(endpoint)?;
        let mut session = Session::new().map_err(|e| Error::Unreachable {
            endpoint: endpoint.id(),
            cause: e.message().to_string(),
        })?;
        session.set_tcp_stream(tcp);
        session.set_compress(true);
        session.handshake().map_err(|e| Error::Unreachable {
            endpoint: endpoint.id(),
            cause: format!("handshake failed: {}", e.message()),
        })?;

        let passphrase = self.authenticate(&session, endpoint)?;
        session.set_keepalive(true, self.keepalive.as_secs().max(1) as u32);
        Ok((session, passphrase))
    }
}

impl RemoteConnector for SshConnector {
    fn connect(&self, endpoint: &RemoteEndpoint) -> Result<Arc<dyn RemoteSession>> {
        let (files, passphrase) = self.open_session(endpoint)?;

        // The second handshake reuses the passphrase so the operator is asked once.
        let mut again = endpoint.clone();
        if passphrase.is_some() {
            again.passphrase = passphrase;
        }
        let (commands, _) = self.open_session(&again)?;
        commands.set_blocking(false);

        info!(endpoint = %endpoint.id(), "SSH session established");
        Ok(Arc::new(SshSession {
            files,
            commands,
            endpoint: endpoint.id(),
            home: std::sync::OnceLock::new(),
        }))
    }
}

pub struct SshSession {
    /// Blocking transport for SFTP and host-side hashing.
    files: Session,
    /// Non-blocking transport for commands.
    commands: Session,
    endpoint: String,
    home: std::sync::OnceLock<Option<PathBuf>>,
}

fn would_block(error: &ssh2::Error) -> bool {
    matches!(error.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Sleep a little longer each time nothing happened.
fn pause(idle: &mut u32) {
    let step = MIN_POLL.saturating_mul(1 << (*idle).min(5));
    std::thread::sleep(step.min(MAX_POLL));
    *idle += 1;
}

/// Repeat a non-blocking libssh2 call until it stops asking to be retried.
fn until_ready<T>(
    cancel: &CancellationToken,
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> Result<T> {
    let mut idle = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if would_block(&e) => {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                pause(&mut idle);
            }
            Err(e) => return Err(Error::Io(io_error(e))),
        }
    }
}

/// Read whatever `reader` has buffered into `sink` without waiting for more.
fn read_available(reader: &mut impl Read, buf: &mut [u8], sink: &mut Vec<u8>) -> io::Result<usize> {
    let mut total = 0;
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                sink.extend_from_slice(&buf[..n]);
                total += n;
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

/// Drain both streams of `channel` once.
fn drain(channel: &mut ssh2::Channel, buf: &mut [u8], stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) -> io::Result<usize> {
    let out = read_available(channel, buf, stdout)?;
    let err = read_available(&mut channel.stderr(), buf, stderr)?;
    Ok(out + err)
}

/// Close a channel whose command is being abandoned. Best effort.
fn abandon(channel: &mut ssh2::Channel) {
    let started = Instant::now();
    let mut idle = 0;
    while started.elapsed() < CLOSE_GRACE {
        match channel.close() {
            Err(e) if would_block(&e) => pause(&mut idle),
            Err(e) => {
                debug!(error = %e.message(), "Closing abandoned channel failed");
                return;
            }
            Ok(()) => return,
        }
    }
}

impl SshSession {
    fn run(&self, command: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let mut channel = until_ready(cancel, || self.commands.channel_session())?;
        if let Err(e) = until_ready(cancel, || channel.exec(command)) {
            abandon(&mut channel);
            return Err(e);
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; EXEC_BUFFER_SIZE];
        let mut idle = 0;
        loop {
            if cancel.is_cancelled() {
                abandon(&mut channel);
                return Err(Error::Cancelled);
            }
            if drain(&mut channel, &mut buf, &mut stdout, &mut stderr)? > 0 {
                idle = 0;
                continue;
            }
            if channel.eof() {
                // Data can land between the last read and the EOF flag.
                drain(&mut channel, &mut buf, &mut stdout, &mut stderr)?;
                break;
            }
            pause(&mut idle);
        }

        until_ready(cancel, || channel.wait_close())?;
        let status = channel.exit_status().map_err(|e| Error::Io(io_error(e)))?;
        Ok(CommandOutput { status, stdout, stderr })
    }

    /// Remote home directory, learned once per session.
    fn remote_home(&self) -> Option<PathBuf> {
        self.home
            .get_or_init(|| match self.run("echo $HOME", &CancellationToken::new()) {
                Ok(out) if out.success() && !out.stdout_text().is_empty() => Some(PathBuf::from(out.stdout_text())),
                Ok(_) => None,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Could not resolve remote home");
                    None
                }
            })
            .clone()
    }
}

impl RemoteSession for SshSession {
    fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        debug!(endpoint = %self.endpoint, command = %command, "Running remote command");
        self.run(command, cancel)
    }

    fn open_file_channel(&self) -> Result<Box<dyn FileChannel>> {
        let sftp = self.files.sftp().map_err(|e| Error::Io(io_error(e)))?;
        Ok(Box::new(SftpChannel {
            sftp,
            session: self.files.clone(),
            home: self.remote_home(),
        }))
    }

    fn ping(&self) -> bool {
        if self.files.keepalive_send().is_err() {
            return false;
        }
        match self.commands.keepalive_send() {
            Err(e) if !would_block(&e) => return false,
            _ => {}
        }
        match self.files.channel_session() {
            Ok(mut channel) => channel.close().is_ok(),
            Err(_) => false,
        }
    }

    fn close(&self) {
        for transport in [&self.commands, &self.files] {
            if let Err(e) = transport.disconnect(None, "closing", None) {
                debug!(endpoint = %self.endpoint, error = %e, "Disconnect failed");
            }
        }
    }
}

/// Map a libssh2 failure onto the `io::ErrorKind` the engine classifies on.
fn io_error(error: ssh2::Error) -> io::Error {
    let kind = match error.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_SOCKET_DISCONNECT
            | LIBSSH2_ERROR_SOCKET_RECV
            | LIBSSH2_ERROR_CHANNEL_FAILURE
            | LIBSSH2_ERROR_CHANNEL_CLOSED,
        ) => ErrorKind::ConnectionReset,
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT) => ErrorKind::TimedOut,
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => ErrorKind::PermissionDenied,
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE | LIBSSH2_FX_NO_SUCH_PATH) => ErrorKind::NotFound,
        ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) => ErrorKind::PermissionDenied,
        ErrorCode::SFTP(LIBSSH2_FX_NO_CONNECTION | LIBSSH2_FX_CONNECTION_LOST) => ErrorKind::ConnectionAborted,
        _ => ErrorKind::Other,
    };
    io::Error::new(kind, error.message().to_string())
}

fn to_stat(stat: &ssh2::FileStat) -> FileStat {
    FileStat {
        size: stat.size.unwrap_or(0),
        modified: stat
            .mtime
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
        is_file: stat.is_file(),
        is_dir: stat.is_dir(),
    }
}

fn empty_stat() -> ssh2::FileStat {
    ssh2::FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: None,
        atime: None,
        mtime: None,
    }
}

pub struct SftpChannel {
    sftp: Sftp,
    session: Session,
    home: Option<PathBuf>,
}

impl SftpChannel {
    /// SFTP has no notion of `~`; resolve it against the remote home.
    fn resolve(&self, path: &Path) -> PathBuf {
        match (path.strip_prefix("~"), &self.home) {
            (Ok(rest), Some(home)) => home.join(rest),
            _ => path.to_path_buf(),
        }
    }

    fn remote_digest(&self, path: &Path, algorithm: DigestAlgorithm) -> Option<Digest> {
        let tool = match algorithm {
            DigestAlgorithm::Sha256 => "sha256sum",
            DigestAlgorithm::Blake3 => "b3sum",
        };
        let command = format!("{tool} -- {}", shell_quote(&path.to_string_lossy()));
        let mut channel = self.session.channel_session().ok()?;
        channel.exec(&command).ok()?;
        let mut out = String::new();
        channel.read_to_string(&mut out).ok()?;
        channel.wait_close().ok()?;
        if channel.exit_status().ok()? != 0 {
            return None;
        }
        Digest::parse_tool_output(algorithm, &out)
    }
}

struct SftpWriter {
    file: ssh2::File,
}

impl Write for SftpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ChannelWriter for SftpWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        // Not every server implements fsync@openssh.com; flushed writes are acknowledged.
        if let Err(e) = self.file.fsync() {
            debug!(error = %e.message(), "Remote fsync unsupported");
        }
        Ok(())
    }
}

impl FileChannel for SftpChannel {
    fn stat(&mut self, path: &Path) -> io::Result<Option<FileStat>> {
        match self.sftp.stat(&self.resolve(path)) {
            Ok(stat) => Ok(Some(to_stat(&stat))),
            Err(e) => {
                let e = io_error(e);
                if e.kind() == ErrorKind::NotFound { Ok(None) } else { Err(e) }
            }
        }
    }

    fn list(&mut self, dir: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries: Vec<DirEntry> = self
            .sftp
            .readdir(&self.resolve(dir))
            .map_err(io_error)?
            .into_iter()
            .map(|(path, stat)| DirEntry {
                path,
                stat: to_stat(&stat),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn open_read(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let mut file = self.sftp.open(&self.resolve(path)).map_err(io_error)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Box::new(io::BufReader::with_capacity(SFTP_BUFFER_SIZE, file)))
    }

    fn open_write(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn ChannelWriter>> {
        let path = self.resolve(path);
        let mut file = self
            .sftp
            .open_mode(&path, OpenFlags::WRITE | OpenFlags::CREATE, 0o644, OpenType::File)
            .map_err(io_error)?;
        let mut truncate = empty_stat();
        truncate.size = Some(offset);
        file.setstat(truncate).map_err(io_error)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(SftpWriter { file }))
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        match self.sftp.unlink(&self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = io_error(e);
                if e.kind() == ErrorKind::NotFound { Ok(()) } else { Err(e) }
            }
        }
    }

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        let (from, to) = (self.resolve(from), self.resolve(to));
        let flags = Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE);
        if self.sftp.rename(&from, &to, flags).is_ok() {
            return Ok(());
        }
        // SFTPv3 servers refuse to replace an existing target.
        self.remove(&to)?;
        self.sftp.rename(&from, &to, None).map_err(io_error)
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        let path = self.resolve(path);
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if let Some(stat) = self.stat(&current)? {
                if stat.is_dir {
                    continue;
                }
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", current.display()),
                ));
            }
            self.sftp.mkdir(&current, 0o755).map_err(io_error)?;
        }
        Ok(())
    }

    fn set_modified(&mut self, path: &Path, modified: DateTime<Utc>) -> io::Result<()> {
        let mut stat = empty_stat();
        let secs = modified.timestamp().max(0) as u64;
        stat.atime = Some(secs);
        stat.mtime = Some(secs);
        self.sftp.setstat(&self.resolve(path), stat).map_err(io_error)
    }

    /// Prefer hashing on the host; stream the file only if the tool is missing.
    fn digest(&mut self, path: &Path, algorithm: DigestAlgorithm) -> io::Result<Digest> {
        let path = self.resolve(path);
        if let Some(digest) = self.remote_digest(&path, algorithm) {
            return Ok(digest);
        }
        debug!(path = %path.display(), "Remote digest tool unavailable, streaming");
        let reader = self.open_read(&path, 0)?;
        verifier::digest_reader(reader, algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_identity_file_wins_over_defaults() {
        let mut ep = RemoteEndpoint::new("prod", "erp.example.com", "frappe");
        ep.identity_file = Some(PathBuf::from("/keys/deploy_ed25519"));
        assert_eq!(candidate_keys(&ep), vec![PathBuf::from("/keys/deploy_ed25519")]);
    }

    #[test]
    fn unresolvable_host_is_unreachable_not_auth() {
        let connector = SshConnector::new(Duration::from_millis(200), Duration::from_secs(30));
        let ep = RemoteEndpoint::new("bad", "host.invalid", "frappe");
        match connector.connect(&ep) {
            Err(Error::Unreachable { endpoint, .. }) => assert_eq!(endpoint, "frappe@host.invalid:22"),
            Err(other) => panic!("expected unreachable, got {other}"),
            Ok(_) => panic!("connect to .invalid host succeeded"),
        }
    }

    /// Yields scripted reads, then reports that nothing more is ready.
    struct Trickle(Vec<io::Result<Vec<u8>>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "drained"));
            }
            let bytes = self.0.remove(0)?;
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }
    }

    #[test]
    fn read_available_returns_at_would_block() {
        let mut reader = Trickle(vec![Ok(b"Config: a\n".to_vec()), Ok(b"Database: b\n".to_vec())]);
        let mut sink = Vec::new();
        let mut buf = [0u8; 64];
        let n = read_available(&mut reader, &mut buf, &mut sink).unwrap();
        assert_eq!(n, sink.len());
        assert_eq!(sink, b"Config: a\nDatabase: b\n");
        assert_eq!(read_available(&mut reader, &mut buf, &mut sink).unwrap(), 0);
    }

    #[test]
    fn read_available_surfaces_transport_errors() {
        let mut reader = Trickle(vec![
            Ok(b"partial".to_vec()),
            Err(io::Error::new(ErrorKind::ConnectionReset, "reset")),
        ]);
        let mut sink = Vec::new();
        let err = read_available(&mut reader, &mut [0u8; 64], &mut sink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert_eq!(sink, b"partial");
    }

    #[test]
    fn poll_backoff_is_capped() {
        let mut idle = 40;
        let started = Instant::now();
        pause(&mut idle);
        assert_eq!(idle, 41);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn timestamps_convert_from_epoch_seconds() {
        let mut stat = empty_stat();
        stat.size = Some(42);
        stat.mtime = Some(1_757_426_473);
        let converted = to_stat(&stat);
        assert_eq!(converted.size, 42);
        assert_eq!(converted.modified.unwrap().timestamp(), 1_757_426_473);
    }
}
