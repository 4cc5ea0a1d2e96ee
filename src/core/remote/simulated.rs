//! In-process stand-in for a remote host.
//!
//! "Remote" paths are plain local paths, so tests can lay out a backup directory
//! in a tempdir and point the engine at it. The [`Simulator`] handle scripts
//! command results and injects faults the way a flaky network would.

use chrono::{DateTime, Utc};
use std::io::{self, ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{
    ChannelWriter, CommandOutput, DirEntry, FileChannel, FileStat, LocalChannel, RemoteConnector, RemoteEndpoint,
    RemoteSession,
};
use crate::core::models::{Digest, DigestAlgorithm};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Unreachable,
    RejectCredentials,
}

type Handler = Arc<dyn Fn(&str) -> CommandOutput + Send + Sync>;

struct SimState {
    mode: ConnectMode,
    connects: u64,
    generation: u64,
    /// Absolute source offset at which reads fail, and how many more times.
    read_fault: Option<(u64, u32)>,
    /// Absolute source offset whose byte the next read flips once.
    corruption: Option<u64>,
    handlers: Vec<(String, Handler)>,
    command_delay: Duration,
    commands: Vec<String>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side control handle.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    pub fn set_mode(&self, mode: ConnectMode) {
        lock(&self.state).mode = mode;
    }

    /// The next read that would cross `offset` fails with a connection reset.
    pub fn fail_next_read_after(&self, offset: u64) {
        self.fail_reads_after(offset, 1);
    }

    /// The next `times` reads that would cross `offset` fail with a connection reset.
    pub fn fail_reads_after(&self, offset: u64, times: u32) {
        lock(&self.state).read_fault = (times > 0).then_some((offset, times));
    }

    /// The next read covering `offset` delivers that byte flipped.
    pub fn corrupt_next_read_at(&self, offset: u64) {
        lock(&self.state).corruption = Some(offset);
    }

    /// Commands starting with `prefix` return `output`. Later registrations win.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.respond_with(prefix, move |_| output.clone());
    }

    pub fn respond_with(&self, prefix: &str, handler: impl Fn(&str) -> CommandOutput + Send + Sync + 'static) {
        lock(&self.state).handlers.push((prefix.to_string(), Arc::new(handler)));
    }

    pub fn delay_commands(&self, delay: Duration) {
        lock(&self.state).command_delay = delay;
    }

    /// Drop every live session, as if the network went away.
    pub fn kill_sessions(&self) {
        lock(&self.state).generation += 1;
    }

    pub fn connect_count(&self) -> u64 {
        lock(&self.state).connects
    }

    pub fn commands_run(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }
}

pub struct SimulatedConnector {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedConnector {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimState {
            mode: ConnectMode::Accept,
            connects: 0,
            generation: 0,
            read_fault: None,
            corruption: None,
            handlers: Vec::new(),
            command_delay: Duration::ZERO,
            commands: Vec::new(),
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            Simulator { state },
        )
    }
}

impl RemoteConnector for SimulatedConnector {
    fn connect(&self, endpoint: &RemoteEndpoint) -> Result<Arc<dyn RemoteSession>> {
        let mut state = lock(&self.state);
        state.connects += 1;
        match state.mode {
            ConnectMode::Unreachable => Err(Error::Unreachable {
                endpoint: endpoint.id(),
                cause: "connection refused".to_string(),
            }),
            ConnectMode::RejectCredentials => Err(Error::Authentication {
                endpoint: endpoint.id(),
                cause: "no identity was accepted".to_string(),
            }),
            ConnectMode::Accept => Ok(Arc::new(SimulatedSession {
                state: Arc::clone(&self.state),
                generation: state.generation,
                closed: AtomicBool::new(false),
            })),
        }
    }
}

struct SimulatedSession {
    state: Arc<Mutex<SimState>>,
    generation: u64,
    closed: AtomicBool,
}

impl SimulatedSession {
    fn alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && lock(&self.state).generation == self.generation
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive() {
            Ok(())
        } else {
            Err(Error::Io(io::Error::new(ErrorKind::ConnectionReset, "session dropped")))
        }
    }
}

impl RemoteSession for SimulatedSession {
    fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        self.ensure_alive()?;
        let (delay, handler) = {
            let mut state = lock(&self.state);
            state.commands.push(command.to_string());
            let handler = state
                .handlers
                .iter()
                .rev()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, h)| Arc::clone(h));
            (state.command_delay, handler)
        };

        let started = Instant::now();
        while started.elapsed() < delay {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(match handler {
            Some(handler) => handler(command),
            None => CommandOutput::default(),
        })
    }

    fn open_file_channel(&self) -> Result<Box<dyn FileChannel>> {
        self.ensure_alive()?;
        Ok(Box::new(SimulatedChannel {
            inner: LocalChannel::new(),
            state: Arc::clone(&self.state),
        }))
    }

    fn ping(&self) -> bool {
        self.alive()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

struct SimulatedChannel {
    inner: LocalChannel,
    state: Arc<Mutex<SimState>>,
}

impl FileChannel for SimulatedChannel {
    fn stat(&mut self, path: &Path) -> io::Result<Option<FileStat>> {
        self.inner.stat(path)
    }

    fn list(&mut self, dir: &Path) -> io::Result<Vec<DirEntry>> {
        self.inner.list(dir)
    }

    fn open_read(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn Read + Send>> {
        let reader = self.inner.open_read(path, offset)?;
        let (fail_at, corrupt_at) = {
            let mut state = lock(&self.state);
            let fail_at = match state.read_fault {
                Some((at, left)) if at >= offset => {
                    state.read_fault = (left > 1).then_some((at, left - 1));
                    Some(at)
                }
                _ => None,
            };
            let corrupt_at = match state.corruption {
                Some(at) if at >= offset => state.corruption.take(),
                _ => None,
            };
            (fail_at, corrupt_at)
        };
        Ok(Box::new(FaultyReader {
            inner: reader,
            position: offset,
            fail_at,
            corrupt_at,
        }))
    }

    fn open_write(&mut self, path: &Path, offset: u64) -> io::Result<Box<dyn ChannelWriter>> {
        self.inner.open_write(path, offset)
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn set_modified(&mut self, path: &Path, modified: DateTime<Utc>) -> io::Result<()> {
        self.inner.set_modified(path, modified)
    }

    /// Hashed "host side", so read faults only hit the transfer itself.
    fn digest(&mut self, path: &Path, algorithm: DigestAlgorithm) -> io::Result<Digest> {
        self.inner.digest(path, algorithm)
    }
}

struct FaultyReader {
    inner: Box<dyn Read + Send>,
    position: u64,
    fail_at: Option<u64>,
    corrupt_at: Option<u64>,
}

impl Read for FaultyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut limit = buf.len();
        if let Some(fail_at) = self.fail_at {
            let allowed = fail_at.saturating_sub(self.position);
            if allowed == 0 {
                self.fail_at = None;
                return Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer"));
            }
            limit = limit.min(allowed as usize);
        }
        let n = self.inner.read(&mut buf[..limit])?;
        if let Some(at) = self.corrupt_at
            && (self.position..self.position + n as u64).contains(&at)
        {
            buf[(at - self.position) as usize] ^= 0xff;
            self.corrupt_at = None;
        }
        self.position += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint::new("sim", "sim.local", "frappe")
    }

    #[test]
    fn connect_modes_map_to_distinct_errors() {
        let (connector, sim) = SimulatedConnector::new();
        sim.set_mode(ConnectMode::Unreachable);
        assert!(matches!(connector.connect(&endpoint()), Err(Error::Unreachable { .. })));
        sim.set_mode(ConnectMode::RejectCredentials);
        assert!(matches!(connector.connect(&endpoint()), Err(Error::Authentication { .. })));
        assert_eq!(sim.connect_count(), 2);
    }

    #[test]
    fn scripted_commands_and_history() {
        let (connector, sim) = SimulatedConnector::new();
        sim.respond(
            "echo",
            CommandOutput {
                status: 0,
                stdout: b"/home/frappe\n".to_vec(),
                stderr: Vec::new(),
            },
        );
        let session = connector.connect(&endpoint()).unwrap();
        let out = session.exec("echo $HOME", &CancellationToken::new()).unwrap();
        assert_eq!(out.stdout_text(), "/home/frappe");
        assert_eq!(sim.commands_run(), vec!["echo $HOME".to_string()]);
    }

    #[test]
    fn killed_sessions_fail_ping() {
        let (connector, sim) = SimulatedConnector::new();
        let session = connector.connect(&endpoint()).unwrap();
        assert!(session.ping());
        sim.kill_sessions();
        assert!(!session.ping());
        assert!(session.open_file_channel().is_err());
    }

    #[test]
    fn read_fault_fires_once_at_offset() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("f.bin");
        fs::write(&path, vec![1u8; 100]).unwrap();

        let (connector, sim) = SimulatedConnector::new();
        sim.fail_next_read_after(40);
        let session = connector.connect(&endpoint()).unwrap();
        let mut channel = session.open_file_channel().unwrap();

        let mut reader = channel.open_read(&path, 0).unwrap();
        let mut buf = vec![0u8; 100];
        let mut total = 0;
        let err = loop {
            match reader.read(&mut buf) {
                Ok(n) => total += n,
                Err(e) => break e,
            }
        };
        assert_eq!(total, 40);
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);

        let mut rest = Vec::new();
        channel.open_read(&path, 40).unwrap().read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), 60);
    }

    #[test]
    fn repeated_faults_and_corruption() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("f.bin");
        fs::write(&path, vec![7u8; 100]).unwrap();

        let (connector, sim) = SimulatedConnector::new();
        sim.fail_reads_after(10, 2);
        let session = connector.connect(&endpoint()).unwrap();
        let mut channel = session.open_file_channel().unwrap();
        for _ in 0..2 {
            let mut rest = Vec::new();
            let err = channel.open_read(&path, 10).unwrap().read_to_end(&mut rest).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        }

        sim.corrupt_next_read_at(50);
        let mut all = Vec::new();
        channel.open_read(&path, 10).unwrap().read_to_end(&mut all).unwrap();
        assert_eq!(all.len(), 90);
        assert_eq!(all[40], 7 ^ 0xff);
        assert!(all.iter().enumerate().all(|(i, b)| i == 40 || *b == 7));
    }
}
