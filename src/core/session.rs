//! Session registry: at most one live session per endpoint.
//!
//! Each endpoint owns a slot guarded by an async mutex, so connecting to one host
//! never waits on another. A session idle for longer than the health-check
//! threshold is pinged before reuse; a failed ping or a transport error
//! invalidates it and the next call reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::remote::{CommandOutput, FileChannel, RemoteConnector, RemoteEndpoint, RemoteSession};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub command_timeout: Duration,
    /// Sessions unused for longer than this are pinged before reuse.
    pub idle_health_check: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            idle_health_check: Duration::from_secs(60),
        }
    }
}

/// Handle to a live session. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    endpoint: RemoteEndpoint,
    inner: Arc<dyn RemoteSession>,
    /// Serializes sub-channel setup; data transfer on open channels is not gated.
    channel_gate: Arc<Mutex<()>>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.id())
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    last_used: Option<Instant>,
}

pub struct SessionManager {
    connector: Arc<dyn RemoteConnector>,
    settings: SessionSettings,
    slots: StdMutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn RemoteConnector>, settings: SessionSettings) -> Self {
        Self {
            connector,
            settings,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn slot(&self, endpoint_id: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(endpoint_id.to_string()).or_default())
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<Slot>>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().cloned().collect()
    }

    /// Existing healthy session for `endpoint`, or a new one.
    pub async fn connect(&self, endpoint: &RemoteEndpoint) -> Result<Session> {
        let slot = self.slot(&endpoint.id());
        let mut slot = slot.lock().await;

        if let Some(existing) = slot.session.clone() {
            let idle = slot.last_used.map(|t| t.elapsed()).unwrap_or_default();
            if idle < self.settings.idle_health_check || ping(&existing).await {
                slot.last_used = Some(Instant::now());
                return Ok(existing);
            }
            info!(endpoint = %endpoint.id(), idle_secs = idle.as_secs(), "Session failed health check, reconnecting");
            slot.session = None;
            close(existing).await;
        }

        let connector = Arc::clone(&self.connector);
        let target = endpoint.clone();
        let inner = tokio::task::spawn_blocking(move || connector.connect(&target))
            .await?
            .inspect_err(|e| warn!(endpoint = %endpoint.id(), error = %e, "Connect failed"))?;

        let session = Session {
            id: Uuid::now_v7(),
            endpoint: endpoint.clone(),
            inner,
            channel_gate: Arc::new(Mutex::new(())),
        };
        info!(endpoint = %endpoint.id(), session = %session.id, "Session opened");
        slot.session = Some(session.clone());
        slot.last_used = Some(Instant::now());
        Ok(session)
    }

    /// Run `command` to completion, a timeout, or cancellation.
    ///
    /// On timeout the command is asked to stop but may still be running remotely,
    /// and the session is dropped so the next call starts on a fresh connection.
    pub async fn run_command(
        &self,
        session: &Session,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let timeout = timeout.unwrap_or(self.settings.command_timeout);
        let stop = cancel.child_token();
        let inner = Arc::clone(&session.inner);
        let (owned, token) = (command.to_string(), stop.clone());
        let handle = tokio::task::spawn_blocking(move || inner.exec(&owned, &token));

        debug!(endpoint = %session.endpoint.id(), command = %command, "Running command");
        let result = tokio::select! {
            joined = tokio::time::timeout(timeout, handle) => match joined {
                Ok(joined) => joined?,
                Err(_) => {
                    stop.cancel();
                    warn!(command = %command, timeout_secs = timeout.as_secs(), "Command timed out");
                    Err(Error::Timeout {
                        command: command.to_string(),
                        after: timeout,
                    })
                }
            },
            _ = cancel.cancelled() => {
                stop.cancel();
                Err(Error::Cancelled)
            }
        };

        match &result {
            Err(e) if e.is_transient() => self.invalidate(session).await,
            _ => self.touch(session).await,
        }
        result
    }

    /// Open a file channel. Channel setup is serialized per session.
    pub async fn open_file_channel(&self, session: &Session) -> Result<Box<dyn FileChannel>> {
        let result = {
            let _gate = session.channel_gate.lock().await;
            let inner = Arc::clone(&session.inner);
            tokio::task::spawn_blocking(move || inner.open_file_channel()).await?
        };
        match &result {
            Err(e) if e.is_transient() => self.invalidate(session).await,
            _ => self.touch(session).await,
        }
        result
    }

    /// Round trip over `session`. `false` invalidates it.
    pub async fn health_check(&self, session: &Session) -> bool {
        let healthy = ping(session).await;
        if healthy {
            self.touch(session).await;
        } else {
            self.invalidate(session).await;
        }
        healthy
    }

    /// Drop `session` from the registry if it is still the live one.
    pub async fn invalidate(&self, session: &Session) {
        let slot = self.slot(&session.endpoint.id());
        let mut slot = slot.lock().await;
        if slot.session.as_ref().is_some_and(|s| s.id == session.id) {
            info!(endpoint = %session.endpoint.id(), session = %session.id, "Invalidating session");
            if let Some(stale) = slot.session.take() {
                close(stale).await;
            }
        }
    }

    async fn touch(&self, session: &Session) {
        let slot = self.slot(&session.endpoint.id());
        let mut slot = slot.lock().await;
        if slot.session.as_ref().is_some_and(|s| s.id == session.id) {
            slot.last_used = Some(Instant::now());
        }
    }

    pub async fn live_sessions(&self) -> usize {
        let mut live = 0;
        for slot in self.all_slots() {
            if slot.lock().await.session.is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn close_all(&self) {
        for slot in self.all_slots() {
            let taken = slot.lock().await.session.take();
            if let Some(session) = taken {
                debug!(endpoint = %session.endpoint.id(), "Closing session");
                close(session).await;
            }
        }
    }
}

async fn ping(session: &Session) -> bool {
    let inner = Arc::clone(&session.inner);
    tokio::task::spawn_blocking(move || inner.ping())
        .await
        .unwrap_or(false)
}

async fn close(session: Session) {
    let inner = session.inner;
    if tokio::task::spawn_blocking(move || inner.close()).await.is_err() {
        warn!("Session close panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::simulated::{ConnectMode, SimulatedConnector, Simulator};

    fn manager(settings: SessionSettings) -> (SessionManager, Simulator) {
        let (connector, sim) = SimulatedConnector::new();
        (SessionManager::new(Arc::new(connector), settings), sim)
    }

    fn endpoint(host: &str) -> RemoteEndpoint {
        RemoteEndpoint::new(host, host, "frappe")
    }

    #[tokio::test]
    async fn reuses_one_session_per_endpoint() {
        let (manager, sim) = manager(SessionSettings::default());
        let a = manager.connect(&endpoint("erp1")).await.unwrap();
        let b = manager.connect(&endpoint("erp1")).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(sim.connect_count(), 1);
        assert_eq!(manager.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn concurrent_connects_share_a_session() {
        let (manager, sim) = manager(SessionSettings::default());
        let manager = Arc::new(manager);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.connect(&endpoint("erp1")).await.unwrap().id() }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(sim.connect_count(), 1);
    }

    #[tokio::test]
    async fn separate_endpoints_get_separate_sessions() {
        let (manager, sim) = manager(SessionSettings::default());
        let (ep1, ep2) = (endpoint("erp1"), endpoint("erp2"));
        let (a, b) = tokio::join!(manager.connect(&ep1), manager.connect(&ep2));
        assert_ne!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(sim.connect_count(), 2);
    }

    #[tokio::test]
    async fn dead_idle_session_is_replaced() {
        let (manager, sim) = manager(SessionSettings {
            idle_health_check: Duration::ZERO,
            ..SessionSettings::default()
        });
        let first = manager.connect(&endpoint("erp1")).await.unwrap();
        sim.kill_sessions();
        let second = manager.connect(&endpoint("erp1")).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(sim.connect_count(), 2);
        assert_eq!(manager.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn failed_health_check_invalidates() {
        let (manager, sim) = manager(SessionSettings::default());
        let session = manager.connect(&endpoint("erp1")).await.unwrap();
        assert!(manager.health_check(&session).await);
        sim.kill_sessions();
        assert!(!manager.health_check(&session).await);
        assert_eq!(manager.live_sessions().await, 0);
    }

    #[tokio::test]
    async fn auth_and_network_failures_are_distinct() {
        let (manager, sim) = manager(SessionSettings::default());
        sim.set_mode(ConnectMode::RejectCredentials);
        let err = manager.connect(&endpoint("erp1")).await.unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
        assert!(!err.is_transient());

        sim.set_mode(ConnectMode::Unreachable);
        let err = manager.connect(&endpoint("erp1")).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn timed_out_session_is_replaced() {
        let (manager, sim) = manager(SessionSettings::default());
        let session = manager.connect(&endpoint("erp1")).await.unwrap();
        sim.delay_commands(Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let err = manager
            .run_command(&session, "bench --site a backup", Some(Duration::from_millis(50)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(manager.live_sessions().await, 0);

        sim.delay_commands(Duration::ZERO);
        let fresh = manager.connect(&endpoint("erp1")).await.unwrap();
        assert_ne!(fresh.id(), session.id());
        let out = manager.run_command(&fresh, "echo ok", None, &cancel).await.unwrap();
        assert!(out.success());
        assert_eq!(sim.connect_count(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_command() {
        let (manager, sim) = manager(SessionSettings::default());
        let session = manager.connect(&endpoint("erp1")).await.unwrap();
        sim.delay_commands(Duration::from_secs(5));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = manager.run_command(&session, "sleep", None, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
