//! Set-level operations: create, list, download, upload, restore.
//!
//! The orchestrator owns the retry state machine around the transfer engine
//! (`pending -> in-progress -> succeeded | needs-retry -> pending | failed`) and
//! is the only writer of the local set index.

use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::grouper::{Grouping, group_into_sets, list_artifacts};
use crate::core::models::{
    ArtifactDescriptor, ArtifactRole, BackupMode, BackupSet, Digest, FailureReason, ProvenanceKey, TaskStatus,
    TransferDirection, TransferOutcome, TransferTask,
};
use crate::core::procedures::{
    LocalRunner, MaintenanceStep, NewSiteArgs, ProcedureCatalog, ProcedureRunner, RestoreArgs, SiteTarget,
    produced_files,
};
use crate::core::progress::ProgressSender;
use crate::core::remote::{FileChannel, LocalChannel};
use crate::core::retry::RetryDecision;
use crate::core::site_config::{ConfigBlob, KeyCarry, carry_forward_key, read_blob};
use crate::core::transfer_engine::TransferEngine;
use crate::core::verifier::{self, ExpectedDigest, VerifyResult};
use crate::db::sets::{self, MemberMark, PriorCopy, SetPresence};
use crate::error::{Error, Result};

/// How one member of a set ended up.
#[derive(Debug, Clone)]
pub struct MemberReport {
    pub file_name: String,
    pub role: ArtifactRole,
    pub destination: PathBuf,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Bytes moved by this operation, across all attempts.
    pub bytes_transferred: u64,
    pub digest: Option<Digest>,
    pub failure: Option<FailureReason>,
    pub cancelled: bool,
}

impl MemberReport {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Result of moving a whole set. Partial success is a status, not an error.
#[derive(Debug, Clone)]
pub struct SetTransferReport {
    pub key: ProvenanceKey,
    pub direction: TransferDirection,
    pub presence: SetPresence,
    pub members: Vec<MemberReport>,
}

impl SetTransferReport {
    pub fn is_complete(&self) -> bool {
        self.presence == SetPresence::Complete
    }

    pub fn failed_members(&self) -> impl Iterator<Item = &MemberReport> {
        self.members.iter().filter(|m| m.failure.is_some())
    }

    pub fn cancelled(&self) -> bool {
        self.members.iter().any(|m| m.cancelled)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.members.iter().map(|m| m.bytes_transferred).sum()
    }
}

#[derive(Clone)]
pub struct RestoreRequest {
    pub target: SiteTarget,
    /// Required when the target site already has a configuration.
    pub overwrite_confirmed: bool,
    /// Re-hash local members against recorded digests first.
    pub verify: bool,
    pub db_root_user: Option<String>,
    pub db_root_password: Option<String>,
    /// Create the site first when it does not exist yet.
    pub create_site: bool,
    /// Administrator password for a created site.
    pub admin_password: Option<String>,
}

impl RestoreRequest {
    pub fn new(target: SiteTarget) -> Self {
        Self {
            target,
            overwrite_confirmed: false,
            verify: true,
            db_root_user: None,
            db_root_password: None,
            create_site: false,
            admin_password: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceResult {
    pub step: MaintenanceStep,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RestoreReport {
    pub key: ProvenanceKey,
    pub verified: Option<VerifyResult>,
    pub key_carry: Option<KeyCarry>,
    pub maintenance: Vec<MaintenanceResult>,
    /// The site did not exist and was created before restoring.
    pub created_site: bool,
}

impl RestoreReport {
    pub fn maintenance_failures(&self) -> impl Iterator<Item = &MaintenanceResult> {
        self.maintenance.iter().filter(|m| m.error.is_some())
    }
}

/// What a local prune removed, newest first.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub kept: Vec<ProvenanceKey>,
    pub removed: Vec<ProvenanceKey>,
    pub bytes_freed: u64,
}

/// The two sides of a set transfer.
#[derive(Clone)]
struct TransferEnds {
    source: Arc<dyn ProcedureRunner>,
    destination: Arc<dyn ProcedureRunner>,
    destination_dir: PathBuf,
    direction: TransferDirection,
}

/// Run `f` against `channel` on the blocking pool and hand the channel back.
async fn on_channel<T, F>(mut channel: Box<dyn FileChannel>, f: F) -> Result<(Box<dyn FileChannel>, T)>
where
    F: FnOnce(&mut dyn FileChannel) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = f(channel.as_mut())?;
        Ok((channel, out))
    })
    .await?
}

fn list_backup_dir(channel: &mut dyn FileChannel, dir: &Path) -> Result<Vec<ArtifactDescriptor>> {
    match list_artifacts(channel, dir) {
        Ok(artifacts) => Ok(artifacts),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Backup directory does not exist yet");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

fn channel_failure(error: Error) -> TransferOutcome {
    match error {
        Error::Cancelled => TransferOutcome::Cancelled,
        e if e.is_transient() => TransferOutcome::NeedsRetry(e.to_string()),
        e => TransferOutcome::Failed(FailureReason::Other(e.to_string())),
    }
}

fn presence_of(reports: &[MemberReport]) -> SetPresence {
    let succeeded = reports.iter().filter(|m| m.succeeded()).count();
    if succeeded == 0 {
        SetPresence::Absent
    } else if succeeded == reports.len() {
        SetPresence::Complete
    } else {
        SetPresence::Partial
    }
}

/// A set with a member that failed in this run is at best partial, whatever the index remembers.
fn confirmed_presence(indexed: SetPresence, members: &[MemberReport]) -> SetPresence {
    match indexed {
        SetPresence::Complete if members.iter().any(|m| m.failure.is_some()) => SetPresence::Partial,
        other => other,
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    ctx: AppContext,
    engine: TransferEngine,
    catalog: ProcedureCatalog,
    progress: ProgressSender,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let engine = TransferEngine::new(ctx.config.engine_settings(), ctx.config.checkpoints());
        let catalog = ProcedureCatalog::new(ctx.config.procedures.clone());
        Self {
            ctx,
            engine,
            catalog,
            progress: ProgressSender::disabled(),
        }
    }

    /// Send transfer progress to `progress` instead of discarding it.
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = progress;
        self
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn catalog(&self) -> &ProcedureCatalog {
        &self.catalog
    }

    fn timeout(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    /// Sites under `bench_path` that have a configuration file.
    pub async fn list_sites(
        &self,
        runner: &dyn ProcedureRunner,
        bench_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let invocation = self.catalog.list_sites(bench_path);
        let output = runner
            .run(&invocation, Self::timeout(self.ctx.config.timeouts.command_secs), cancel)
            .await?;
        let mut sites: Vec<String> = output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        sites.sort();
        Ok(sites)
    }

    /// Bench directories on the runner's host found under the configured search
    /// globs. Only directories with a complete bench layout are returned.
    pub async fn find_benches(&self, runner: &dyn ProcedureRunner, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
        let invocation = self.catalog.find_benches();
        let output = runner
            .run(&invocation, Self::timeout(self.ctx.config.timeouts.command_secs), cancel)
            .await?;
        let benches: BTreeSet<PathBuf> = output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect();
        debug!(host = %runner.describe(), found = benches.len(), "Bench search finished");
        Ok(benches.into_iter().collect())
    }

    /// Fail with a precondition error unless `target` looks like a real installation.
    pub async fn validate_installation(
        &self,
        runner: &dyn ProcedureRunner,
        target: &SiteTarget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let invocation = self.catalog.validate_installation(target);
        match runner
            .run(&invocation, Self::timeout(self.ctx.config.timeouts.command_secs), cancel)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::RemoteProcedure { .. }) => Err(Error::Precondition(format!(
                "{target} on {} is not a valid installation",
                runner.describe()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Sets in the target's backup directory, newest first.
    pub async fn list_sets(&self, runner: &dyn ProcedureRunner, target: &SiteTarget) -> Result<Grouping> {
        let channel = runner.file_channel().await?;
        let dir = target.backup_dir();
        let (_, artifacts) = on_channel(channel, move |c| list_backup_dir(c, &dir)).await?;
        Ok(group_into_sets(artifacts))
    }

    /// Sets in local storage, with digests recorded by earlier downloads attached.
    pub async fn list_local_sets(&self) -> Result<Grouping> {
        let dir = self.ctx.config.storage_path.clone();
        let (_, artifacts) = on_channel(Box::new(LocalChannel::new()), move |c| list_backup_dir(c, &dir)).await?;

        let mut described = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let digest = sets::recorded_digest(&self.ctx.db, &artifact.key, &artifact.file_name).await?;
            described.push(artifact.with_digest(digest));
        }
        Ok(group_into_sets(described))
    }

    pub async fn index_status(&self) -> Result<Vec<sets::IndexedSet>> {
        sets::list_sets(&self.ctx.db).await
    }

    /// Remove a set's artifacts from the runner's host. The local index is untouched.
    pub async fn delete_remote_set(
        &self,
        runner: &dyn ProcedureRunner,
        set: &BackupSet,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let paths: Vec<PathBuf> = set.members().iter().map(|m| m.path.clone()).collect();
        if paths.is_empty() {
            return Ok(());
        }
        let invocation = self.catalog.delete_backup(&paths);
        runner
            .run(&invocation, Self::timeout(self.ctx.config.timeouts.command_secs), cancel)
            .await?;
        info!(set = %set.key(), host = %runner.describe(), members = paths.len(), "Backup set deleted");
        Ok(())
    }

    /// Remove a set from local storage and forget it in the index.
    /// Returns the bytes freed.
    pub async fn delete_local_set(&self, set: &BackupSet) -> Result<u64> {
        let storage = &self.ctx.config.storage_path;
        if let Some(stray) = set.members().iter().find(|m| !m.path.starts_with(storage)) {
            return Err(Error::Precondition(format!(
                "{} is outside local storage {}",
                stray.path.display(),
                storage.display()
            )));
        }

        let mut freed = 0;
        for member in set.members() {
            match tokio::fs::remove_file(&member.path).await {
                Ok(()) => freed += member.size,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        sets::forget_set(&self.ctx.db, set.key()).await?;
        info!(set = %set.key(), bytes = freed, "Local set deleted");
        Ok(freed)
    }

    /// Keep the `keep_latest` newest local sets and delete the rest.
    pub async fn prune_local(&self, keep_latest: usize) -> Result<PruneReport> {
        if keep_latest == 0 {
            return Err(Error::Precondition("refusing to prune every local set; keep at least one".into()));
        }
        let grouping = self.list_local_sets().await?;
        let mut report = PruneReport::default();
        for (index, set) in grouping.sets.iter().enumerate() {
            if index < keep_latest {
                report.kept.push(set.key().clone());
                continue;
            }
            report.bytes_freed += self.delete_local_set(set).await?;
            report.removed.push(set.key().clone());
        }
        info!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            bytes = report.bytes_freed,
            "Local storage pruned"
        );
        Ok(report)
    }

    /// Ask the host to produce a backup, then find the set it produced by listing.
    ///
    /// A timed-out creation may still have finished remotely, so the directory is
    /// re-listed before any retry.
    pub async fn create_backup(
        &self,
        runner: &dyn ProcedureRunner,
        target: &SiteTarget,
        mode: BackupMode,
        cancel: &CancellationToken,
    ) -> Result<BackupSet> {
        let span = info_span!("create_backup", target = %target, mode = mode.as_str());
        self.create_backup_inner(runner, target, mode, cancel)
            .instrument(span)
            .await
    }

    async fn create_backup_inner(
        &self,
        runner: &dyn ProcedureRunner,
        target: &SiteTarget,
        mode: BackupMode,
        cancel: &CancellationToken,
    ) -> Result<BackupSet> {
        self.validate_installation(runner, target, cancel).await?;

        let before: HashSet<ProvenanceKey> = self
            .list_sets(runner, target)
            .await?
            .sets
            .iter()
            .map(|s| s.key().clone())
            .collect();

        let invocation = self.catalog.create_backup(target, mode);
        let timeout = Self::timeout(self.ctx.config.timeouts.create_backup_secs);
        let retry = self.ctx.config.retry;
        let mut attempts = 0;
        let mut hinted = Vec::new();

        loop {
            attempts += 1;
            match runner.run(&invocation, timeout, cancel).await {
                Ok(output) => {
                    hinted = produced_files(&output.stdout_text());
                    break;
                }
                Err(e @ Error::Timeout { .. }) => {
                    warn!(attempt = attempts, error = %e, "Backup creation timed out, checking for output");
                    if self.newest_new_set(runner, target, &before, &[]).await?.is_some() {
                        info!("Backup appeared despite the timeout");
                        break;
                    }
                    match retry.decide(attempts) {
                        RetryDecision::RetryAfter(delay) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => return Err(Error::Cancelled),
                            }
                        }
                        RetryDecision::GiveUp => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match self.newest_new_set(runner, target, &before, &hinted).await? {
            Some(set) => {
                info!(set = %set.key(), members = set.members().len(), "Backup created");
                Ok(set)
            }
            None => Err(Error::RemoteProcedure {
                procedure: invocation.procedure.to_string(),
                status: 0,
                stderr: format!("no new backup set appeared in {}", target.backup_dir().display()),
            }),
        }
    }

    async fn newest_new_set(
        &self,
        runner: &dyn ProcedureRunner,
        target: &SiteTarget,
        before: &HashSet<ProvenanceKey>,
        hinted: &[(ArtifactRole, String)],
    ) -> Result<Option<BackupSet>> {
        let fresh: Vec<BackupSet> = self
            .list_sets(runner, target)
            .await?
            .sets
            .into_iter()
            .filter(|s| !before.contains(s.key()))
            .collect();

        let by_hint = fresh.iter().position(|s| {
            hinted
                .iter()
                .any(|(_, name)| s.members().iter().any(|m| &m.file_name == name))
        });
        // Sets are newest first.
        let index = by_hint.or(if fresh.is_empty() { None } else { Some(0) });
        Ok(index.and_then(|i| fresh.into_iter().nth(i)))
    }

    /// Fetch every member of a remote set into local storage.
    pub async fn download_set(
        &self,
        runner: Arc<dyn ProcedureRunner>,
        set: &BackupSet,
        cancel: &CancellationToken,
    ) -> Result<SetTransferReport> {
        sets::register_set(&self.ctx.db, set).await?;
        let ends = TransferEnds {
            source: runner,
            destination: Arc::new(LocalRunner),
            destination_dir: self.ctx.config.storage_path.clone(),
            direction: TransferDirection::Download,
        };

        let span = info_span!("download_set", set = %set.key());
        let members = self.transfer_set(set, ends, cancel).instrument(span).await?;
        let presence = confirmed_presence(sets::presence(&self.ctx.db, set.key()).await?, &members);
        log_set_result(set.key(), presence, &members);

        Ok(SetTransferReport {
            key: set.key().clone(),
            direction: TransferDirection::Download,
            presence,
            members,
        })
    }

    /// Push every member of a local set into the target's backup directory.
    pub async fn upload_set(
        &self,
        runner: Arc<dyn ProcedureRunner>,
        set: &BackupSet,
        target: &SiteTarget,
        cancel: &CancellationToken,
    ) -> Result<SetTransferReport> {
        let ends = TransferEnds {
            source: Arc::new(LocalRunner),
            destination: runner,
            destination_dir: target.backup_dir(),
            direction: TransferDirection::Upload,
        };

        let span = info_span!("upload_set", set = %set.key(), target = %target);
        let members = self.transfer_set(set, ends, cancel).instrument(span).await?;
        let presence = presence_of(&members);
        log_set_result(set.key(), presence, &members);

        Ok(SetTransferReport {
            key: set.key().clone(),
            direction: TransferDirection::Upload,
            presence,
            members,
        })
    }

    async fn transfer_set(
        &self,
        set: &BackupSet,
        ends: TransferEnds,
        cancel: &CancellationToken,
    ) -> Result<Vec<MemberReport>> {
        let members = set.members().to_vec();
        let workers = self.ctx.config.concurrency.max(1);
        let mut reports = Vec::with_capacity(members.len());

        if workers == 1 {
            for member in members {
                let report = self.run_member(set.key(), member, &ends, cancel).await?;
                let stop = report.cancelled;
                reports.push(report);
                if stop {
                    break;
                }
            }
            return Ok(reports);
        }

        // Configuration goes first; key preservation on restore depends on it.
        let (first, rest): (Vec<_>, Vec<_>) = members
            .into_iter()
            .partition(|m| m.role == ArtifactRole::Configuration);
        for member in first {
            reports.push(self.run_member(set.key(), member, &ends, cancel).await?);
        }

        let permits = Arc::new(Semaphore::new(workers));
        let mut pool = JoinSet::new();
        for member in rest {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::Cancelled)?;
            let (this, ends, cancel, key) = (self.clone(), ends.clone(), cancel.clone(), set.key().clone());
            pool.spawn(async move {
                let _permit = permit;
                this.run_member(&key, member, &ends, &cancel).await
            });
        }
        while let Some(joined) = pool.join_next().await {
            reports.push(joined??);
        }

        reports.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok(reports)
    }

    async fn run_member(
        &self,
        key: &ProvenanceKey,
        member: ArtifactDescriptor,
        ends: &TransferEnds,
        cancel: &CancellationToken,
    ) -> Result<MemberReport> {
        let destination = ends.destination_dir.join(&member.file_name);
        let task = TransferTask::new(member.clone(), destination, ends.direction);
        let report = self.drive_member(task, ends, cancel).await;

        if ends.direction == TransferDirection::Download && !report.cancelled {
            if report.succeeded() {
                let digest = match report.digest.clone() {
                    Some(digest) => Some(digest),
                    None => self.hash_local(&report.destination).await,
                };
                let mark = MemberMark::from_descriptor(&member, digest, report.attempts);
                sets::mark_member_succeeded(&self.ctx.db, key, mark).await?;
            } else if let Some(failure) = &report.failure {
                let prior = match tokio::fs::try_exists(&report.destination).await {
                    Ok(true) => PriorCopy::Kept,
                    _ => PriorCopy::Lost,
                };
                let mark = MemberMark::from_descriptor(&member, None, report.attempts);
                sets::mark_member_failed(&self.ctx.db, key, mark, failure.to_string(), prior).await?;
            }
        }
        Ok(report)
    }

    /// Drive one task to a terminal state or cancellation.
    async fn drive_member(&self, mut task: TransferTask, ends: &TransferEnds, cancel: &CancellationToken) -> MemberReport {
        let retry = self.ctx.config.retry;
        let mut bytes_transferred = 0;
        let mut failure = None;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            task.attempts += 1;
            task.status = TaskStatus::Pending;
            task.last_attempt_bytes = 0;
            let outcome = self.attempt(&mut task, ends, cancel).await;
            bytes_transferred += task.last_attempt_bytes;

            let cause = match outcome {
                TransferOutcome::Succeeded => break,
                TransferOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
                TransferOutcome::NeedsRetry(cause) => cause,
                TransferOutcome::Failed(reason @ FailureReason::Integrity { .. }) => reason.to_string(),
                TransferOutcome::Failed(reason) => {
                    error!(file = %task.source.file_name, reason = %reason, "Transfer failed");
                    task.status = TaskStatus::Failed;
                    failure = Some(reason);
                    break;
                }
            };

            match retry.decide(task.attempts) {
                RetryDecision::RetryAfter(delay) => {
                    task.backoff = Some(delay);
                    warn!(
                        file = %task.source.file_name,
                        attempt = task.attempts,
                        backoff_ms = delay.as_millis() as u64,
                        cause = %cause,
                        "Transfer attempt failed, retrying"
                    );
                    ends.source.check_health().await;
                    ends.destination.check_health().await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            cancelled = true;
                            break;
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    let reason = FailureReason::Exhausted {
                        attempts: task.attempts,
                        cause,
                    };
                    error!(file = %task.source.file_name, reason = %reason, "Giving up on transfer");
                    task.status = TaskStatus::Failed;
                    task.last_error = Some(reason.to_string());
                    failure = Some(reason);
                    break;
                }
            }
        }

        MemberReport {
            file_name: task.source.file_name.clone(),
            role: task.source.role,
            destination: task.destination.clone(),
            status: task.status,
            attempts: task.attempts,
            bytes_transferred,
            digest: task.destination_digest.clone().or(task.source_digest.clone()),
            failure,
            cancelled,
        }
    }

    async fn attempt(&self, task: &mut TransferTask, ends: &TransferEnds, cancel: &CancellationToken) -> TransferOutcome {
        let source = match ends.source.file_channel().await {
            Ok(channel) => channel,
            Err(e) => return channel_failure(e),
        };
        let destination = match ends.destination.file_channel().await {
            Ok(channel) => channel,
            Err(e) => return channel_failure(e),
        };

        match self
            .engine
            .transfer(task.clone(), source, destination, self.progress.clone(), cancel.clone())
            .await
        {
            Ok(run) => {
                *task = run.task;
                run.outcome
            }
            Err(e) => TransferOutcome::Failed(FailureReason::Other(e.to_string())),
        }
    }

    /// Digest of a local file, for members the engine did not hash.
    async fn hash_local(&self, path: &Path) -> Option<Digest> {
        let (path, algorithm) = (path.to_path_buf(), self.ctx.config.digest);
        let hashed = tokio::task::spawn_blocking(move || verifier::digest_file(&path, algorithm)).await;
        match hashed {
            Ok(Ok(digest)) => Some(digest),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not hash downloaded member");
                None
            }
            Err(e) => {
                warn!(error = %e, "Hashing task failed");
                None
            }
        }
    }

    /// Re-hash local members against the digests recorded when they arrived.
    ///
    /// A member with no recorded digest cannot be vouched for and fails verification.
    pub async fn reverify_local(&self, set: &BackupSet) -> Result<VerifyResult> {
        let mut expected = Vec::with_capacity(set.members().len());
        for member in set.members() {
            let digest = match &member.digest {
                Some(digest) => Some(digest.clone()),
                None => sets::recorded_digest(&self.ctx.db, set.key(), &member.file_name).await?,
            };
            match digest {
                Some(digest) => expected.push(ExpectedDigest {
                    path: member.path.clone(),
                    digest,
                    size: member.size,
                }),
                None => {
                    return Err(Error::Precondition(format!(
                        "{} has no recorded digest; download it again or skip verification",
                        member.file_name
                    )));
                }
            }
        }
        verifier::verify_files(&format!("restore {}", set.key()), &expected).await
    }

    /// Replay a local set onto `request.target` through `runner`.
    ///
    /// Nothing is invoked unless the set has a database artifact. The encryption
    /// key is carried forward before any maintenance step runs; maintenance
    /// failures are reported, never fatal.
    pub async fn restore_set(
        &self,
        runner: Arc<dyn ProcedureRunner>,
        set: &BackupSet,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let Some(database) = set.member(ArtifactRole::Database) else {
            return Err(Error::Precondition(format!(
                "backup set {} has no database artifact to restore",
                set.key()
            )));
        };
        let span = info_span!(
            "restore_set",
            set = %set.key(),
            target = %request.target,
            host = %runner.describe()
        );
        self.restore_inner(runner, set, database, request, cancel)
            .instrument(span)
            .await
    }

    async fn restore_inner(
        &self,
        runner: Arc<dyn ProcedureRunner>,
        set: &BackupSet,
        database: &ArtifactDescriptor,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let target = &request.target;
        let site_config = target.site_config();

        let config_path = site_config.clone();
        let (_, existing) = on_channel(runner.file_channel().await?, move |c| Ok(c.stat(&config_path)?)).await?;
        if existing.is_some() && !request.overwrite_confirmed {
            return Err(Error::Precondition(format!(
                "{target} already exists; confirm the overwrite to restore over it"
            )));
        }
        let new_site = match (&existing, request.create_site, &request.admin_password) {
            (Some(_), _, _) => None,
            (None, false, _) => {
                return Err(Error::Precondition(format!(
                    "{target} does not exist; ask for it to be created first"
                )));
            }
            (None, true, None) => {
                return Err(Error::Precondition(format!(
                    "creating {target} needs an administrator password"
                )));
            }
            (None, true, Some(password)) => Some(NewSiteArgs {
                admin_password: password.clone(),
                db_root_user: request.db_root_user.clone(),
                db_root_password: request.db_root_password.clone(),
            }),
        };

        let verified = if request.verify {
            Some(self.reverify_local(set).await?)
        } else {
            None
        };

        let backup_config: Option<ConfigBlob> = match set.member(ArtifactRole::Configuration) {
            Some(member) => {
                let path = member.path.clone();
                let (_, blob) = on_channel(Box::new(LocalChannel::new()), move |c| read_blob(c, &path)).await?;
                blob
            }
            None => None,
        };

        if let Some(args) = &new_site {
            let invocation = self.catalog.new_site(target, args);
            runner
                .run(&invocation, Self::timeout(self.ctx.config.timeouts.restore_secs), cancel)
                .await?;
            info!("Site created");
        }

        let staged_dir = self.stage_members(&runner, set, target, cancel).await?;
        let staged = |m: &ArtifactDescriptor| match &staged_dir {
            Some(dir) => dir.join(&m.file_name),
            None => m.path.clone(),
        };
        let args = RestoreArgs {
            database: staged(database),
            public_files: set.member(ArtifactRole::PublicAssets).map(staged),
            private_files: set.member(ArtifactRole::PrivateAssets).map(staged),
            db_root_user: request.db_root_user.clone(),
            db_root_password: request.db_root_password.clone(),
            force: request.overwrite_confirmed,
        };
        let invocation = self.catalog.restore(target, &args);
        runner
            .run(&invocation, Self::timeout(self.ctx.config.timeouts.restore_secs), cancel)
            .await?;
        info!("Restore procedure finished");

        let key_carry = match backup_config {
            Some(blob) => {
                let destination = site_config.clone();
                let channel = runner.file_channel().await?;
                let (_, carry) = on_channel(channel, move |c| carry_forward_key(&blob, c, &destination)).await?;
                Some(carry)
            }
            None => None,
        };

        let mut maintenance = Vec::with_capacity(MaintenanceStep::ALL.len());
        for step in MaintenanceStep::ALL {
            let invocation = self.catalog.maintenance(target, step);
            let result = runner
                .run(&invocation, Self::timeout(self.ctx.config.timeouts.command_secs), cancel)
                .await;
            let error = match result {
                Ok(_) => None,
                Err(e) => {
                    warn!(step = step.as_str(), error = %e, "Post-restore maintenance failed");
                    Some(e.to_string())
                }
            };
            maintenance.push(MaintenanceResult { step, error });
        }

        Ok(RestoreReport {
            key: set.key().clone(),
            verified,
            key_carry,
            maintenance,
            created_site: new_site.is_some(),
        })
    }

    /// Upload members when procedures run elsewhere. Returns the directory they
    /// were staged in, or `None` when the local paths are usable as-is.
    async fn stage_members(
        &self,
        runner: &Arc<dyn ProcedureRunner>,
        set: &BackupSet,
        target: &SiteTarget,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        if runner.is_local() {
            return Ok(None);
        }

        let report = self.upload_set(Arc::clone(runner), set, target, cancel).await?;
        if report.cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(failed) = report.failed_members().next() {
            let cause = failed.failure.as_ref().map(ToString::to_string).unwrap_or_default();
            return Err(Error::ExhaustedRetries {
                path: failed.destination.clone(),
                attempts: failed.attempts,
                cause,
            });
        }
        Ok(Some(target.backup_dir()))
    }
}

fn log_set_result(key: &ProvenanceKey, presence: SetPresence, members: &[MemberReport]) {
    let failed = members.iter().filter(|m| m.failure.is_some()).count();
    let bytes: u64 = members.iter().map(|m| m.bytes_transferred).sum();
    match presence {
        SetPresence::Complete => info!(set = %key, bytes, "Set transferred"),
        _ => warn!(set = %key, presence = presence.as_str(), failed, bytes, "Set only partially transferred"),
    }
}
