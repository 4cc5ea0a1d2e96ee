//! Single-file transfer between two [`FileChannel`]s.
//!
//! One call runs one attempt to a [`TransferOutcome`]; it never loops on failure.
//! Bytes land in `<destination>.part` and are renamed into place only after
//! verification, so a file at the final destination path is always complete.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::core::checkpoint::{Checkpoint, CheckpointStore};
use crate::core::models::{DigestAlgorithm, FailureReason, TaskStatus, TransferOutcome, TransferTask};
use crate::core::progress::{ProgressPhase, ProgressSender, TaskProgress};
use crate::core::remote::{ChannelWriter, FileChannel, FileStat};
use crate::error::{Result, is_transient_io_error};

/// What to do when the final destination already exists with the source's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingDestinationPolicy {
    /// Compare digests; a mismatch discards the destination and transfers again.
    #[default]
    Reverify,
    /// Accept it as already transferred.
    Trust,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub chunk_size: usize,
    pub digest: DigestAlgorithm,
    /// Hash the source before copying when no digest is known yet.
    pub verify_source_digest: bool,
    pub existing_destination: ExistingDestinationPolicy,
    /// Sync the destination and persist a checkpoint every this many bytes.
    pub checkpoint_every: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            digest: DigestAlgorithm::Sha256,
            verify_source_digest: true,
            existing_destination: ExistingDestinationPolicy::Reverify,
            checkpoint_every: 1024 * 1024,
        }
    }
}

/// Channels and side inputs for one engine call.
pub struct TransferIo<'a> {
    pub source: &'a mut dyn FileChannel,
    pub destination: &'a mut dyn FileChannel,
    pub progress: &'a ProgressSender,
    pub cancel: &'a CancellationToken,
}

/// Everything handed back by [`TransferEngine::transfer`], channels included so
/// the caller can reuse them for the next member.
pub struct TransferRun {
    pub task: TransferTask,
    pub outcome: TransferOutcome,
    pub source: Box<dyn FileChannel>,
    pub destination: Box<dyn FileChannel>,
}

#[derive(Debug, Clone)]
pub struct TransferEngine {
    settings: EngineSettings,
    checkpoints: CheckpointStore,
}

/// Early exit from an attempt with its outcome.
type Step<T> = std::result::Result<T, TransferOutcome>;

#[derive(Clone, Copy)]
enum Side {
    Source,
    Destination,
}

fn io_outcome(side: Side, context: &str, error: &io::Error) -> TransferOutcome {
    let message = format!("{context}: {error}");
    if is_transient_io_error(error) {
        return TransferOutcome::NeedsRetry(message);
    }
    match side {
        Side::Source if error.kind() == ErrorKind::NotFound => {
            TransferOutcome::Failed(FailureReason::SourceMissing(message))
        }
        Side::Source => TransferOutcome::Failed(FailureReason::Other(message)),
        Side::Destination => TransferOutcome::Failed(FailureReason::DestinationUnwritable(message)),
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

impl TransferEngine {
    pub fn new(settings: EngineSettings, checkpoints: CheckpointStore) -> Self {
        Self { settings, checkpoints }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run one attempt on the blocking pool.
    pub async fn transfer(
        &self,
        mut task: TransferTask,
        mut source: Box<dyn FileChannel>,
        mut destination: Box<dyn FileChannel>,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<TransferRun> {
        let engine = self.clone();
        let span = info_span!(
            "transfer",
            source = %task.source_path().display(),
            destination = %task.destination.display()
        );

        let run = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let outcome = engine.transfer_blocking(
                &mut task,
                TransferIo {
                    source: source.as_mut(),
                    destination: destination.as_mut(),
                    progress: &progress,
                    cancel: &cancel,
                },
            );
            TransferRun {
                task,
                outcome,
                source,
                destination,
            }
        })
        .await?;
        Ok(run)
    }

    /// Run one attempt on the current thread and record its effect on `task`.
    ///
    /// `NeedsRetry` and `Cancelled` leave the task `Pending` with a resumable checkpoint.
    pub fn transfer_blocking(&self, task: &mut TransferTask, io: TransferIo<'_>) -> TransferOutcome {
        task.status = TaskStatus::InProgress;
        task.last_attempt_bytes = 0;
        task.last_error = None;
        let start = Instant::now();

        let mut progress = io
            .progress
            .task(task.id, task.source.file_name.clone(), task.total_bytes, task.bytes_confirmed);

        let outcome = match self.attempt(task, io.source, io.destination, &mut progress, io.cancel) {
            Ok(()) => TransferOutcome::Succeeded,
            Err(outcome) => outcome,
        };

        let (status, phase) = match &outcome {
            TransferOutcome::Succeeded => (TaskStatus::Succeeded, ProgressPhase::Succeeded),
            TransferOutcome::Failed(reason) => {
                task.last_error = Some(reason.to_string());
                (TaskStatus::Failed, ProgressPhase::Failed)
            }
            TransferOutcome::NeedsRetry(reason) => {
                task.last_error = Some(reason.clone());
                (TaskStatus::Pending, ProgressPhase::Paused)
            }
            TransferOutcome::Cancelled => (TaskStatus::Pending, ProgressPhase::Paused),
        };
        task.status = status;
        progress.force(phase, task.bytes_confirmed);

        match &outcome {
            TransferOutcome::Succeeded => info!(
                bytes = task.total_bytes,
                written = task.last_attempt_bytes,
                duration_ms = start.elapsed().as_millis() as u64,
                "Transfer complete"
            ),
            TransferOutcome::Cancelled => info!(confirmed = task.bytes_confirmed, "Transfer cancelled"),
            other => warn!(confirmed = task.bytes_confirmed, outcome = ?other, "Transfer attempt did not complete"),
        }
        outcome
    }

    fn attempt(
        &self,
        task: &mut TransferTask,
        source: &mut dyn FileChannel,
        destination: &mut dyn FileChannel,
        progress: &mut TaskProgress,
        cancel: &CancellationToken,
    ) -> Step<()> {
        let source_path = task.source_path().to_path_buf();
        let final_path = task.destination.clone();
        let part = part_path(&final_path);

        let stat = self.stat_source(source, &source_path)?;
        task.total_bytes = stat.size;

        if self.already_present(task, source, destination, &stat, progress)? {
            task.bytes_confirmed = stat.size;
            self.checkpoints.remove(&final_path).ok();
            return Ok(());
        }

        let mut offset = self.resume_offset(task, destination, &stat, &part)?;
        task.bytes_confirmed = offset;

        if task.source_digest.is_none() && self.settings.verify_source_digest {
            progress.force(ProgressPhase::Hashing, offset);
            let digest = source
                .digest(&source_path, self.settings.digest)
                .map_err(|e| io_outcome(Side::Source, "hashing source", &e))?;
            debug!(digest = %digest, "Source digest computed");
            task.source_digest = Some(digest);
        }

        if let Some(parent) = final_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            destination
                .create_dir_all(parent)
                .map_err(|e| io_outcome(Side::Destination, "creating destination directory", &e))?;
        }

        let mut checkpoint = Checkpoint {
            source: source_path.clone(),
            destination: final_path.clone(),
            confirmed_bytes: offset,
            source_size: stat.size,
            source_modified: stat.modified,
            source_digest: task.source_digest.clone(),
            updated_at: Utc::now(),
        };
        self.save_checkpoint(&mut checkpoint, offset)?;

        if offset > 0 {
            info!(offset, total = stat.size, "Resuming transfer");
        }

        let mut reader = source
            .open_read(&source_path, offset)
            .map_err(|e| io_outcome(Side::Source, "opening source", &e))?;
        let mut writer = destination
            .open_write(&part, offset)
            .map_err(|e| io_outcome(Side::Destination, "opening destination", &e))?;

        let mut buffer = vec![0u8; self.settings.chunk_size.max(1)];
        let mut written = offset;

        while written < stat.size {
            if cancel.is_cancelled() {
                self.commit(task, &mut checkpoint, writer.as_mut(), written)?;
                return Err(TransferOutcome::Cancelled);
            }

            let want = buffer.len().min((stat.size - written) as usize);
            let n = match reader.read(&mut buffer[..want]) {
                Ok(0) => {
                    drop(writer);
                    self.discard(destination, &part, &final_path);
                    return Err(TransferOutcome::NeedsRetry(
                        "source shrank during transfer".to_string(),
                    ));
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Keep what already reached the destination so the retry resumes.
                    self.commit(task, &mut checkpoint, writer.as_mut(), written).ok();
                    return Err(io_outcome(Side::Source, "reading source", &e));
                }
            };

            if let Err(e) = writer.write_all(&buffer[..n]) {
                return Err(io_outcome(Side::Destination, "writing destination", &e));
            }
            written += n as u64;
            task.last_attempt_bytes += n as u64;

            if written - checkpoint.confirmed_bytes >= self.settings.checkpoint_every {
                self.commit(task, &mut checkpoint, writer.as_mut(), written)?;
            }
            progress.update(ProgressPhase::Transferring, written);
        }

        let mut trailing = [0u8; 1];
        if matches!(reader.read(&mut trailing), Ok(n) if n > 0) {
            drop(writer);
            self.discard(destination, &part, &final_path);
            return Err(TransferOutcome::NeedsRetry("source grew during transfer".to_string()));
        }
        drop(reader);

        self.commit(task, &mut checkpoint, writer.as_mut(), written)?;
        drop(writer);
        offset = written;

        let after = self.stat_source(source, &source_path)?;
        if after.size != stat.size || after.modified != stat.modified {
            self.discard(destination, &part, &final_path);
            return Err(TransferOutcome::NeedsRetry(
                "source changed during transfer".to_string(),
            ));
        }

        if let Some(expected) = task.source_digest.clone() {
            task.status = TaskStatus::Verifying;
            progress.force(ProgressPhase::Verifying, offset);
            let actual = destination
                .digest(&part, expected.algorithm)
                .map_err(|e| io_outcome(Side::Destination, "hashing destination", &e))?;
            if actual != expected {
                warn!(expected = %expected, actual = %actual, "Destination digest mismatch, discarding");
                self.discard(destination, &part, &final_path);
                task.bytes_confirmed = 0;
                return Err(TransferOutcome::Failed(FailureReason::Integrity {
                    expected,
                    actual: actual.hex,
                }));
            }
            task.destination_digest = Some(actual);
        }

        destination
            .rename(&part, &final_path)
            .map_err(|e| io_outcome(Side::Destination, "finalizing destination", &e))?;
        if let Some(modified) = stat.modified
            && let Err(e) = destination.set_modified(&final_path, modified)
        {
            debug!(error = %e, "Could not preserve modification time");
        }
        if let Err(e) = self.checkpoints.remove(&final_path) {
            warn!(error = %e, "Failed to remove checkpoint");
        }
        Ok(())
    }

    fn stat_source(&self, source: &mut dyn FileChannel, path: &Path) -> Step<FileStat> {
        match source.stat(path) {
            Ok(Some(stat)) if stat.is_file => Ok(stat),
            Ok(Some(_)) => Err(TransferOutcome::Failed(FailureReason::SourceMissing(format!(
                "{} is not a regular file",
                path.display()
            )))),
            Ok(None) => Err(TransferOutcome::Failed(FailureReason::SourceMissing(format!(
                "{} no longer exists",
                path.display()
            )))),
            Err(e) => Err(io_outcome(Side::Source, "reading source metadata", &e)),
        }
    }

    /// Whether the final destination already holds this source.
    fn already_present(
        &self,
        task: &mut TransferTask,
        source: &mut dyn FileChannel,
        destination: &mut dyn FileChannel,
        stat: &FileStat,
        progress: &mut TaskProgress,
    ) -> Step<bool> {
        let existing = match destination.stat(&task.destination) {
            Ok(Some(existing)) if existing.is_file && existing.size == stat.size => existing,
            Ok(_) => return Ok(false),
            Err(e) => return Err(io_outcome(Side::Destination, "reading destination metadata", &e)),
        };

        if self.settings.existing_destination == ExistingDestinationPolicy::Trust {
            debug!(size = existing.size, "Destination already present, trusting it");
            return Ok(true);
        }

        if task.source_digest.is_none() {
            if !self.settings.verify_source_digest {
                debug!("No source digest available, accepting destination by size");
                return Ok(true);
            }
            progress.force(ProgressPhase::Hashing, 0);
            let digest = source
                .digest(task.source_path(), self.settings.digest)
                .map_err(|e| io_outcome(Side::Source, "hashing source", &e))?;
            task.source_digest = Some(digest);
        }
        let Some(expected) = task.source_digest.clone() else {
            return Ok(false);
        };

        progress.force(ProgressPhase::Verifying, 0);
        let actual = destination
            .digest(&task.destination, expected.algorithm)
            .map_err(|e| io_outcome(Side::Destination, "hashing destination", &e))?;
        if actual == expected {
            debug!("Destination already present and verified");
            task.destination_digest = Some(actual);
            return Ok(true);
        }

        warn!(expected = %expected, actual = %actual, "Existing destination differs from source, replacing");
        destination
            .remove(&task.destination)
            .map_err(|e| io_outcome(Side::Destination, "removing stale destination", &e))?;
        Ok(false)
    }

    /// Offset to resume from, discarding partial state that cannot be trusted.
    fn resume_offset(
        &self,
        task: &mut TransferTask,
        destination: &mut dyn FileChannel,
        stat: &FileStat,
        part: &Path,
    ) -> Step<u64> {
        let checkpoint = self.checkpoints.load(&task.destination);
        let part_len = destination
            .stat(part)
            .map_err(|e| io_outcome(Side::Destination, "reading partial destination", &e))?
            .map(|s| s.size);

        let usable = match (&checkpoint, part_len) {
            (Some(cp), Some(len)) => {
                cp.source == task.source.path
                    && cp.matches_source(stat.size, stat.modified)
                    && cp.confirmed_bytes <= len
                    && cp.confirmed_bytes <= stat.size
            }
            _ => false,
        };

        if let (true, Some(cp)) = (usable, &checkpoint) {
            if task.source_digest.is_none() {
                task.source_digest = cp.source_digest.clone();
            }
            return Ok(cp.confirmed_bytes);
        }

        if checkpoint.is_some() || part_len.is_some() {
            info!(part = %part.display(), "Discarding partial destination, source changed or checkpoint missing");
            destination
                .remove(part)
                .map_err(|e| io_outcome(Side::Destination, "removing partial destination", &e))?;
            self.checkpoints.remove(&task.destination).ok();
            // A digest learned against a different source version is stale.
            if checkpoint.is_some() && task.source.digest.is_none() {
                task.source_digest = None;
            }
        }
        Ok(0)
    }

    /// Sync the destination, then record `written` as confirmed.
    fn commit(
        &self,
        task: &mut TransferTask,
        checkpoint: &mut Checkpoint,
        writer: &mut dyn ChannelWriter,
        written: u64,
    ) -> Step<()> {
        writer
            .sync()
            .map_err(|e| io_outcome(Side::Destination, "syncing destination", &e))?;
        self.save_checkpoint(checkpoint, written)?;
        task.bytes_confirmed = written;
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &mut Checkpoint, confirmed: u64) -> Step<()> {
        checkpoint.confirmed_bytes = confirmed;
        checkpoint.updated_at = Utc::now();
        self.checkpoints
            .save(checkpoint)
            .map_err(|e| io_outcome(Side::Destination, "saving checkpoint", &e))
    }

    fn discard(&self, destination: &mut dyn FileChannel, part: &Path, final_path: &Path) {
        if let Err(e) = destination.remove(part) {
            warn!(path = %part.display(), error = %e, "Failed to remove partial destination");
        }
        if let Err(e) = self.checkpoints.remove(final_path) {
            warn!(error = %e, "Failed to remove checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{ArtifactDescriptor, ArtifactRole, ProvenanceKey, TransferDirection};
    use crate::core::remote::LocalChannel;
    use crate::core::verifier::digest_bytes;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _temp: TempDir,
        src_dir: PathBuf,
        dst_dir: PathBuf,
        engine: TransferEngine,
    }

    fn fixture(settings: EngineSettings) -> Fixture {
        let temp = tempdir().unwrap();
        let src_dir = temp.path().join("remote");
        let dst_dir = temp.path().join("local");
        fs::create_dir_all(&src_dir).unwrap();
        let engine = TransferEngine::new(settings, CheckpointStore::new(temp.path().join("cp")));
        Fixture {
            _temp: temp,
            src_dir,
            dst_dir,
            engine,
        }
    }

    fn task_for(f: &Fixture, name: &str, content: &[u8]) -> TransferTask {
        let path = f.src_dir.join(name);
        fs::write(&path, content).unwrap();
        let source = ArtifactDescriptor {
            path,
            file_name: name.to_string(),
            role: ArtifactRole::Database,
            key: ProvenanceKey::new("siteA", "20250909_143022"),
            size: content.len() as u64,
            modified: Utc::now(),
            digest: None,
        };
        TransferTask::new(source, f.dst_dir.join(name), TransferDirection::Download)
    }

    fn run(f: &Fixture, task: &mut TransferTask) -> TransferOutcome {
        let mut src = LocalChannel::new();
        let mut dst = LocalChannel::new();
        f.engine.transfer_blocking(
            task,
            TransferIo {
                source: &mut src,
                destination: &mut dst,
                progress: &ProgressSender::disabled(),
                cancel: &CancellationToken::new(),
            },
        )
    }

    fn small_chunks() -> EngineSettings {
        EngineSettings {
            chunk_size: 1024,
            checkpoint_every: 4096,
            ..EngineSettings::default()
        }
    }

    #[test]
    fn copies_and_verifies() {
        let f = fixture(small_chunks());
        let content = vec![7u8; 10_000];
        let mut task = task_for(&f, "db.sql.gz", &content);

        assert_eq!(run(&f, &mut task), TransferOutcome::Succeeded);
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(fs::read(&task.destination).unwrap(), content);
        assert_eq!(task.destination_digest, Some(digest_bytes(&content, DigestAlgorithm::Sha256)));
        assert!(!part_path(&task.destination).exists());
        assert!(f.engine.checkpoints().load(&task.destination).is_none());
    }

    #[test]
    fn missing_source_fails_without_retry() {
        let f = fixture(small_chunks());
        let mut task = task_for(&f, "db.sql.gz", b"abc");
        fs::remove_file(task.source_path()).unwrap();

        let outcome = run(&f, &mut task);
        assert!(matches!(outcome, TransferOutcome::Failed(FailureReason::SourceMissing(_))));
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let f = fixture(small_chunks());
        let mut task = task_for(&f, "db.sql.gz", &[1u8; 5000]);
        assert_eq!(run(&f, &mut task), TransferOutcome::Succeeded);

        let mut again = TransferTask::new(task.source.clone(), task.destination.clone(), TransferDirection::Download);
        assert_eq!(run(&f, &mut again), TransferOutcome::Succeeded);
        assert_eq!(again.last_attempt_bytes, 0);
    }

    #[test]
    fn stale_destination_is_replaced_under_reverify() {
        let f = fixture(small_chunks());
        let mut task = task_for(&f, "db.sql.gz", b"fresh content");
        fs::create_dir_all(&f.dst_dir).unwrap();
        fs::write(&task.destination, b"stale content").unwrap();

        assert_eq!(run(&f, &mut task), TransferOutcome::Succeeded);
        assert_eq!(fs::read(&task.destination).unwrap(), b"fresh content");
    }

    #[test]
    fn trust_policy_accepts_same_size_destination() {
        let f = fixture(EngineSettings {
            existing_destination: ExistingDestinationPolicy::Trust,
            ..small_chunks()
        });
        let mut task = task_for(&f, "db.sql.gz", b"fresh content");
        fs::create_dir_all(&f.dst_dir).unwrap();
        fs::write(&task.destination, b"stale content").unwrap();

        assert_eq!(run(&f, &mut task), TransferOutcome::Succeeded);
        assert_eq!(fs::read(&task.destination).unwrap(), b"stale content");
    }

    #[test]
    fn wrong_expected_digest_fails_integrity_and_cleans_up() {
        let f = fixture(small_chunks());
        let mut task = task_for(&f, "db.sql.gz", &[3u8; 3000]);
        task.source_digest = Some(digest_bytes(b"something else", DigestAlgorithm::Sha256));

        let outcome = run(&f, &mut task);
        assert!(matches!(outcome, TransferOutcome::Failed(FailureReason::Integrity { .. })));
        assert!(!task.destination.exists());
        assert!(!part_path(&task.destination).exists());
    }

    #[test]
    fn cancellation_leaves_resumable_checkpoint() {
        let f = fixture(small_chunks());
        let content = vec![9u8; 8192];
        let mut task = task_for(&f, "db.sql.gz", &content);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut src = LocalChannel::new();
        let mut dst = LocalChannel::new();
        let outcome = f.engine.transfer_blocking(
            &mut task,
            TransferIo {
                source: &mut src,
                destination: &mut dst,
                progress: &ProgressSender::disabled(),
                cancel: &cancel,
            },
        );
        assert_eq!(outcome, TransferOutcome::Cancelled);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(f.engine.checkpoints().load(&task.destination).is_some());

        assert_eq!(run(&f, &mut task), TransferOutcome::Succeeded);
        assert_eq!(fs::read(&task.destination).unwrap(), content);
    }

    #[test]
    fn changed_source_discards_partial() {
        let f = fixture(small_chunks());
        let mut task = task_for(&f, "db.sql.gz", &[1u8; 4096]);

        // Partial state from a run against an older version of the source.
        fs::create_dir_all(&f.dst_dir).unwrap();
        fs::write(part_path(&task.destination), [0u8; 2048]).unwrap();
        f.engine
            .checkpoints()
            .save(&Checkpoint {
                source: task.source.path.clone(),
                destination: task.destination.clone(),
                confirmed_bytes: 2048,
                source_size: 9999,
                source_modified: None,
                source_digest: None,
                updated_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(run(&f, &mut task), TransferOutcome::Succeeded);
        assert_eq!(task.last_attempt_bytes, 4096);
        assert_eq!(fs::read(&task.destination).unwrap(), vec![1u8; 4096]);
    }

    #[test]
    fn part_suffix_is_appended() {
        assert_eq!(
            part_path(Path::new("/b/db.sql.gz")),
            PathBuf::from("/b/db.sql.gz.part")
        );
    }
}
