use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Layout of the creation timestamp token in artifact file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Functional category of one artifact within a backup set.
///
/// The declaration order is the role precedence used for ordering members,
/// transfers and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactRole {
    Database,
    Configuration,
    PublicAssets,
    PrivateAssets,
    Unclassified,
}

impl ArtifactRole {
    pub const ALL: [ArtifactRole; 5] = [
        ArtifactRole::Database,
        ArtifactRole::Configuration,
        ArtifactRole::PublicAssets,
        ArtifactRole::PrivateAssets,
        ArtifactRole::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Configuration => "configuration",
            Self::PublicAssets => "public-assets",
            Self::PrivateAssets => "private-assets",
            Self::Unclassified => "unclassified",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == s)
    }
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (origin identity, creation timestamp) pair shared by every member of a set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProvenanceKey {
    pub origin: String,
    pub timestamp: String,
}

impl ProvenanceKey {
    pub fn new(origin: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            timestamp: timestamp.into(),
        }
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()
    }
}

impl fmt::Display for ProvenanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.origin, self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }

    /// Length of the lowercase hex rendering of a digest.
    pub fn hex_len(&self) -> usize {
        64
    }
}

/// Content digest of one file, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl Digest {
    pub fn new(algorithm: DigestAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Parse the first token of `sha256sum`/`b3sum` style output.
    pub fn parse_tool_output(algorithm: DigestAlgorithm, output: &str) -> Option<Self> {
        let token = output.split_whitespace().next()?;
        let valid = token.len() == algorithm.hex_len() && token.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| Self::new(algorithm, token))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// One physical backup file as seen in a listing snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub path: PathBuf,
    pub file_name: String,
    pub role: ArtifactRole,
    pub key: ProvenanceKey,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub digest: Option<Digest>,
}

impl ArtifactDescriptor {
    /// Same file, with a digest learned elsewhere (e.g. the local index).
    pub fn with_digest(self, digest: Option<Digest>) -> Self {
        Self { digest, ..self }
    }
}

/// What a creation request asks the remote side to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Database,
    Files,
    Complete,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Files => "files",
            Self::Complete => "complete",
        }
    }
}

/// Artifacts sharing one provenance key, ordered by role precedence.
///
/// Built once from a listing snapshot; a later listing yields a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSet {
    key: ProvenanceKey,
    members: Vec<ArtifactDescriptor>,
}

impl BackupSet {
    pub(crate) fn new(key: ProvenanceKey, mut members: Vec<ArtifactDescriptor>) -> Self {
        members.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.file_name.cmp(&b.file_name)));
        Self { key, members }
    }

    pub fn key(&self) -> &ProvenanceKey {
        &self.key
    }

    pub fn members(&self) -> &[ArtifactDescriptor] {
        &self.members
    }

    pub fn member(&self, role: ArtifactRole) -> Option<&ArtifactDescriptor> {
        self.members.iter().find(|m| m.role == role)
    }

    /// A set is restorable on its own once it holds a database artifact.
    pub fn is_complete(&self) -> bool {
        self.member(ArtifactRole::Database).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.missing_roles().is_empty()
    }

    /// Roles a full set would have that this one lacks.
    pub fn missing_roles(&self) -> Vec<ArtifactRole> {
        [
            ArtifactRole::Database,
            ArtifactRole::Configuration,
            ArtifactRole::PublicAssets,
            ArtifactRole::PrivateAssets,
        ]
        .into_iter()
        .filter(|role| self.member(*role).is_none())
        .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.members.iter().map(|m| m.size).sum()
    }
}

/// Which way bytes flow for a task. Informational; the engine itself only sees channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Verifying,
    Succeeded,
    Failed,
}

/// Mutable state of one file move. Owned by whoever drives the engine.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: Uuid,
    pub source: ArtifactDescriptor,
    pub destination: PathBuf,
    pub direction: TransferDirection,
    pub bytes_confirmed: u64,
    pub total_bytes: u64,
    pub source_digest: Option<Digest>,
    pub destination_digest: Option<Digest>,
    pub attempts: u32,
    pub backoff: Option<Duration>,
    pub status: TaskStatus,
    /// Bytes written by the most recent engine invocation only.
    pub last_attempt_bytes: u64,
    pub last_error: Option<String>,
}

impl TransferTask {
    pub fn new(source: ArtifactDescriptor, destination: impl Into<PathBuf>, direction: TransferDirection) -> Self {
        Self {
            id: Uuid::now_v7(),
            total_bytes: source.size,
            source_digest: source.digest.clone(),
            source,
            destination: destination.into(),
            direction,
            bytes_confirmed: 0,
            destination_digest: None,
            attempts: 0,
            backoff: None,
            status: TaskStatus::Pending,
            last_attempt_bytes: 0,
            last_error: None,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source.path
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Integrity { expected: Digest, actual: String },
    SourceMissing(String),
    DestinationUnwritable(String),
    Exhausted { attempts: u32, cause: String },
    Other(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integrity { expected, actual } => {
                write!(f, "integrity: expected {expected}, found {actual}")
            }
            Self::SourceMissing(msg) => write!(f, "source missing: {msg}"),
            Self::DestinationUnwritable(msg) => write!(f, "destination unwritable: {msg}"),
            Self::Exhausted { attempts, cause } => {
                write!(f, "exhausted after {attempts} attempt(s): {cause}")
            }
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

/// Result of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Succeeded,
    Failed(FailureReason),
    NeedsRetry(String),
    /// Stopped on request; the checkpoint is left resumable.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(role: ArtifactRole, name: &str) -> ArtifactDescriptor {
        ArtifactDescriptor {
            path: PathBuf::from(format!("/backups/{name}")),
            file_name: name.to_string(),
            role,
            key: ProvenanceKey::new("siteA", "20250909_143022"),
            size: 10,
            modified: Utc::now(),
            digest: None,
        }
    }

    #[test]
    fn role_precedence_follows_declaration_order() {
        assert!(ArtifactRole::Database < ArtifactRole::Configuration);
        assert!(ArtifactRole::Configuration < ArtifactRole::PublicAssets);
        assert!(ArtifactRole::PrivateAssets < ArtifactRole::Unclassified);
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in ArtifactRole::ALL {
            assert_eq!(ArtifactRole::from_str(role.as_str()), Some(role));
        }
    }

    #[test]
    fn database_only_set_is_complete_not_full() {
        let set = BackupSet::new(
            ProvenanceKey::new("siteA", "20250909_143022"),
            vec![descriptor(ArtifactRole::Database, "db.sql.gz")],
        );
        assert!(set.is_complete());
        assert!(!set.is_full());
        assert_eq!(set.missing_roles().len(), 3);
    }

    #[test]
    fn members_are_sorted_by_role() {
        let set = BackupSet::new(
            ProvenanceKey::new("siteA", "20250909_143022"),
            vec![
                descriptor(ArtifactRole::PublicAssets, "p.tar"),
                descriptor(ArtifactRole::Database, "d.sql.gz"),
            ],
        );
        assert_eq!(set.members()[0].role, ArtifactRole::Database);
    }

    #[test]
    fn digest_parses_sha256sum_output() {
        let hex = "a".repeat(64);
        let out = format!("{hex}  /srv/backups/file.sql.gz\n");
        let digest = Digest::parse_tool_output(DigestAlgorithm::Sha256, &out).unwrap();
        assert_eq!(digest.hex, hex);
        assert!(Digest::parse_tool_output(DigestAlgorithm::Sha256, "sha256sum: not found").is_none());
    }

    #[test]
    fn timestamp_token_parses() {
        let key = ProvenanceKey::new("siteA", "20250909_143022");
        assert!(key.created_at().is_some());
    }
}
