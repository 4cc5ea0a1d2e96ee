pub mod checkpoint;
pub mod grouper;
pub mod models;
pub mod orchestrator;
pub mod procedures;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod session;
pub mod site_config;
pub mod transfer_engine;
pub mod verifier;

pub use grouper::{Grouping, group_into_sets, list_artifacts};
pub use models::{ArtifactDescriptor, ArtifactRole, BackupMode, BackupSet, ProvenanceKey};
pub use orchestrator::{Orchestrator, PruneReport, RestoreReport, RestoreRequest, SetTransferReport};
pub use procedures::{LocalRunner, ProcedureRunner, SessionRunner, SiteTarget};
pub use progress::ProgressTracker;
pub use session::SessionManager;
pub use transfer_engine::TransferEngine;
