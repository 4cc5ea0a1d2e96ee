//! Opaque procedures run on an installation host.
//!
//! The engine only knows procedures by logical name. Each one renders to a shell
//! command line from configurable templates, runs through a [`ProcedureRunner`],
//! and fails with the captured stderr when it exits non-zero.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::models::{ArtifactRole, BackupMode};
use crate::core::remote::{CommandOutput, FileChannel, LocalChannel, RemoteEndpoint, shell_quote};
use crate::core::session::SessionManager;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceStep {
    Migrate,
    ClearCache,
    Build,
}

impl MaintenanceStep {
    pub const ALL: [MaintenanceStep; 3] = [Self::Migrate, Self::ClearCache, Self::Build];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migrate => "migrate",
            Self::ClearCache => "clear-cache",
            Self::Build => "build",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    CreateBackup(BackupMode),
    RestoreBackup,
    PostRestoreMaintenance(MaintenanceStep),
    ValidateInstallation,
    ListSites,
    FindBenches,
    NewSite,
    DeleteBackup,
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBackup(mode) => write!(f, "create-backup[{}]", mode.as_str()),
            Self::RestoreBackup => f.write_str("restore-backup"),
            Self::PostRestoreMaintenance(step) => write!(f, "post-restore-maintenance[{}]", step.as_str()),
            Self::ValidateInstallation => f.write_str("validate-installation"),
            Self::ListSites => f.write_str("list-sites"),
            Self::FindBenches => f.write_str("find-benches"),
            Self::NewSite => f.write_str("new-site"),
            Self::DeleteBackup => f.write_str("delete-backup"),
        }
    }
}

/// Command templates. `{bench}` is the bench executable, `{site}` the site name,
/// `{database}` the database artifact path. Values are shell-quoted on substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcedureTemplates {
    pub bench: String,
    pub create_database: String,
    pub create_files: String,
    pub create_complete: String,
    pub restore: String,
    pub migrate: String,
    pub clear_cache: String,
    pub build: String,
    pub new_site: String,
    /// Shell globs searched for bench directories. `~` is the login user's home.
    pub bench_search_paths: Vec<String>,
}

impl Default for ProcedureTemplates {
    fn default() -> Self {
        Self {
            bench: "bench".to_string(),
            create_database: "{bench} --site {site} backup --only-db".to_string(),
            create_files: "{bench} --site {site} backup --only-files".to_string(),
            create_complete: "{bench} --site {site} backup --with-files".to_string(),
            restore: "{bench} --site {site} restore {database}".to_string(),
            migrate: "{bench} --site {site} migrate".to_string(),
            clear_cache: "{bench} --site {site} clear-cache".to_string(),
            build: "{bench} --site {site} build".to_string(),
            new_site: "{bench} new-site {site}".to_string(),
            bench_search_paths: [
                "/home/*/frappe-bench",
                "/home/*/frappe-*",
                "/opt/bench/*/frappe-bench",
                "/opt/bench/*/frappe-*",
                "/var/www/*/frappe-bench",
                "/var/www/*/frappe-*",
                "~/frappe-bench",
                "~/frappe-*",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

/// One installation on one host: a bench directory and a site inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteTarget {
    pub bench_path: PathBuf,
    pub site: String,
}

impl SiteTarget {
    pub fn new(bench_path: impl Into<PathBuf>, site: impl Into<String>) -> Self {
        Self {
            bench_path: bench_path.into(),
            site: site.into(),
        }
    }

    pub fn site_dir(&self) -> PathBuf {
        self.bench_path.join("sites").join(&self.site)
    }

    /// Where the backup tooling writes artifacts for this site.
    pub fn backup_dir(&self) -> PathBuf {
        self.site_dir().join("private").join("backups")
    }

    pub fn site_config(&self) -> PathBuf {
        self.site_dir().join("site_config.json")
    }
}

impl fmt::Display for SiteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bench_path.display(), self.site)
    }
}

/// Extra arguments of the restore procedure.
#[derive(Clone, Default)]
pub struct RestoreArgs {
    pub database: PathBuf,
    pub public_files: Option<PathBuf>,
    pub private_files: Option<PathBuf>,
    pub db_root_user: Option<String>,
    pub db_root_password: Option<String>,
    pub force: bool,
}

/// Extra arguments of the site creation procedure.
#[derive(Clone, Default)]
pub struct NewSiteArgs {
    pub admin_password: String,
    pub db_root_user: Option<String>,
    pub db_root_password: Option<String>,
}

/// A rendered procedure ready to run.
#[derive(Clone)]
pub struct Invocation {
    pub procedure: Procedure,
    pub command: String,
    /// `command` with secrets masked, for logs.
    pub display: String,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("procedure", &self.procedure)
            .field("command", &self.display)
            .finish()
    }
}

fn path_arg(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Search globs are spliced unquoted so the shell expands them.
fn is_search_glob(pattern: &str) -> bool {
    !pattern.is_empty()
        && pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '*' | '?' | '~' | '.' | '_' | '-'))
        && pattern[1..].find('~').is_none()
}

#[derive(Debug, Clone, Default)]
pub struct ProcedureCatalog {
    templates: ProcedureTemplates,
}

impl ProcedureCatalog {
    pub fn new(templates: ProcedureTemplates) -> Self {
        Self { templates }
    }

    fn render(&self, template: &str, target: &SiteTarget, database: Option<&Path>) -> String {
        let mut rendered = template
            .replace("{bench}", &self.templates.bench)
            .replace("{site}", &shell_quote(&target.site));
        if let Some(database) = database {
            rendered = rendered.replace("{database}", &path_arg(database));
        }
        format!("cd {} && {}", path_arg(&target.bench_path), rendered)
    }

    fn plain(procedure: Procedure, command: String) -> Invocation {
        Invocation {
            procedure,
            display: command.clone(),
            command,
        }
    }

    pub fn create_backup(&self, target: &SiteTarget, mode: BackupMode) -> Invocation {
        let template = match mode {
            BackupMode::Database => &self.templates.create_database,
            BackupMode::Files => &self.templates.create_files,
            BackupMode::Complete => &self.templates.create_complete,
        };
        Self::plain(Procedure::CreateBackup(mode), self.render(template, target, None))
    }

    pub fn restore(&self, target: &SiteTarget, args: &RestoreArgs) -> Invocation {
        let mut command = self.render(&self.templates.restore, target, Some(&args.database));
        if let Some(public) = &args.public_files {
            command.push_str(&format!(" --with-public-files {}", path_arg(public)));
        }
        if let Some(private) = &args.private_files {
            command.push_str(&format!(" --with-private-files {}", path_arg(private)));
        }
        if let Some(user) = &args.db_root_user {
            command.push_str(&format!(" --mariadb-root-username {}", shell_quote(user)));
        }
        let mut display = command.clone();
        if let Some(password) = &args.db_root_password {
            command.push_str(&format!(" --mariadb-root-password {}", shell_quote(password)));
            display.push_str(" --mariadb-root-password ****");
        }
        if args.force {
            command.push_str(" --force");
            display.push_str(" --force");
        }
        Invocation {
            procedure: Procedure::RestoreBackup,
            command,
            display,
        }
    }

    pub fn maintenance(&self, target: &SiteTarget, step: MaintenanceStep) -> Invocation {
        let template = match step {
            MaintenanceStep::Migrate => &self.templates.migrate,
            MaintenanceStep::ClearCache => &self.templates.clear_cache,
            MaintenanceStep::Build => &self.templates.build,
        };
        Self::plain(Procedure::PostRestoreMaintenance(step), self.render(template, target, None))
    }

    /// Succeeds only when the bench layout and the site's configuration exist.
    pub fn validate_installation(&self, target: &SiteTarget) -> Invocation {
        let site_config = Path::new("sites").join(&target.site).join("site_config.json");
        let command = format!(
            "cd {} && test -d sites && test -d apps && test -f sites/common_site_config.json && test -f {}",
            path_arg(&target.bench_path),
            path_arg(&site_config)
        );
        Self::plain(Procedure::ValidateInstallation, command)
    }

    /// Prints one site name per line.
    pub fn list_sites(&self, bench_path: &Path) -> Invocation {
        let command = format!(
            "cd {} && for d in */; do [ -f \"${{d}}site_config.json\" ] && echo \"${{d%/}}\"; done; true",
            path_arg(&bench_path.join("sites"))
        );
        Self::plain(Procedure::ListSites, command)
    }

    /// Prints every directory matching a search glob that has a bench layout,
    /// one per line. Globs with shell metacharacters are skipped.
    pub fn find_benches(&self) -> Invocation {
        let patterns: Vec<&str> = self
            .templates
            .bench_search_paths
            .iter()
            .map(String::as_str)
            .filter(|p| {
                let ok = is_search_glob(p);
                if !ok {
                    debug!(pattern = %p, "Skipping bench search path with unsupported characters");
                }
                ok
            })
            .collect();
        let command = format!(
            "for d in {}; do [ -d \"$d/sites\" ] && [ -d \"$d/apps\" ] && [ -f \"$d/sites/common_site_config.json\" ] && echo \"$d\"; done; true",
            patterns.join(" ")
        );
        Self::plain(Procedure::FindBenches, command)
    }

    pub fn new_site(&self, target: &SiteTarget, args: &NewSiteArgs) -> Invocation {
        let mut command = self.render(&self.templates.new_site, target, None);
        if let Some(user) = &args.db_root_user {
            command.push_str(&format!(" --mariadb-root-username {}", shell_quote(user)));
        }
        let mut display = command.clone();
        command.push_str(&format!(" --admin-password {}", shell_quote(&args.admin_password)));
        display.push_str(" --admin-password ****");
        if let Some(password) = &args.db_root_password {
            command.push_str(&format!(" --mariadb-root-password {}", shell_quote(password)));
            display.push_str(" --mariadb-root-password ****");
        }
        Invocation {
            procedure: Procedure::NewSite,
            command,
            display,
        }
    }

    /// Removes the given artifact files; already missing ones are not an error.
    pub fn delete_backup(&self, paths: &[PathBuf]) -> Invocation {
        let quoted: Vec<String> = paths.iter().map(|p| path_arg(p)).collect();
        Self::plain(Procedure::DeleteBackup, format!("rm -f -- {}", quoted.join(" ")))
    }
}

static PRODUCED_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?P<label>Config|Database|Public|Private)\s*:\s*(?P<path>\S+)").expect("valid regex")
});

/// Files the backup tool reports having written, from its summary lines
/// (`Database: /path/...sql.gz`). Used as a hint only; the listing is authoritative.
pub fn produced_files(output: &str) -> Vec<(ArtifactRole, String)> {
    PRODUCED_FILE
        .captures_iter(output)
        .map(|c| {
            let role = match &c["label"] {
                "Config" => ArtifactRole::Configuration,
                "Database" => ArtifactRole::Database,
                "Public" => ArtifactRole::PublicAssets,
                _ => ArtifactRole::PrivateAssets,
            };
            let name = Path::new(&c["path"])
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            (role, name)
        })
        .filter(|(_, name)| !name.is_empty())
        .collect()
}

/// Where procedures run: the local machine or a remote host.
#[async_trait]
pub trait ProcedureRunner: Send + Sync {
    fn describe(&self) -> String;

    /// Whether procedures see the local filesystem.
    fn is_local(&self) -> bool;

    /// Run without interpreting the exit status.
    async fn execute(&self, invocation: &Invocation, timeout: Duration, cancel: &CancellationToken) -> Result<CommandOutput>;

    /// File access on the host the procedures run on.
    async fn file_channel(&self) -> Result<Box<dyn FileChannel>>;

    /// Round trip to the host. A failure drops any cached connection.
    async fn check_health(&self) -> bool {
        true
    }

    /// Run and map a non-zero exit status to [`Error::RemoteProcedure`].
    async fn run(&self, invocation: &Invocation, timeout: Duration, cancel: &CancellationToken) -> Result<CommandOutput> {
        info!(procedure = %invocation.procedure, host = %self.describe(), command = %invocation.display, "Running procedure");
        let output = self.execute(invocation, timeout, cancel).await?;
        if output.success() {
            return Ok(output);
        }
        let mut stderr = output.stderr_text();
        if stderr.is_empty() {
            stderr = output.stdout_text();
        }
        Err(Error::RemoteProcedure {
            procedure: invocation.procedure.to_string(),
            status: output.status,
            stderr,
        })
    }
}

/// Runs procedures through `sh -c` on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

#[async_trait]
impl ProcedureRunner for LocalRunner {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn execute(&self, invocation: &Invocation, timeout: Duration, cancel: &CancellationToken) -> Result<CommandOutput> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&invocation.command)
            .kill_on_drop(true)
            .output();

        // Dropping the future kills the child.
        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Err(Error::Timeout {
                        command: invocation.display.clone(),
                        after: timeout,
                    })
                }
            },
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let status = output.status.code().unwrap_or(-1);
        debug!(status, "Local procedure finished");
        Ok(CommandOutput {
            status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn file_channel(&self) -> Result<Box<dyn FileChannel>> {
        Ok(Box::new(LocalChannel::new()))
    }
}

/// Runs procedures over the endpoint's shared session.
#[derive(Clone)]
pub struct SessionRunner {
    sessions: Arc<SessionManager>,
    endpoint: RemoteEndpoint,
}

impl SessionRunner {
    pub fn new(sessions: Arc<SessionManager>, endpoint: RemoteEndpoint) -> Self {
        Self { sessions, endpoint }
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl ProcedureRunner for SessionRunner {
    fn describe(&self) -> String {
        self.endpoint.id()
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn execute(&self, invocation: &Invocation, timeout: Duration, cancel: &CancellationToken) -> Result<CommandOutput> {
        let session = self.sessions.connect(&self.endpoint).await?;
        match self
            .sessions
            .run_command(&session, &invocation.command, Some(timeout), cancel)
            .await
        {
            Err(Error::Timeout { after, .. }) => Err(Error::Timeout {
                command: invocation.display.clone(),
                after,
            }),
            other => other,
        }
    }

    async fn file_channel(&self) -> Result<Box<dyn FileChannel>> {
        let session = self.sessions.connect(&self.endpoint).await?;
        self.sessions.open_file_channel(&session).await
    }

    async fn check_health(&self) -> bool {
        match self.sessions.connect(&self.endpoint).await {
            Ok(session) => self.sessions.health_check(&session).await,
            Err(_) => false,
        }
    }
}
