//! Backup artifact naming and grouping.
//!
//! Artifacts are named `<timestamp>-<origin>-<role><ext>`, e.g.
//! `20250909_143022-siteA-database.sql.gz`. The same convention is produced by
//! [`artifact_file_name`] and parsed by [`parse_artifact_name`].

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::core::models::{ArtifactDescriptor, ArtifactRole, BackupSet, ProvenanceKey, TIMESTAMP_FORMAT};
use crate::core::remote::FileChannel;

static KNOWN_ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<ts>\d{8}_\d{6})-(?P<origin>.+?)-(?P<role>database|site_config_backup|config|private-files|private|public-files|public|files)(?P<ext>\.sql\.gz|\.sql|\.json|\.tar\.gz|\.tgz|\.tar)$",
    )
    .expect("valid regex")
});

static ANY_ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<ts>\d{8}_\d{6})-(?P<origin>.+)-(?P<role>[^-]+?)(?P<ext>\.sql\.gz|\.sql|\.json|\.tar\.gz|\.tgz|\.tar)$")
        .expect("valid regex")
});

/// Role and provenance recovered from a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub key: ProvenanceKey,
    pub role: ArtifactRole,
}

fn classify(token: &str, ext: &str) -> ArtifactRole {
    let archive = matches!(ext, ".tar" | ".tar.gz" | ".tgz");
    match token {
        "database" if matches!(ext, ".sql.gz" | ".sql") => ArtifactRole::Database,
        "site_config_backup" | "config" if ext == ".json" => ArtifactRole::Configuration,
        "files" | "public-files" | "public" if archive => ArtifactRole::PublicAssets,
        "private-files" | "private" if archive => ArtifactRole::PrivateAssets,
        _ => ArtifactRole::Unclassified,
    }
}

/// `None` for anything that does not follow the naming convention.
pub fn parse_artifact_name(file_name: &str) -> Option<ParsedName> {
    let captures = KNOWN_ARTIFACT
        .captures(file_name)
        .or_else(|| ANY_ARTIFACT.captures(file_name))?;
    let timestamp = &captures["ts"];
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;

    Some(ParsedName {
        key: ProvenanceKey::new(&captures["origin"], timestamp),
        role: classify(&captures["role"], &captures["ext"]),
    })
}

/// Origin token for a site name, as the backup tooling writes it.
pub fn origin_token(site: &str) -> String {
    site.chars()
        .map(|c| if c == '.' || c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// File name an artifact of `role` gets for `key`. `None` for unclassified.
pub fn artifact_file_name(key: &ProvenanceKey, role: ArtifactRole) -> Option<String> {
    let suffix = match role {
        ArtifactRole::Database => "database.sql.gz",
        ArtifactRole::Configuration => "site_config_backup.json",
        ArtifactRole::PublicAssets => "files.tar",
        ArtifactRole::PrivateAssets => "private-files.tar",
        ArtifactRole::Unclassified => return None,
    };
    Some(format!("{}-{}-{}", key.timestamp, key.origin, suffix))
}

/// Descriptors for every regular file in `dir` that follows the naming convention.
pub fn list_artifacts(channel: &mut dyn FileChannel, dir: &Path) -> io::Result<Vec<ArtifactDescriptor>> {
    let mut artifacts = Vec::new();
    for entry in channel.list(dir)? {
        if !entry.stat.is_file {
            continue;
        }
        let Some(file_name) = entry.file_name().map(str::to_string) else {
            continue;
        };
        let Some(parsed) = parse_artifact_name(&file_name) else {
            debug!(file = %file_name, "Skipping non-artifact file");
            continue;
        };

        let modified = entry
            .stat
            .modified
            .or_else(|| parsed.key.created_at().map(|t| t.and_utc()))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        artifacts.push(ArtifactDescriptor {
            path: entry.path.clone(),
            file_name,
            role: parsed.role,
            key: parsed.key,
            size: entry.stat.size,
            modified,
            digest: None,
        });
    }
    Ok(artifacts)
}

/// A role collision inside one set. The later-listed file was kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingWarning {
    pub key: ProvenanceKey,
    pub role: ArtifactRole,
    pub kept: String,
    pub discarded: String,
}

impl std::fmt::Display for GroupingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "duplicate {} artifact for {}: kept {}, ignored {}",
            self.role, self.key, self.kept, self.discarded
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Grouping {
    /// Newest first.
    pub sets: Vec<BackupSet>,
    pub warnings: Vec<GroupingWarning>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Role(ArtifactRole),
    Unclassified(String),
}

/// Partition descriptors into sets by provenance key.
pub fn group_into_sets(descriptors: impl IntoIterator<Item = ArtifactDescriptor>) -> Grouping {
    let mut by_key: HashMap<ProvenanceKey, BTreeMap<Slot, ArtifactDescriptor>> = HashMap::new();
    let mut warnings = Vec::new();

    for descriptor in descriptors {
        let slot = match descriptor.role {
            ArtifactRole::Unclassified => Slot::Unclassified(descriptor.file_name.clone()),
            role => Slot::Role(role),
        };
        let members = by_key.entry(descriptor.key.clone()).or_default();
        let (key, role, kept) = (descriptor.key.clone(), descriptor.role, descriptor.file_name.clone());
        if let Some(previous) = members.insert(slot, descriptor)
            && previous.file_name != kept
        {
            let warning = GroupingWarning {
                key,
                role,
                kept,
                discarded: previous.file_name,
            };
            warn!(%warning, "Artifact collision");
            warnings.push(warning);
        }
    }

    let mut sets: Vec<BackupSet> = by_key
        .into_iter()
        .map(|(key, members)| BackupSet::new(key, members.into_values().collect()))
        .collect();
    sets.sort_by(|a, b| {
        b.key()
            .timestamp
            .cmp(&a.key().timestamp)
            .then_with(|| a.key().origin.cmp(&b.key().origin))
    });

    Grouping { sets, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::LocalChannel;
    use proptest::prelude::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn descriptor(name: &str) -> ArtifactDescriptor {
        let parsed = parse_artifact_name(name).unwrap();
        ArtifactDescriptor {
            path: PathBuf::from("/backups").join(name),
            file_name: name.to_string(),
            role: parsed.role,
            key: parsed.key,
            size: name.len() as u64,
            modified: DateTime::<Utc>::UNIX_EPOCH,
            digest: None,
        }
    }

    #[test]
    fn parses_frappe_style_names() {
        let parsed = parse_artifact_name("20250909_210113-frappe15_labexposed_com-database.sql.gz").unwrap();
        assert_eq!(parsed.key, ProvenanceKey::new("frappe15_labexposed_com", "20250909_210113"));
        assert_eq!(parsed.role, ArtifactRole::Database);

        let cases = [
            ("20250909_210113-s-site_config_backup.json", ArtifactRole::Configuration),
            ("20250909_210113-s-config.json", ArtifactRole::Configuration),
            ("20250909_210113-s-files.tar", ArtifactRole::PublicAssets),
            ("20250909_210113-s-public.tar", ArtifactRole::PublicAssets),
            ("20250909_210113-s-private-files.tar", ArtifactRole::PrivateAssets),
            ("20250909_210113-s-private.tgz", ArtifactRole::PrivateAssets),
            ("20250909_210113-s-database.tar", ArtifactRole::Unclassified),
            ("20250909_210113-s-extra.sql.gz", ArtifactRole::Unclassified),
        ];
        for (name, role) in cases {
            assert_eq!(parse_artifact_name(name).unwrap().role, role, "{name}");
        }
    }

    #[test]
    fn origin_may_contain_dashes() {
        let parsed = parse_artifact_name("20250909_143022-my-site-private-files.tar").unwrap();
        assert_eq!(parsed.key.origin, "my-site");
        assert_eq!(parsed.role, ArtifactRole::PrivateAssets);
    }

    #[test]
    fn rejects_non_artifacts() {
        for name in [
            "notes.txt",
            "20250909_143022-siteA-database.sql.gz.part",
            "siteA_20250909_143022_database.sql.gz",
            "20251399_143022-siteA-database.sql.gz",
        ] {
            assert!(parse_artifact_name(name).is_none(), "{name}");
        }
    }

    #[test]
    fn writer_and_parser_agree() {
        let key = ProvenanceKey::new(origin_token("erp.example.com"), "20250909_143022");
        assert_eq!(key.origin, "erp_example_com");
        for role in ArtifactRole::ALL {
            let Some(name) = artifact_file_name(&key, role) else {
                assert_eq!(role, ArtifactRole::Unclassified);
                continue;
            };
            let parsed = parse_artifact_name(&name).unwrap();
            assert_eq!(parsed.key, key);
            assert_eq!(parsed.role, role);
        }
    }

    #[test]
    fn three_file_listing_is_complete_not_full() {
        let grouping = group_into_sets([
            descriptor("20250909_143022-siteA-public.tar"),
            descriptor("20250909_143022-siteA-database.sql.gz"),
            descriptor("20250909_143022-siteA-config.json"),
        ]);
        assert!(grouping.warnings.is_empty());
        assert_eq!(grouping.sets.len(), 1);

        let set = &grouping.sets[0];
        assert_eq!(set.key(), &ProvenanceKey::new("siteA", "20250909_143022"));
        let roles: Vec<_> = set.members().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ArtifactRole::Database, ArtifactRole::Configuration, ArtifactRole::PublicAssets]
        );
        assert!(set.is_complete());
        assert!(!set.is_full());
        assert_eq!(set.missing_roles(), vec![ArtifactRole::PrivateAssets]);
    }

    #[test]
    fn sets_are_newest_first() {
        let grouping = group_into_sets([
            descriptor("20250101_000000-siteA-database.sql.gz"),
            descriptor("20250909_143022-siteB-database.sql.gz"),
            descriptor("20250909_143022-siteA-database.sql.gz"),
        ]);
        let keys: Vec<_> = grouping.sets.iter().map(|s| s.key().to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "(siteA, 20250909_143022)",
                "(siteB, 20250909_143022)",
                "(siteA, 20250101_000000)"
            ]
        );
    }

    #[test]
    fn duplicate_role_keeps_later_and_warns() {
        let grouping = group_into_sets([
            descriptor("20250909_143022-siteA-config.json"),
            descriptor("20250909_143022-siteA-site_config_backup.json"),
            descriptor("20250101_000000-siteB-database.sql.gz"),
        ]);
        assert_eq!(grouping.sets.len(), 2);
        assert_eq!(grouping.warnings.len(), 1);
        let warning = &grouping.warnings[0];
        assert_eq!(warning.kept, "20250909_143022-siteA-site_config_backup.json");
        assert_eq!(warning.discarded, "20250909_143022-siteA-config.json");
        assert_eq!(
            grouping.sets[0].member(ArtifactRole::Configuration).unwrap().file_name,
            "20250909_143022-siteA-site_config_backup.json"
        );
    }

    #[test]
    fn list_artifacts_skips_other_files() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("20250909_143022-siteA-database.sql.gz"), b"db").unwrap();
        fs::write(temp.path().join("README"), b"x").unwrap();
        fs::create_dir(temp.path().join("20250909_143022-siteA-files.tar")).unwrap();

        let artifacts = list_artifacts(&mut LocalChannel::new(), temp.path()).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].size, 2);
        assert_eq!(artifacts[0].role, ArtifactRole::Database);
    }

    fn arb_name() -> impl Strategy<Value = String> {
        let ts = prop::sample::select(vec!["20250101_000000", "20250909_143022", "20251231_235959"]);
        let origin = prop::sample::select(vec!["siteA", "siteB", "erp_example_com", "my-site"]);
        let suffix = prop::sample::select(vec![
            "database.sql.gz",
            "database.sql",
            "config.json",
            "site_config_backup.json",
            "files.tar",
            "public.tar",
            "private-files.tar",
            "private.tgz",
            "extra.tar",
            "dump.json",
        ]);
        (ts, origin, suffix).prop_map(|(ts, origin, suffix)| format!("{ts}-{origin}-{suffix}"))
    }

    proptest! {
        #[test]
        fn grouping_is_idempotent(names in prop::collection::vec(arb_name(), 0..24)) {
            let first = group_into_sets(names.iter().map(|n| descriptor(n)));
            let flattened: Vec<_> = first.sets.iter().flat_map(|s| s.members().to_vec()).collect();
            let second = group_into_sets(flattened);

            prop_assert_eq!(&first.sets, &second.sets);
            prop_assert!(second.warnings.is_empty());
            for set in &first.sets {
                prop_assert!(set.members().iter().all(|m| &m.key == set.key()));
            }
        }
    }
}
