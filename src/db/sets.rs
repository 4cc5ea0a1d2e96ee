//! Which backup sets, and which of their members, are present locally.
//!
//! Member rows only ever move towards `succeeded`, so marks from concurrent
//! transfers commute: any completion order yields the same final rows.

use serde::Serialize;
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use super::index_error;
use crate::core::models::{ArtifactDescriptor, ArtifactRole, BackupSet, Digest, DigestAlgorithm, ProvenanceKey};
use crate::error::Result;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetPresence {
    Complete,
    Partial,
    Absent,
}

impl SetPresence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Absent => "absent",
        }
    }

    fn derive(expected: u64, succeeded: u64) -> Self {
        if succeeded == 0 {
            Self::Absent
        } else if succeeded >= expected {
            Self::Complete
        } else {
            Self::Partial
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexedMember {
    pub file_name: String,
    pub role: ArtifactRole,
    pub size: u64,
    pub digest: Option<Digest>,
    pub status: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexedSet {
    pub key: ProvenanceKey,
    pub expected_members: u64,
    pub succeeded_members: u64,
    pub presence: SetPresence,
}

/// Outcome to record for one member.
#[derive(Debug, Clone)]
pub struct MemberMark {
    pub file_name: String,
    pub role: ArtifactRole,
    pub size: u64,
    pub digest: Option<Digest>,
    pub attempts: u32,
}

impl MemberMark {
    pub fn from_descriptor(member: &ArtifactDescriptor, digest: Option<Digest>, attempts: u32) -> Self {
        Self {
            file_name: member.file_name.clone(),
            role: member.role,
            size: member.size,
            digest,
            attempts,
        }
    }
}

/// State of an earlier good copy when a member fails again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorCopy {
    /// The destination still holds the file recorded as succeeded.
    Kept,
    /// Nothing is left at the destination; the member can no longer count as present.
    Lost,
}

fn ensure_set(tx: &rusqlite::Transaction<'_>, key: &ProvenanceKey) -> rusqlite::Result<String> {
    tx.execute(
        "INSERT INTO backup_sets (id, origin, timestamp) VALUES (?1, ?2, ?3)
         ON CONFLICT(origin, timestamp) DO NOTHING",
        params![Uuid::now_v7().to_string(), &key.origin, &key.timestamp],
    )?;
    tx.query_row(
        "SELECT id FROM backup_sets WHERE origin = ?1 AND timestamp = ?2",
        params![&key.origin, &key.timestamp],
        |row| row.get(0),
    )
}

fn refresh_expected(tx: &rusqlite::Transaction<'_>, set_id: &str) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE backup_sets
         SET expected_members = (SELECT COUNT(*) FROM set_members WHERE set_id = ?1),
             updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1",
        params![set_id],
    )?;
    Ok(())
}

fn parse_digest(algorithm: Option<String>, hex: Option<String>) -> Option<Digest> {
    let algorithm = DigestAlgorithm::from_str(algorithm.as_deref()?)?;
    Some(Digest::new(algorithm, hex?))
}

/// Record the members a set is expected to have. Existing rows keep their status.
pub async fn register_set(conn: &Connection, set: &BackupSet) -> Result<()> {
    let key = set.key().clone();
    let members: Vec<(String, String, u64)> = set
        .members()
        .iter()
        .map(|m| (m.file_name.clone(), m.role.as_str().to_string(), m.size))
        .collect();

    conn.call(move |c| {
        let tx = c.transaction()?;
        let set_id = ensure_set(&tx, &key)?;
        for (file_name, role, size) in &members {
            tx.execute(
                "INSERT INTO set_members (set_id, role, file_name, size, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(set_id, file_name) DO UPDATE SET
                    role = excluded.role,
                    size = excluded.size
                 WHERE set_members.status != 'succeeded'",
                params![&set_id, role, file_name, *size as i64, STATUS_PENDING],
            )?;
        }
        refresh_expected(&tx, &set_id)?;
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(index_error)
}

/// Idempotent: marking the same member twice leaves one succeeded row.
pub async fn mark_member_succeeded(conn: &Connection, key: &ProvenanceKey, mark: MemberMark) -> Result<()> {
    let key = key.clone();
    conn.call(move |c| {
        let tx = c.transaction()?;
        let set_id = ensure_set(&tx, &key)?;
        let (algorithm, hex) = match &mark.digest {
            Some(d) => (Some(d.algorithm.as_str()), Some(d.hex.clone())),
            None => (None, None),
        };
        tx.execute(
            "INSERT INTO set_members (set_id, role, file_name, size, digest_algorithm, digest, status, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(set_id, file_name) DO UPDATE SET
                role = excluded.role,
                size = excluded.size,
                digest_algorithm = COALESCE(excluded.digest_algorithm, set_members.digest_algorithm),
                digest = COALESCE(excluded.digest, set_members.digest),
                status = excluded.status,
                attempts = MAX(set_members.attempts, excluded.attempts),
                last_error = NULL,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &set_id,
                mark.role.as_str(),
                &mark.file_name,
                mark.size as i64,
                algorithm,
                hex,
                STATUS_SUCCEEDED,
                mark.attempts
            ],
        )?;
        refresh_expected(&tx, &set_id)?;
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(index_error)
}

/// A member that succeeded earlier keeps that status only while its copy is `Kept`.
pub async fn mark_member_failed(
    conn: &Connection,
    key: &ProvenanceKey,
    mark: MemberMark,
    error: String,
    prior: PriorCopy,
) -> Result<()> {
    let keep_success = prior == PriorCopy::Kept;
    let key = key.clone();
    conn.call(move |c| {
        let tx = c.transaction()?;
        let set_id = ensure_set(&tx, &key)?;
        tx.execute(
            "INSERT INTO set_members (set_id, role, file_name, size, status, attempts, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(set_id, file_name) DO UPDATE SET
                attempts = MAX(set_members.attempts, excluded.attempts),
                status = CASE WHEN set_members.status = 'succeeded' AND ?8 THEN set_members.status
                              ELSE excluded.status END,
                last_error = CASE WHEN set_members.status = 'succeeded' AND ?8 THEN NULL
                                  ELSE excluded.last_error END,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &set_id,
                mark.role.as_str(),
                &mark.file_name,
                mark.size as i64,
                STATUS_FAILED,
                mark.attempts,
                error,
                keep_success
            ],
        )?;
        refresh_expected(&tx, &set_id)?;
        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(index_error)
}

pub async fn presence(conn: &Connection, key: &ProvenanceKey) -> Result<SetPresence> {
    let key = key.clone();
    let counts = conn
        .call(move |c| {
            c.query_row(
                "SELECT s.expected_members,
                        (SELECT COUNT(*) FROM set_members m WHERE m.set_id = s.id AND m.status = 'succeeded')
                 FROM backup_sets s
                 WHERE s.origin = ?1 AND s.timestamp = ?2",
                params![&key.origin, &key.timestamp],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
        })
        .await
        .map_err(index_error)?;

    Ok(match counts {
        Some((expected, succeeded)) => SetPresence::derive(expected as u64, succeeded as u64),
        None => SetPresence::Absent,
    })
}

/// Digest recorded when `file_name` was last confirmed present.
pub async fn recorded_digest(conn: &Connection, key: &ProvenanceKey, file_name: &str) -> Result<Option<Digest>> {
    let key = key.clone();
    let file_name = file_name.to_string();
    let row = conn
        .call(move |c| {
            c.query_row(
                "SELECT m.digest_algorithm, m.digest
                 FROM set_members m JOIN backup_sets s ON s.id = m.set_id
                 WHERE s.origin = ?1 AND s.timestamp = ?2 AND m.file_name = ?3 AND m.status = 'succeeded'",
                params![&key.origin, &key.timestamp, &file_name],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
        })
        .await
        .map_err(index_error)?;

    Ok(row.and_then(|(algorithm, hex)| parse_digest(algorithm, hex)))
}

pub async fn list_members(conn: &Connection, key: &ProvenanceKey) -> Result<Vec<IndexedMember>> {
    let key = key.clone();
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT m.file_name, m.role, m.size, m.digest_algorithm, m.digest, m.status, m.attempts, m.last_error
             FROM set_members m JOIN backup_sets s ON s.id = m.set_id
             WHERE s.origin = ?1 AND s.timestamp = ?2
             ORDER BY m.file_name",
        )?;
        let rows = stmt.query_map(params![&key.origin, &key.timestamp], |row| {
            let role: String = row.get(1)?;
            Ok(IndexedMember {
                file_name: row.get(0)?,
                role: ArtifactRole::from_str(&role).unwrap_or(ArtifactRole::Unclassified),
                size: row.get::<_, i64>(2)? as u64,
                digest: parse_digest(row.get(3)?, row.get(4)?),
                status: row.get(5)?,
                attempts: row.get(6)?,
                last_error: row.get(7)?,
            })
        })?;
        let mut members: Vec<IndexedMember> = rows.collect::<rusqlite::Result<_>>()?;
        members.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok::<_, rusqlite::Error>(members)
    })
    .await
    .map_err(index_error)
}

/// All indexed sets, newest first.
pub async fn list_sets(conn: &Connection) -> Result<Vec<IndexedSet>> {
    conn.call(|c| {
        let mut stmt = c.prepare(
            "SELECT s.origin, s.timestamp, s.expected_members,
                    (SELECT COUNT(*) FROM set_members m WHERE m.set_id = s.id AND m.status = 'succeeded')
             FROM backup_sets s
             ORDER BY s.timestamp DESC, s.origin ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let expected = row.get::<_, i64>(2)? as u64;
            let succeeded = row.get::<_, i64>(3)? as u64;
            Ok(IndexedSet {
                key: ProvenanceKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                expected_members: expected,
                succeeded_members: succeeded,
                presence: SetPresence::derive(expected, succeeded),
            })
        })?;
        let sets = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(sets)
    })
    .await
    .map_err(index_error)
}

/// Drop a set and its member rows. Returns whether the set was indexed.
pub async fn forget_set(conn: &Connection, key: &ProvenanceKey) -> Result<bool> {
    let key = key.clone();
    let removed = conn
        .call(move |c| {
            c.execute(
                "DELETE FROM backup_sets WHERE origin = ?1 AND timestamp = ?2",
                params![&key.origin, &key.timestamp],
            )
        })
        .await
        .map_err(index_error)?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grouper::group_into_sets;
    use crate::db::init_in_memory;
    use chrono::Utc;
    use std::path::PathBuf;

    fn member(name: &str, role: ArtifactRole) -> ArtifactDescriptor {
        ArtifactDescriptor {
            path: PathBuf::from(format!("/b/{name}")),
            file_name: name.to_string(),
            role,
            key: ProvenanceKey::new("site1", "20250909_143022"),
            size: 10,
            modified: Utc::now(),
            digest: None,
        }
    }

    fn three_member_set() -> BackupSet {
        let grouping = group_into_sets(vec![
            member("20250909_143022-site1-database.sql.gz", ArtifactRole::Database),
            member("20250909_143022-site1-site_config_backup.json", ArtifactRole::Configuration),
            member("20250909_143022-site1-files.tar", ArtifactRole::PublicAssets),
        ]);
        grouping.sets.into_iter().next().unwrap()
    }

    fn digest(hex_char: char) -> Digest {
        Digest::new(DigestAlgorithm::Sha256, hex_char.to_string().repeat(64))
    }

    #[tokio::test]
    async fn presence_follows_member_marks() {
        let conn = init_in_memory().await.unwrap();
        let set = three_member_set();
        register_set(&conn, &set).await.unwrap();
        assert_eq!(presence(&conn, set.key()).await.unwrap(), SetPresence::Absent);

        let db = &set.members()[0];
        mark_member_succeeded(&conn, set.key(), MemberMark::from_descriptor(db, Some(digest('a')), 1))
            .await
            .unwrap();
        assert_eq!(presence(&conn, set.key()).await.unwrap(), SetPresence::Partial);

        for m in &set.members()[1..] {
            mark_member_succeeded(&conn, set.key(), MemberMark::from_descriptor(m, None, 1))
                .await
                .unwrap();
        }
        assert_eq!(presence(&conn, set.key()).await.unwrap(), SetPresence::Complete);
        assert_eq!(
            recorded_digest(&conn, set.key(), &db.file_name).await.unwrap(),
            Some(digest('a'))
        );
    }

    #[tokio::test]
    async fn marks_commute_regardless_of_order() {
        let set = three_member_set();
        let members = set.members().to_vec();

        let forward = init_in_memory().await.unwrap();
        let backward = init_in_memory().await.unwrap();
        register_set(&forward, &set).await.unwrap();
        register_set(&backward, &set).await.unwrap();

        for m in &members {
            mark_member_succeeded(&forward, set.key(), MemberMark::from_descriptor(m, Some(digest('b')), 2))
                .await
                .unwrap();
        }
        for m in members.iter().rev() {
            mark_member_succeeded(&backward, set.key(), MemberMark::from_descriptor(m, Some(digest('b')), 2))
                .await
                .unwrap();
            // Repeats are no-ops.
            mark_member_succeeded(&backward, set.key(), MemberMark::from_descriptor(m, Some(digest('b')), 2))
                .await
                .unwrap();
        }

        let a = list_members(&forward, set.key()).await.unwrap();
        let b = list_members(&backward, set.key()).await.unwrap();
        assert_eq!(a.len(), 3);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.file_name, y.file_name);
            assert_eq!(x.status, y.status);
            assert_eq!(x.digest, y.digest);
        }
    }

    #[tokio::test]
    async fn failure_keeps_success_while_copy_survives() {
        let conn = init_in_memory().await.unwrap();
        let set = three_member_set();
        register_set(&conn, &set).await.unwrap();
        let db = &set.members()[0];

        mark_member_succeeded(&conn, set.key(), MemberMark::from_descriptor(db, Some(digest('c')), 1))
            .await
            .unwrap();
        mark_member_failed(
            &conn,
            set.key(),
            MemberMark::from_descriptor(db, None, 3),
            "late failure".into(),
            PriorCopy::Kept,
        )
        .await
        .unwrap();

        let members = list_members(&conn, set.key()).await.unwrap();
        let row = members.iter().find(|m| m.file_name == db.file_name).unwrap();
        assert_eq!(row.status, STATUS_SUCCEEDED);
        assert_eq!(row.last_error, None);
        assert_eq!(row.attempts, 3);
    }

    #[tokio::test]
    async fn lost_copy_demotes_earlier_success() {
        let conn = init_in_memory().await.unwrap();
        let set = three_member_set();
        register_set(&conn, &set).await.unwrap();
        for m in set.members() {
            mark_member_succeeded(&conn, set.key(), MemberMark::from_descriptor(m, Some(digest('d')), 1))
                .await
                .unwrap();
        }
        assert_eq!(presence(&conn, set.key()).await.unwrap(), SetPresence::Complete);

        let public = &set.members()[2];
        mark_member_failed(
            &conn,
            set.key(),
            MemberMark::from_descriptor(public, None, 2),
            "source missing".into(),
            PriorCopy::Lost,
        )
        .await
        .unwrap();

        assert_eq!(presence(&conn, set.key()).await.unwrap(), SetPresence::Partial);
        assert_eq!(recorded_digest(&conn, set.key(), &public.file_name).await.unwrap(), None);
        let members = list_members(&conn, set.key()).await.unwrap();
        let row = members.iter().find(|m| m.file_name == public.file_name).unwrap();
        assert_eq!(row.status, STATUS_FAILED);
        assert_eq!(row.last_error.as_deref(), Some("source missing"));
    }

    #[tokio::test]
    async fn unknown_set_is_absent() {
        let conn = init_in_memory().await.unwrap();
        let key = ProvenanceKey::new("nowhere", "20200101_000000");
        assert_eq!(presence(&conn, &key).await.unwrap(), SetPresence::Absent);
        assert!(list_sets(&conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forgetting_a_set_drops_its_members() {
        let conn = init_in_memory().await.unwrap();
        let set = three_member_set();
        register_set(&conn, &set).await.unwrap();

        assert!(forget_set(&conn, set.key()).await.unwrap());
        assert_eq!(presence(&conn, set.key()).await.unwrap(), SetPresence::Absent);
        assert!(list_members(&conn, set.key()).await.unwrap().is_empty());
        assert!(!forget_set(&conn, set.key()).await.unwrap());
    }
}
