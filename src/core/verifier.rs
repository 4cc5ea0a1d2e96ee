use sha2::Digest as _;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::models::{Digest, DigestAlgorithm};
use crate::error::{Error, Result};

/// Read chunk size for hashing (128KB)
const HASH_BUFFER_SIZE: usize = 128 * 1024;

/// A file that should hash to a known value.
#[derive(Debug, Clone)]
pub struct ExpectedDigest {
    pub path: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

/// Result of a successful verification
#[derive(Debug)]
pub struct VerifyResult {
    pub files_verified: u64,
    pub bytes_verified: u64,
}

/// Details of a file that failed verification
#[derive(Debug)]
pub struct FileMismatch {
    pub path: PathBuf,
    pub reason: MismatchReason,
}

#[derive(Debug)]
pub enum MismatchReason {
    HashMismatch { expected: Digest, actual: String },
    Missing,
    Unreadable(String),
}

enum Hasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    fn finalize(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Hash everything `reader` yields, streaming in chunks.
pub fn digest_reader(mut reader: impl Read, algorithm: DigestAlgorithm) -> io::Result<Digest> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(Digest::new(algorithm, hasher.finalize()))
}

pub fn digest_bytes(bytes: &[u8], algorithm: DigestAlgorithm) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(bytes);
    Digest::new(algorithm, hasher.finalize())
}

/// Hash a local file (sync version)
pub fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> io::Result<Digest> {
    let file = std::fs::File::open(path)?;
    digest_reader(BufReader::with_capacity(HASH_BUFFER_SIZE, file), algorithm)
}

/// Re-hash local files and compare against digests recorded when they arrived.
///
/// Every file is checked before reporting, so one error lists all bad files.
pub async fn verify_files(label: &str, expected: &[ExpectedDigest]) -> Result<VerifyResult> {
    let total = expected.len() as u64;
    info!(label = %label, total_files = total, "Starting digest verification");

    if total == 0 {
        return Ok(VerifyResult {
            files_verified: 0,
            bytes_verified: 0,
        });
    }

    let expected = expected.to_vec();
    let label = label.to_string();

    tokio::task::spawn_blocking(move || {
        let mut mismatches: Vec<FileMismatch> = Vec::new();
        let mut bytes_verified: u64 = 0;

        for item in &expected {
            debug!(file = %item.path.display(), "Verifying file");

            if !item.path.exists() {
                mismatches.push(FileMismatch {
                    path: item.path.clone(),
                    reason: MismatchReason::Missing,
                });
                continue;
            }

            match digest_file(&item.path, item.digest.algorithm) {
                Ok(actual) if actual == item.digest => bytes_verified += item.size,
                Ok(actual) => mismatches.push(FileMismatch {
                    path: item.path.clone(),
                    reason: MismatchReason::HashMismatch {
                        expected: item.digest.clone(),
                        actual: actual.hex,
                    },
                }),
                Err(e) => mismatches.push(FileMismatch {
                    path: item.path.clone(),
                    reason: MismatchReason::Unreadable(e.to_string()),
                }),
            }
        }

        if let Some(first) = mismatches.first() {
            info!(label = %label, mismatches = mismatches.len(), "Verification failed");
            let (expected, actual) = match &first.reason {
                MismatchReason::HashMismatch { expected, actual } if mismatches.len() == 1 => {
                    (expected.clone(), actual.clone())
                }
                _ => {
                    let expected = expected
                        .iter()
                        .find(|e| e.path == first.path)
                        .map(|e| e.digest.clone())
                        .unwrap_or_else(|| Digest::new(DigestAlgorithm::default(), ""));
                    (expected, format_mismatch_error(&mismatches))
                }
            };
            return Err(Error::Integrity {
                path: first.path.clone(),
                expected,
                actual,
            });
        }

        info!(label = %label, files_verified = total, bytes_verified, "Verification complete");
        Ok(VerifyResult {
            files_verified: total,
            bytes_verified,
        })
    })
    .await?
}

/// Format mismatch errors into a human-readable message
fn format_mismatch_error(mismatches: &[FileMismatch]) -> String {
    let mut msg = format!("{} file(s) did not match", mismatches.len());

    for m in mismatches.iter().take(10) {
        let reason = match &m.reason {
            MismatchReason::HashMismatch { actual, .. } => format!("hash mismatch ({actual})"),
            MismatchReason::Missing => "missing".to_string(),
            MismatchReason::Unreadable(e) => format!("unreadable: {e}"),
        };
        msg.push_str(&format!("\n  - {}: {}", m.path.display(), reason));
    }

    if mismatches.len() > 10 {
        msg.push_str(&format!("\n  ... and {} more", mismatches.len() - 10));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn expect(path: PathBuf, content: &[u8]) -> ExpectedDigest {
        ExpectedDigest {
            path,
            digest: digest_bytes(content, DigestAlgorithm::Sha256),
            size: content.len() as u64,
        }
    }

    #[test]
    fn sha256_matches_known_vector() {
        let digest = digest_bytes(b"abc", DigestAlgorithm::Sha256);
        assert_eq!(
            digest.hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn blake3_matches_library_hash() {
        let digest = digest_bytes(b"hello world", DigestAlgorithm::Blake3);
        assert_eq!(digest.hex, blake3::hash(b"hello world").to_hex().to_string());
    }

    #[test]
    fn streaming_and_one_shot_agree() {
        let data = vec![0x5Au8; 300 * 1024];
        let streamed = digest_reader(&data[..], DigestAlgorithm::Sha256).unwrap();
        assert_eq!(streamed, digest_bytes(&data, DigestAlgorithm::Sha256));
    }

    #[tokio::test]
    async fn verify_files_success() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db.sql.gz");
        std::fs::write(&path, b"hello world").unwrap();

        let result = verify_files("set", &[expect(path, b"hello world")]).await.unwrap();
        assert_eq!(result.files_verified, 1);
        assert_eq!(result.bytes_verified, 11);
    }

    #[tokio::test]
    async fn verify_files_detects_corruption() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db.sql.gz");
        std::fs::write(&path, b"corrupted content").unwrap();

        let err = verify_files("set", &[expect(path, b"original content")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(err.to_string().contains("db.sql.gz"));
    }

    #[tokio::test]
    async fn verify_files_reports_every_mismatch() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a"), b"wrong a").unwrap();
        std::fs::write(temp.path().join("c"), b"wrong c").unwrap();

        let err = verify_files(
            "set",
            &[
                expect(temp.path().join("a"), b"content a"),
                expect(temp.path().join("b"), b"content b"),
                expect(temp.path().join("c"), b"content c"),
            ],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("3 file(s) did not match"));
    }

    #[tokio::test]
    async fn verify_files_empty() {
        let result = verify_files("set", &[]).await.unwrap();
        assert_eq!(result.files_verified, 0);
    }
}
