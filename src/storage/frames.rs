//! Content-addressed frame store.
//!
//! Layout: `<root>/<hash[0..2]>/<hash>`. The SHA-256 of the encoded bytes is
//! the only identity, so storing the same bytes twice is a no-op.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RecallError, Result};

const TMP_SUFFIX: &str = ".tmp";

pub struct FrameStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub temp_files_removed: usize,
    pub orphans_removed: usize,
}

impl FrameStore {
    /// Open (creating if needed) a store rooted at `root`. Leftover temp files
    /// from an interrupted write are cleared by `reconcile`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            RecallError::storage(format!(
                "Failed to create frame directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    fn is_valid_hash(hash: &str) -> bool {
        hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }

    /// Absolute path of the frame with this hash (whether or not it exists).
    pub fn path_for(&self, hash: &str) -> Result<PathBuf> {
        if !Self::is_valid_hash(hash) {
            return Err(RecallError::FrameNotFound(format!(
                "malformed content hash '{}'",
                hash
            )));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.path_for(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Store `data` and return its content hash. The file is fsync'ed and
    /// renamed into place before this returns.
    pub fn put(&self, data: &[u8]) -> Result<String> {
        let hash = Self::compute_hash(data);
        let final_path = self.path_for(&hash)?;
        if final_path.is_file() {
            tracing::debug!("Frame {} already stored", &hash[..12]);
            return Ok(hash);
        }

        let dir = final_path
            .parent()
            .ok_or_else(|| RecallError::storage("frame path has no parent"))?;
        fs::create_dir_all(dir)
            .map_err(|e| RecallError::storage(format!("Failed to create frame shard dir: {}", e)))?;

        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = dir.join(format!("{}.{}.{}{}", hash, std::process::id(), seq, TMP_SUFFIX));

        let write_result = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &final_path)?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(RecallError::storage(format!(
                "Failed to write frame {}: {}",
                &hash[..12],
                e
            )));
        }

        sync_dir(dir);
        Ok(hash)
    }

    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.path_for(hash)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RecallError::FrameNotFound(hash.to_string()))
            }
            Err(e) => Err(RecallError::storage(format!(
                "Failed to read frame {}: {}",
                hash, e
            ))),
        }
    }

    /// Every stored hash.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        for shard in fs::read_dir(&self.root)?.flatten() {
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for file in fs::read_dir(shard.path())?.flatten() {
                let name = file.file_name().to_string_lossy().to_string();
                if Self::is_valid_hash(&name) {
                    hashes.push(name);
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Remove interrupted temp files and frames no entry references.
    /// Must run before capture starts.
    pub fn reconcile(&self, referenced: &HashSet<String>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for shard in fs::read_dir(&self.root)?.flatten() {
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for file in fs::read_dir(shard.path())?.flatten() {
                let name = file.file_name().to_string_lossy().to_string();
                if name.ends_with(TMP_SUFFIX) {
                    if fs::remove_file(file.path()).is_ok() {
                        report.temp_files_removed += 1;
                    }
                } else if Self::is_valid_hash(&name) && !referenced.contains(&name) {
                    match fs::remove_file(file.path()) {
                        Ok(()) => report.orphans_removed += 1,
                        Err(e) => tracing::warn!("Failed to remove orphan frame {}: {}", name, e),
                    }
                }
            }
        }
        if report.temp_files_removed > 0 || report.orphans_removed > 0 {
            tracing::info!(
                "Frame store reconciled: {} temp files, {} orphan frames removed",
                report.temp_files_removed,
                report.orphans_removed
            );
        }
        Ok(report)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
