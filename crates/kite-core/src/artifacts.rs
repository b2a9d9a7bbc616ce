//! Named file/directory artifact store (Section 4.2).
//!
//! Artifacts live under `workspace/<artifactRoot>/<name>` and are indexed
//! by a JSON manifest (`artifactRoot/manifest`) so that names survive
//! across runs in the same workspace. `put` is atomic from a consumer's
//! perspective: a replace is staged into a sibling temp path and swapped
//! into place, never observed half-written.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MANIFEST_VERSION: u32 = 1;
const MANIFEST_FILE_NAME: &str = "manifest";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("artifact source not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("failed to persist manifest: {0}")]
    ManifestPersistFailure(io::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// On-disk manifest shape. Stable per Section 6: `{ "version": 1, "entries": {...} }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// Named file/directory store rooted at `workspace/<artifactRoot>/`.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    index: RwLock<BTreeMap<String, String>>,
}

impl ArtifactStore {
    /// Open (or create) a store rooted at `artifact_root`. Does not load
    /// any existing manifest; call `load_manifest` explicitly so callers
    /// control when cross-run state is adopted.
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            root: artifact_root.into(),
            index: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Copy `source` (file or directory, recursive) into `artifactRoot/name`,
    /// replacing any prior entry. Updates the in-memory index; callers
    /// persist the manifest explicitly via `save_manifest` at the points
    /// the scheduler considers durable (Section 4.2).
    pub fn put(&self, name: &str, source: &Path) -> Result<PathBuf> {
        if !source.exists() {
            return Err(ArtifactError::SourceNotFound(source.to_path_buf()));
        }
        fs::create_dir_all(&self.root)?;

        let dest = self.entry_path(name);
        let staged = self.root.join(format!("{name}.tmp"));
        if staged.exists() {
            remove_any(&staged)?;
        }

        if source.is_dir() {
            copy_dir_recursive(source, &staged)?;
        } else {
            if let Some(parent) = staged.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, &staged)?;
        }

        // Staged rename: swap the new entry into place, then drop the old one.
        if dest.exists() {
            let previous = self.root.join(format!("{name}.prev"));
            if previous.exists() {
                remove_any(&previous)?;
            }
            fs::rename(&dest, &previous)?;
            fs::rename(&staged, &dest)?;
            remove_any(&previous)?;
        } else {
            fs::rename(&staged, &dest)?;
        }

        self.index
            .write()
            .expect("artifact index poisoned")
            .insert(name.to_string(), name.to_string());

        Ok(dest)
    }

    /// Absolute path under `artifactRoot/name`, if registered.
    pub fn get(&self, name: &str) -> Option<PathBuf> {
        let index = self.index.read().expect("artifact index poisoned");
        index.get(name).map(|rel| self.root.join(rel))
    }

    pub fn has(&self, name: &str) -> bool {
        self.index
            .read()
            .expect("artifact index poisoned")
            .contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.index
            .read()
            .expect("artifact index poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// SHA256 of a stored artifact's contents, for test assertions
    /// (ambient addition, Section 4.2 implementation note; not part of the
    /// stable manifest shape). Directories hash their concatenated,
    /// path-sorted file contents.
    pub fn checksum(&self, name: &str) -> Result<Option<String>> {
        let Some(path) = self.get(name) else {
            return Ok(None);
        };
        Ok(Some(checksum_path(&path)?))
    }

    /// Serialise `name → relativePath` to `artifactRoot/manifest` with an
    /// atomic write (temp file, fsync, rename).
    pub fn save_manifest(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let entries = self.index.read().expect("artifact index poisoned").clone();
        let manifest = ManifestFile {
            version: MANIFEST_VERSION,
            entries,
        };
        let body = serde_json::to_string_pretty(&manifest)
            .map_err(|e| ArtifactError::ManifestPersistFailure(io::Error::other(e)))?;

        let path = self.manifest_path();
        let tmp_path = self.root.join(format!("{MANIFEST_FILE_NAME}.tmp"));
        {
            let mut file = fs::File::create(&tmp_path)
                .map_err(ArtifactError::ManifestPersistFailure)?;
            use std::io::Write;
            file.write_all(body.as_bytes())
                .map_err(ArtifactError::ManifestPersistFailure)?;
            file.sync_all().map_err(ArtifactError::ManifestPersistFailure)?;
        }
        fs::rename(&tmp_path, &path).map_err(ArtifactError::ManifestPersistFailure)?;
        Ok(())
    }

    /// Populate the index from the on-disk manifest. Entries whose target
    /// path has vanished are dropped with a `tracing::warn`.
    pub fn load_manifest(&self) -> Result<()> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(());
        }
        let body = fs::read_to_string(&path)?;
        let manifest: ManifestFile = serde_json::from_str(&body).unwrap_or_default();

        let mut index = self.index.write().expect("artifact index poisoned");
        index.clear();
        for (name, rel_path) in manifest.entries {
            let abs = self.root.join(&rel_path);
            if abs.exists() {
                index.insert(name, rel_path);
            } else {
                tracing::warn!(artifact = %name, path = %abs.display(), "manifest entry missing on disk, dropping");
            }
        }
        Ok(())
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

fn checksum_path(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    if path.is_dir() {
        let mut files = collect_files_sorted(path)?;
        files.sort();
        for file in files {
            hash_file(&file, &mut hasher)?;
        }
    } else {
        hash_file(path, &mut hasher)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_files_sorted(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(collect_files_sorted(&path)?);
        } else {
            out.push(path);
        }
    }
    Ok(out)
}

fn hash_file(path: &Path, hasher: &mut Sha256) -> io::Result<()> {
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}
