//! Storage-root file management.
//!
//! Every artifact path in the system passes through [`FileManager`]. The
//! root is canonicalized once at construction (on platforms where `/var`
//! and friends are themselves symlinks, resolving the root first keeps
//! descendant checks honest), and every candidate path is normalized,
//! prefix-checked, and swept for symlink components before use.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use fetchd_core::error::ServiceError;

use crate::reaper::{DeletionScheduler, DeletionTaskId};
use crate::sanitize::sanitize_filename;
use crate::template::{TemplateContext, expand_template};

/// Path safety, template placement, and retention for the storage root.
pub struct FileManager {
    /// Canonicalized storage root.
    root: PathBuf,
    /// Public URL prefix; `None` disables public URLs.
    public_base_url: Option<String>,
    /// Deletion scheduler for retention.
    reaper: Arc<DeletionScheduler>,
}

impl FileManager {
    /// Create a manager over `root`, creating the directory if needed.
    pub fn new(
        root: impl AsRef<Path>,
        public_base_url: &str,
        reaper: Arc<DeletionScheduler>,
    ) -> Result<Self, ServiceError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            ServiceError::storage(format!("cannot create storage root {}: {e}", root.display()))
        })?;
        let root = root.canonicalize().map_err(|e| {
            ServiceError::storage(format!(
                "cannot resolve storage root {}: {e}",
                root.display()
            ))
        })?;

        let public_base_url = {
            let trimmed = public_base_url.trim_end_matches('/');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };

        Ok(Self {
            root,
            public_base_url,
            reaper,
        })
    }

    /// The canonical storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a candidate path to a safe absolute path under the root.
    ///
    /// Rejects with `StorageError` when the normalized path escapes the
    /// root, when any component under the root is a symlink, or when the
    /// final filename sanitizes to nothing.
    pub fn validate_path(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, ServiceError> {
        let candidate = candidate.as_ref();
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let normalized = normalize(&joined)?;

        if !normalized.starts_with(&self.root) || normalized == self.root {
            return Err(ServiceError::storage(format!(
                "path {} escapes the storage root",
                candidate.display()
            )));
        }

        let filename = normalized
            .file_name()
            .and_then(|n| n.to_str())
            .map(sanitize_filename)
            .unwrap_or_default();
        if filename.is_empty() {
            return Err(ServiceError::storage(format!(
                "path {} has no usable filename",
                candidate.display()
            )));
        }

        // Sweep every existing component between the root and the target
        // for symlinks. Components that do not exist yet cannot be links.
        let mut probe = self.root.clone();
        for component in normalized
            .strip_prefix(&self.root)
            .map_err(|_| ServiceError::storage("path left the storage root"))?
            .components()
        {
            probe.push(component);
            match std::fs::symlink_metadata(&probe) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ServiceError::storage(format!(
                        "path {} traverses a symlink at {}",
                        candidate.display(),
                        probe.display()
                    )));
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        Ok(normalized)
    }

    /// Create (if needed) and return the private working directory of a job.
    pub fn workdir(&self, job_id: &str) -> Result<PathBuf, ServiceError> {
        let safe = sanitize_filename(job_id);
        if safe.is_empty() {
            return Err(ServiceError::storage("job id sanitizes to nothing"));
        }
        // A dedicated prefix keeps in-flight downloads apart from placed
        // artifacts.
        let dir = self.root.join(".work").join(safe);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ServiceError::storage(format!("cannot create workdir: {e}")))?;
        Ok(dir)
    }

    /// Remove a job's working directory and anything left inside it.
    pub fn remove_workdir(&self, job_id: &str) {
        let safe = sanitize_filename(job_id);
        if safe.is_empty() {
            return;
        }
        let dir = self.root.join(".work").join(safe);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    target: "fetchd.store",
                    path = %dir.display(),
                    error = %e,
                    "Failed to remove workdir"
                );
            }
        }
    }

    /// Move a downloaded file to its templated location under the root.
    ///
    /// Returns the absolute path and the root-relative path.
    pub fn place(
        &self,
        source: &Path,
        template: &str,
        ctx: &TemplateContext,
    ) -> Result<(PathBuf, String), ServiceError> {
        let relative = expand_template(template, ctx);
        let absolute = self.validate_path(Path::new(&relative))?;

        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServiceError::storage(format!("cannot create output dirs: {e}")))?;
        }
        std::fs::rename(source, &absolute).map_err(|e| {
            ServiceError::storage(format!(
                "cannot move {} into place: {e}",
                source.display()
            ))
        })?;

        let relative = absolute
            .strip_prefix(&self.root)
            .map_err(|_| ServiceError::storage("placed file left the storage root"))?
            .to_string_lossy()
            .into_owned();
        Ok((absolute, relative))
    }

    /// Public URL of a root-relative path, if public serving is configured.
    #[must_use]
    pub fn public_url(&self, relative: &str) -> Option<String> {
        let base = self.public_base_url.as_ref()?;
        let encoded: Vec<String> = relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        Some(format!("{base}/files/{}", encoded.join("/")))
    }

    /// Schedule deletion of an artifact after `retention`.
    pub fn schedule_deletion(
        &self,
        path: &Path,
        retention: Duration,
    ) -> Result<(DeletionTaskId, DateTime<Utc>), ServiceError> {
        self.reaper.schedule(path, retention)
    }

    /// The deletion scheduler backing retention.
    #[must_use]
    pub fn reaper(&self) -> &Arc<DeletionScheduler> {
        &self.reaper
    }
}

/// Lexically normalize a path: strip `.`, resolve `..` against the stack.
/// A `..` that would climb past the filesystem root is a storage error.
fn normalize(path: &Path) -> Result<PathBuf, ServiceError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(ServiceError::storage("path underflows the filesystem root"));
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
