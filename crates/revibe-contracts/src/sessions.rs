use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::Utc;

/// Named subdirectories of one pipeline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Products,
    Composites,
    FinalDesigns,
    Analysis,
    Debug,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Products,
        ArtifactKind::Composites,
        ArtifactKind::FinalDesigns,
        ArtifactKind::Analysis,
        ArtifactKind::Debug,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Products => "products",
            ArtifactKind::Composites => "composites",
            ArtifactKind::FinalDesigns => "final_designs",
            ArtifactKind::Analysis => "analysis",
            ArtifactKind::Debug => "debug",
        }
    }
}

/// One pipeline run's directory tree under `<base>/sessions/<id>/`.
///
/// Sessions are never torn down automatically. Concurrent runs get distinct
/// directories by construction; a timestamp collision between two runs
/// started the same second is the only unmitigated risk.
#[derive(Debug, Clone)]
pub struct Session {
    base_dir: PathBuf,
    session_id: String,
    session_path: PathBuf,
}

impl Session {
    /// Create the session tree. `session_id` defaults to a UTC timestamp.
    pub fn create(base_dir: impl Into<PathBuf>, session_id: Option<String>) -> Result<Self> {
        let base_dir = base_dir.into();
        let session_id = session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string());
        if session_id == "latest" || session_id.contains(['/', '\\']) {
            bail!("invalid session id '{session_id}'");
        }
        let session_path = base_dir.join("sessions").join(&session_id);
        for kind in ArtifactKind::ALL {
            fs::create_dir_all(session_path.join(kind.dir_name())).with_context(|| {
                format!("failed creating session directory {}", session_path.display())
            })?;
        }
        Ok(Self {
            base_dir,
            session_id,
            session_path,
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.session_path
    }

    pub fn dir(&self, kind: ArtifactKind) -> PathBuf {
        self.session_path.join(kind.dir_name())
    }

    /// Write `bytes` into the subdirectory for `kind`; returns the path.
    pub fn save_bytes(&self, kind: ArtifactKind, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let target = self.dir(kind).join(name);
        fs::write(&target, bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(target)
    }

    pub fn save_text(&self, kind: ArtifactKind, name: &str, text: &str) -> Result<PathBuf> {
        self.save_bytes(kind, name, text.as_bytes())
    }

    /// Copy an existing file into the subdirectory for `kind`.
    pub fn copy_into(&self, kind: ArtifactKind, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| anyhow::anyhow!("source has no file name: {}", source.display()))?;
        let target = self.dir(kind).join(name);
        fs::copy(source, &target).with_context(|| {
            format!(
                "failed to copy {} into {}",
                source.display(),
                target.display()
            )
        })?;
        Ok(target)
    }

    /// Point `<base>/sessions/latest` at this session, replacing any
    /// previous link.
    #[cfg(unix)]
    pub fn create_latest_symlink(&self) -> Result<PathBuf> {
        let latest = self.base_dir.join("sessions").join("latest");
        if latest.symlink_metadata().is_ok() {
            fs::remove_file(&latest)
                .with_context(|| format!("failed to remove {}", latest.display()))?;
        }
        std::os::unix::fs::symlink(&self.session_path, &latest)
            .with_context(|| format!("failed to link {}", latest.display()))?;
        Ok(latest)
    }

    #[cfg(not(unix))]
    pub fn create_latest_symlink(&self) -> Result<PathBuf> {
        Ok(self.base_dir.join("sessions").join("latest"))
    }

    /// Delete sessions under `base_dir` whose tree was last modified more
    /// than `max_age_days` ago. The `latest` link is always kept. Returns
    /// how many sessions were removed.
    pub fn prune_older_than(base_dir: &Path, max_age_days: u64) -> Result<usize> {
        let sessions_dir = base_dir.join("sessions");
        if !sessions_dir.is_dir() {
            return Ok(0);
        }
        let cutoff = SystemTime::now() - Duration::from_secs(max_age_days * 24 * 60 * 60);
        let mut removed = 0;
        for entry in fs::read_dir(&sessions_dir)
            .with_context(|| format!("failed reading {}", sessions_dir.display()))?
        {
            let entry = entry?;
            if entry.file_name() == "latest" {
                continue;
            }
            let path = entry.path();
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
