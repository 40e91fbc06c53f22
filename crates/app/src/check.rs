use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryStatus {
    Present,
    Missing,
    Created,
    NotADirectory,
}

impl fmt::Display for DirectoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DirectoryStatus::Present => "ok",
            DirectoryStatus::Missing => "does not exist",
            DirectoryStatus::Created => "created",
            DirectoryStatus::NotADirectory => "is not a directory",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryCheck {
    pub key: String,
    pub path: PathBuf,
    pub status: DirectoryStatus,
}

impl DirectoryCheck {
    pub fn is_problem(&self) -> bool {
        matches!(
            self.status,
            DirectoryStatus::Missing | DirectoryStatus::NotADirectory
        )
    }
}

/// Report on each configured directory, creating missing ones when `fix` is set.
pub fn check_directories(dirs: &[(String, PathBuf)], fix: bool) -> Result<Vec<DirectoryCheck>> {
    dirs.iter()
        .map(|(key, path)| {
            let status = check_directory(path, fix)?;
            Ok(DirectoryCheck {
                key: key.clone(),
                path: path.clone(),
                status,
            })
        })
        .collect()
}

fn check_directory(path: &Path, fix: bool) -> Result<DirectoryStatus> {
    if path.is_dir() {
        return Ok(DirectoryStatus::Present);
    }
    if path.exists() {
        return Ok(DirectoryStatus::NotADirectory);
    }
    if !fix {
        return Ok(DirectoryStatus::Missing);
    }
    info!(path = %path.display(), "creating directory");
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(DirectoryStatus::Created)
}
