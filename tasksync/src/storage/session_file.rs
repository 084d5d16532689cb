use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::session::SessionState;

const APP_DIR_NAME: &str = "tasksync";
const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, Error)]
pub enum SessionFileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed session file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session persisted as JSON so a restart does not require signing in again.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME)
            .join(SESSION_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<SessionState>, SessionFileError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    pub async fn save(&self, state: &SessionState) -> Result<(), SessionFileError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), SessionFileError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_core::AuthUser;
    use tempfile::tempdir;

    fn state() -> SessionState {
        SessionState {
            access_token: "access-1".into(),
            refresh_token: "refresh-1".into(),
            expires_at: Some(1_714_557_600),
            user: AuthUser {
                id: "u1".into(),
                email: Some("ann@example.com".into()),
            },
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("session.json"));
        assert!(file.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_creates_parent_dirs_and_load_reads_back() {
        let dir = tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("nested/tasksync/session.json"));
        file.save(&state()).await.unwrap();

        assert_eq!(file.load().await.unwrap(), Some(state()));
        assert!(!file.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("session.json"));
        file.save(&state()).await.unwrap();
        file.delete().await.unwrap();
        file.delete().await.unwrap();
        assert!(file.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = SessionFile::new(path).load().await.unwrap_err();
        assert!(matches!(err, SessionFileError::Json(_)));
    }
}
