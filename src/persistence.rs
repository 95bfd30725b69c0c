use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tunnelforge_core::session::{SessionInfo, SessionStore, is_valid_session_id, session_info_path};

/// Write a file atomically (temp file + rename), 0600 on unix.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Session metadata kept as `session.json` next to each transcript.
pub struct FileSessionStore {
    control_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        if !is_valid_session_id(session_id) {
            return Ok(None);
        }
        let path = session_info_path(&self.control_dir, session_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let info = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(info))
    }

    fn save(&self, session_id: &str, info: &SessionInfo) -> Result<()> {
        anyhow::ensure!(is_valid_session_id(session_id), "invalid session id {:?}", session_id);
        let path = session_info_path(&self.control_dir, session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(info)?;
        write_atomic(&path, content.as_bytes())
    }
}

/// Session metadata held in memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySessionStore {
    infos: parking_lot::Mutex<std::collections::HashMap<String, SessionInfo>>,
}

#[cfg(test)]
impl MemorySessionStore {
    pub fn insert(&self, session_id: &str, info: SessionInfo) {
        self.infos.lock().insert(session_id.to_string(), info);
    }
}

#[cfg(test)]
impl SessionStore for MemorySessionStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        Ok(self.infos.lock().get(session_id).cloned())
    }

    fn save(&self, session_id: &str, info: &SessionInfo) -> Result<()> {
        self.infos.lock().insert(session_id.to_string(), info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_metadata_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.load("abc").unwrap().is_none());
        assert!(store.load("../x").unwrap().is_none());
    }

    #[test]
    fn save_preserves_foreign_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("abc")).unwrap();
        std::fs::write(
            dir.path().join("abc/session.json"),
            r#"{"name":"build","pid":7}"#,
        )
        .unwrap();

        let store = FileSessionStore::new(dir.path());
        let mut info = store.load("abc").unwrap().unwrap();
        assert_eq!(info.prune_offset, None);
        info.prune_offset = Some(512);
        store.save("abc", &info).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("abc/session.json")).unwrap())
                .unwrap();
        assert_eq!(raw["pruneOffset"], 512);
        assert_eq!(raw["pid"], 7);
        assert!(!dir.path().join("abc/session.tmp").exists());
    }

    #[test]
    fn corrupt_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("abc")).unwrap();
        std::fs::write(dir.path().join("abc/session.json"), "{").unwrap();
        assert!(FileSessionStore::new(dir.path()).load("abc").is_err());
    }
}
