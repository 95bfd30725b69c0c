use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the transcript inside a session directory.
pub const TRANSCRIPT_FILE: &str = "stdout";
/// File name of the session metadata inside a session directory.
pub const SESSION_FILE: &str = "session.json";

/// Session ids name a directory under the control dir, so they must be a
/// single path component.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id != "."
        && session_id != ".."
        && !session_id.contains(['/', '\\', '\0'])
}

/// `<control_dir>/<session_id>/stdout`
pub fn transcript_path(control_dir: &Path, session_id: &str) -> PathBuf {
    control_dir.join(session_id).join(TRANSCRIPT_FILE)
}

/// `<control_dir>/<session_id>/session.json`
pub fn session_info_path(control_dir: &Path, session_id: &str) -> PathBuf {
    control_dir.join(session_id).join(SESSION_FILE)
}

/// Persisted session metadata.
///
/// Only `prune_offset` is interpreted here; every other field written by the
/// session owner is carried through untouched on save.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Byte offset where replay to new subscribers starts.
    #[serde(
        default,
        alias = "lastClearOffset",
        skip_serializing_if = "Option::is_none"
    )]
    pub prune_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Session metadata storage.
pub trait SessionStore: Send + Sync {
    /// Load metadata for a session. `Ok(None)` when nothing is stored.
    fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionInfo>>;
    fn save(&self, session_id: &str, info: &SessionInfo) -> anyhow::Result<()>;
}
