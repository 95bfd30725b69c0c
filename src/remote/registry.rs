use parking_lot::Mutex;
use std::collections::HashMap;
use tunnelforge_core::remote::{RemoteRegistry, RemoteServer};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Remote with ID {0} already registered")]
    DuplicateId(String),
    #[error("Remote with name {0} already registered")]
    DuplicateName(String),
}

#[derive(Default)]
struct RegistryInner {
    remotes: HashMap<String, RemoteServer>,
    session_to_remote: HashMap<String, String>,
}

/// Peers registered with this HQ, and which of them owns each session.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<RegistryInner>,
}

fn now_millis() -> u64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mut remote: RemoteServer) -> Result<RemoteServer, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.remotes.contains_key(&remote.id) {
            return Err(RegistryError::DuplicateId(remote.id));
        }
        if inner.remotes.values().any(|r| r.name == remote.name) {
            return Err(RegistryError::DuplicateName(remote.name));
        }
        remote.registered_at = now_millis();
        for session_id in &remote.session_ids {
            inner
                .session_to_remote
                .insert(session_id.clone(), remote.id.clone());
        }
        inner.remotes.insert(remote.id.clone(), remote.clone());
        log::info!("Remote registered: {} ({}) at {}", remote.name, remote.id, remote.url);
        Ok(remote)
    }

    /// Returns the removed remote, if it was registered.
    pub fn unregister(&self, remote_id: &str) -> Option<RemoteServer> {
        let mut inner = self.inner.lock();
        let remote = inner.remotes.remove(remote_id)?;
        inner.session_to_remote.retain(|_, owner| owner != remote_id);
        log::info!("Remote unregistered: {} ({})", remote.name, remote.id);
        Some(remote)
    }

    pub fn find_by_name(&self, name: &str) -> Option<RemoteServer> {
        self.inner
            .lock()
            .remotes
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    /// All remotes, oldest registration first.
    pub fn list(&self) -> Vec<RemoteServer> {
        let mut remotes: Vec<RemoteServer> = self.inner.lock().remotes.values().cloned().collect();
        remotes.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        remotes
    }

    /// Replace the set of sessions a remote owns.
    pub fn update_sessions(&self, remote_id: &str, session_ids: impl IntoIterator<Item = String>) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(remote) = inner.remotes.get_mut(remote_id) else {
            return false;
        };
        inner.session_to_remote.retain(|_, owner| owner != remote_id);
        remote.session_ids = session_ids.into_iter().collect();
        for session_id in &remote.session_ids {
            inner
                .session_to_remote
                .insert(session_id.clone(), remote_id.to_string());
        }
        true
    }
}

impl RemoteRegistry for MemoryRegistry {
    fn find_by_session_id(&self, session_id: &str) -> Option<RemoteServer> {
        let inner = self.inner.lock();
        let remote_id = inner.session_to_remote.get(session_id)?;
        inner.remotes.get(remote_id).cloned()
    }

    fn find_by_id(&self, remote_id: &str) -> Option<RemoteServer> {
        self.inner.lock().remotes.get(remote_id).cloned()
    }
}
