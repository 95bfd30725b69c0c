use std::collections::BTreeSet;

/// A peer server registered with this HQ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteServer {
    pub id: String,
    pub name: String,
    /// Base HTTP(S) address, e.g. `http://10.0.0.5:4020`.
    pub url: String,
    /// Bearer token presented when connecting to the peer.
    pub token: String,
    /// Unix milliseconds.
    pub registered_at: u64,
    pub session_ids: BTreeSet<String>,
}

impl RemoteServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            token: token.into(),
            registered_at: 0,
            session_ids: BTreeSet::new(),
        }
    }

    /// WebSocket address of the peer's `/buffers` endpoint.
    pub fn buffers_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https") {
            format!("wss{}", rest)
        } else if let Some(rest) = base.strip_prefix("http") {
            format!("ws{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/buffers", ws_base)
    }
}

/// Lookup of which peer owns a session. Only consulted in HQ mode.
pub trait RemoteRegistry: Send + Sync {
    fn find_by_session_id(&self, session_id: &str) -> Option<RemoteServer>;
    fn find_by_id(&self, remote_id: &str) -> Option<RemoteServer>;
}
