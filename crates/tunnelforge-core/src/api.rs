use crate::remote::RemoteServer;
use serde::{Deserialize, Serialize};

// ── API request/response types ──────────────────────────────────────────────

/// GET /health response
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub hq_mode: bool,
}

/// Entry of GET /api/sessions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    /// Transcript size in bytes.
    #[serde(default)]
    pub transcript_bytes: u64,
}

/// GET /api/sessions/{id}/buffer/stats response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub total_rows: usize,
    pub cols: usize,
    pub rows: usize,
    pub viewport_y: i32,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub scrollback: usize,
    pub is_paused: bool,
    pub pending_lines: usize,
    /// Percent of the scrollback in use, 0..=100.
    pub buffer_utilization: u32,
    pub max_buffer_lines: usize,
}

/// POST /api/remotes/register request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRemoteRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

impl RegisterRemoteRequest {
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty() && !self.url.is_empty() && !self.token.is_empty()
    }
}

/// Registered remote as reported over the API. The token is never echoed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSummary {
    pub id: String,
    pub name: String,
    pub url: String,
    pub registered_at: u64,
    pub session_ids: Vec<String>,
}

impl From<&RemoteServer> for RemoteSummary {
    fn from(remote: &RemoteServer) -> Self {
        Self {
            id: remote.id.clone(),
            name: remote.name.clone(),
            url: remote.url.clone(),
            registered_at: remote.registered_at,
            session_ids: remote.session_ids.iter().cloned().collect(),
        }
    }
}

/// POST /api/remotes/register response
#[derive(Serialize, Deserialize)]
pub struct RegisterRemoteResponse {
    pub success: bool,
    pub remote: RemoteSummary,
}

/// POST /api/remotes/{name}/refresh-sessions response
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSessionsResponse {
    pub success: bool,
    pub session_count: usize,
}

/// Generic success response
#[derive(Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Generic error response
#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
