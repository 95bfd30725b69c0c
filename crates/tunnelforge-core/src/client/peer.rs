use crate::remote::RemoteServer;
use crate::ws::{WsInbound, parse_buffer_frame};

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

/// Something that arrived from (or happened to) a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A buffer frame, kept verbatim, with the session id it carries.
    Frame { session_id: String, data: Vec<u8> },
    /// A JSON control message from the peer.
    Control(String),
    /// The socket closed or failed. No further events follow.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connect to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("connect to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("invalid request for {url}: {message}")]
    Request { url: String, message: String },
}

/// Outbound WebSocket connection to a peer server's `/buffers` endpoint.
///
/// Dropping the connection aborts its reader and writer tasks.
pub struct PeerConnection {
    remote_id: String,
    remote_name: String,
    ws_tx: async_channel::Sender<WsInbound>,
    open: Arc<AtomicBool>,
    reader: tokio::task::AbortHandle,
    writer: tokio::task::AbortHandle,
}

impl PeerConnection {
    /// Connect to `remote`, failing if the handshake does not finish within
    /// `timeout`. Events from the peer are delivered on the returned receiver.
    pub async fn connect(
        remote: &RemoteServer,
        timeout: Duration,
    ) -> Result<(Self, async_channel::Receiver<PeerEvent>), PeerError> {
        let url = remote.buffers_url();

        let mut request = url.as_str().into_client_request().map_err(|e| PeerError::Request {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", remote.token)).map_err(|e| {
            PeerError::Request {
                url: url.clone(),
                message: e.to_string(),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| PeerError::Timeout {
                    url: url.clone(),
                    timeout,
                })?
                .map_err(|e| PeerError::Connect {
                    url: url.clone(),
                    message: e.to_string(),
                })?;

        log::info!("Connected to remote {} ({})", remote.name, url);

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (ws_tx, ws_rx) = async_channel::unbounded::<WsInbound>();
        let (event_tx, event_rx) = async_channel::unbounded::<PeerEvent>();
        let open = Arc::new(AtomicBool::new(true));

        // Writer task
        let writer_open = open.clone();
        let writer_name = remote.name.clone();
        let writer = tokio::spawn(async move {
            while let Ok(msg) = ws_rx.recv().await {
                if let Err(e) = ws_write
                    .send(tungstenite::Message::Text(msg.to_json().into()))
                    .await
                {
                    log::warn!("Failed to send to remote {}: {}", writer_name, e);
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            let _ = ws_write.close().await;
        });

        // Reader task
        let reader_open = open.clone();
        let reader_name = remote.name.clone();
        let reader = tokio::spawn(async move {
            loop {
                match ws_read.next().await {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        let Some((session_id, _)) = parse_buffer_frame(&data) else {
                            log::debug!(
                                "Ignoring malformed binary frame ({} bytes) from remote {}",
                                data.len(),
                                reader_name
                            );
                            continue;
                        };
                        let event = PeerEvent::Frame {
                            session_id: session_id.to_string(),
                            data: data.to_vec(),
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if event_tx.send(PeerEvent::Control(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Remote {} socket error: {}", reader_name, e);
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(PeerEvent::Closed).await;
        });

        Ok((
            Self {
                remote_id: remote.id.clone(),
                remote_name: remote.name.clone(),
                ws_tx,
                open,
                reader: reader.abort_handle(),
                writer: writer.abort_handle(),
            },
            event_rx,
        ))
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.ws_tx.is_closed()
    }

    /// Queue a control message for the peer. Returns false (and sends
    /// nothing) when the connection is no longer open.
    pub fn send_control(&self, msg: WsInbound) -> bool {
        if !self.is_open() {
            log::debug!("Remote {} not open, dropping {:?}", self.remote_name, msg);
            return false;
        }
        self.ws_tx.try_send(msg).is_ok()
    }

    /// Close the socket. The reader reports `PeerEvent::Closed` once it sees
    /// the close.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.ws_tx.close();
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.ws_tx.close();
        self.writer.abort();
        self.reader.abort();
    }
}
