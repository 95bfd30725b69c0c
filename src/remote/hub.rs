use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tunnelforge_core::client::{PeerConnection, PeerEvent};
use tunnelforge_core::codec::encode_snapshot;
use tunnelforge_core::remote::RemoteRegistry;
use tunnelforge_core::snapshot::BufferSnapshot;
use tunnelforge_core::ws::{WsInbound, WsOutbound, build_buffer_frame};
use tunnelforge_terminal::{ChangeCallback, ListenerId, TerminalManager};

pub type ClientId = u64;

/// A message queued for one client socket.
#[derive(Clone, Debug, PartialEq)]
pub enum HubMessage {
    Text(String),
    Binary(Vec<u8>),
}

enum Subscription {
    Local(ListenerId),
    Remote { remote_id: String },
}

struct ClientState {
    tx: async_channel::Sender<HubMessage>,
    subscriptions: HashMap<String, Subscription>,
}

struct PeerRecord {
    conn: Arc<PeerConnection>,
    generation: u64,
}

struct HubInner {
    terminals: TerminalManager,
    /// Present only in HQ mode.
    registry: Option<Arc<dyn RemoteRegistry>>,
    peer_timeout: Duration,
    clients: Mutex<HashMap<ClientId, ClientState>>,
    peers: Mutex<HashMap<String, PeerRecord>>,
    /// One connect at a time per remote, so each remote gets one socket.
    peer_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_client_id: AtomicU64,
    next_generation: AtomicU64,
}

/// Fans buffer snapshots out to WebSocket clients. Local sessions come from
/// the terminal manager; in HQ mode sessions owned by a registered remote are
/// proxied from that remote's own hub.
#[derive(Clone)]
pub struct BufferHub {
    inner: Arc<HubInner>,
}

fn now_millis() -> u64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

impl BufferHub {
    pub fn new(
        terminals: TerminalManager,
        registry: Option<Arc<dyn RemoteRegistry>>,
        peer_timeout: Duration,
    ) -> Self {
        log::info!("Buffer hub started (HQ mode: {})", registry.is_some());
        Self {
            inner: Arc::new(HubInner {
                terminals,
                registry,
                peer_timeout,
                clients: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                peer_locks: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Register a client. The greeting is already queued on the receiver.
    pub fn connect_client(&self) -> (ClientId, async_channel::Receiver<HubMessage>) {
        let (tx, rx) = async_channel::unbounded();
        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let _ = tx.try_send(HubMessage::Text(WsOutbound::connected().to_json()));
        self.inner.clients.lock().insert(
            id,
            ClientState {
                tx,
                subscriptions: HashMap::new(),
            },
        );
        log::info!("Buffer client {} connected ({} total)", id, self.client_count());
        (id, rx)
    }

    fn send(&self, client_id: ClientId, msg: HubMessage) {
        let tx = self
            .inner
            .clients
            .lock()
            .get(&client_id)
            .map(|c| c.tx.clone());
        match tx {
            Some(tx) if tx.try_send(msg).is_ok() => {}
            _ => log::debug!("Buffer client {} is gone, dropping message", client_id),
        }
    }

    fn send_json(&self, client_id: ClientId, msg: &WsOutbound) {
        self.send(client_id, HubMessage::Text(msg.to_json()));
    }

    /// Handle a text message from a client.
    pub async fn handle_text(&self, client_id: ClientId, text: &str) {
        match serde_json::from_str::<WsInbound>(text) {
            Ok(WsInbound::Subscribe { session_id }) => self.subscribe(client_id, &session_id).await,
            Ok(WsInbound::Unsubscribe { session_id }) => self.unsubscribe(client_id, &session_id),
            Ok(WsInbound::Ping) => self.send_json(
                client_id,
                &WsOutbound::Pong {
                    timestamp: now_millis(),
                },
            ),
            Err(e) => {
                log::debug!("Bad message from buffer client {}: {}", client_id, e);
                self.send_json(client_id, &WsOutbound::error("Invalid message format"));
            }
        }
    }

    /// Subscribe a client to a session. Re-subscribing replaces the old
    /// subscription.
    pub async fn subscribe(&self, client_id: ClientId, session_id: &str) {
        self.unsubscribe(client_id, session_id);

        let remote = self
            .inner
            .registry
            .as_ref()
            .and_then(|r| r.find_by_session_id(session_id));
        let ok = match remote {
            Some(remote) => self.subscribe_remote(client_id, session_id, &remote.id).await,
            None => self.subscribe_local(client_id, session_id),
        };
        if ok {
            self.send_json(
                client_id,
                &WsOutbound::Subscribed {
                    session_id: session_id.to_string(),
                },
            );
            log::info!("Buffer client {} subscribed to {}", client_id, session_id);
        }
    }

    fn subscribe_local(&self, client_id: ClientId, session_id: &str) -> bool {
        let Some(tx) = self
            .inner
            .clients
            .lock()
            .get(&client_id)
            .map(|c| c.tx.clone())
        else {
            return false;
        };

        let callback: ChangeCallback = Arc::new(move |id: &str, snapshot: &BufferSnapshot| {
            let frame = build_buffer_frame(id, &encode_snapshot(snapshot));
            if tx.try_send(HubMessage::Binary(frame)).is_err() {
                log::debug!("Skipping buffer update for {}: client gone", id);
            }
        });

        let listener = match self.inner.terminals.subscribe_to_changes(session_id, callback) {
            Ok(listener) => listener,
            Err(e) => {
                log::warn!("Failed to subscribe to local session {}: {}", session_id, e);
                self.send_json(client_id, &WsOutbound::error("Failed to subscribe to session"));
                return false;
            }
        };

        let recorded = match self.inner.clients.lock().get_mut(&client_id) {
            Some(client) => {
                client
                    .subscriptions
                    .insert(session_id.to_string(), Subscription::Local(listener));
                true
            }
            None => false,
        };
        if !recorded {
            self.inner.terminals.unsubscribe(session_id, listener);
            return false;
        }

        match self.inner.terminals.encode_snapshot(session_id) {
            Ok(snapshot) => {
                let frame = build_buffer_frame(session_id, &snapshot);
                log::debug!("Sending initial buffer ({} bytes) for {}", frame.len(), session_id);
                self.send(client_id, HubMessage::Binary(frame));
            }
            Err(e) => log::warn!("No initial buffer for {}: {}", session_id, e),
        }
        true
    }

    async fn subscribe_remote(&self, client_id: ClientId, session_id: &str, remote_id: &str) -> bool {
        let conn = match self.ensure_peer(remote_id).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to connect to remote {} for {}: {:#}", remote_id, session_id, e);
                self.send_json(client_id, &WsOutbound::error("Failed to connect to remote server"));
                return false;
            }
        };

        {
            let mut clients = self.inner.clients.lock();
            let Some(client) = clients.get_mut(&client_id) else {
                return false;
            };
            client.subscriptions.insert(
                session_id.to_string(),
                Subscription::Remote {
                    remote_id: remote_id.to_string(),
                },
            );
        }

        // Sent even when the peer already streams this session, so the new
        // client gets an initial frame.
        if !conn.send_control(WsInbound::Subscribe {
            session_id: session_id.to_string(),
        }) {
            log::warn!("Remote {} closed before subscribe to {}", conn.remote_name(), session_id);
        }
        log::debug!("Requested {} from remote {}", session_id, conn.remote_name());
        true
    }

    /// Return an open connection to `remote_id`, connecting if needed.
    async fn ensure_peer(&self, remote_id: &str) -> anyhow::Result<Arc<PeerConnection>> {
        let connect_lock = self
            .inner
            .peer_locks
            .lock()
            .entry(remote_id.to_string())
            .or_default()
            .clone();
        let _guard = connect_lock.lock().await;

        let existing = self
            .inner
            .peers
            .lock()
            .get(remote_id)
            .filter(|peer| peer.conn.is_open())
            .map(|peer| peer.conn.clone());
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let registry = self
            .inner
            .registry
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("not running in HQ mode"))?;
        let remote = registry
            .find_by_id(remote_id)
            .ok_or_else(|| anyhow::anyhow!("remote {} not registered", remote_id))?;

        let (conn, events) = PeerConnection::connect(&remote, self.inner.peer_timeout).await?;
        let conn = Arc::new(conn);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.peers.lock().insert(
            remote_id.to_string(),
            PeerRecord {
                conn: conn.clone(),
                generation,
            },
        );

        // Clients that outlived an earlier connection still want their frames.
        let wanted = self.wanted_from(remote_id);
        if !wanted.is_empty() {
            log::info!(
                "Re-subscribing {} sessions on remote {}",
                wanted.len(),
                conn.remote_name()
            );
        }
        for session_id in wanted {
            conn.send_control(WsInbound::Subscribe { session_id });
        }

        let weak = Arc::downgrade(&self.inner);
        let pump_conn = Arc::downgrade(&conn);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let Some(hub) = Self::upgrade(&weak) else { break };
                let Some(conn) = pump_conn.upgrade() else { break };
                match event {
                    PeerEvent::Frame { session_id, data } => hub.forward_frame(&session_id, &data),
                    PeerEvent::Control(text) => {
                        log::debug!("Remote {} message: {}", conn.remote_id(), text);
                    }
                    PeerEvent::Closed => {
                        hub.drop_peer(conn.remote_id(), generation);
                        break;
                    }
                }
            }
        });
        Ok(conn)
    }

    /// Sessions that clients have subscribed to through `remote_id`.
    fn wanted_from(&self, remote_id: &str) -> Vec<String> {
        let mut wanted: Vec<String> = self
            .inner
            .clients
            .lock()
            .values()
            .flat_map(|c| c.subscriptions.iter())
            .filter(|(_, sub)| matches!(sub, Subscription::Remote { remote_id: r } if r == remote_id))
            .map(|(session_id, _)| session_id.clone())
            .collect();
        wanted.sort();
        wanted.dedup();
        wanted
    }

    fn upgrade(weak: &Weak<HubInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn drop_peer(&self, remote_id: &str, generation: u64) {
        let mut peers = self.inner.peers.lock();
        if peers.get(remote_id).is_some_and(|p| p.generation == generation) {
            peers.remove(remote_id);
            log::info!("Disconnected from remote {}", remote_id);
        }
    }

    /// Send a peer's frame, unchanged, to every client subscribed to its session.
    fn forward_frame(&self, session_id: &str, data: &[u8]) {
        let targets: Vec<async_channel::Sender<HubMessage>> = self
            .inner
            .clients
            .lock()
            .values()
            .filter(|c| c.subscriptions.contains_key(session_id))
            .map(|c| c.tx.clone())
            .collect();
        for tx in &targets {
            let _ = tx.try_send(HubMessage::Binary(data.to_vec()));
        }
        if !targets.is_empty() {
            log::debug!("Forwarded buffer for {} to {} clients", session_id, targets.len());
        }
    }

    /// Drop a client's subscription to a session, if it has one.
    pub fn unsubscribe(&self, client_id: ClientId, session_id: &str) {
        let removed = self
            .inner
            .clients
            .lock()
            .get_mut(&client_id)
            .and_then(|c| c.subscriptions.remove(session_id));
        let Some(subscription) = removed else {
            return;
        };
        self.release(session_id, subscription);
        log::info!("Buffer client {} unsubscribed from {}", client_id, session_id);
    }

    fn release(&self, session_id: &str, subscription: Subscription) {
        match subscription {
            Subscription::Local(listener) => {
                self.inner.terminals.unsubscribe(session_id, listener);
            }
            Subscription::Remote { remote_id } => {
                let still_wanted = self.inner.clients.lock().values().any(|c| {
                    matches!(
                        c.subscriptions.get(session_id),
                        Some(Subscription::Remote { remote_id: r }) if *r == remote_id
                    )
                });
                if still_wanted {
                    return;
                }
                let conn = self
                    .inner
                    .peers
                    .lock()
                    .get(&remote_id)
                    .map(|peer| peer.conn.clone());
                let Some(conn) = conn else {
                    return;
                };
                if !conn.send_control(WsInbound::Unsubscribe {
                    session_id: session_id.to_string(),
                }) {
                    log::debug!(
                        "Cannot unsubscribe {} from remote {}: connection not open",
                        session_id,
                        conn.remote_name()
                    );
                }
            }
        }
    }

    /// Forget a client and everything it was subscribed to.
    pub fn disconnect_client(&self, client_id: ClientId) {
        let Some(client) = self.inner.clients.lock().remove(&client_id) else {
            return;
        };
        let count = client.subscriptions.len();
        for (session_id, subscription) in client.subscriptions {
            self.release(&session_id, subscription);
        }
        log::info!(
            "Buffer client {} disconnected ({} subscriptions cleaned up)",
            client_id,
            count
        );
    }

    /// Connect to a newly registered remote ahead of the first subscriber.
    pub async fn on_remote_registered(&self, remote_id: &str) {
        if let Err(e) = self.ensure_peer(remote_id).await {
            log::warn!("Failed to pre-connect to remote {}: {:#}", remote_id, e);
        }
    }

    /// Tear down the connection to an unregistered remote.
    pub fn on_remote_unregistered(&self, remote_id: &str) {
        self.inner.peer_locks.lock().remove(remote_id);
        let removed = self.inner.peers.lock().remove(remote_id);
        if let Some(peer) = removed {
            peer.conn.close();
            log::info!(
                "Closed connection to unregistered remote {} ({} peers left)",
                remote_id,
                self.peer_count()
            );
        }
    }

    /// Close every client and peer connection.
    pub fn shutdown(&self) {
        let clients: Vec<(ClientId, ClientState)> = self.inner.clients.lock().drain().collect();
        for (_, client) in clients {
            client.tx.close();
            for (session_id, subscription) in client.subscriptions {
                if let Subscription::Local(listener) = subscription {
                    self.inner.terminals.unsubscribe(&session_id, listener);
                }
            }
        }
        let peers: Vec<PeerRecord> = self.inner.peers.lock().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.conn.close();
        }
        log::info!("Buffer hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::registry::MemoryRegistry;
    use std::io::Write;
    use std::path::Path;
    use tunnelforge_core::codec::decode_snapshot;
    use tunnelforge_core::remote::RemoteServer;
    use tunnelforge_core::session::transcript_path;
    use tunnelforge_core::ws::parse_buffer_frame;
    use tunnelforge_terminal::{FlowControlConfig, TerminalSettings};

    fn write_session(control_dir: &Path, session_id: &str, lines: &[&str]) {
        let path = transcript_path(control_dir, session_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    fn hub(control_dir: &Path, registry: Option<Arc<dyn RemoteRegistry>>) -> BufferHub {
        let terminals = TerminalManager::new(
            control_dir,
            TerminalSettings::default(),
            FlowControlConfig::default(),
        );
        BufferHub::new(terminals, registry, Duration::from_millis(500))
    }

    fn drain(rx: &async_channel::Receiver<HubMessage>) -> Vec<HubMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn json(msg: &HubMessage) -> serde_json::Value {
        match msg {
            HubMessage::Text(t) => serde_json::from_str(t).unwrap(),
            HubMessage::Binary(_) => panic!("expected text, got binary"),
        }
    }

    #[tokio::test]
    async fn greets_and_answers_ping() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path(), None);
        let (id, rx) = hub.connect_client();
        hub.handle_text(id, r#"{"type":"ping"}"#).await;
        hub.handle_text(id, "nonsense").await;

        let msgs = drain(&rx);
        assert_eq!(json(&msgs[0]), serde_json::json!({"type":"connected","version":"1.0"}));
        assert_eq!(json(&msgs[1])["type"], "pong");
        assert!(json(&msgs[1])["timestamp"].as_u64().unwrap() > 0);
        assert_eq!(json(&msgs[2])["type"], "error");
    }

    #[tokio::test]
    async fn local_subscribe_sends_frame_then_subscribed() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            "s1",
            &[r#"{"version":2,"width":80,"height":24}"#, r#"[0.1,"o","hi"]"#],
        );
        let hub = hub(dir.path(), None);
        let (id, rx) = hub.connect_client();
        drain(&rx);

        hub.handle_text(id, r#"{"type":"subscribe","sessionId":"s1"}"#).await;
        let msgs = drain(&rx);
        assert_eq!(msgs.len(), 2);
        let HubMessage::Binary(frame) = &msgs[0] else {
            panic!("expected a buffer frame first");
        };
        let (session_id, snapshot) = parse_buffer_frame(frame).unwrap();
        assert_eq!(session_id, "s1");
        let snapshot = decode_snapshot(snapshot).unwrap();
        assert_eq!(snapshot.cells[0][0].ch, "h");
        assert_eq!(json(&msgs[1]), serde_json::json!({"type":"subscribed","sessionId":"s1"}));

        // Changes are pushed after the debounce.
        write_session(dir.path(), "s1", &[r#"[0.2,"o","!"]"#]);
        hub.inner.terminals.on_file_changed("s1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let updates = drain(&rx);
        assert!(!updates.is_empty());
        assert!(updates.iter().all(|m| matches!(m, HubMessage::Binary(_))));

        // Nothing after unsubscribing.
        hub.handle_text(id, r#"{"type":"unsubscribe","sessionId":"s1"}"#).await;
        assert_eq!(hub.inner.terminals.listener_count("s1"), 0);
        write_session(dir.path(), "s1", &[r#"[0.3,"o","?"]"#]);
        hub.inner.terminals.on_file_changed("s1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(drain(&rx).is_empty());
    }

    #[tokio::test]
    async fn resubscribe_keeps_one_listener_and_disconnect_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        write_session(dir.path(), "s1", &[r#"{"version":2,"width":80,"height":24}"#]);
        let hub = hub(dir.path(), None);
        let (id, _rx) = hub.connect_client();

        hub.subscribe(id, "s1").await;
        hub.subscribe(id, "s1").await;
        assert_eq!(hub.inner.terminals.listener_count("s1"), 1);

        hub.disconnect_client(id);
        assert_eq!(hub.inner.terminals.listener_count("s1"), 0);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path(), None);
        let (id, rx) = hub.connect_client();
        drain(&rx);
        hub.subscribe(id, "missing").await;
        let msgs = drain(&rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(json(&msgs[0])["type"], "error");
    }

    #[tokio::test]
    async fn unreachable_remote_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register(RemoteServer::new("r1", "box", "http://127.0.0.1:1", "t"))
            .unwrap();
        registry.update_sessions("r1", ["remote-s".to_string()]);
        let hub = hub(dir.path(), Some(registry));
        let (id, rx) = hub.connect_client();
        drain(&rx);

        hub.subscribe(id, "remote-s").await;
        let msgs = drain(&rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            json(&msgs[0]),
            serde_json::json!({"type":"error","message":"Failed to connect to remote server"})
        );
        assert_eq!(hub.peer_count(), 0);

        // Unsubscribing something never subscribed is a no-op.
        hub.unsubscribe(id, "remote-s");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_remote_does_not_hold_up_another() {
        let dir = tempfile::tempdir().unwrap();
        // Accepts connections but never answers the WebSocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let slow_url = format!("http://{}", listener.local_addr().unwrap());
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register(RemoteServer::new("slow", "slow", slow_url, "t"))
            .unwrap();
        registry
            .register(RemoteServer::new("dead", "dead", "http://127.0.0.1:1", "t"))
            .unwrap();
        registry.update_sessions("slow", ["slow-s".to_string()]);
        registry.update_sessions("dead", ["dead-s".to_string()]);
        let terminals = TerminalManager::new(
            dir.path(),
            TerminalSettings::default(),
            FlowControlConfig::default(),
        );
        let hub = BufferHub::new(terminals, Some(registry), Duration::from_secs(3));

        let (slow_client, _slow_rx) = hub.connect_client();
        let pending = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.subscribe(slow_client, "slow-s").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (id, rx) = hub.connect_client();
        drain(&rx);
        let started = std::time::Instant::now();
        hub.subscribe(id, "dead-s").await;
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert_eq!(json(&drain(&rx)[0])["type"], "error");

        pending.abort();
        silent.abort();
    }

    #[tokio::test]
    async fn reconnect_resubscribes_sessions_clients_still_want() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path(), None);
        let (a, _rx_a) = hub.connect_client();
        let (b, _rx_b) = hub.connect_client();
        {
            let mut clients = hub.inner.clients.lock();
            for (client, session, remote) in [(a, "x", "r1"), (b, "x", "r1"), (b, "y", "r1"), (a, "z", "r2")] {
                clients.get_mut(&client).unwrap().subscriptions.insert(
                    session.to_string(),
                    Subscription::Remote {
                        remote_id: remote.to_string(),
                    },
                );
            }
        }

        assert_eq!(hub.wanted_from("r1"), vec!["x", "y"]);
        assert_eq!(hub.wanted_from("r2"), vec!["z"]);
        assert!(hub.wanted_from("r3").is_empty());

        hub.unsubscribe(b, "y");
        assert_eq!(hub.wanted_from("r1"), vec!["x"]);
    }
}
