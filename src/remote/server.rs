use crate::config::ServerConfig;
use crate::persistence::FileSessionStore;
use crate::remote::hub::BufferHub;
use crate::remote::registry::MemoryRegistry;
use crate::remote::routes::{self, AppState};
use crate::stream::StreamWatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tunnelforge_core::remote::RemoteRegistry;
use tunnelforge_terminal::TerminalManager;

/// Build every service the routes need from the configuration.
/// Must be called inside a tokio runtime.
pub fn build_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let terminals = TerminalManager::new(
        &config.control_dir,
        config.terminal.clone(),
        config.flow_control.clone(),
    );
    terminals.spawn_background_tasks();

    let streams = StreamWatcher::new(Arc::new(FileSessionStore::new(&config.control_dir)));

    let registry = config.hq_mode.then(|| Arc::new(MemoryRegistry::new()));
    let hub = BufferHub::new(
        terminals.clone(),
        registry
            .clone()
            .map(|r| r as Arc<dyn RemoteRegistry>),
        Duration::from_secs(config.peer_connect_timeout_secs),
    );

    let http = reqwest::Client::builder().build()?;

    Ok(AppState {
        terminals,
        streams,
        hub,
        registry,
        auth_token: config.auth_token.as_deref().map(Arc::from),
        http,
        start_time: Instant::now(),
    })
}

/// Handle to a running server. Call [`Server::stop`] and then
/// [`Server::wait`] to shut down gracefully.
pub struct Server {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    addr: SocketAddr,
    state: AppState,
}

impl Server {
    /// Bind `addr` and start serving on the current runtime.
    pub async fn start(addr: &str, state: AppState) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = routes::build_router(state.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(shutdown_rx))
                .await
                .ok();
            log::info!("Server shut down");
        });

        Ok(Self {
            shutdown_tx,
            task,
            addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close every client, peer, watch and timer, then stop accepting.
    pub fn stop(&self) {
        self.state.hub.shutdown();
        self.state.streams.shutdown();
        self.state.terminals.shutdown();
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the serve loop to finish.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            log::warn!("Server task failed: {}", e);
        }
    }
}

/// Wait until the shutdown signal is received.
async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
