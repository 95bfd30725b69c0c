mod config;
mod persistence;
mod remote;
mod stream;

use crate::config::ServerConfig;
use crate::remote::server::{Server, build_state};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = ServerConfig::load();
    log::info!(
        "Serving sessions from {} (HQ mode: {})",
        config.control_dir.display(),
        config.hq_mode
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tunnelforge")
        .build()?;

    runtime.block_on(async {
        let state = build_state(&config)?;
        let server = Server::start(&config.listen_addr, state).await?;

        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
        }
        log::info!("Shutting down");
        server.stop();
        server.wait().await;
        anyhow::Ok(())
    })?;

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    Ok(())
}
