//! spfmesh controller daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

use spfmesh::runtime::{DeviceSource, StdinSource};
use spfmesh::{ChannelHandle, Config, Controller, LogChannel, TopologySnapshot, UdpTransport};

/// How long shutdown waits for the loop to finish its current event.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting controller {} ({}) in group {}",
        cfg.controller_id, cfg.controller_name, cfg.group
    );

    // Gossip transport
    let transport = UdpTransport::bind(
        cfg.controller_id,
        &cfg.controller_name,
        &cfg.cluster_secret,
        cfg.gossip_bind,
        cfg.peers.clone(),
    )
    .await?;
    info!("Gossip listening on {}", transport.local_addr()?);

    let (controller, handle) = Controller::new(&cfg, transport);

    // Device events, fed from stdin; rules go to the log.
    let channel = ChannelHandle(Arc::new(LogChannel));
    let mut source = StdinSource::stdin(channel.clone());
    let events = handle.events();
    let source_handle = tokio::spawn(async move {
        if let Err(e) = source.monitor(events).await {
            error!("Device source failed: {}", e);
        }
    });

    // Topology snapshots for external viewers
    let snapshot_handle = cfg
        .snapshot_path
        .clone()
        .map(|path| tokio::spawn(write_snapshots(path, handle.snapshots())));

    let mut controller_handle = tokio::spawn(controller.run());

    // Graceful Shutdown
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        res = &mut controller_handle => {
            if let Err(e) = res {
                error!("Controller loop failed: {}", e);
            }
        }
    }

    handle.shutdown();
    if !controller_handle.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, &mut controller_handle)
            .await
            .is_err()
    {
        warn!("Controller did not stop in time, aborting");
        controller_handle.abort();
    }
    source_handle.abort();
    if let Some(h) = snapshot_handle {
        h.abort();
    }
    drop(channel);

    info!("Shutdown complete.");
    Ok(())
}

async fn write_snapshots(path: PathBuf, mut rx: watch::Receiver<TopologySnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        let json = match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize snapshot: {}", e);
                continue;
            }
        };
        if let Err(e) = tokio::fs::write(&path, json).await {
            warn!("Failed to write snapshot to {}: {}", path.display(), e);
        }
    }
}
