//! `send` and `receive` implementations.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use multilink_coordinator::{EngineConfig, TransferCoordinator};
use multilink_data_channel::TcpChunkReceiver;
use multilink_transfer::{ChannelId, FileSource, NoopObserver, SessionProgress, SessionStatus};

pub async fn send(
    config: EngineConfig,
    file: PathBuf,
    wired: Option<SocketAddr>,
    wireless: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let endpoints: Vec<(ChannelId, SocketAddr)> = [(ChannelId::Wired, wired), (ChannelId::Wireless, wireless)]
        .into_iter()
        .filter_map(|(channel, addr)| addr.map(|a| (channel, a)))
        .collect();
    if endpoints.is_empty() {
        bail!("at least one of --wired or --wireless is required");
    }

    let coordinator = TransferCoordinator::new(config, Arc::new(NoopObserver))?;
    coordinator.on_progress(Box::new(|p: SessionProgress| {
        info!(
            percent = p.percent(),
            completed = p.completed,
            failed = p.failed,
            total = p.total_chunks,
            "progress"
        );
    }));

    for (channel, addr) in endpoints {
        // A channel that fails to open is skipped; start() fails if none opened.
        if let Err(e) = coordinator.open(channel, addr).await {
            warn!(%channel, %addr, error = %e, "channel unavailable");
        }
    }

    let result = run_send(&coordinator, file).await;
    let status = coordinator.close().await;
    result?;

    match status {
        Some(SessionStatus::Completed) => Ok(()),
        Some(status) => bail!("transfer ended as {status:?}"),
        None => bail!("no transfer took place"),
    }
}

async fn run_send(coordinator: &TransferCoordinator, file: PathBuf) -> anyhow::Result<()> {
    let session = coordinator
        .prepare(Arc::new(FileSource::new(&file)))
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    coordinator.start().await?;

    tokio::select! {
        status = coordinator.wait() => {
            let status = status?;
            info!(session_id = session.id(), ?status, "transfer finished");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, closing channels");
        }
    }
    Ok(())
}

pub async fn receive(listen: SocketAddr, out: PathBuf) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let receiver = TcpChunkReceiver::new(&out, cancel.clone());
    let (addr, listener) = receiver.listen(listen).await?;
    info!(%addr, out = %out.display(), "waiting for sender");

    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = receiver.accept_and_receive(listener).await;
    signal.abort();

    let file = result.context("receiving transfer")?;
    info!(
        path = %file.path.display(),
        bytes = file.file_size,
        chunks = file.total_chunks,
        mismatches = file.checksum_mismatches,
        "file received"
    );
    Ok(())
}
