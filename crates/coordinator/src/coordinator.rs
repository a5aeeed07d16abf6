//! Transfer session orchestration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use multilink_data_channel::{ChannelConnection, ChannelSender, SenderReport, TransferMetadata};
use multilink_transfer::{
    ByteSource, ChannelId, ChannelQueueSet, Chunk, LivenessMap, ProgressCallback, ProgressTracker,
    RebalanceOutcome, SessionProgress, SessionStatus, TransferError, TransferObserver,
    TransferSession, chunk_source,
};

use crate::config::EngineConfig;
use crate::error::CoordinatorError;
use crate::liveness::{ChannelRegistry, LivenessProvider, MeasuredLiveness};

/// Forwards sender callbacks and wakes [`TransferCoordinator::wait`]
/// whenever a chunk reaches a terminal status.
struct CompletionObserver {
    inner: Arc<dyn TransferObserver>,
    settled: Notify,
}

impl TransferObserver for CompletionObserver {
    fn on_chunking_progress(&self, percent: u8) {
        self.inner.on_chunking_progress(percent);
    }

    fn on_chunk_progress(&self, chunk: &Chunk, percent: u8) {
        self.inner.on_chunk_progress(chunk, percent);
    }

    fn on_chunk_complete(&self, chunk: &Chunk) {
        self.inner.on_chunk_complete(chunk);
        self.settled.notify_one();
    }

    fn on_chunk_error(&self, chunk: &Chunk, message: &str) {
        self.inner.on_chunk_error(chunk, message);
        self.settled.notify_one();
    }
}

type SenderHandle = JoinHandle<(ChannelConnection, SenderReport)>;

#[derive(Default)]
struct Tasks {
    started: bool,
    senders: Vec<SenderHandle>,
    rebalancer: Option<JoinHandle<()>>,
}

/// Runs one transfer session across the opened channels.
pub struct TransferCoordinator {
    config: EngineConfig,
    queues: Arc<ChannelQueueSet>,
    observer: Arc<CompletionObserver>,
    liveness: Arc<dyn LivenessProvider>,
    registry: ChannelRegistry,
    /// Opened channels whose sender has not started yet.
    connections: Mutex<BTreeMap<ChannelId, ChannelConnection>>,
    session: OnceLock<Arc<TransferSession>>,
    tracker: ProgressTracker,
    tasks: Mutex<Tasks>,
    cancel: CancellationToken,
}

impl TransferCoordinator {
    /// Creates a coordinator that measures liveness from its own senders.
    pub fn new(
        config: EngineConfig,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let registry = ChannelRegistry::new();
        let liveness = Arc::new(MeasuredLiveness::new(registry.clone()));
        Ok(Self {
            queues: Arc::new(ChannelQueueSet::new(config.balancer.clone())?),
            observer: Arc::new(CompletionObserver {
                inner: observer,
                settled: Notify::new(),
            }),
            liveness,
            registry,
            connections: Mutex::new(BTreeMap::new()),
            session: OnceLock::new(),
            tracker: ProgressTracker::new(Some(config.progress_interval())),
            tasks: Mutex::new(Tasks::default()),
            cancel: CancellationToken::new(),
            config,
        })
    }

    /// Replaces the liveness source, e.g. with an external link monitor.
    ///
    /// Reports are still restricted to opened channels.
    pub fn with_liveness(mut self, provider: Arc<dyn LivenessProvider>) -> Self {
        self.liveness = provider;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queues(&self) -> &ChannelQueueSet {
        &self.queues
    }

    /// Registers a callback receiving periodic progress snapshots.
    pub fn on_progress(&self, callback: ProgressCallback) {
        self.tracker.on_progress(callback);
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Connects `channel` to `addr`. Already opened channels are left alone.
    ///
    /// A failure only concerns this channel; the session can still start
    /// on the others.
    pub async fn open(&self, channel: ChannelId, addr: SocketAddr) -> Result<(), CoordinatorError> {
        self.ensure_configured(channel)?;
        if self.registry.contains(channel) {
            debug!(%channel, "channel already open");
            return Ok(());
        }

        match ChannelConnection::connect(channel, addr, self.config.connect_timeout(), &self.cancel)
            .await
        {
            Ok(conn) => self.attach(conn).await,
            Err(source) => {
                warn!(%channel, %addr, error = %source, "channel open failed");
                Err(CoordinatorError::ChannelOpen { channel, source })
            }
        }
    }

    /// Adopts an already established connection.
    pub async fn attach(&self, conn: ChannelConnection) -> Result<(), CoordinatorError> {
        let channel = conn.channel();
        self.ensure_configured(channel)?;
        if self.tasks.lock().await.started {
            return Err(CoordinatorError::InvalidState(format!(
                "cannot open {channel} channel after start"
            )));
        }

        let mut connections = self.connections.lock().await;
        if connections.contains_key(&channel) {
            return Ok(());
        }
        self.registry.register(channel);
        connections.insert(channel, conn);
        Ok(())
    }

    /// Channels opened so far, in channel order.
    pub fn opened_channels(&self) -> Vec<ChannelId> {
        self.registry.channels()
    }

    fn ensure_configured(&self, channel: ChannelId) -> Result<(), CoordinatorError> {
        if self.queues.channels().contains(&channel) {
            Ok(())
        } else {
            Err(TransferError::UnknownChannel(channel).into())
        }
    }

    /// Provider report restricted to the opened channels.
    pub fn liveness(&self) -> LivenessMap {
        self.registry.mask(&self.liveness.detect())
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Chunks `source` and creates the session.
    pub async fn prepare(
        &self,
        source: Arc<dyn ByteSource>,
    ) -> Result<Arc<TransferSession>, CoordinatorError> {
        if self.session.get().is_some() {
            return Err(CoordinatorError::InvalidState("session already prepared".into()));
        }

        let observer = Arc::clone(&self.observer);
        let chunk_size = self.config.chunk_size;
        let name = source.name().to_string();
        let chunks = tokio::task::spawn_blocking(move || {
            let report: &mut (dyn FnMut(u8) + Send) =
                &mut |percent| observer.on_chunking_progress(percent);
            chunk_source(source.as_ref(), chunk_size, Some(report))
        })
        .await
        .map_err(|e| CoordinatorError::Task(e.to_string()))??;

        let total_size = chunks.iter().map(|c| c.size() as u64).sum();
        let session = Arc::new(TransferSession::new(name, total_size, chunks));
        if self.session.set(Arc::clone(&session)).is_err() {
            return Err(CoordinatorError::InvalidState("session already prepared".into()));
        }
        self.tracker.track(Arc::clone(&session));

        info!(
            session_id = session.id(),
            file = session.file_name(),
            bytes = total_size,
            chunks = session.total_chunks(),
            "session prepared"
        );
        Ok(session)
    }

    pub fn session(&self) -> Option<Arc<TransferSession>> {
        self.session.get().cloned()
    }

    fn prepared(&self) -> Result<Arc<TransferSession>, CoordinatorError> {
        self.session().ok_or(CoordinatorError::SessionNotPrepared)
    }

    /// Announces the transfer on every opened channel, distributes the
    /// chunks over the channels that took the announcement and starts one
    /// sender per channel.
    ///
    /// Fails with [`CoordinatorError::NoChannelAvailable`], and fails the
    /// session, when no channel is left to send on.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        let session = self.prepared()?;
        let mut tasks = self.tasks.lock().await;
        if tasks.started {
            return Err(CoordinatorError::InvalidState("session already started".into()));
        }
        tasks.started = true;

        let total_chunks = u32::try_from(session.total_chunks()).map_err(|_| {
            CoordinatorError::InvalidState(format!("too many chunks: {}", session.total_chunks()))
        })?;
        let metadata = TransferMetadata {
            transfer_id: session.id().to_string(),
            file_name: session.file_name().to_string(),
            file_size: session.total_size(),
            total_chunks,
        };

        let opened = std::mem::take(&mut *self.connections.lock().await);
        let mut ready = Vec::with_capacity(opened.len());
        for (channel, mut conn) in opened {
            match conn.send_metadata(&metadata).await {
                Ok(()) => ready.push(conn),
                Err(e) => {
                    warn!(%channel, error = %e, "metadata send failed, channel dropped");
                    self.registry.remove(channel);
                    if let Err(e) = conn.shutdown().await {
                        debug!(%channel, error = %e, "channel shutdown failed");
                    }
                }
            }
        }
        if ready.is_empty() {
            session.fail("no channel available");
            return Err(CoordinatorError::NoChannelAvailable);
        }

        let counts = match self.queues.distribute(session.chunks(), &self.liveness()) {
            Ok(counts) => counts,
            Err(e) => {
                session.fail(&e.to_string());
                // Hand the connections back so close() releases them.
                let mut connections = self.connections.lock().await;
                for conn in ready {
                    connections.insert(conn.channel(), conn);
                }
                return Err(match e {
                    TransferError::NoChannelAvailable => CoordinatorError::NoChannelAvailable,
                    other => other.into(),
                });
            }
        };

        session.start();
        let channels: Vec<ChannelId> = ready.iter().map(|c| c.channel()).collect();
        for conn in ready {
            let channel = conn.channel();
            let observer: Arc<dyn TransferObserver> = self.observer.clone();
            let sender = ChannelSender::new(
                channel,
                Arc::clone(&self.queues),
                observer,
                self.cancel.clone(),
            )
            .with_config(self.config.sender_config())
            .with_health(self.registry.register(channel));
            tasks.senders.push(tokio::spawn(sender.run(conn)));
        }
        tasks.rebalancer = self.config.rebalance_interval().map(|period| self.spawn_rebalancer(period));
        self.tracker.start();

        info!(
            session_id = session.id(),
            ?channels,
            ?counts,
            "transfer started"
        );
        Ok(())
    }

    fn spawn_rebalancer(&self, period: std::time::Duration) -> JoinHandle<()> {
        let queues = Arc::clone(&self.queues);
        let liveness = Arc::clone(&self.liveness);
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; speeds are unmeasured then.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let map = registry.mask(&liveness.detect());
                        if let RebalanceOutcome::Migrated { from, to, moved } = queues.rebalance(&map) {
                            debug!(%from, %to, moved, "background rebalance");
                        }
                    }
                }
            }
        })
    }

    /// Routes an externally assigned chunk to its channel's queue.
    pub async fn enqueue(&self, chunk: Arc<Chunk>) -> Result<(), CoordinatorError> {
        let channel = chunk
            .assigned_channel()
            .ok_or_else(|| TransferError::UnassignedChunk(chunk.id().to_string()))?;
        if !self.registry.contains(channel) {
            return Err(CoordinatorError::ChannelNotOpen(channel));
        }
        self.queues.enqueue(chunk)?;
        Ok(())
    }

    /// Rebalances once using the current liveness.
    pub fn rebalance(&self) -> RebalanceOutcome {
        self.queues.rebalance(&self.liveness())
    }

    /// Session progress, recomputed from the chunk statuses.
    pub fn progress(&self) -> Result<SessionProgress, CoordinatorError> {
        Ok(self.prepared()?.progress())
    }

    /// Waits until every chunk is Completed or Failed and settles the
    /// session status accordingly.
    ///
    /// Returns early with the current status when the coordinator is
    /// closed in the meantime.
    pub async fn wait(&self) -> Result<SessionStatus, CoordinatorError> {
        let session = self.prepared()?;
        if session.status() == SessionStatus::Preparing {
            return Err(CoordinatorError::InvalidState("session not started".into()));
        }

        let poll = self.config.progress_interval();
        loop {
            let notified = self.observer.settled.notified();
            if !session.is_active() || session.progress().is_settled() {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        if session.is_active() && session.progress().is_settled() {
            let status = session.settle();
            self.tracker.notify_progress(session.id());
            info!(session_id = session.id(), ?status, "session settled");
        }
        Ok(session.status())
    }

    /// Cancels the senders, waits for them to stop and releases every
    /// connection. Safe to call more than once and before `start`.
    ///
    /// Returns the final session status, if a session was prepared.
    pub async fn close(&self) -> Option<SessionStatus> {
        self.cancel.cancel();
        self.tracker.stop();

        let (senders, rebalancer) = {
            let mut tasks = self.tasks.lock().await;
            (std::mem::take(&mut tasks.senders), tasks.rebalancer.take())
        };
        if let Some(handle) = rebalancer
            && let Err(e) = handle.await
        {
            warn!(error = %e, "rebalancer task failed");
        }

        let grace = self.config.shutdown_grace();
        for mut handle in senders {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok((conn, report))) => {
                    debug!(
                        channel = %report.channel,
                        sent = report.sent,
                        failed = report.failed,
                        "sender joined"
                    );
                    release(conn).await;
                }
                Ok(Err(e)) => warn!(error = %e, "sender task failed"),
                Err(_) => {
                    warn!("sender did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        let idle = std::mem::take(&mut *self.connections.lock().await);
        for conn in idle.into_values() {
            release(conn).await;
        }

        let session = self.session()?;
        match session.status() {
            SessionStatus::Preparing => session.fail("closed before start"),
            SessionStatus::Transferring => {
                session.settle();
            }
            SessionStatus::Completed | SessionStatus::Failed => {}
        }
        self.tracker.notify_progress(session.id());
        self.tracker.untrack(session.id());

        let status = session.status();
        info!(session_id = session.id(), ?status, "session closed");
        Some(status)
    }
}

async fn release(conn: ChannelConnection) {
    let channel = conn.channel();
    if let Err(e) = conn.shutdown().await {
        debug!(%channel, error = %e, "channel shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use multilink_data_channel::TcpChunkReceiver;
    use multilink_transfer::{
        ChannelLiveness, ChunkStatus, EventObserver, MemorySource, NoopObserver, TransferEvent,
    };
    use tokio::io::AsyncWrite;

    use crate::liveness::StaticLiveness;

    const KIB: usize = 1024;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            chunk_size: 64 * KIB,
            idle_backoff_ms: 5,
            rebalance_interval_ms: 20,
            progress_interval_ms: 20,
            shutdown_grace_ms: 1_000,
            ..Default::default()
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<StdMutex<Vec<u8>>>);

    impl AsyncWrite for SharedSink {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Accepts the metadata frame, then fails every write.
    #[derive(Default)]
    struct FailAfterMetadata {
        flushed_once: bool,
    }

    impl AsyncWrite for FailAfterMetadata {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.flushed_once {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link lost")))
            } else {
                Poll::Ready(Ok(buf.len()))
            }
        }
        fn poll_flush(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushed_once = true;
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn two_channels_deliver_file_to_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let data = patterned(20 * 64 * KIB + 123);

        let receiver = TcpChunkReceiver::new(dir.path(), CancellationToken::new());
        let (addr, listener) = receiver.listen("127.0.0.1:0").await.unwrap();
        let received = tokio::spawn(async move { receiver.accept_and_receive(listener).await });

        let (observer, mut events) = EventObserver::channel(4096);
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(observer)).unwrap();
        coordinator.open(ChannelId::Wired, addr).await.unwrap();
        coordinator.open(ChannelId::Wireless, addr).await.unwrap();
        coordinator.open(ChannelId::Wired, addr).await.unwrap();
        assert_eq!(coordinator.opened_channels(), ChannelId::ALL.to_vec());

        let session = coordinator
            .prepare(Arc::new(MemorySource::new("payload.bin", data.clone())))
            .await
            .unwrap();
        assert_eq!(session.total_chunks(), 21);

        coordinator.start().await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(20), coordinator.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(coordinator.progress().unwrap().fraction, 1.0);

        assert_eq!(coordinator.close().await, Some(SessionStatus::Completed));

        let file = received.await.unwrap().unwrap();
        assert_eq!(file.transfer_id, session.id());
        assert_eq!(std::fs::read(dir.path().join("payload.bin")).unwrap(), data);

        let mut chunking = 0;
        let mut completes = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                TransferEvent::ChunkingProgress { .. } => chunking += 1,
                TransferEvent::ChunkComplete { .. } => completes += 1,
                TransferEvent::ChunkError { message, .. } => panic!("chunk error: {message}"),
                TransferEvent::ChunkProgress { .. } => {}
            }
        }
        assert_eq!(chunking, 21);
        assert_eq!(completes, 21);
    }

    #[tokio::test]
    async fn one_channel_failing_to_open_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let data = patterned(5 * 64 * KIB);

        let receiver = TcpChunkReceiver::new(dir.path(), CancellationToken::new());
        let (addr, listener) = receiver.listen("127.0.0.1:0").await.unwrap();
        let received = tokio::spawn(async move { receiver.accept_and_receive(listener).await });

        let dead = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver)).unwrap();
        let err = coordinator.open(ChannelId::Wired, dead).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::ChannelOpen {
                channel: ChannelId::Wired,
                ..
            }
        ));
        coordinator.open(ChannelId::Wireless, addr).await.unwrap();

        let session = coordinator
            .prepare(Arc::new(MemorySource::new("one.bin", data.clone())))
            .await
            .unwrap();
        coordinator.start().await.unwrap();

        // Everything lands on the only opened channel.
        assert!(
            session
                .chunks()
                .iter()
                .all(|c| c.assigned_channel() == Some(ChannelId::Wireless))
        );

        assert_eq!(coordinator.wait().await.unwrap(), SessionStatus::Completed);
        coordinator.close().await;
        received.await.unwrap().unwrap();
        assert_eq!(std::fs::read(dir.path().join("one.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn no_opened_channel_fails_session() {
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver)).unwrap();
        let session = coordinator
            .prepare(Arc::new(MemorySource::new("x.bin", patterned(1000))))
            .await
            .unwrap();

        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::NoChannelAvailable)
        ));
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.chunks().iter().all(|c| c.is_pending()));
        assert_eq!(coordinator.close().await, Some(SessionStatus::Failed));
    }

    #[tokio::test]
    async fn liveness_provider_is_masked_to_opened_channels() {
        // The provider only reports the unopened channel as usable.
        let provider = Arc::new(StaticLiveness::new(LivenessMap::from([
            (ChannelId::Wired, ChannelLiveness::up(10.0)),
            (ChannelId::Wireless, ChannelLiveness::down()),
        ])));
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver))
            .unwrap()
            .with_liveness(provider);
        coordinator
            .attach(ChannelConnection::from_writer(ChannelId::Wireless, SharedSink::default()))
            .await
            .unwrap();

        let liveness = coordinator.liveness();
        assert!(!liveness.contains_key(&ChannelId::Wired));

        coordinator
            .prepare(Arc::new(MemorySource::new("m.bin", patterned(1000))))
            .await
            .unwrap();
        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::NoChannelAvailable)
        ));
        coordinator.close().await;
    }

    #[tokio::test]
    async fn failing_channel_settles_session_as_failed() {
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver)).unwrap();
        coordinator
            .attach(ChannelConnection::from_writer(ChannelId::Wired, FailAfterMetadata::default()))
            .await
            .unwrap();
        let session = coordinator
            .prepare(Arc::new(MemorySource::new("f.bin", patterned(3 * 64 * KIB))))
            .await
            .unwrap();

        coordinator.start().await.unwrap();
        assert_eq!(coordinator.wait().await.unwrap(), SessionStatus::Failed);
        assert!(session.chunks().iter().all(|c| c.status() == ChunkStatus::Failed));
        assert!(session.error().contains("3 failed"));
        assert_eq!(coordinator.close().await, Some(SessionStatus::Failed));
    }

    #[tokio::test]
    async fn enqueue_routes_by_assignment() {
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver)).unwrap();
        coordinator
            .attach(ChannelConnection::from_writer(ChannelId::Wired, SharedSink::default()))
            .await
            .unwrap();

        let unassigned = Arc::new(Chunk::new("a_chunk_0", 0, vec![1]));
        assert!(matches!(
            coordinator.enqueue(Arc::clone(&unassigned)).await,
            Err(CoordinatorError::Transfer(TransferError::UnassignedChunk(_)))
        ));

        let wireless = Arc::new(Chunk::new("a_chunk_1", 1, vec![2]));
        wireless.assign(ChannelId::Wireless).unwrap();
        assert!(matches!(
            coordinator.enqueue(wireless).await,
            Err(CoordinatorError::ChannelNotOpen(ChannelId::Wireless))
        ));

        unassigned.assign(ChannelId::Wired).unwrap();
        coordinator.enqueue(unassigned).await.unwrap();
        assert_eq!(coordinator.queues().remaining_count(ChannelId::Wired), 1);
        coordinator.close().await;
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_rejected() {
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver)).unwrap();
        assert!(matches!(
            coordinator.start().await,
            Err(CoordinatorError::SessionNotPrepared)
        ));
        assert!(matches!(
            coordinator.progress(),
            Err(CoordinatorError::SessionNotPrepared)
        ));

        coordinator
            .prepare(Arc::new(MemorySource::new("l.bin", patterned(10))))
            .await
            .unwrap();
        assert!(matches!(
            coordinator.wait().await,
            Err(CoordinatorError::InvalidState(_))
        ));
        assert!(matches!(
            coordinator
                .prepare(Arc::new(MemorySource::new("l.bin", patterned(10))))
                .await,
            Err(CoordinatorError::InvalidState(_))
        ));

        assert_eq!(coordinator.close().await, Some(SessionStatus::Failed));
        assert_eq!(coordinator.close().await, Some(SessionStatus::Failed));
    }

    #[tokio::test]
    async fn close_without_session() {
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver)).unwrap();
        coordinator
            .attach(ChannelConnection::from_writer(ChannelId::Wired, SharedSink::default()))
            .await
            .unwrap();
        assert_eq!(coordinator.close().await, None);
    }

    #[tokio::test]
    async fn unknown_channel_rejected() {
        let config = EngineConfig {
            balancer: multilink_transfer::BalancerConfig {
                split: vec![multilink_transfer::ChannelShare {
                    channel: ChannelId::Wired,
                    fraction: 1.0,
                    initial_speed: 35.0,
                }],
                ..Default::default()
            },
            ..fast_config()
        };
        let coordinator = TransferCoordinator::new(config, Arc::new(NoopObserver)).unwrap();
        let err = coordinator
            .attach(ChannelConnection::from_writer(ChannelId::Wireless, SharedSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Transfer(TransferError::UnknownChannel(ChannelId::Wireless))
        ));
    }

    #[tokio::test]
    async fn empty_source_completes_immediately() {
        let coordinator = TransferCoordinator::new(fast_config(), Arc::new(NoopObserver)).unwrap();
        let sink = SharedSink::default();
        coordinator
            .attach(ChannelConnection::from_writer(ChannelId::Wired, sink.clone()))
            .await
            .unwrap();
        coordinator
            .prepare(Arc::new(MemorySource::new("empty.bin", Vec::new())))
            .await
            .unwrap();
        coordinator.start().await.unwrap();
        assert_eq!(coordinator.wait().await.unwrap(), SessionStatus::Completed);
        coordinator.close().await;

        // Only the metadata frame went out: 4+36 uuid, 4+9 name, 8, 4.
        assert_eq!(sink.0.lock().unwrap().len(), 4 + 36 + 4 + 9 + 8 + 4);
    }
}
