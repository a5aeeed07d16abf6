use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::recover;
use crate::session::{SessionProgress, TransferSession};

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with session progress.
pub type ProgressCallback = Box<dyn Fn(SessionProgress) + Send + Sync>;

/// Pushes progress snapshots of active sessions to callbacks periodically.
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackerInner>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

struct TrackerInner {
    callbacks: Vec<ProgressCallback>,
    sessions: HashMap<String, Arc<TransferSession>>,
    interval: Duration,
}

impl TrackerInner {
    fn notify(&self, session: &TransferSession) {
        let progress = session.progress();
        for cb in &self.callbacks {
            cb(progress.clone());
        }
    }
}

impl ProgressTracker {
    /// Creates a tracker; `None` selects a 500 ms interval.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackerInner {
                callbacks: Vec::new(),
                sessions: HashMap::new(),
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
            })),
            stop: Mutex::new(None),
        }
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        recover(self.inner.write()).callbacks.push(callback);
    }

    /// Begins tracking a session.
    pub fn track(&self, session: Arc<TransferSession>) {
        let id = session.id().to_string();
        recover(self.inner.write()).sessions.insert(id, session);
    }

    /// Stops tracking a session.
    pub fn untrack(&self, session_id: &str) {
        recover(self.inner.write()).sessions.remove(session_id);
    }

    /// Sends a one-time notification for a session, active or not.
    pub fn notify_progress(&self, session_id: &str) {
        let inner = recover(self.inner.read());
        if let Some(session) = inner.sessions.get(session_id) {
            inner.notify(session);
        }
    }

    /// Starts periodic notifications for active sessions in a tokio task.
    ///
    /// Replaces any running task. Call [`stop`](Self::stop) to cancel.
    pub fn start(&self) {
        let (tx, mut rx) = oneshot::channel();
        // Dropping a previous sender ends its task.
        *recover(self.stop.lock()) = Some(tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let interval = recover(inner.read()).interval;
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let i = recover(inner.read());
                        for session in i.sessions.values().filter(|s| s.is_active()) {
                            i.notify(session);
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });
    }

    /// Stops the periodic notification task.
    pub fn stop(&self) {
        // Dropping the sender signals the task to exit.
        drop(recover(self.stop.lock()).take());
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

/// Sliding-window throughput meter for one channel.
///
/// The rate covers the bytes written since the oldest retained sample's
/// predecessor, measured up to now, so it decays while nothing is written
/// and reaches zero once the window holds no samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
    window: Duration,
    /// Start of the measured span; `None` until the first sample.
    since: Option<Instant>,
}

impl SpeedInner {
    fn evict(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            let stale = now.duration_since(t) > self.window;
            if !stale && self.samples.len() <= self.max_samples {
                break;
            }
            self.samples.pop_front();
            self.since = Some(t);
        }
    }
}

impl SpeedCalculator {
    /// `window` defaults to 5 s and `max_samples` to 100.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: VecDeque::new(),
                max_samples: max_samples.unwrap_or(100).max(1),
                window: window.unwrap_or(Duration::from_secs(5)),
                since: None,
            }),
        }
    }

    /// Records `bytes` written at the current instant.
    ///
    /// The first sample only marks the start of the measurement; its bytes
    /// were written before it.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = recover(self.inner.lock());
        let now = Instant::now();
        if s.since.is_none() {
            s.since = Some(now);
            return;
        }
        s.samples.push_back((now, bytes));
        s.evict(now);
    }

    /// Average bytes per second between the start of the retained span and
    /// now. 0.0 before two samples or when the window holds none.
    pub fn bytes_per_second(&self) -> f64 {
        let mut s = recover(self.inner.lock());
        let now = Instant::now();
        s.evict(now);
        let Some(since) = s.since else {
            return 0.0;
        };
        let elapsed = now.duration_since(since);
        let bytes: u64 = s.samples.iter().map(|(_, b)| b).sum();
        if bytes == 0 || elapsed.is_zero() {
            return 0.0;
        }
        bytes as f64 / elapsed.as_secs_f64()
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}
