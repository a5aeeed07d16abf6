use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{ChannelId, Chunk, LivenessMap};
use crate::{TransferError, recover};

/// Static share of the chunk count routed to one channel at distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelShare {
    pub channel: ChannelId,
    /// Fraction of the total chunk count, `0.0..=1.0`.
    pub fraction: f64,
    /// Speed estimate used until the channel reports a measurement.
    pub initial_speed: f64,
}

/// Distribution and rebalancing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Channels in priority order with their static split.
    pub split: Vec<ChannelShare>,
    /// Relative speed difference that must be exceeded before migrating.
    pub speed_threshold: f64,
    /// Maximum chunks migrated per rebalance call.
    pub migration_cap: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            split: vec![
                ChannelShare {
                    channel: ChannelId::Wired,
                    fraction: 0.65,
                    initial_speed: 35.0,
                },
                ChannelShare {
                    channel: ChannelId::Wireless,
                    fraction: 0.35,
                    initial_speed: 20.0,
                },
            ],
            speed_threshold: 0.15,
            migration_cap: 10,
        }
    }
}

impl BalancerConfig {
    /// Checks the split covers each channel once and sums to 1.0.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.split.is_empty() {
            return Err(TransferError::InvalidConfig("split is empty".into()));
        }
        let mut seen = Vec::with_capacity(self.split.len());
        let mut sum = 0.0;
        for share in &self.split {
            if seen.contains(&share.channel) {
                return Err(TransferError::InvalidConfig(format!(
                    "channel {} listed twice in split",
                    share.channel
                )));
            }
            seen.push(share.channel);
            if !(0.0..=1.0).contains(&share.fraction) {
                return Err(TransferError::InvalidConfig(format!(
                    "fraction for {} out of range: {}",
                    share.channel, share.fraction
                )));
            }
            sum += share.fraction;
        }
        if (sum - 1.0).abs() > 1e-6 {
            return Err(TransferError::InvalidConfig(format!(
                "split fractions sum to {sum}, expected 1.0"
            )));
        }
        if !self.speed_threshold.is_finite() || self.speed_threshold < 0.0 {
            return Err(TransferError::InvalidConfig(format!(
                "invalid speed threshold: {}",
                self.speed_threshold
            )));
        }
        Ok(())
    }
}

/// Result of a [`ChannelQueueSet::rebalance`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RebalanceOutcome {
    /// Fewer than two live channels.
    TooFewChannels,
    /// Speeds are within the hysteresis band; nothing moved.
    WithinThreshold { difference: f64 },
    /// Pending chunks moved from the slow queue to the back of the fast one.
    Migrated {
        from: ChannelId,
        to: ChannelId,
        moved: usize,
    },
}

/// Per-channel FIFO queues of chunks awaiting sending, plus the speed
/// estimates that drive rebalancing.
///
/// Each queue has its own lock: a channel's sender only ever takes its own
/// queue's lock, while distribution and rebalancing lock queues in
/// [`ChannelId`] order.
pub struct ChannelQueueSet {
    config: BalancerConfig,
    queues: BTreeMap<ChannelId, Mutex<VecDeque<Arc<Chunk>>>>,
    speeds: Mutex<Speeds>,
}

#[derive(Debug, Default)]
struct Speeds {
    estimate: BTreeMap<ChannelId, f64>,
    /// Channels that reported a positive throughput at least once.
    measured: BTreeSet<ChannelId>,
}

impl ChannelQueueSet {
    /// Creates empty queues for every channel in the split.
    pub fn new(config: BalancerConfig) -> Result<Self, TransferError> {
        config.validate()?;
        let queues = config
            .split
            .iter()
            .map(|s| (s.channel, Mutex::new(VecDeque::new())))
            .collect();
        let estimate = config
            .split
            .iter()
            .map(|s| (s.channel, s.initial_speed))
            .collect();
        Ok(Self {
            config,
            queues,
            speeds: Mutex::new(Speeds {
                estimate,
                measured: BTreeSet::new(),
            }),
        })
    }

    /// Configured channels in priority order.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.config.split.iter().map(|s| s.channel).collect()
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Assigns every chunk to a usable channel and enqueues it.
    ///
    /// Clears all queues first. Walking chunks in index order, each channel
    /// in the split is preferred for its contiguous share of the chunk
    /// count; when the preferred channel is unusable the next usable one in
    /// priority order takes the chunk. Returns the per-channel counts.
    ///
    /// Fails with [`TransferError::NoChannelAvailable`] without touching
    /// any queue when no channel is usable.
    pub fn distribute(
        &self,
        chunks: &[Arc<Chunk>],
        liveness: &LivenessMap,
    ) -> Result<BTreeMap<ChannelId, usize>, TransferError> {
        let priority = self.channels();
        let usable: Vec<bool> = priority
            .iter()
            .map(|c| liveness.get(c).is_some_and(|l| l.is_usable()))
            .collect();
        if !usable.contains(&true) {
            warn!("distribution skipped: no usable channel");
            return Err(TransferError::NoChannelAvailable);
        }
        if let Some(c) = chunks.iter().find(|c| !c.is_pending()) {
            return Err(TransferError::InvalidTransition {
                chunk: c.id().to_string(),
                from: c.status(),
                to: crate::ChunkStatus::Pending,
            });
        }

        let total = chunks.len();
        let mut ends = Vec::with_capacity(priority.len());
        let mut cumulative = 0.0;
        for (k, share) in self.config.split.iter().enumerate() {
            cumulative += share.fraction;
            let end = if k + 1 == priority.len() {
                total
            } else {
                ((total as f64 * cumulative).floor() as usize).min(total)
            };
            ends.push(end);
        }

        let mut guards: BTreeMap<ChannelId, _> = self
            .queues
            .iter()
            .map(|(c, q)| (*c, recover(q.lock())))
            .collect();
        for q in guards.values_mut() {
            q.clear();
        }

        let mut counts: BTreeMap<ChannelId, usize> = BTreeMap::new();
        let mut preferred = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            while preferred + 1 < ends.len() && i >= ends[preferred] {
                preferred += 1;
            }
            // At least one channel is usable, so the search always succeeds.
            let Some(k) = (0..priority.len())
                .map(|step| (preferred + step) % priority.len())
                .find(|&k| usable[k])
            else {
                return Err(TransferError::NoChannelAvailable);
            };
            let channel = priority[k];
            chunk.assign(channel)?;
            if let Some(q) = guards.get_mut(&channel) {
                q.push_back(Arc::clone(chunk));
            }
            *counts.entry(channel).or_default() += 1;
        }

        info!(total, ?counts, "chunks distributed");
        Ok(counts)
    }

    /// Moves pending chunks from the slowest live channel to the fastest.
    ///
    /// Speed estimates are refreshed from every usable channel that reports
    /// a positive, finite throughput. A zero throughput replaces the
    /// estimate only for a channel that already reported a positive one,
    /// so unmeasured channels keep their configured speed while a stalled
    /// one drops to zero. At most
    /// `min(slow_len / 4, migration_cap)` entries are examined from the
    /// front of the slow queue; pending ones are appended to the fast
    /// queue, anything else keeps its place.
    pub fn rebalance(&self, liveness: &LivenessMap) -> RebalanceOutcome {
        let live: Vec<(ChannelId, f64)> = {
            let mut speeds = recover(self.speeds.lock());
            let Speeds { estimate, measured } = &mut *speeds;
            for (channel, l) in liveness {
                let throughput = l.current_throughput;
                if !l.is_usable() || !throughput.is_finite() || throughput < 0.0 {
                    continue;
                }
                let Some(speed) = estimate.get_mut(channel) else {
                    continue;
                };
                if throughput > 0.0 {
                    *speed = throughput;
                    measured.insert(*channel);
                } else if measured.contains(channel) {
                    *speed = 0.0;
                }
            }
            estimate
                .iter()
                .filter(|(c, _)| liveness.get(*c).is_some_and(|l| l.is_usable()))
                .map(|(c, s)| (*c, *s))
                .collect()
        };

        if live.len() < 2 {
            return RebalanceOutcome::TooFewChannels;
        }

        let Some(&(fast, max)) = live.iter().max_by(|a, b| a.1.total_cmp(&b.1)) else {
            return RebalanceOutcome::TooFewChannels;
        };
        let Some(&(slow, min)) = live.iter().min_by(|a, b| a.1.total_cmp(&b.1)) else {
            return RebalanceOutcome::TooFewChannels;
        };
        if fast == slow {
            return RebalanceOutcome::WithinThreshold { difference: 0.0 };
        }

        let difference = if min > 0.0 {
            (max - min) / min
        } else if max > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        if difference <= self.config.speed_threshold {
            return RebalanceOutcome::WithinThreshold { difference };
        }

        let moved = match self.migrate(slow, fast) {
            Ok(moved) => moved,
            Err(e) => {
                warn!(error = %e, "rebalance skipped");
                0
            }
        };
        if moved > 0 {
            info!(from = %slow, to = %fast, moved, difference, "rebalanced queues");
        } else {
            debug!(from = %slow, to = %fast, difference, "rebalance found nothing to move");
        }
        RebalanceOutcome::Migrated {
            from: slow,
            to: fast,
            moved,
        }
    }

    fn migrate(&self, slow: ChannelId, fast: ChannelId) -> Result<usize, TransferError> {
        let slow_lock = self.queue(slow)?;
        let fast_lock = self.queue(fast)?;

        // Lock in channel order.
        let (mut first, mut second) = if slow < fast {
            (recover(slow_lock.lock()), recover(fast_lock.lock()))
        } else {
            let f = recover(fast_lock.lock());
            (recover(slow_lock.lock()), f)
        };
        let (slow_q, fast_q) = (&mut *first, &mut *second);

        let n = (slow_q.len() / 4).min(self.config.migration_cap);
        let mut kept = Vec::new();
        let mut moved = 0;
        for _ in 0..n {
            let Some(chunk) = slow_q.pop_front() else {
                break;
            };
            if chunk.is_pending() && chunk.assign(fast).is_ok() {
                fast_q.push_back(chunk);
                moved += 1;
            } else {
                kept.push(chunk);
            }
        }
        for chunk in kept.into_iter().rev() {
            slow_q.push_front(chunk);
        }
        Ok(moved)
    }

    /// Routes a chunk to the queue of its assigned channel.
    pub fn enqueue(&self, chunk: Arc<Chunk>) -> Result<(), TransferError> {
        let channel = chunk
            .assigned_channel()
            .ok_or_else(|| TransferError::UnassignedChunk(chunk.id().to_string()))?;
        recover(self.queue(channel)?.lock()).push_back(chunk);
        Ok(())
    }

    /// Pops the front of `channel`'s queue; `None` when it is empty.
    pub fn get_next_chunk(&self, channel: ChannelId) -> Option<Arc<Chunk>> {
        let q = self.queues.get(&channel)?;
        recover(q.lock()).pop_front()
    }

    /// Current length of `channel`'s queue.
    pub fn remaining_count(&self, channel: ChannelId) -> usize {
        self.queues
            .get(&channel)
            .map(|q| recover(q.lock()).len())
            .unwrap_or(0)
    }

    /// Sum of all queue lengths.
    pub fn total_remaining(&self) -> usize {
        self.queues.values().map(|q| recover(q.lock()).len()).sum()
    }

    /// Current speed estimate for `channel`.
    pub fn speed_estimate(&self, channel: ChannelId) -> Option<f64> {
        recover(self.speeds.lock()).estimate.get(&channel).copied()
    }

    /// Empties every queue.
    pub fn clear(&self) {
        for q in self.queues.values() {
            recover(q.lock()).clear();
        }
    }

    fn queue(&self, channel: ChannelId) -> Result<&Mutex<VecDeque<Arc<Chunk>>>, TransferError> {
        self.queues
            .get(&channel)
            .ok_or(TransferError::UnknownChannel(channel))
    }
}
