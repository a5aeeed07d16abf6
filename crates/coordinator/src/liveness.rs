//! Channel liveness providers.
//!
//! The balancer consumes a [`LivenessMap`] before distribution and before
//! every rebalance. Providers either report what the sender side measures
//! ([`MeasuredLiveness`]) or what an external link monitor says
//! ([`StaticLiveness`]).

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use multilink_data_channel::ChannelHealth;
use multilink_transfer::{ChannelId, ChannelLiveness, LivenessMap};

/// Source of per-channel liveness and throughput.
pub trait LivenessProvider: Send + Sync {
    fn detect(&self) -> LivenessMap;
}

/// Liveness set from outside, e.g. by a link monitor.
#[derive(Debug, Default)]
pub struct StaticLiveness {
    map: RwLock<LivenessMap>,
}

impl StaticLiveness {
    pub fn new(map: LivenessMap) -> Self {
        Self {
            map: RwLock::new(map),
        }
    }

    /// Every channel in `channels` up with no throughput measured yet.
    pub fn all_up(channels: &[ChannelId]) -> Self {
        Self::new(channels.iter().map(|c| (*c, ChannelLiveness::up(0.0))).collect())
    }

    pub fn set(&self, channel: ChannelId, liveness: ChannelLiveness) {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, liveness);
    }
}

impl LivenessProvider for StaticLiveness {
    fn detect(&self) -> LivenessMap {
        self.map.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// ---------------------------------------------------------------------------
// ChannelRegistry
// ---------------------------------------------------------------------------

/// Opened channels and their shared health, keyed by channel.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<BTreeMap<ChannelId, Arc<ChannelHealth>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel`, returning its health (existing or new).
    pub fn register(&self, channel: ChannelId) -> Arc<ChannelHealth> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(channel).or_default())
    }

    pub fn remove(&self, channel: ChannelId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel);
    }

    pub fn get(&self, channel: ChannelId) -> Option<Arc<ChannelHealth>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .cloned()
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.get(channel).is_some()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Restricts `reported` to registered channels.
    ///
    /// Unregistered channels are dropped, registered ones missing from
    /// the report count as down, and a channel whose writes failed is
    /// never reported connected.
    pub fn mask(&self, reported: &LivenessMap) -> LivenessMap {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .map(|(channel, health)| {
                let mut liveness = reported.get(channel).copied().unwrap_or_default();
                liveness.is_connected &= health.is_connected();
                (*channel, liveness)
            })
            .collect()
    }
}

/// Liveness derived from the senders themselves: a registered channel is
/// up until one of its writes fails, at the throughput its sender measured.
#[derive(Clone)]
pub struct MeasuredLiveness {
    registry: ChannelRegistry,
}

impl MeasuredLiveness {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry }
    }
}

impl LivenessProvider for MeasuredLiveness {
    fn detect(&self) -> LivenessMap {
        let map = self.registry.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .map(|(channel, health)| {
                let liveness = if health.is_connected() {
                    ChannelLiveness::up(health.throughput())
                } else {
                    ChannelLiveness::down()
                };
                (*channel, liveness)
            })
            .collect()
    }
}
