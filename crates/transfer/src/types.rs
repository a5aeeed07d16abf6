use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::chunked::checksum_bytes;
use crate::{TransferError, recover};

/// One transport path between sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    /// High-bandwidth wired link.
    Wired,
    /// Lower-bandwidth wireless link.
    Wireless,
}

impl ChannelId {
    /// Every channel, in default priority order.
    pub const ALL: [ChannelId; 2] = [ChannelId::Wired, ChannelId::Wireless];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelId::Wired => "wired",
            ChannelId::Wireless => "wireless",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelId {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wired" | "usb" => Ok(ChannelId::Wired),
            "wireless" | "wifi" => Ok(ChannelId::Wireless),
            other => Err(TransferError::InvalidConfig(format!(
                "unknown channel: {other}"
            ))),
        }
    }
}

/// Liveness of a channel as reported by the connection collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelLiveness {
    pub is_active: bool,
    pub is_connected: bool,
    /// Smoothed throughput estimate in bytes per second.
    pub current_throughput: f64,
}

impl ChannelLiveness {
    /// Active and connected, with the given throughput.
    pub fn up(current_throughput: f64) -> Self {
        Self {
            is_active: true,
            is_connected: true,
            current_throughput,
        }
    }

    /// Neither active nor connected.
    pub fn down() -> Self {
        Self::default()
    }

    /// Whether chunks may be routed over this channel.
    pub fn is_usable(&self) -> bool {
        self.is_active && self.is_connected
    }
}

/// Channel -> liveness snapshot.
pub type LivenessMap = HashMap<ChannelId, ChannelLiveness>;

/// Transfer state of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
}

impl ChunkStatus {
    /// `Pending -> Transferring -> {Completed | Failed}`; nothing else.
    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        matches!(
            (self, next),
            (ChunkStatus::Pending, ChunkStatus::Transferring)
                | (ChunkStatus::Transferring, ChunkStatus::Completed)
                | (ChunkStatus::Transferring, ChunkStatus::Failed)
        )
    }

    /// Completed or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

/// Which channel a chunk is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Assignment {
    #[default]
    Unassigned,
    Channel(ChannelId),
}

impl Assignment {
    pub fn channel(self) -> Option<ChannelId> {
        match self {
            Assignment::Unassigned => None,
            Assignment::Channel(c) => Some(c),
        }
    }
}

/// One unit of transfer: an immutable, checksummed slice of the source.
///
/// Shared between the session's chunk list and whichever queue currently
/// holds it; the mutable part sits behind a lock.
#[derive(Debug)]
pub struct Chunk {
    id: String,
    index: u32,
    payload: Vec<u8>,
    /// SHA-256 hex digest of `payload`.
    checksum: String,
    state: RwLock<ChunkState>,
}

#[derive(Debug)]
struct ChunkState {
    status: ChunkStatus,
    assignment: Assignment,
    last_progress: u8,
}

impl Chunk {
    /// Creates a pending, unassigned chunk and computes its checksum.
    pub fn new(id: impl Into<String>, index: u32, payload: Vec<u8>) -> Self {
        let checksum = checksum_bytes(&payload);
        Self {
            id: id.into(),
            index,
            payload,
            checksum,
            state: RwLock::new(ChunkState {
                status: ChunkStatus::Pending,
                assignment: Assignment::Unassigned,
                last_progress: 0,
            }),
        }
    }

    /// Builds the canonical chunk id for `file_name` at `index`.
    pub fn make_id(file_name: &str, index: u32) -> String {
        format!("{file_name}_chunk_{index}")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Position in the original stream.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn status(&self) -> ChunkStatus {
        recover(self.state.read()).status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == ChunkStatus::Pending
    }

    pub fn assignment(&self) -> Assignment {
        recover(self.state.read()).assignment
    }

    pub fn assigned_channel(&self) -> Option<ChannelId> {
        self.assignment().channel()
    }

    /// Last block-level progress reported while sending (0-100).
    pub fn last_progress(&self) -> u8 {
        recover(self.state.read()).last_progress
    }

    /// Routes the chunk to `channel`. Only pending chunks can be (re)assigned.
    pub fn assign(&self, channel: ChannelId) -> Result<(), TransferError> {
        let mut s = recover(self.state.write());
        if s.status != ChunkStatus::Pending {
            return Err(TransferError::InvalidTransition {
                chunk: self.id.clone(),
                from: s.status,
                to: ChunkStatus::Pending,
            });
        }
        s.assignment = Assignment::Channel(channel);
        Ok(())
    }

    /// Claims the chunk for sending (`Pending -> Transferring`).
    pub fn begin_transfer(&self) -> Result<(), TransferError> {
        self.transition(ChunkStatus::Transferring)
    }

    /// `Transferring -> Completed`.
    pub fn complete(&self) -> Result<(), TransferError> {
        let mut s = recover(self.state.write());
        self.transition_locked(&mut s, ChunkStatus::Completed)?;
        s.last_progress = 100;
        Ok(())
    }

    /// `Transferring -> Failed`.
    pub fn fail(&self) -> Result<(), TransferError> {
        self.transition(ChunkStatus::Failed)
    }

    pub fn set_progress(&self, percent: u8) {
        recover(self.state.write()).last_progress = percent.min(100);
    }

    fn transition(&self, next: ChunkStatus) -> Result<(), TransferError> {
        let mut s = recover(self.state.write());
        self.transition_locked(&mut s, next)
    }

    fn transition_locked(&self, s: &mut ChunkState, next: ChunkStatus) -> Result<(), TransferError> {
        if !s.status.can_transition_to(next) {
            return Err(TransferError::InvalidTransition {
                chunk: self.id.clone(),
                from: s.status,
                to: next,
            });
        }
        s.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        Chunk::new(Chunk::make_id("movie.mkv", 3), 3, b"payload".to_vec())
    }

    #[test]
    fn new_chunk_is_pending_and_unassigned() {
        let chunk = sample_chunk();
        assert_eq!(chunk.id(), "movie.mkv_chunk_3");
        assert_eq!(chunk.index(), 3);
        assert_eq!(chunk.size(), 7);
        assert_eq!(chunk.status(), ChunkStatus::Pending);
        assert_eq!(chunk.assignment(), Assignment::Unassigned);
        assert_eq!(chunk.checksum(), checksum_bytes(b"payload"));
    }

    #[test]
    fn happy_path_transitions() {
        let chunk = sample_chunk();
        chunk.begin_transfer().unwrap();
        assert_eq!(chunk.status(), ChunkStatus::Transferring);
        chunk.complete().unwrap();
        assert_eq!(chunk.status(), ChunkStatus::Completed);
        assert_eq!(chunk.last_progress(), 100);
    }

    #[test]
    fn cannot_skip_transferring() {
        let chunk = sample_chunk();
        assert!(chunk.complete().is_err());
        assert!(chunk.fail().is_err());
        assert_eq!(chunk.status(), ChunkStatus::Pending);
    }

    #[test]
    fn terminal_states_are_final() {
        let chunk = sample_chunk();
        chunk.begin_transfer().unwrap();
        chunk.fail().unwrap();
        assert!(chunk.begin_transfer().is_err());
        assert!(chunk.complete().is_err());
        assert!(chunk.fail().is_err());
        assert_eq!(chunk.status(), ChunkStatus::Failed);
    }

    #[test]
    fn claim_is_exclusive() {
        let chunk = sample_chunk();
        assert!(chunk.begin_transfer().is_ok());
        assert!(matches!(
            chunk.begin_transfer(),
            Err(TransferError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn assign_only_while_pending() {
        let chunk = sample_chunk();
        chunk.assign(ChannelId::Wired).unwrap();
        chunk.assign(ChannelId::Wireless).unwrap();
        assert_eq!(chunk.assigned_channel(), Some(ChannelId::Wireless));

        chunk.begin_transfer().unwrap();
        assert!(chunk.assign(ChannelId::Wired).is_err());
        assert_eq!(chunk.assigned_channel(), Some(ChannelId::Wireless));
    }

    #[test]
    fn transition_table() {
        use ChunkStatus::*;
        let all = [Pending, Transferring, Completed, Failed];
        for from in all {
            for to in all {
                let allowed = from.can_transition_to(to);
                let expected = matches!(
                    (from, to),
                    (Pending, Transferring) | (Transferring, Completed) | (Transferring, Failed)
                );
                assert_eq!(allowed, expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn channel_id_parse_and_display() {
        assert_eq!("wired".parse::<ChannelId>().unwrap(), ChannelId::Wired);
        assert_eq!("WiFi".parse::<ChannelId>().unwrap(), ChannelId::Wireless);
        assert!("carrier-pigeon".parse::<ChannelId>().is_err());
        assert_eq!(ChannelId::Wireless.to_string(), "wireless");
    }

    #[test]
    fn liveness_requires_active_and_connected() {
        assert!(ChannelLiveness::up(1.0).is_usable());
        assert!(!ChannelLiveness::down().is_usable());
        let half = ChannelLiveness {
            is_active: true,
            is_connected: false,
            current_throughput: 10.0,
        };
        assert!(!half.is_usable());
    }
}
