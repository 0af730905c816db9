//! Core Snapshot
//!
//! A consistent capture of every core state machine at one log position.
//! Each state machine contributes an opaque payload tagged with its own
//! format version, so machines can evolve their formats independently.
//!
//! Wire format (big-endian):
//! ```text
//! prev_index i64 | prev_term u64 | count u32 |
//!   count x (ordinal u32 | version u16 | length u32 | bytes)
//! ```

mod machines;

pub use machines::{CoreStateMachine, CoreStateMachines};

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::log::{LogIndex, LogPosition, Term};

/// Kinds of core state captured in a snapshot.
///
/// Ordinals are stable on the wire: new kinds are appended and an ordinal
/// is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoreStateType {
    LockToken,
    SessionTracker,
    IdAllocation,
    RaftCoreState,
}

impl CoreStateType {
    /// Every known kind, in ordinal order
    pub const ALL: [CoreStateType; 4] = [
        CoreStateType::LockToken,
        CoreStateType::SessionTracker,
        CoreStateType::IdAllocation,
        CoreStateType::RaftCoreState,
    ];

    pub fn ordinal(self) -> u32 {
        match self {
            CoreStateType::LockToken => 0,
            CoreStateType::SessionTracker => 1,
            CoreStateType::IdAllocation => 2,
            CoreStateType::RaftCoreState => 3,
        }
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.ordinal() == ordinal)
    }
}

impl std::fmt::Display for CoreStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreStateType::LockToken => write!(f, "LOCK_TOKEN"),
            CoreStateType::SessionTracker => write!(f, "SESSION_TRACKER"),
            CoreStateType::IdAllocation => write!(f, "ID_ALLOCATION"),
            CoreStateType::RaftCoreState => write!(f, "RAFT_CORE_STATE"),
        }
    }
}

/// One state machine's serialized state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPayload {
    /// Format version of `data`, owned by the state machine
    pub version: u16,
    pub data: Bytes,
}

impl SnapshotPayload {
    pub fn new(version: u16, data: impl Into<Bytes>) -> Self {
        Self {
            version,
            data: data.into(),
        }
    }
}

/// Immutable snapshot of the core state machines at `(prev_index, prev_term)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSnapshot {
    prev_index: LogIndex,
    prev_term: Term,
    payloads: BTreeMap<CoreStateType, SnapshotPayload>,
}

impl CoreSnapshot {
    /// Create an empty snapshot at the given position
    pub fn new(prev_index: LogIndex, prev_term: Term) -> Self {
        Self {
            prev_index,
            prev_term,
            payloads: BTreeMap::new(),
        }
    }

    /// Add a payload, replacing any previous one of the same type
    pub fn add(&mut self, state_type: CoreStateType, payload: SnapshotPayload) {
        self.payloads.insert(state_type, payload);
    }

    /// Builder form of [`CoreSnapshot::add`]
    pub fn with(mut self, state_type: CoreStateType, payload: SnapshotPayload) -> Self {
        self.add(state_type, payload);
        self
    }

    pub fn get(&self, state_type: CoreStateType) -> Option<&SnapshotPayload> {
        self.payloads.get(&state_type)
    }

    pub fn prev_index(&self) -> LogIndex {
        self.prev_index
    }

    pub fn prev_term(&self) -> Term {
        self.prev_term
    }

    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.prev_index, self.prev_term)
    }

    /// Number of state types present
    pub fn size(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Present types with their payloads, in ordinal order
    pub fn types(&self) -> impl Iterator<Item = (CoreStateType, &SnapshotPayload)> {
        self.payloads.iter().map(|(t, p)| (*t, p))
    }

    /// Encode to the wire format
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_i64::<BigEndian>(self.prev_index)?;
        buf.write_u64::<BigEndian>(self.prev_term)?;
        buf.write_u32::<BigEndian>(self.payloads.len() as u32)?;
        for (state_type, payload) in &self.payloads {
            let length = u32::try_from(payload.data.len()).map_err(|_| {
                Error::SnapshotFormat(format!("{} payload is too large", state_type))
            })?;
            buf.write_u32::<BigEndian>(state_type.ordinal())?;
            buf.write_u16::<BigEndian>(payload.version)?;
            buf.write_u32::<BigEndian>(length)?;
            buf.extend_from_slice(&payload.data);
        }
        Ok(buf)
    }

    /// Decode from the wire format.
    ///
    /// Unknown or repeated types, truncated input and trailing bytes are
    /// all rejected.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let prev_index = cursor.read_i64::<BigEndian>().map_err(truncated)?;
        let prev_term = cursor.read_u64::<BigEndian>().map_err(truncated)?;
        let count = cursor.read_u32::<BigEndian>().map_err(truncated)?;

        let mut snapshot = CoreSnapshot::new(prev_index, prev_term);
        for _ in 0..count {
            let ordinal = cursor.read_u32::<BigEndian>().map_err(truncated)?;
            let state_type = CoreStateType::from_ordinal(ordinal).ok_or_else(|| {
                Error::SnapshotFormat(format!("Unknown core state type ordinal {}", ordinal))
            })?;
            let version = cursor.read_u16::<BigEndian>().map_err(truncated)?;
            let length = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;

            let remaining = bytes.len() - cursor.position() as usize;
            if length > remaining {
                return Err(truncated(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let mut data = vec![0u8; length];
            cursor.read_exact(&mut data).map_err(truncated)?;

            if snapshot.payloads.contains_key(&state_type) {
                return Err(Error::SnapshotFormat(format!(
                    "Duplicate core state type {}",
                    state_type
                )));
            }
            snapshot.add(state_type, SnapshotPayload::new(version, data));
        }

        let trailing = bytes.len() - cursor.position() as usize;
        if trailing > 0 {
            return Err(Error::SnapshotFormat(format!(
                "{} trailing bytes after snapshot",
                trailing
            )));
        }
        Ok(snapshot)
    }

    fn encoded_len(&self) -> usize {
        20 + self
            .payloads
            .values()
            .map(|p| 10 + p.data.len())
            .sum::<usize>()
    }
}

impl std::fmt::Display for CoreSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CoreSnapshot{{prev_index={}, prev_term={}, types={}}}",
            self.prev_index,
            self.prev_term,
            self.payloads.len()
        )
    }
}

fn truncated(e: std::io::Error) -> Error {
    Error::SnapshotFormat(format!("Truncated snapshot: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CoreSnapshot {
        CoreSnapshot::new(41, 3)
            .with(CoreStateType::LockToken, SnapshotPayload::new(1, vec![7u8; 5]))
            .with(CoreStateType::IdAllocation, SnapshotPayload::new(2, vec![1u8, 2, 3]))
            .with(CoreStateType::RaftCoreState, SnapshotPayload::new(1, Vec::new()))
    }

    #[test]
    fn test_snapshot_round_trip() {
        let snapshot = sample();
        let restored = CoreSnapshot::deserialize(&snapshot.serialize().unwrap()).unwrap();

        assert_eq!(restored, snapshot);
        assert_eq!(restored.size(), 3);
        assert_eq!(restored.position(), LogPosition::new(41, 3));
        assert!(restored.get(CoreStateType::SessionTracker).is_none());
        assert_eq!(restored.get(CoreStateType::IdAllocation).unwrap().version, 2);
    }

    #[test]
    fn test_empty_snapshot_is_legal() {
        let snapshot = CoreSnapshot::new(-1, 0);
        let bytes = snapshot.serialize().unwrap();
        assert_eq!(bytes.len(), 20);

        let restored = CoreSnapshot::deserialize(&bytes).unwrap();
        assert!(restored.is_empty());
        assert_eq!(restored.prev_index(), -1);
    }

    #[test]
    fn test_encoding_layout() {
        let snapshot = CoreSnapshot::new(1, 2)
            .with(CoreStateType::SessionTracker, SnapshotPayload::new(9, vec![0xAB]));
        let bytes = snapshot.serialize().unwrap();

        assert_eq!(&bytes[0..8], &1i64.to_be_bytes());
        assert_eq!(&bytes[8..16], &2u64.to_be_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_be_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_be_bytes());
        assert_eq!(&bytes[24..26], &9u16.to_be_bytes());
        assert_eq!(&bytes[26..30], &1u32.to_be_bytes());
        assert_eq!(bytes[30], 0xAB);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut bytes = CoreSnapshot::new(0, 1)
            .with(CoreStateType::LockToken, SnapshotPayload::new(1, vec![1u8]))
            .serialize()
            .unwrap();
        bytes[20..24].copy_from_slice(&99u32.to_be_bytes());

        assert!(matches!(
            CoreSnapshot::deserialize(&bytes),
            Err(Error::SnapshotFormat(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_type() {
        let mut bytes = CoreSnapshot::new(0, 1)
            .with(CoreStateType::LockToken, SnapshotPayload::new(1, vec![1u8]))
            .with(CoreStateType::SessionTracker, SnapshotPayload::new(1, vec![2u8]))
            .serialize()
            .unwrap();
        // relabel the second entry as LOCK_TOKEN
        bytes[31..35].copy_from_slice(&0u32.to_be_bytes());

        assert!(matches!(
            CoreSnapshot::deserialize(&bytes),
            Err(Error::SnapshotFormat(msg)) if msg.contains("Duplicate")
        ));
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let bytes = sample().serialize().unwrap();
        for cut in [0, 7, 19, 25, bytes.len() - 1] {
            assert!(
                CoreSnapshot::deserialize(&bytes[..cut]).is_err(),
                "accepted snapshot cut at {}",
                cut
            );
        }

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(matches!(
            CoreSnapshot::deserialize(&extended),
            Err(Error::SnapshotFormat(msg)) if msg.contains("trailing")
        ));
    }

    #[test]
    fn test_ordinals_are_stable() {
        for (i, state_type) in CoreStateType::ALL.iter().enumerate() {
            assert_eq!(state_type.ordinal(), i as u32);
            assert_eq!(CoreStateType::from_ordinal(i as u32), Some(*state_type));
        }
        assert_eq!(CoreStateType::from_ordinal(4), None);
    }
}
