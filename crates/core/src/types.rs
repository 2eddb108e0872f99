//! Sequence-number newtypes.
//!
//! Two sequences order the log. The **LSN** is node-global and assigned by
//! the WAL writer at commit; it strictly increases across every row the
//! node persists. The **SCN** is per shard and only advances on
//! scn-changing tags, so replicas of a shard can compare positions without
//! seeing the other shards' traffic.

use serde::{Deserialize, Serialize};

/// Node-global log sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub i64);

impl Lsn {
    /// The LSN before any row has been written.
    pub const ZERO: Lsn = Lsn(0);

    /// Next LSN in sequence.
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-shard sequence number, bumped only by scn-changing tags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Scn(pub i64);

impl Scn {
    /// The SCN of an empty shard.
    pub const ZERO: Scn = Scn(0);

    /// Next SCN in sequence.
    pub fn next(self) -> Scn {
        Scn(self.0 + 1)
    }
}

impl std::fmt::Display for Scn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication unit identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShardId(pub u16);

/// Shard id used by rows that do not belong to any shard.
pub const SHARD_ID_NONE: ShardId = ShardId(u16::MAX);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upstream SCN marker carried by replicated rows.
///
/// Six bytes on the wire; values are clamped into 48 bits. A replica stores
/// the feeder's SCN here so lag can be measured and the stream resumed
/// after reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RemoteScn(pub [u8; 6]);

impl RemoteScn {
    /// Encode an SCN into the 48-bit marker.
    pub fn from_scn(scn: Scn) -> RemoteScn {
        let bytes = scn.0.to_le_bytes();
        let mut out = [0u8; 6];
        out.copy_from_slice(&bytes[..6]);
        RemoteScn(out)
    }

    /// Decode the marker back into an SCN.
    pub fn to_scn(self) -> Scn {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&self.0);
        Scn(i64::from_le_bytes(bytes))
    }

    /// True when no upstream SCN has been recorded.
    pub fn is_zero(self) -> bool {
        self.0 == [0u8; 6]
    }
}
