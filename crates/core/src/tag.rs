//! Row tags.
//!
//! Every durable row carries a 16-bit tag. The two highest bits classify
//! the row (`01` snapshot, `10` wal, `11` system wal; `00` is invalid) and
//! the low 14 bits enumerate the kind. Kind values below
//! [`Tag::USER_BASE`] are reserved for the engine; applications register
//! their own kinds at or above it.

use crate::error::CoreError;

/// Mask selecting the kind bits of a tag.
pub const TAG_MASK: u16 = 0x3fff;

/// Row classification carried in the top two tag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Row belongs to a snapshot file.
    Snap,
    /// Ordinary replicated write.
    Wal,
    /// System row on the wal sequence.
    Sys,
}

impl TagClass {
    fn bits(self) -> u16 {
        match self {
            TagClass::Snap => 0x4000,
            TagClass::Wal => 0x8000,
            TagClass::Sys => 0xc000,
        }
    }
}

/// Engine-reserved row kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TagKind {
    /// First row of a snapshot.
    SnapInitial = 1,
    /// Snapshot body row.
    SnapData = 2,
    /// Ordinary data row.
    WalData = 3,
    /// Last row of a snapshot; bumps the SCN.
    SnapFinal = 4,
    /// Marks the end of replay; never persisted with meaning.
    WalFinal = 5,
    /// Rolling checksum checkpoint over applied payloads.
    RunCrc = 6,
    /// Sequence bump with no payload effect.
    Nop = 7,
    /// Installs a new shard.
    ShardCreate = 11,
    /// Alters an existing shard's configuration.
    ShardAlter = 12,
    /// Removes a shard.
    ShardFinal = 13,
    /// Type-length-value envelope for compound payloads.
    Tlv = 14,
}

/// A complete row tag: class bits plus kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u16);

impl Tag {
    /// First kind value available to applications.
    pub const USER_BASE: u16 = 32;

    /// Build a snapshot-class tag.
    pub fn snap(kind: TagKind) -> Tag {
        Tag(TagClass::Snap.bits() | kind as u16)
    }

    /// Build a wal-class tag.
    pub fn wal(kind: TagKind) -> Tag {
        Tag(TagClass::Wal.bits() | kind as u16)
    }

    /// Build a system-class tag.
    pub fn sys(kind: TagKind) -> Tag {
        Tag(TagClass::Sys.bits() | kind as u16)
    }

    /// Build a wal-class tag for an application kind.
    pub fn user(kind: u16) -> Tag {
        debug_assert!(kind >= Tag::USER_BASE && kind <= TAG_MASK);
        Tag(TagClass::Wal.bits() | kind)
    }

    /// Kind bits of the tag.
    pub fn kind_bits(self) -> u16 {
        self.0 & TAG_MASK
    }

    /// Class of the tag, or an error for the invalid `00` class.
    pub fn class(self) -> Result<TagClass, CoreError> {
        match self.0 & !TAG_MASK {
            0x4000 => Ok(TagClass::Snap),
            0x8000 => Ok(TagClass::Wal),
            0xc000 => Ok(TagClass::Sys),
            _ => Err(CoreError::InvalidTag(self.0)),
        }
    }

    /// True for tags that advance the shard SCN when applied.
    ///
    /// Any wal-class tag changes the SCN; of the snap/system kinds only
    /// `Nop`, `RunCrc`, `ShardCreate`, `ShardAlter` and `SnapFinal` do.
    pub fn changes_scn(self) -> bool {
        if self.0 & !TAG_MASK == TagClass::Wal.bits() {
            return true;
        }
        matches!(
            self.kind_bits(),
            k if k == TagKind::Nop as u16
                || k == TagKind::RunCrc as u16
                || k == TagKind::ShardCreate as u16
                || k == TagKind::ShardAlter as u16
                || k == TagKind::SnapFinal as u16
        )
    }

    /// True for the dummy end-of-replay row.
    pub fn is_dummy(self) -> bool {
        self.kind_bits() == TagKind::WalFinal as u16
    }

    fn kind_name(self) -> Option<&'static str> {
        Some(match self.kind_bits() {
            1 => "snap_initial",
            2 => "snap_data",
            3 => "wal_data",
            4 => "snap_final",
            5 => "wal_final",
            6 => "run_crc",
            7 => "nop",
            11 => "shard_create",
            12 => "shard_alter",
            13 => "shard_final",
            14 => "tlv",
            _ => return None,
        })
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let class = match self.0 & !TAG_MASK {
            0x4000 => "snap",
            0x8000 => "wal",
            0xc000 => "sys",
            _ => "bad",
        };
        match self.kind_name() {
            Some(name) => write!(f, "{}/{}", class, name),
            None => write!(f, "{}/usr{}", class, self.kind_bits()),
        }
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({:#06x} {})", self.0, self)
    }
}
