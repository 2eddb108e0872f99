//! Shards: replication units and their row application.
//!
//! A shard owns one tuple space, its SCN, its role and (for replicas) the
//! feeder it streams from. All durable rows funnel through
//! [`Shard::apply_row`] — recovery, the primary commit path and the
//! replication puller — so the invariant that the stored SCN equals the
//! SCN of the last applied row holds no matter where a row came from.

use std::collections::BTreeMap;

use tracing::warn;

use tidelog_core::{Row, Scn, ShardId, TagKind};
use tidelog_durability::{FeederParam, RowConsumer};
use tidelog_index::KeyDef;

use crate::space::Space;

/// Who drives this shard's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRole {
    /// Accepts client writes and feeds replicas
    Primary,
    /// Applies the feeder's stream; local writes are refused
    Replica,
}

/// One replication unit.
pub struct Shard {
    id: ShardId,
    role: ShardRole,
    feeder: Option<FeederParam>,
    scn: Scn,
    /// Highest SCN handed out to an in-flight submission.
    submitted_scn: Scn,
    /// Upstream SCN of the last replicated row, for lag accounting.
    remote_scn: Scn,
    last_update_tm: f64,
    space: Space,
}

impl Shard {
    /// Create a shard over a space built from `defs`.
    pub fn new(id: ShardId, role: ShardRole, defs: &[KeyDef]) -> Shard {
        Shard {
            id,
            role,
            feeder: None,
            scn: Scn::ZERO,
            submitted_scn: Scn::ZERO,
            remote_scn: Scn::ZERO,
            last_update_tm: 0.0,
            space: Space::new(defs),
        }
    }

    /// Configure the upstream feeder for a replica.
    pub fn set_feeder(&mut self, feeder: Option<FeederParam>) {
        self.feeder = feeder;
    }

    /// Shard id.
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Current role.
    pub fn role(&self) -> ShardRole {
        self.role
    }

    /// Promote or demote.
    pub fn set_role(&mut self, role: ShardRole) {
        self.role = role;
    }

    /// True when local writes must be refused.
    pub fn is_replica(&self) -> bool {
        self.role == ShardRole::Replica
    }

    /// Configured feeder, if any.
    pub fn feeder(&self) -> Option<&FeederParam> {
        self.feeder.as_ref()
    }

    /// SCN of the last applied row.
    pub fn scn(&self) -> Scn {
        self.scn
    }

    /// Upstream SCN of the last replicated row.
    pub fn remote_scn(&self) -> Scn {
        self.remote_scn
    }

    /// Seconds since the last applied row, against the given now.
    pub fn lag(&self, now_tm: f64) -> f64 {
        if self.last_update_tm == 0.0 {
            0.0
        } else {
            (now_tm - self.last_update_tm).max(0.0)
        }
    }

    /// The shard's tuple space.
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Mutable access for the commit path.
    pub fn space_mut(&mut self) -> &mut Space {
        &mut self.space
    }

    /// Reserve the SCN for a row about to be submitted. SCNs are handed
    /// out in submission order and confirmed by [`Shard::apply_row`] at
    /// commit, so concurrent submissions never collide.
    pub fn reserve_scn(&mut self) -> Scn {
        let next = self.submitted_scn.max(self.scn).next();
        self.submitted_scn = next;
        next
    }

    /// Roll the reservation counter back after a failed WAL write. The
    /// writer fails every in-flight submission together, so the counter
    /// simply returns to the committed SCN.
    pub fn abort_reservations(&mut self) {
        self.submitted_scn = self.scn;
    }

    /// Apply one durable row.
    pub fn apply_row(&mut self, row: &Row) -> Result<(), String> {
        let kind = row.tag.kind_bits();
        if kind == TagKind::WalData as u16
            || kind == TagKind::SnapData as u16
            || kind >= tidelog_core::Tag::USER_BASE
        {
            self.space.apply(&row.data)?;
        } else if kind == TagKind::ShardCreate as u16 || kind == TagKind::ShardAlter as u16 {
            // configuration rows carry no payload the space applies;
            // their effect is the scn adoption below
        } else if kind == TagKind::SnapInitial as u16
            || kind == TagKind::SnapFinal as u16
            || kind == TagKind::Nop as u16
            || kind == TagKind::RunCrc as u16
            || kind == TagKind::ShardFinal as u16
        {
            // sequence-only rows
        } else {
            warn!(tag = %row.tag, "unhandled row tag, applying as sequence-only");
        }

        if row.tag.changes_scn() {
            self.scn = row.scn;
            if self.submitted_scn < self.scn {
                self.submitted_scn = self.scn;
            }
        }
        if !row.remote_scn.is_zero() {
            self.remote_scn = row.remote_scn.to_scn();
        }
        self.last_update_tm = row.tm;
        Ok(())
    }
}

/// Every shard of the node; the recovery row consumer.
pub struct Shards {
    shards: BTreeMap<ShardId, Shard>,
    /// Index layout for shards materialized by `shard_create` rows.
    default_defs: Vec<KeyDef>,
}

impl Shards {
    /// Registry that materializes unknown shards with the given layout.
    pub fn new(default_defs: Vec<KeyDef>) -> Shards {
        Shards {
            shards: BTreeMap::new(),
            default_defs,
        }
    }

    /// Install a shard.
    pub fn insert(&mut self, shard: Shard) {
        self.shards.insert(shard.id(), shard);
    }

    /// Shard by id.
    pub fn get(&self, id: ShardId) -> Option<&Shard> {
        self.shards.get(&id)
    }

    /// Mutable shard by id.
    pub fn get_mut(&mut self, id: ShardId) -> Option<&mut Shard> {
        self.shards.get_mut(&id)
    }

    /// Iterate shards in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    /// Iterate shards mutably in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Shard> {
        self.shards.values_mut()
    }

    /// Per-shard SCNs, for file preambles.
    pub fn scn_map(&self) -> Vec<(ShardId, Scn)> {
        self.shards.iter().map(|(id, s)| (*id, s.scn())).collect()
    }

    fn shard_for_row(&mut self, row: &Row) -> Option<&mut Shard> {
        let id = row.shard_id;
        if id == tidelog_core::SHARD_ID_NONE {
            return None;
        }
        if !self.shards.contains_key(&id) {
            // shard_create (and replayed rows of a shard this node no
            // longer has configured) materialize it with the default
            // layout
            let defs = self.default_defs.clone();
            self.shards.insert(id, Shard::new(id, ShardRole::Primary, &defs));
        }
        self.shards.get_mut(&id)
    }

    /// Apply a row to its shard; rows with no shard are sequence-only.
    pub fn apply(&mut self, row: &Row) -> Result<(), String> {
        match self.shard_for_row(row) {
            Some(shard) => shard.apply_row(row),
            None => Ok(()),
        }
    }
}

impl RowConsumer for Shards {
    fn recover_row(&mut self, row: &Row) -> Result<(), String> {
        self.apply(row)
    }
}
