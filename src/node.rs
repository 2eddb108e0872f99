//! Node lifecycle: recovery, serving, replication, snapshots, shutdown.
//!
//! Startup is the recovery state machine: lock the data directory, load
//! the greatest snapshot, replay the WAL tail, then either configure the
//! WAL writer child and accept writes (primary) or start the replication
//! puller (follower). Fold mode stops after writing a fresh snapshot.
//!
//! Everything runs on one current-thread runtime inside a `LocalSet`;
//! the WAL writer child and snapshot child are the only true parallelism.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use tidelog_core::{Lsn, Row, Scn, ShardId, Tag, TagKind};
use tidelog_durability::recovery::run_crc_payload;
use tidelog_durability::snapshot::{child_done, fork_and_run, write_snapshot};
use tidelog_durability::{
    Backoff, FeederParam, LogDir, Puller, Recovery, RunCrcStatus, WalConfig, WalWriter,
};
use tidelog_index::KeyDef;
use tidelog_net::{codes, ReplyError, Service};

use crate::error::{NodeError, Result};
use crate::shard::{Shard, ShardRole, Shards};

/// Node configuration, normally produced by the launcher.
#[derive(Clone)]
pub struct NodeConfig {
    /// Directory holding snapshots and WAL files
    pub data_dir: PathBuf,
    /// Listen address for the request service
    pub listen: String,
    /// Upstream feeder; presence makes this node a follower
    pub feeder: Option<FeederParam>,
    /// Index layout of the default shard (first definition is primary)
    pub space: Vec<KeyDef>,
    /// Worker tasks in the service pool
    pub workers: usize,
    /// Rows per xlog file before rotation
    pub rows_per_file: u64,
    /// Periodic snapshot interval; `None` disables the timer
    pub snapshot_interval: Option<Duration>,
    /// Periodic run-crc checkpoint interval; `None` disables it
    pub run_crc_interval: Option<Duration>,
    /// Replication reconnect backoff floor
    pub reconnect_base: Duration,
    /// Replication reconnect backoff cap
    pub reconnect_cap: Duration,
}

impl NodeConfig {
    /// Defaults: primary serving a single space keyed by a `u32` primary
    /// field, listening on an ephemeral local port.
    pub fn new(data_dir: impl Into<PathBuf>) -> NodeConfig {
        NodeConfig {
            data_dir: data_dir.into(),
            listen: "127.0.0.1:0".to_string(),
            feeder: None,
            space: vec![KeyDef::u32(0)],
            workers: 4,
            rows_per_file: 65_536,
            snapshot_interval: None,
            run_crc_interval: None,
            reconnect_base: Duration::from_millis(100),
            reconnect_cap: Duration::from_secs(10),
        }
    }

    /// Set the listen address.
    pub fn with_listen(mut self, listen: impl Into<String>) -> NodeConfig {
        self.listen = listen.into();
        self
    }

    /// Follow the given feeder.
    pub fn with_feeder(mut self, feeder: FeederParam) -> NodeConfig {
        self.feeder = Some(feeder);
        self
    }

    /// Set the space layout.
    pub fn with_space(mut self, defs: Vec<KeyDef>) -> NodeConfig {
        self.space = defs;
        self
    }

    /// Set the xlog rotation threshold.
    pub fn with_rows_per_file(mut self, rows: u64) -> NodeConfig {
        self.rows_per_file = rows;
        self
    }

    fn wal_config(&self) -> WalConfig {
        WalConfig::new(&self.data_dir).with_rows_per_file(self.rows_per_file)
    }
}

/// Serializes index application into LSN order: commits may resume in any
/// order, but each waits for its predecessor before touching the indexes.
struct ApplyGate {
    next: Cell<i64>,
    wake: Notify,
}

impl ApplyGate {
    fn new(next: Lsn) -> ApplyGate {
        ApplyGate {
            next: Cell::new(next.0),
            wake: Notify::new(),
        }
    }

    async fn enter(&self, lsn: Lsn) {
        loop {
            if self.next.get() == lsn.0 {
                return;
            }
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.next.get() == lsn.0 {
                return;
            }
            notified.await;
        }
    }

    fn exit(&self, next: Lsn) {
        self.next.set(next.0);
        self.wake.notify_waiters();
    }
}

/// Shared node state reachable from every handler.
pub struct NodeState {
    config: NodeConfig,
    /// All shards; the recovery row consumer
    pub shards: RefCell<Shards>,
    writer: RefCell<Option<Rc<WalWriter>>>,
    lsn: Cell<Lsn>,
    run_crc: Cell<u32>,
    run_crc_status: Cell<RunCrcStatus>,
    read_only: Cell<bool>,
    gate: ApplyGate,
    snapshot_child: Cell<Option<nix::unistd::Pid>>,
    shutdown_tx: watch::Sender<bool>,
    /// Keeps the data-directory flock held for the process lifetime.
    _dir_lock: Recovery,
}

impl NodeState {
    /// Current node LSN: the last applied row.
    pub fn lsn(&self) -> Lsn {
        self.lsn.get()
    }

    /// Rolling checksum over applied wal payloads.
    pub fn run_crc(&self) -> u32 {
        self.run_crc.get()
    }

    /// Run-crc verification status from recovery.
    pub fn run_crc_status(&self) -> RunCrcStatus {
        self.run_crc_status.get()
    }

    /// SCN of a shard.
    pub fn scn(&self, shard: ShardId) -> Option<Scn> {
        self.shards.borrow().get(shard).map(|s| s.scn())
    }

    /// WAL directory of this node.
    pub fn wal_dir(&self) -> LogDir {
        LogDir::wal(&self.config.data_dir)
    }

    fn snap_dir(&self) -> LogDir {
        LogDir::snap(&self.config.data_dir)
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Refuse writes that this node cannot take.
    pub fn check_writable(&self, shard: ShardId) -> std::result::Result<(), ReplyError> {
        let shards = self.shards.borrow();
        let shard = shards
            .get(shard)
            .ok_or_else(|| ReplyError::new(codes::ILLEGAL_PARAMS, "no such shard"))?;
        if shard.is_replica() {
            return Err(ReplyError::new(codes::NOT_MASTER, "node is a replica"));
        }
        if self.read_only.get() || self.writer.borrow().is_none() {
            return Err(ReplyError::new(codes::READONLY, "wal writer unavailable"));
        }
        Ok(())
    }

    /// Submit one row for durable commit; resolves with the row stamped
    /// with its assigned LSN, plus the post-commit rolling checksum.
    pub async fn wal_commit(
        &self,
        row: Row,
        shard: ShardId,
    ) -> std::result::Result<(Row, u32), ReplyError> {
        let writer = self
            .writer
            .borrow()
            .clone()
            .ok_or_else(|| ReplyError::new(codes::READONLY, "wal writer unavailable"))?;

        match writer.submit(vec![row.clone()]).await {
            Ok(commit) => {
                let mut row = row;
                row.lsn = commit.last_lsn;
                Ok((row, commit.run_crc))
            }
            Err(e) => {
                warn!(error = %e, "wal submit failed, node is read-only until respawn");
                self.read_only.set(true);
                if let Some(shard) = self.shards.borrow_mut().get_mut(shard) {
                    shard.abort_reservations();
                }
                Err(ReplyError::new(codes::READONLY, "wal write failed"))
            }
        }
    }

    /// Apply a committed row to the indexes, in LSN order.
    pub async fn apply_committed(
        &self,
        row: &Row,
        run_crc: u32,
    ) -> std::result::Result<(), ReplyError> {
        self.gate.enter(row.lsn).await;
        let applied = self.shards.borrow_mut().apply(row);
        self.lsn.set(row.lsn);
        self.run_crc.set(run_crc);
        self.gate.exit(row.lsn.next());
        applied.map_err(|reason| ReplyError::new(codes::INDEX_VIOLATION, reason))
    }

    /// Apply a row pulled from the feeder: allocate a local LSN, record
    /// the upstream SCN, drop rows already covered.
    fn apply_replicated(&self, upstream: &Row) -> std::result::Result<bool, String> {
        let current = self
            .shards
            .borrow()
            .get(upstream.shard_id)
            .map(|s| s.scn())
            .unwrap_or(Scn::ZERO);
        if upstream.scn <= current {
            return Ok(false);
        }

        let mut row = upstream.clone();
        row.lsn = self.lsn.get().next();
        row.remote_scn = tidelog_core::RemoteScn::from_scn(upstream.scn);
        self.shards.borrow_mut().apply(&row)?;
        self.lsn.set(row.lsn);
        self.gate.exit(row.lsn.next());
        Ok(true)
    }

    /// Rows of a full state dump, in apply order: a configuration row per
    /// shard carrying its SCN, then its data rows.
    fn snapshot_rows(shards: &Shards) -> Vec<Row> {
        let mut rows = Vec::new();
        for shard in shards.iter() {
            let mut create = Row::new(Tag::sys(TagKind::ShardCreate), shard.id(), Vec::new());
            create.scn = shard.scn();
            rows.push(create);
            for payload in shard.space().snapshot_payloads() {
                let mut row = Row::new(Tag::snap(TagKind::SnapData), shard.id(), payload);
                row.scn = shard.scn();
                rows.push(row);
            }
        }
        rows
    }

    /// Write a snapshot of the current state in-process and prune WAL
    /// files it makes redundant. Used by fold mode and tests; the timer
    /// path forks instead.
    pub fn snapshot_inline(&self) -> Result<PathBuf> {
        let shards = self.shards.borrow();
        let lsn = self.lsn.get();
        let path = write_snapshot(
            &self.snap_dir(),
            lsn,
            &shards.scn_map(),
            self.run_crc.get(),
            Self::snapshot_rows(&shards),
        )?;
        drop(shards);
        self.wal_dir().prune_covered(lsn)?;
        Ok(path)
    }

    /// Fork a snapshot child; the parent keeps serving.
    pub fn snapshot_fork(&self) -> Result<()> {
        if self.snapshot_child.get().is_some() {
            warn!("snapshot already running, skipping");
            return Ok(());
        }
        let shards = self.shards.borrow();
        let lsn = self.lsn.get();
        let run_crc = self.run_crc.get();
        let snap_dir = self.snap_dir();
        let pid = fork_and_run(|| {
            write_snapshot(
                &snap_dir,
                lsn,
                &shards.scn_map(),
                run_crc,
                Self::snapshot_rows(&shards),
            )
            .map(|_| ())
        })?;
        self.snapshot_child.set(Some(pid));
        Ok(())
    }
}

/// A started node.
pub struct Node {
    state: Rc<NodeState>,
    service: Rc<Service>,
    addr: String,
    serve_task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Node {
    /// Recover local state and start serving. Must run inside a
    /// `tokio::task::LocalSet` on a current-thread runtime.
    pub async fn start(config: NodeConfig) -> Result<Node> {
        std::fs::create_dir_all(&config.data_dir)?;

        let role = if config.feeder.is_some() {
            ShardRole::Replica
        } else {
            ShardRole::Primary
        };
        let mut shards = Shards::new(config.space.clone());
        let mut default_shard = Shard::new(ShardId(0), role, &config.space);
        default_shard.set_feeder(config.feeder.clone());
        shards.insert(default_shard);

        // Init → LoadingSnap → LoadingWal
        let mut recovery = Recovery::new(
            LogDir::snap(&config.data_dir),
            LogDir::wal(&config.data_dir),
        );
        recovery.lock()?;
        let lsn = recovery.load_full(&mut shards)?;

        // recovery materializes replayed shards as primaries; a follower
        // node demotes them before serving
        if role == ShardRole::Replica {
            for shard in shards.iter_mut() {
                shard.set_role(ShardRole::Replica);
            }
        }

        let run_crc = recovery.run_crc();
        let run_crc_status = recovery.run_crc_status();
        let (shutdown_tx, _) = watch::channel(false);
        let state = Rc::new(NodeState {
            shards: RefCell::new(shards),
            writer: RefCell::new(None),
            lsn: Cell::new(lsn),
            run_crc: Cell::new(run_crc),
            run_crc_status: Cell::new(run_crc_status),
            read_only: Cell::new(false),
            gate: ApplyGate::new(lsn.next()),
            snapshot_child: Cell::new(None),
            shutdown_tx,
            _dir_lock: recovery,
            config: config.clone(),
        });

        if config.feeder.is_none() {
            // go primary: configure the WAL writer child
            let writer = WalWriter::spawn_child(&config.wal_config(), 1, lsn, run_crc)?;
            *state.writer.borrow_mut() = Some(Rc::new(writer));
            tokio::task::spawn_local(writer_watcher(state.clone()));
            if let Some(interval) = config.run_crc_interval {
                tokio::task::spawn_local(run_crc_timer(state.clone(), interval));
            }
        } else {
            // go follower: pull from the feeder
            tokio::task::spawn_local(replica_task(state.clone()));
        }

        if let Some(interval) = config.snapshot_interval {
            tokio::task::spawn_local(snapshot_timer(state.clone(), interval));
        }

        let service = Service::new("tidelog", config.workers);
        crate::ops::register(&service, state.clone());
        crate::feeder::register(&service, state.clone());

        let listener = tokio::net::TcpListener::bind(&config.listen).await?;
        let addr = listener.local_addr()?.to_string();
        let serve_task = tokio::task::spawn_local(service.clone().serve(listener));

        info!(addr = %addr, lsn = lsn.0, role = ?role, "node started");
        Ok(Node {
            state,
            service,
            addr,
            serve_task,
        })
    }

    /// Recover, write a fresh snapshot, exit without serving.
    pub fn fold(config: NodeConfig) -> Result<PathBuf> {
        std::fs::create_dir_all(&config.data_dir)?;
        let mut shards = Shards::new(config.space.clone());
        shards.insert(Shard::new(ShardId(0), ShardRole::Primary, &config.space));

        let mut recovery = Recovery::new(
            LogDir::snap(&config.data_dir),
            LogDir::wal(&config.data_dir),
        );
        recovery.lock()?;
        let lsn = recovery.load_full(&mut shards)?;

        let path = write_snapshot(
            &LogDir::snap(&config.data_dir),
            lsn,
            &shards.scn_map(),
            recovery.run_crc(),
            NodeState::snapshot_rows(&shards),
        )?;
        info!(path = %path.display(), "fold complete");
        Ok(path)
    }

    /// Bound service address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Shared state, for tests and embedding.
    pub fn state(&self) -> &Rc<NodeState> {
        &self.state
    }

    /// Current LSN.
    pub fn lsn(&self) -> Lsn {
        self.state.lsn()
    }

    /// Stop accepting, drain handlers, flush the WAL child, exit.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down");
        let _ = self.state.shutdown_tx.send(true);
        self.service.shutdown();
        match self.serve_task.await {
            Ok(result) => result?,
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(NodeError::Config(format!("serve task panicked: {}", e))),
        }

        // closing the writer drops the socketpair; the child flushes its
        // queue, writes the eof marker and exits, releasing its inherited
        // copy of the directory lock
        if let Some(writer) = self.state.writer.borrow_mut().take() {
            writer.close();
            writer.wait_exit().await;
        }

        // let background tasks observe the shutdown signal and unwind, so
        // the directory lock is free by the time this returns
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Serve until SIGTERM or ctrl-c.
    pub async fn run(config: NodeConfig) -> Result<()> {
        let node = Node::start(config).await?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("interrupt"),
        }
        node.shutdown().await
    }
}

/// Respawn the WAL writer child when it dies: bump the epoch, reseed the
/// LSN and checksum chain, leave failed submissions failed.
async fn writer_watcher(state: Rc<NodeState>) {
    let mut shutdown = state.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => if *shutdown.borrow() { return },
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let dead = state
            .writer
            .borrow()
            .as_ref()
            .map(|w| !w.is_alive())
            .unwrap_or(false);
        if !dead {
            // also reap a finished snapshot child while we are here
            if let Some(pid) = state.snapshot_child.get() {
                if let Some(ok) = child_done(pid) {
                    state.snapshot_child.set(None);
                    if ok {
                        if let Err(e) = state.wal_dir().prune_covered(state.lsn.get()) {
                            warn!(error = %e, "wal prune after snapshot failed");
                        }
                    } else {
                        warn!("snapshot child failed");
                    }
                }
            }
            continue;
        }

        let old = state.writer.borrow_mut().take();
        let epoch = old.as_ref().map(|w| w.epoch()).unwrap_or(0) + 1;
        if let Some(old) = old {
            old.reap();
        }
        for shard in state.shards.borrow_mut().iter_mut() {
            shard.abort_reservations();
        }

        // rows the dead child wrote without a confirmed reply would fork
        // the log if a fresh child wrote past them; the logs on disk are
        // the source of truth, so stay read-only and let the operator
        // restart into recovery instead
        match tidelog_durability::reader::tail_lsn(&state.wal_dir()) {
            Ok(Some(tail)) if tail > state.lsn.get() => {
                error!(
                    tail = tail.0,
                    applied = state.lsn.get().0,
                    "wal tail ahead of applied state after writer crash; staying read-only"
                );
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "cannot inspect wal tail, staying read-only");
                continue;
            }
        }

        match WalWriter::spawn_child(
            &state.config.wal_config(),
            epoch,
            state.lsn.get(),
            state.run_crc.get(),
        ) {
            Ok(writer) => {
                info!(epoch, "wal writer respawned");
                *state.writer.borrow_mut() = Some(Rc::new(writer));
                state.read_only.set(false);
            }
            Err(e) => {
                error!(error = %e, "wal writer respawn failed, staying read-only");
            }
        }
    }
}

/// Follower loop: handshake at the current SCN, apply the stream,
/// reconnect with capped exponential backoff.
async fn replica_task(state: Rc<NodeState>) {
    let feeder = state
        .config
        .feeder
        .clone()
        .expect("replica task requires a feeder");
    let mut backoff = Backoff::new(state.config.reconnect_base, state.config.reconnect_cap);
    let mut shutdown = state.shutdown_rx();

    loop {
        let scn = state.scn(ShardId(0)).unwrap_or(Scn::ZERO);
        let puller = tokio::select! {
            _ = shutdown.changed() => return,
            p = Puller::connect(&feeder, scn) => p,
        };
        match puller {
            Ok(mut puller) => loop {
                let row = tokio::select! {
                    _ = shutdown.changed() => return,
                    r = puller.recv_row() => r,
                };
                match row {
                    Ok(row) => {
                        backoff.reset();
                        match state.apply_replicated(&row) {
                            Ok(true) => {}
                            Ok(false) => {
                                // scn at or below ours: idempotent drop
                            }
                            Err(reason) => {
                                error!(lsn = row.lsn.0, reason = %reason, "replica apply failed");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "replication stream broken");
                        break;
                    }
                }
            },
            Err(e) => {
                warn!(feeder = %feeder.addr, error = %e, "feeder connect failed");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Periodic forked snapshots.
async fn snapshot_timer(state: Rc<NodeState>, interval: Duration) {
    let mut shutdown = state.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => if *shutdown.borrow() { return },
            _ = tokio::time::sleep(interval) => {}
        }
        if state.lsn.get() == Lsn::ZERO {
            continue;
        }
        if let Err(e) = state.snapshot_fork() {
            warn!(error = %e, "snapshot fork failed");
        }
    }
}

/// Periodic run-crc checkpoint rows.
async fn run_crc_timer(state: Rc<NodeState>, interval: Duration) {
    let mut shutdown = state.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => if *shutdown.borrow() { return },
            _ = tokio::time::sleep(interval) => {}
        }
        if state.check_writable(ShardId(0)).is_err() {
            continue;
        }

        let scn = {
            let mut shards = state.shards.borrow_mut();
            match shards.get_mut(ShardId(0)) {
                Some(shard) => shard.reserve_scn(),
                None => continue,
            }
        };
        let mut row = Row::new(
            Tag::sys(TagKind::RunCrc),
            ShardId(0),
            run_crc_payload(state.run_crc.get()),
        );
        row.scn = scn;
        match state.wal_commit(row, ShardId(0)).await {
            Ok((row, crc)) => {
                if let Err(e) = state.apply_committed(&row, crc).await {
                    warn!(error = %e.message, "run_crc apply failed");
                }
            }
            Err(e) => warn!(error = %e.message, "run_crc submit failed"),
        }
    }
}
