// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable Raft storage for one replica.
//!
//! Implements the combined `RaftStorage` trait (v1 API, via the adaptor) on
//! `Arc<ReplicaStore>`. The replica's state directory holds:
//!
//! ```text
//! <state_dir>/raft/log        bincode frames of log entries
//! <state_dir>/raft/vote       the current vote
//! <state_dir>/raft/meta       committed / purged / applied ids, membership
//! <state_dir>/snapshots/      executor snapshot blobs + their metadata
//! ```
//!
//! Applying a committed entry decodes the wire request and invokes the
//! hosted worker runtime directly (batching bypassed: log order must map
//! one-to-one onto handler invocations). Snapshot build and restore delegate
//! to the executor's callbacks; the blob format is the executor's concern.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftStorage, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership, Vote,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use flow_repr::wire;
use flow_worker::WorkerRuntime;

use crate::{decode, encode, ReplicaId, ReplicaNode, TypeConfig};

/// A snapshot held in memory for serving to peers.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<ReplicaId, ReplicaNode>,
    pub data: Vec<u8>,
}

/// One durable log entry: the log id plus the bincode-encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntryData {
    log_id: LogId<ReplicaId>,
    payload: Vec<u8>,
}

/// Durable non-log metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaData {
    committed: Option<LogId<ReplicaId>>,
    last_purged: Option<LogId<ReplicaId>>,
    last_applied: Option<LogId<ReplicaId>>,
    last_membership: StoredMembership<ReplicaId, ReplicaNode>,
}

/// Snapshot metadata persisted next to the blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRecord {
    meta: SnapshotMeta<ReplicaId, ReplicaNode>,
    blob: PathBuf,
}

/// The durable state of one replica, shared with openraft via `Arc`.
pub struct ReplicaStore {
    dir: PathBuf,
    /// The hosted worker runtime; committed entries apply through it.
    runtime: Arc<WorkerRuntime>,
    log: RwLock<BTreeMap<u64, LogEntryData>>,
    vote: RwLock<Option<Vote<ReplicaId>>>,
    meta: RwLock<MetaData>,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
}

impl Debug for ReplicaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ReplicaStore {
    /// Opens (or creates) the replica state under `dir`, restoring the
    /// latest snapshot into the executor before any log replay.
    pub async fn open(dir: impl Into<PathBuf>, runtime: Arc<WorkerRuntime>) -> anyhow::Result<Arc<ReplicaStore>> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("raft"))?;
        std::fs::create_dir_all(dir.join("snapshots"))?;

        let vote = read_file_opt(&dir.join("raft/vote"))?;
        let meta: MetaData = read_file_opt(&dir.join("raft/meta"))?.unwrap_or_default();
        let log = read_log(&dir.join("raft/log"))?;

        let current_snapshot = match read_file_opt::<SnapshotRecord>(&dir.join("snapshots/latest"))? {
            Some(record) => {
                let data = std::fs::read(&record.blob)?;
                Some(StoredSnapshot {
                    meta: record.meta,
                    data,
                })
            }
            None => None,
        };

        let store = ReplicaStore {
            dir,
            runtime,
            log: RwLock::new(log),
            vote: RwLock::new(vote),
            meta: RwLock::new(meta),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(current_snapshot),
        };

        // Seed the executor from the latest snapshot; openraft re-applies
        // the log tail between the snapshot and the committed index.
        if let Some(snapshot) = store.current_snapshot.read().clone() {
            let blob = store.snapshot_blob_path(&snapshot.meta.snapshot_id);
            info!(
                snapshot = %snapshot.meta.snapshot_id,
                "consensus: restoring executor from snapshot"
            );
            store
                .runtime
                .executor()
                .restore(&blob)
                .await
                .map_err(|e| anyhow::anyhow!("snapshot restore failed: {e}"))?;
            let mut meta = store.meta.write();
            if meta.last_applied < snapshot.meta.last_log_id {
                meta.last_applied = snapshot.meta.last_log_id;
                meta.last_membership = snapshot.meta.last_membership.clone();
            }
        }

        Ok(Arc::new(store))
    }

    /// The hosted runtime.
    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.runtime
    }

    fn snapshot_blob_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join("snapshots").join(snapshot_id)
    }

    fn persist_log(&self) -> Result<(), std::io::Error> {
        let log = self.log.read();
        let entries: Vec<&LogEntryData> = log.values().collect();
        let bytes = encode(&entries).map_err(io_other)?;
        atomic_write(&self.dir.join("raft/log"), &bytes)
    }

    fn persist_vote(&self) -> Result<(), std::io::Error> {
        let vote = self.vote.read();
        let bytes = encode(&*vote).map_err(io_other)?;
        atomic_write(&self.dir.join("raft/vote"), &bytes)
    }

    fn persist_meta(&self) -> Result<(), std::io::Error> {
        let meta = self.meta.read();
        let bytes = encode(&*meta).map_err(io_other)?;
        atomic_write(&self.dir.join("raft/meta"), &bytes)
    }

    fn entries_in<RB: RangeBounds<u64>>(&self, range: RB) -> Vec<Entry<TypeConfig>> {
        let log = self.log.read();
        log.range(range)
            .map(|(_, entry)| {
                match decode::<EntryPayload<TypeConfig>>(&entry.payload) {
                    Ok(payload) => Entry {
                        log_id: entry.log_id,
                        payload,
                    },
                    Err(e) => {
                        warn!("consensus: undecodable log entry {}: {e}", entry.log_id);
                        Entry {
                            log_id: entry.log_id,
                            payload: EntryPayload::Blank,
                        }
                    }
                }
            })
            .collect()
    }
}

fn io_other<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

/// Writes via a temp file + rename so a crash never leaves a torn file.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn read_file_opt<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(decode(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_log(path: &Path) -> anyhow::Result<BTreeMap<u64, LogEntryData>> {
    let entries: Vec<LogEntryData> = match std::fs::read(path) {
        Ok(bytes) => decode(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(entries
        .into_iter()
        .map(|e| (e.log_id.index, e))
        .collect())
}

/// Log reader handle shared with openraft's replication tasks.
pub struct ReplicaLogReader {
    store: Arc<ReplicaStore>,
}

impl RaftLogReader<TypeConfig> for ReplicaLogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<ReplicaId>> {
        Ok(self.store.entries_in(range))
    }
}

/// Builds snapshots by invoking the executor's snapshot callback.
pub struct ReplicaSnapshotBuilder {
    store: Arc<ReplicaStore>,
}

impl RaftSnapshotBuilder<TypeConfig> for ReplicaSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<ReplicaId>> {
        let (last_applied, last_membership) = {
            let meta = self.store.meta.read();
            (meta.last_applied, meta.last_membership.clone())
        };

        let snapshot_idx = self.store.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match last_applied {
            Some(last) => format!("{}-{}-{snapshot_idx}", last.leader_id, last.index),
            None => format!("--{snapshot_idx}"),
        };
        let blob = self.store.snapshot_blob_path(&snapshot_id);

        self.store
            .runtime
            .executor()
            .snapshot(&blob)
            .await
            .map_err(|e| StorageIOError::read_state_machine(&io_other(e)))?;
        let data = std::fs::read(&blob)
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: snapshot_id.clone(),
        };
        let record = SnapshotRecord {
            meta: meta.clone(),
            blob,
        };
        let record_bytes = encode(&record).map_err(|e| {
            StorageIOError::read_state_machine(&io_other(e))
        })?;
        atomic_write(&self.store.dir.join("snapshots/latest"), &record_bytes)
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        *self.store.current_snapshot.write() = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });
        info!(snapshot = %snapshot_id, "consensus: built snapshot");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftLogReader<TypeConfig> for Arc<ReplicaStore> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<ReplicaId>> {
        Ok(self.entries_in(range))
    }
}

// The v2 storage traits are sealed around the adaptor; the combined v1 trait
// is the supported integration surface for external stores.
#[allow(deprecated)]
impl RaftStorage<TypeConfig> for Arc<ReplicaStore> {
    type LogReader = ReplicaLogReader;
    type SnapshotBuilder = ReplicaSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<ReplicaId>) -> Result<(), StorageError<ReplicaId>> {
        *self.vote.write() = Some(vote.clone());
        self.persist_vote()
            .map_err(|e| StorageIOError::write_vote(&e).into())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<ReplicaId>>, StorageError<ReplicaId>> {
        Ok(self.vote.read().clone())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<ReplicaId>>,
    ) -> Result<(), StorageError<ReplicaId>> {
        self.meta.write().committed = committed;
        self.persist_meta()
            .map_err(|e| StorageIOError::write(&e).into())
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<ReplicaId>>, StorageError<ReplicaId>> {
        Ok(self.meta.read().committed)
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<ReplicaId>> {
        let log = self.log.read();
        let last_log_id = log.iter().next_back().map(|(_, e)| e.log_id);
        let last_purged = self.meta.read().last_purged;
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last_log_id.or(last_purged),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        ReplicaLogReader {
            store: Arc::clone(self),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<ReplicaId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        {
            let mut log = self.log.write();
            for entry in entries {
                let payload = encode(&entry.payload)
                    .map_err(|e| StorageIOError::write_logs(&io_other(e)))?;
                log.insert(
                    entry.log_id.index,
                    LogEntryData {
                        log_id: entry.log_id,
                        payload,
                    },
                );
            }
        }
        self.persist_log()
            .map_err(|e| StorageIOError::write_logs(&e).into())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<ReplicaId>,
    ) -> Result<(), StorageError<ReplicaId>> {
        {
            let mut log = self.log.write();
            let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
        }
        self.persist_log()
            .map_err(|e| StorageIOError::write_logs(&e).into())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<ReplicaId>,
    ) -> Result<(), StorageError<ReplicaId>> {
        {
            let mut log = self.log.write();
            let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
            self.meta.write().last_purged = Some(log_id);
        }
        self.persist_log()
            .map_err(|e| StorageIOError::write_logs(&io_other(e)))?;
        self.persist_meta()
            .map_err(|e| StorageIOError::write(&e).into())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<ReplicaId>>,
            StoredMembership<ReplicaId, ReplicaNode>,
        ),
        StorageError<ReplicaId>,
    > {
        let meta = self.meta.read();
        Ok((meta.last_applied, meta.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<Vec<u8>>, StorageError<ReplicaId>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            self.meta.write().last_applied = Some(entry.log_id);
            match &entry.payload {
                EntryPayload::Blank => results.push(Vec::new()),
                EntryPayload::Membership(membership) => {
                    self.meta.write().last_membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    results.push(Vec::new());
                }
                EntryPayload::Normal(bytes) => {
                    // Decode the wire request and run the handler in log
                    // order. Handler failures are part of the response, not
                    // a storage error: every replica sees the same outcome.
                    let response = match wire::decode(bytes) {
                        Ok(req) => match self.runtime.process_direct(req).await {
                            Ok(resp) => wire::encode(&resp)
                                .map(|b| b.to_vec())
                                .unwrap_or_default(),
                            Err(e) => {
                                warn!(
                                    "consensus: apply failed at {}: {e}",
                                    entry.log_id
                                );
                                Vec::new()
                            }
                        },
                        Err(e) => {
                            warn!(
                                "consensus: undecodable entry at {}: {e}",
                                entry.log_id
                            );
                            Vec::new()
                        }
                    };
                    results.push(response);
                }
            }
        }
        self.persist_meta()
            .map_err(|e| StorageIOError::write(&e))?;
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        ReplicaSnapshotBuilder {
            store: Arc::clone(self),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<ReplicaId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<ReplicaId, ReplicaNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<ReplicaId>> {
        let data = snapshot.into_inner();
        let blob = self.snapshot_blob_path(&meta.snapshot_id);
        std::fs::write(&blob, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        self.runtime
            .executor()
            .restore(&blob)
            .await
            .map_err(|e| {
                StorageIOError::write_snapshot(Some(meta.signature()), &io_other(e))
            })?;

        {
            let mut store_meta = self.meta.write();
            store_meta.last_applied = meta.last_log_id;
            store_meta.last_membership = meta.last_membership.clone();
        }
        let record = SnapshotRecord {
            meta: meta.clone(),
            blob,
        };
        let record_bytes = encode(&record)
            .map_err(|e| StorageIOError::write(&io_other(e)))?;
        atomic_write(&self.dir.join("snapshots/latest"), &record_bytes)
            .map_err(|e| StorageIOError::write(&e))?;
        *self.current_snapshot.write() = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });

        // Drop the log the snapshot covers.
        if let Some(last_log_id) = meta.last_log_id {
            let mut log = self.log.write();
            let keys: Vec<u64> = log.range(..=last_log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
            self.meta.write().last_purged = Some(last_log_id);
        }
        self.persist_log()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        self.persist_meta()
            .map_err(|e| StorageIOError::write(&e).into())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<ReplicaId>> {
        Ok(self.current_snapshot.read().as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use flow_executor::testing::CounterExecutor;
    use flow_repr::{DataRequest, DocBatch, Document};

    use super::*;

    fn runtime() -> Arc<WorkerRuntime> {
        Arc::new(WorkerRuntime::new("counter0", Arc::new(CounterExecutor::new())))
    }

    fn write_entry(index: u64) -> Entry<TypeConfig> {
        let req = DataRequest::new("/index", DocBatch(vec![Document::with_id("d")]));
        let bytes = wire::encode(&req).unwrap().to_vec();
        Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(bytes),
        }
    }

    #[tokio::test]
    async fn vote_and_log_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = ReplicaStore::open(dir.path(), runtime()).await.unwrap();
            let vote = Vote::new(3, 1);
            store.save_vote(&vote).await.unwrap();
            store.append_to_log(vec![write_entry(1), write_entry(2)]).await.unwrap();
        }
        let mut store = ReplicaStore::open(dir.path(), runtime()).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(Vote::new(3, 1)));
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 2);
        let entries = store.entries_in(1..=2);
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn apply_invokes_the_handler_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let mut store = ReplicaStore::open(dir.path(), Arc::clone(&rt)).await.unwrap();
        store
            .apply_to_state_machine(&[write_entry(1), write_entry(2), write_entry(3)])
            .await
            .unwrap();
        // Three single-document writes applied.
        let resp = rt
            .process(DataRequest::new("/count", DocBatch::empty()))
            .await
            .unwrap();
        let results = resp.results().unwrap();
        match &results["counter0"] {
            flow_repr::Value::Map(map) => {
                assert_eq!(map.get("count"), Some(&flow_repr::Value::Int(3)))
            }
            other => panic!("unexpected {other:?}"),
        }
        let (applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 3);
    }

    #[tokio::test]
    async fn snapshot_restores_executor_state_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let rt = runtime();
            let mut store = ReplicaStore::open(dir.path(), Arc::clone(&rt)).await.unwrap();
            store
                .apply_to_state_machine(&[write_entry(1), write_entry(2)])
                .await
                .unwrap();
            let mut builder = store.get_snapshot_builder().await;
            builder.build_snapshot().await.unwrap();
        }
        // A fresh runtime starts at zero; opening the store restores the
        // snapshot into it.
        let rt = runtime();
        let _store = ReplicaStore::open(dir.path(), Arc::clone(&rt)).await.unwrap();
        let resp = rt
            .process(DataRequest::new("/count", DocBatch::empty()))
            .await
            .unwrap();
        match &resp.results().unwrap()["counter0"] {
            flow_repr::Value::Map(map) => {
                assert_eq!(map.get("count"), Some(&flow_repr::Value::Int(2)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
