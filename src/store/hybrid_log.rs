use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atomicwrites::{AtomicFile, OverwriteBehavior};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{CheckpointConfig, LogConfig};
use crate::error::StoreError;
use crate::store::functions::Functions;
use crate::store::index::HashIndex;
use crate::store::paged_log::HybridLog;
use crate::store::record::{decode_record, encode_record, Record, RecordHeader};
use crate::store::{CheckpointToken, KvSession, KvStore, LogWatermarks, Status};
use crate::value::{FromValue, Key, Tagged, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Read,
    Rmw,
}

/// An operation the store could not finish synchronously.
struct PendingOp<K, I, C> {
    kind: PendingKind,
    key: K,
    input: I,
    context: C,
    serial_no: u64,
}

#[derive(Debug, Default)]
struct CheckpointState {
    version: u64,
    in_progress: Option<CheckpointToken>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMetadata {
    token: CheckpointToken,
    watermarks: LogWatermarks,
    entry_count: u64,
}

type PendingQueue<K, V, F> =
    VecDeque<PendingOp<K, <F as Functions<K, V>>::Input, <F as Functions<K, V>>::Context>>;

struct Shared<K, V, F: Functions<K, V>> {
    index: HashIndex<K>,
    log: RwLock<HybridLog>,
    functions: F,
    checkpoint_config: Option<CheckpointConfig>,
    checkpoint: Mutex<CheckpointState>,
    /// Pending operations of disposed sessions, adopted by the next
    /// `complete_pending` call of any session
    orphaned: Mutex<PendingQueue<K, V, F>>,
    next_session_id: AtomicU64,
    active_sessions: AtomicU64,
    _value: PhantomData<fn() -> V>,
}

/// Reference hybrid-log store: a hash index over a page-structured log whose
/// tail is mutable in memory and whose oldest pages live on a device.
///
/// Cloning is cheap and yields another handle to the same store.
pub struct HybridLogStore<K, V, F: Functions<K, V>> {
    shared: Arc<Shared<K, V, F>>,
}

impl<K, V, F: Functions<K, V>> Clone for HybridLogStore<K, V, F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: Key, V: Value, F: Functions<K, V>> HybridLogStore<K, V, F> {
    pub fn new(
        capacity: usize,
        functions: F,
        log_config: LogConfig,
        checkpoint_config: Option<CheckpointConfig>,
    ) -> Result<Self, StoreError> {
        let log = HybridLog::new(&log_config)?;
        log::debug!(
            "hybrid log store with {} index buckets, {} byte pages, {} in-memory pages",
            capacity.max(1).next_power_of_two(),
            log_config.page_size(),
            log_config.memory_pages(),
        );
        Ok(Self {
            shared: Arc::new(Shared {
                index: HashIndex::new(capacity),
                log: RwLock::new(log),
                functions,
                checkpoint_config,
                checkpoint: Mutex::new(CheckpointState::default()),
                orphaned: Mutex::new(VecDeque::new()),
                next_session_id: AtomicU64::new(1),
                active_sessions: AtomicU64::new(0),
                _value: PhantomData,
            }),
        })
    }

    pub fn functions(&self) -> &F {
        &self.shared.functions
    }

    /// Sessions opened and not yet disposed
    pub fn active_sessions(&self) -> u64 {
        self.shared.active_sessions.load(Ordering::Relaxed)
    }
}

/// Fails if the record at `address` was written for another key
fn owned_by<K: Key, V>(record: Record<K, V>, key: &K, address: u64) -> Result<Record<K, V>, StoreError> {
    if record.key == *key {
        Ok(record)
    } else {
        Err(StoreError::KeyMismatch { address })
    }
}

fn read_in_memory<K: Key, V: Value>(
    log: &HybridLog,
    key: &K,
    address: u64,
) -> Result<Option<Record<K, V>>, StoreError> {
    let Some(header) = log.read_memory(address, RecordHeader::SIZE) else {
        return Ok(None);
    };
    let header = RecordHeader::decode(header)?;
    match log.read_memory(address, header.record_len()) {
        Some(bytes) => owned_by(decode_record(bytes)?, key, address).map(Some),
        None => Ok(None),
    }
}

fn read_from_device<K: Key, V: Value>(
    log: &HybridLog,
    key: &K,
    address: u64,
) -> Result<Option<Record<K, V>>, StoreError> {
    let Some(header) = log.read_device(address, RecordHeader::SIZE)? else {
        return Ok(None);
    };
    let header = RecordHeader::decode(&header)?;
    match log.read_device(address, header.record_len())? {
        Some(bytes) if bytes.len() == header.record_len() => {
            owned_by(decode_record(&bytes)?, key, address).map(Some)
        }
        _ => Ok(None),
    }
}

/// True if the record at `address` has exactly the encoded length `len`
fn same_layout(log: &HybridLog, address: u64, len: usize) -> Result<bool, StoreError> {
    match log.read_memory(address, RecordHeader::SIZE) {
        Some(header) => Ok(RecordHeader::decode(header)?.record_len() == len),
        None => Ok(false),
    }
}

fn write_checkpoint_metadata(dir: &Path, metadata: &CheckpointMetadata) -> Result<(), StoreError> {
    let path = dir.join(format!("checkpoint_{}.json", metadata.token.version));
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|file| {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, metadata)?;
            writer.flush().map_err(serde_json::Error::io)
        })
        .map_err(|err| match err {
            atomicwrites::Error::Internal(err) => StoreError::Device(err),
            atomicwrites::Error::User(err) => StoreError::Json(err),
        })
}

impl<K: Key, V: Value, F: Functions<K, V>> Shared<K, V, F> {
    fn upsert(&self, key: &K, value: &V) -> Result<Status, StoreError> {
        let bytes = encode_record(key, Some(value), false)?;
        let mut shard = self.index.shard(key).write();
        let mut log = self.log.write();
        if let Some(&address) = shard.get(key) {
            if address >= log.read_only() && same_layout(&log, address, bytes.len())? {
                log.write(address, &bytes);
                return Ok(Status::Ok);
            }
        }
        let address = log.append(&bytes)?;
        shard.insert(key.clone(), address);
        Ok(Status::Ok)
    }

    fn delete(&self, key: &K) -> Result<Status, StoreError> {
        let mut shard = self.index.shard(key).write();
        let mut log = self.log.write();
        if let Some(&address) = shard.get(key) {
            if address >= log.read_only() {
                if let Some(header) = log.read_memory(address, RecordHeader::SIZE) {
                    let mut header = RecordHeader::decode(header)?;
                    header.tombstone = true;
                    log.write(address, &header.encode()?);
                    return Ok(Status::Ok);
                }
            }
        }
        let bytes = encode_record::<K, V>(key, None, true)?;
        let address = log.append(&bytes)?;
        shard.insert(key.clone(), address);
        Ok(Status::Ok)
    }

    /// Ok with `output` filled for in-memory records, Pending below `head`
    fn read(&self, key: &K, input: &F::Input, output: &mut F::Output) -> Result<Status, StoreError> {
        let shard = self.index.shard(key).read();
        let Some(&address) = shard.get(key) else {
            return Ok(Status::NotFound);
        };
        let log = self.log.read();
        if address < log.head() {
            return Ok(Status::Pending);
        }
        match read_in_memory::<K, V>(&log, key, address)? {
            Some(Record {
                tombstone: false,
                value: Some(value),
                ..
            }) => {
                self.functions.single_reader(key, input, &value, output);
                Ok(Status::Ok)
            }
            _ => Ok(Status::NotFound),
        }
    }

    /// Finish a read that was below `head` when issued
    fn read_pending(
        &self,
        key: &K,
        input: &F::Input,
        output: &mut F::Output,
    ) -> Result<Status, StoreError> {
        let shard = self.index.shard(key).read();
        let Some(&address) = shard.get(key) else {
            return Ok(Status::NotFound);
        };
        let log = self.log.read();
        let record = if address >= log.head() {
            read_in_memory::<K, V>(&log, key, address)?
        } else {
            match read_from_device::<K, V>(&log, key, address)? {
                Some(record) => Some(record),
                None => return Ok(Status::Error),
            }
        };
        match record {
            Some(Record {
                tombstone: false,
                value: Some(value),
                ..
            }) => {
                self.functions.single_reader(key, input, &value, output);
                Ok(Status::Ok)
            }
            _ => Ok(Status::NotFound),
        }
    }

    /// RMW against the current record of `key`.
    ///
    /// Records in the fuzzy region return Pending. Records below `head`
    /// return Pending unless `fetch` allows a device read.
    fn rmw(&self, key: &K, input: &F::Input, fetch: bool) -> Result<Status, StoreError> {
        let mut shard = self.index.shard(key).write();
        let mut log = self.log.write();

        let current = match shard.get(key) {
            None => None,
            Some(&address) if address >= log.head() => {
                read_in_memory::<K, V>(&log, key, address)?.map(|record| (address, record))
            }
            Some(&address) if fetch => match read_from_device::<K, V>(&log, key, address)? {
                Some(record) => Some((address, record)),
                None => return Ok(Status::Error),
            },
            Some(_) => return Ok(Status::Pending),
        };

        let (address, old) = match current {
            Some((
                address,
                Record {
                    tombstone: false,
                    value: Some(old),
                    ..
                },
            )) => (address, old),
            _ => {
                let value = self.functions.initial_updater(key, input);
                let address = log.append(&encode_record(key, Some(&value), false)?)?;
                shard.insert(key.clone(), address);
                return Ok(Status::NotFound);
            }
        };

        if address >= log.read_only() {
            let mut value = old.clone();
            if self.functions.in_place_updater(key, input, &mut value) {
                let bytes = encode_record(key, Some(&value), false)?;
                if same_layout(&log, address, bytes.len())? {
                    log.write(address, &bytes);
                } else {
                    let address = log.append(&bytes)?;
                    shard.insert(key.clone(), address);
                }
                return Ok(Status::Ok);
            }
        } else if address >= log.safe_read_only() {
            return Ok(Status::Pending);
        }

        let value = self.functions.copy_updater(key, input, &old);
        let address = log.append(&encode_record(key, Some(&value), false)?)?;
        shard.insert(key.clone(), address);
        Ok(Status::Ok)
    }

    /// Try to finish `op`. Returns it back if it is still pending.
    fn complete(
        &self,
        op: PendingOp<K, F::Input, F::Context>,
    ) -> Option<PendingOp<K, F::Input, F::Context>> {
        match op.kind {
            PendingKind::Read => {
                let mut output = F::Output::default();
                let status = self
                    .read_pending(&op.key, &op.input, &mut output)
                    .unwrap_or_else(|err| {
                        log::warn!("pending read {} of {:?} failed: {err}", op.serial_no, op.key);
                        Status::Error
                    });
                self.functions
                    .read_completion_callback(&op.key, &op.input, &output, op.context, status);
                None
            }
            PendingKind::Rmw => {
                let status = self.rmw(&op.key, &op.input, true).unwrap_or_else(|err| {
                    log::warn!("pending rmw {} of {:?} failed: {err}", op.serial_no, op.key);
                    Status::Error
                });
                if status == Status::Pending {
                    return Some(op);
                }
                self.functions
                    .rmw_completion_callback(&op.key, &op.input, op.context, status);
                None
            }
        }
    }
}

impl<K, V, F: Functions<K, V>> Drop for Shared<K, V, F> {
    fn drop(&mut self) {
        let orphaned = self.orphaned.get_mut().len();
        if orphaned > 0 {
            log::warn!("store dropped with {orphaned} uncompleted pending operations");
        }
    }
}

impl<K, V, F> KvStore for HybridLogStore<K, V, F>
where
    K: Key,
    V: Value + Tagged,
    F: Functions<K, V>,
    F::Input: FromValue<V>,
    F::Output: Tagged,
    F::Context: Default,
{
    type Session = HybridLogSession<K, V, F>;

    fn new_session(&self) -> Self::Session {
        let id = self.shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.shared.active_sessions.fetch_add(1, Ordering::Relaxed);
        HybridLogSession {
            shared: self.shared.clone(),
            id,
            pending: VecDeque::new(),
            disposed: false,
            _not_send: PhantomData,
        }
    }

    fn entry_count(&self) -> u64 {
        self.shared.index.len()
    }

    fn index_size(&self) -> u64 {
        self.shared.index.size()
    }

    fn log(&self) -> LogWatermarks {
        self.shared.log.read().watermarks()
    }

    /// Relocate live records below `until` to the tail, drop tombstones and
    /// records the device no longer holds, then move `begin` to `until`.
    fn compact(&self, until: u64) -> Result<u64, StoreError> {
        let shared = &self.shared;
        {
            let log = shared.log.read();
            if until < log.begin() || until > log.safe_read_only() {
                return Err(StoreError::UnsafeCompaction {
                    until,
                    begin: log.begin(),
                    safe_read_only: log.safe_read_only(),
                });
            }
        }

        // Every live record is copied out before the first append: appends
        // may evict pages still holding records of other shards.
        let mut shards: Vec<_> = shared.index.shards().iter().map(|shard| shard.write()).collect();
        let mut log = shared.log.write();
        let mut live = Vec::new();
        let mut dropped = 0u64;
        for (idx, shard) in shards.iter_mut().enumerate() {
            let stale: Vec<(K, u64)> = shard
                .iter()
                .filter(|(_, address)| **address < until)
                .map(|(key, &address)| (key.clone(), address))
                .collect();
            for (key, address) in stale {
                let record = if address >= log.head() {
                    read_in_memory::<K, V>(&log, &key, address)?
                } else {
                    read_from_device::<K, V>(&log, &key, address)?
                };
                match record {
                    Some(Record {
                        tombstone: false,
                        value: Some(value),
                        ..
                    }) => live.push((idx, key, value)),
                    _ => {
                        shard.remove(&key);
                        dropped += 1;
                    }
                }
            }
        }

        let relocated = live.len();
        for (idx, key, value) in live {
            let address = log.append(&encode_record(&key, Some(&value), false)?)?;
            shards[idx].insert(key, address);
        }
        drop(shards);

        log.truncate(until)?;
        log::info!("compacted log until {until}: {relocated} records relocated, {dropped} dropped");
        Ok(log.begin())
    }

    fn take_full_checkpoint(&self) -> Result<CheckpointToken, StoreError> {
        let mut state = self.shared.checkpoint.lock();
        if let Some(token) = state.in_progress {
            return Err(StoreError::CheckpointInProgress {
                version: token.version,
            });
        }
        let until = {
            let mut log = self.shared.log.write();
            log.fold_over();
            log.tail()
        };
        state.version += 1;
        let token = CheckpointToken {
            version: state.version,
            until,
        };
        state.in_progress = Some(token);
        log::info!("checkpoint {} started, folding the log over at {until}", token.version);
        Ok(token)
    }

    /// Checkpoints complete synchronously, so a running checkpoint is always
    /// returned regardless of `wait`.
    fn complete_checkpoint(&self, _wait: bool) -> Result<Option<CheckpointToken>, StoreError> {
        let mut state = self.shared.checkpoint.lock();
        let token = state.in_progress.ok_or(StoreError::NoCheckpoint)?;

        let watermarks = {
            let log = self.shared.log.read();
            log.flush()?;
            log.watermarks()
        };
        if let Some(dir) = self
            .shared
            .checkpoint_config
            .as_ref()
            .and_then(|config| config.dir.as_deref())
        {
            let metadata = CheckpointMetadata {
                token,
                watermarks,
                entry_count: self.entry_count(),
            };
            write_checkpoint_metadata(dir, &metadata)?;
        }

        state.in_progress = None;
        self.shared.functions.checkpoint_completion_callback(&token);
        log::info!("checkpoint {} completed", token.version);
        Ok(Some(token))
    }
}

/// Session over a [`HybridLogStore`]. Not `Send`: a session stays on the
/// thread that opened it.
pub struct HybridLogSession<K, V, F: Functions<K, V>> {
    shared: Arc<Shared<K, V, F>>,
    id: u64,
    pending: PendingQueue<K, V, F>,
    disposed: bool,
    _not_send: PhantomData<*const ()>,
}

impl<K: Key, V: Value, F: Functions<K, V>> HybridLogSession<K, V, F> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operations this session still has to complete
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn failed(&self, operation: &str, key: &K, err: StoreError) -> Status {
        log::warn!("session {}: {operation} of {key:?} failed: {err}", self.id);
        Status::Error
    }
}

impl<K, V, F: Functions<K, V>> HybridLogSession<K, V, F> {
    fn release(&mut self, explicit: bool) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if !self.pending.is_empty() {
            if explicit {
                log::debug!(
                    "session {} hands {} pending operations to the store",
                    self.id,
                    self.pending.len()
                );
            } else {
                log::warn!(
                    "session {} dropped without dispose with {} pending operations",
                    self.id,
                    self.pending.len()
                );
            }
            self.shared.orphaned.lock().extend(self.pending.drain(..));
        }
        self.shared.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<K, V, F> KvSession for HybridLogSession<K, V, F>
where
    K: Key,
    V: Value + Tagged,
    F: Functions<K, V>,
    F::Input: FromValue<V>,
    F::Output: Tagged,
    F::Context: Default,
{
    type Key = K;
    type Value = V;
    type Input = F::Input;
    type Output = F::Output;
    type Context = F::Context;

    fn upsert(&mut self, key: &K, value: &V, _context: F::Context, _serial_no: u64) -> Status {
        self.shared
            .upsert(key, value)
            .unwrap_or_else(|err| self.failed("upsert", key, err))
    }

    fn read(
        &mut self,
        key: &K,
        input: &F::Input,
        output: &mut F::Output,
        context: F::Context,
        serial_no: u64,
    ) -> Status {
        match self.shared.read(key, input, output) {
            Ok(Status::Pending) => {
                self.pending.push_back(PendingOp {
                    kind: PendingKind::Read,
                    key: key.clone(),
                    input: input.clone(),
                    context,
                    serial_no,
                });
                Status::Pending
            }
            Ok(status) => status,
            Err(err) => self.failed("read", key, err),
        }
    }

    fn delete(&mut self, key: &K, _context: F::Context, _serial_no: u64) -> Status {
        self.shared
            .delete(key)
            .unwrap_or_else(|err| self.failed("delete", key, err))
    }

    fn rmw(&mut self, key: &K, input: &F::Input, context: F::Context, serial_no: u64) -> Status {
        match self.shared.rmw(key, input, false) {
            Ok(Status::Pending) => {
                self.pending.push_back(PendingOp {
                    kind: PendingKind::Rmw,
                    key: key.clone(),
                    input: input.clone(),
                    context,
                    serial_no,
                });
                Status::Pending
            }
            Ok(status) => status,
            Err(err) => self.failed("rmw", key, err),
        }
    }

    fn refresh(&mut self) {
        self.shared.log.write().refresh();
    }

    fn complete_pending(&mut self, wait: bool) -> bool {
        self.pending.extend(self.shared.orphaned.lock().drain(..));
        loop {
            self.refresh();
            for _ in 0..self.pending.len() {
                let Some(op) = self.pending.pop_front() else {
                    break;
                };
                if let Some(op) = self.shared.complete(op) {
                    self.pending.push_back(op);
                }
            }
            if !wait || self.pending.is_empty() {
                break;
            }
            std::thread::yield_now();
        }
        self.pending.is_empty()
    }

    fn dispose(mut self) {
        self.release(true);
    }
}

impl<K, V, F: Functions<K, V>> Drop for HybridLogSession<K, V, F> {
    fn drop(&mut self) {
        self.release(false);
    }
}
