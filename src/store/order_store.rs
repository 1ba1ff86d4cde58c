//! The durable order store.
//!
//! Orders are indexed twice: by broker order id, and by logical serial,
//! where the serial index points at the newest order of a replace chain.
//! Reads go straight to the concurrent maps; structural mutations take a
//! single store mutex so that a snapshot never observes a half-applied
//! change.
//!
//! # Persistence
//!
//! The store file is a sequence of frames, each holding a full image of the
//! order table and both sequence counters. Recovery loads the newest frame
//! that validates. A torn trailing frame is truncated away on open.

use super::config::StoreConfig;
use super::error::StoreError;
use super::frame::{self, FrameDefect, FrameScan};
use super::order::{OrderRecord, OrderRef, OrderState};
use super::snapshot::{RestoredImage, SnapshotSync, SnapshotWriter, StoreImage};
use crate::utils::current_time_millis;
use dashmap::DashMap;
use memmap2::Mmap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, trace, warn};

enum WriterState {
    Idle,
    Open(SnapshotWriter),
    Closed,
}

/// Crash-recoverable table of broker orders.
///
/// # Examples
///
/// ```no_run
/// use order_runtime::store::{DurableOrderStore, OrderRecord, Side, StoreConfig};
///
/// let store = DurableOrderStore::new(StoreConfig::new("/var/lib/engine", "orders"));
/// store.open_file()?;
/// store.assign_by_id(OrderRecord::new("B-1", 1, "ES", Side::Buy, 4_500, 2).into_ref(), 10, 3)?;
/// store.force_snapshot()?;
/// store.wait_for_snapshot()?;
/// # Ok::<(), order_runtime::store::StoreError>(())
/// ```
pub struct DurableOrderStore {
    config: StoreConfig,
    by_id: DashMap<String, OrderRef>,
    by_serial: DashMap<i64, OrderRef>,
    mutation: Mutex<()>,
    remote_sequence: AtomicU64,
    local_sequence: AtomicU64,
    dirty: AtomicBool,
    frame_sequence: AtomicU64,
    last_snapshot_at: AtomicU64,
    writer: Mutex<WriterState>,
    sync: Arc<SnapshotSync>,
}

impl DurableOrderStore {
    /// Creates an empty store. Nothing touches the disk until
    /// [`open_file`](Self::open_file) or [`recover`](Self::recover).
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            by_id: DashMap::new(),
            by_serial: DashMap::new(),
            mutation: Mutex::new(()),
            remote_sequence: AtomicU64::new(0),
            local_sequence: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            frame_sequence: AtomicU64::new(0),
            last_snapshot_at: AtomicU64::new(0),
            writer: Mutex::new(WriterState::Idle),
            sync: Arc::new(SnapshotSync::default()),
        }
    }

    /// The store's configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // The guarded unit carries no data, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Index mutations ────────────────────────────────────────────────────

    /// Inserts or replaces an order.
    ///
    /// If another order with the same logical serial but a different broker
    /// id is indexed, the newest order of that chain gets `order` as its
    /// replacement, and serial lookups resolve to `order` from now on. The
    /// superseded order stays reachable by its own id.
    ///
    /// Re-setting an id with a new record moves every replace link that
    /// pointed at the old record onto the new one.
    ///
    /// # Errors
    ///
    /// [`StoreError::ReplaceCycle`] if `order` already precedes the indexed
    /// chain.
    pub fn set_order(&self, order: OrderRef) -> Result<(), StoreError> {
        {
            let _guard = self.lock();
            self.index(order)?;
        }
        self.after_mutation();
        Ok(())
    }

    /// [`set_order`](Self::set_order) plus
    /// [`update_sequence`](Self::update_sequence), applied atomically with
    /// respect to snapshots.
    ///
    /// # Errors
    ///
    /// See [`set_order`](Self::set_order).
    pub fn assign_by_id(
        &self,
        order: OrderRef,
        remote_sequence: u64,
        local_sequence: u64,
    ) -> Result<(), StoreError> {
        {
            let _guard = self.lock();
            self.index(order)?;
            self.advance_sequences(remote_sequence, local_sequence);
        }
        self.after_mutation();
        Ok(())
    }

    fn index(&self, order: OrderRef) -> Result<(), StoreError> {
        let serial = order.logical_serial();
        let superseded = self
            .by_id
            .get(order.broker_order_id())
            .map(|e| Arc::clone(e.value()))
            .filter(|previous| !Arc::ptr_eq(previous, &order));
        if let Some(previous) = &superseded {
            self.relink(previous, &order)?;
        }

        let predecessor = self.by_serial.get(&serial).map(|e| e.value().latest());
        if let Some(tail) = predecessor
            && !Arc::ptr_eq(&tail, &order.latest())
            && tail.broker_order_id() != order.broker_order_id()
        {
            tail.set_replace(&order)?;
            trace!(
                serial,
                from = tail.broker_order_id(),
                to = order.broker_order_id(),
                "order replaced"
            );
        }

        if let Some(previous) = &superseded
            && previous.logical_serial() != serial
        {
            self.by_serial
                .remove_if(&previous.logical_serial(), |_, indexed| Arc::ptr_eq(indexed, previous));
        }
        self.by_id
            .insert(order.broker_order_id().to_string(), Arc::clone(&order));
        if order.replace().is_none() || !self.by_serial.contains_key(&serial) {
            self.by_serial.insert(serial, order);
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Moves every replace link that targets `previous` onto `order`, which
    /// takes over its broker id. `order` inherits the successor of
    /// `previous` unless it already has one.
    fn relink(&self, previous: &OrderRef, order: &OrderRef) -> Result<(), StoreError> {
        if order.replace().is_none()
            && let Some(next) = previous.replace()
        {
            order.set_replace(&next)?;
        }

        let serial = previous.logical_serial();
        let heads: Vec<OrderRef> = self
            .by_id
            .iter()
            .filter(|e| e.value().logical_serial() == serial)
            .map(|e| Arc::clone(e.value()))
            .collect();
        for head in heads {
            let mut cursor = Some(head);
            while let Some(current) = cursor {
                let next = current.replace();
                if next.as_ref().is_some_and(|n| Arc::ptr_eq(n, previous)) {
                    current.set_replace(order)?;
                    trace!(
                        serial,
                        from = current.broker_order_id(),
                        to = order.broker_order_id(),
                        "replace link moved to re-set order"
                    );
                    break;
                }
                cursor = next;
            }
        }
        Ok(())
    }

    /// Removes an order from both indices.
    ///
    /// Replace links pointing at the removed order are left intact.
    pub fn remove_order(&self, broker_order_id: &str) -> Option<OrderRef> {
        let removed = {
            let _guard = self.lock();
            self.unindex(broker_order_id)
        };
        if removed.is_some() {
            self.after_mutation();
        }
        removed
    }

    fn unindex(&self, broker_order_id: &str) -> Option<OrderRef> {
        let (_, order) = self.by_id.remove(broker_order_id)?;
        self.by_serial
            .remove_if(&order.logical_serial(), |_, indexed| Arc::ptr_eq(indexed, &order));
        self.dirty.store(true, Ordering::Release);
        Some(order)
    }

    /// Drops the unacknowledged orders of `symbol` and reverts outstanding
    /// replace/cancel requests to [`OrderState::Active`].
    ///
    /// Returns the number of orders removed or reverted.
    pub fn clear_pending_orders(&self, symbol: &str) -> usize {
        let affected = {
            let _guard = self.lock();
            let pending: Vec<OrderRef> = self
                .by_id
                .iter()
                .filter(|e| e.value().symbol() == symbol && e.value().state().is_pending())
                .map(|e| Arc::clone(e.value()))
                .collect();

            for order in &pending {
                match order.state() {
                    OrderState::Pending => {
                        self.unindex(order.broker_order_id());
                    }
                    _ => order.set_state(OrderState::Active),
                }
            }
            if !pending.is_empty() {
                self.dirty.store(true, Ordering::Release);
            }
            pending.len()
        };
        if affected > 0 {
            debug!(symbol, affected, "pending orders cleared");
            self.after_mutation();
        }
        affected
    }

    /// Removes every order. Sequence counters are kept.
    pub fn clear(&self) {
        {
            let _guard = self.lock();
            self.by_id.clear();
            self.by_serial.clear();
            self.dirty.store(true, Ordering::Release);
        }
        self.after_mutation();
    }

    // ─── Lookups ────────────────────────────────────────────────────────────

    /// Looks up an order by broker id.
    ///
    /// # Errors
    ///
    /// [`StoreError::OrderNotFound`] if no order has that id.
    pub fn get_order_by_id(&self, broker_order_id: &str) -> Result<OrderRef, StoreError> {
        self.try_get_order_by_id(broker_order_id)
            .ok_or_else(|| StoreError::OrderNotFound {
                broker_order_id: broker_order_id.to_string(),
            })
    }

    #[must_use]
    pub fn try_get_order_by_id(&self, broker_order_id: &str) -> Option<OrderRef> {
        self.by_id.get(broker_order_id).map(|e| Arc::clone(e.value()))
    }

    /// Newest order of the replace chain for `logical_serial`.
    #[must_use]
    pub fn try_get_order_by_serial(&self, logical_serial: i64) -> Option<OrderRef> {
        self.by_serial.get(&logical_serial).map(|e| e.value().latest())
    }

    /// Newest order of the replace chain for `logical_serial`.
    ///
    /// # Errors
    ///
    /// [`StoreError::SerialNotFound`] if no order has that serial.
    pub fn get_order_by_serial(&self, logical_serial: i64) -> Result<OrderRef, StoreError> {
        self.try_get_order_by_serial(logical_serial)
            .ok_or(StoreError::SerialNotFound { logical_serial })
    }

    /// Orders matching `predicate`, ordered by logical serial then broker id.
    pub fn get_orders<F>(&self, predicate: F) -> Vec<OrderRef>
    where
        F: Fn(&OrderRecord) -> bool,
    {
        let mut orders: Vec<OrderRef> = self
            .by_id
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| Arc::clone(e.value()))
            .collect();
        orders.sort_by(|a, b| {
            (a.logical_serial(), a.broker_order_id()).cmp(&(b.logical_serial(), b.broker_order_id()))
        });
        orders
    }

    /// Orders of `symbol` that are working at the broker.
    pub fn get_active_orders(&self, symbol: &str) -> Vec<OrderRef> {
        self.get_orders(|o| o.symbol() == symbol && o.state().is_active())
    }

    /// Number of orders indexed by id.
    #[must_use]
    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    // ─── Sequences ──────────────────────────────────────────────────────────

    /// Raises the sequence counters; lower values are ignored.
    pub fn update_sequence(&self, remote_sequence: u64, local_sequence: u64) {
        {
            let _guard = self.lock();
            self.advance_sequences(remote_sequence, local_sequence);
        }
        self.after_mutation();
    }

    fn advance_sequences(&self, remote_sequence: u64, local_sequence: u64) {
        let remote = self.remote_sequence.fetch_max(remote_sequence, Ordering::AcqRel);
        let local = self.local_sequence.fetch_max(local_sequence, Ordering::AcqRel);
        if remote < remote_sequence || local < local_sequence {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Overwrites both sequence counters.
    pub fn set_sequences(&self, remote_sequence: u64, local_sequence: u64) {
        {
            let _guard = self.lock();
            self.remote_sequence.store(remote_sequence, Ordering::Release);
            self.local_sequence.store(local_sequence, Ordering::Release);
            self.dirty.store(true, Ordering::Release);
        }
        self.after_mutation();
    }

    #[must_use]
    pub fn remote_sequence(&self) -> u64 {
        self.remote_sequence.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn local_sequence(&self) -> u64 {
        self.local_sequence.load(Ordering::Acquire)
    }

    // ─── File lifecycle ─────────────────────────────────────────────────────

    /// Opens the store file, creating it and its directory if absent, and
    /// starts the snapshot writer. Does not load any orders.
    ///
    /// A torn trailing frame is truncated. Calling this on an open store is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Io`] if the directory or file cannot be opened.
    /// - [`StoreError::UnsupportedVersion`] if the file holds a frame from a
    ///   newer format.
    /// - [`StoreError::Closed`] after [`close`](Self::close).
    pub fn open_file(&self) -> Result<(), StoreError> {
        let mut writer = self.writer();
        match &*writer {
            WriterState::Open(_) => Ok(()),
            WriterState::Closed => Err(StoreError::Closed),
            WriterState::Idle => self.open_locked(&mut writer, false).map(|_| ()),
        }
    }

    /// Returns `true` once the writer is running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(&*self.writer(), WriterState::Open(_))
    }

    fn open_locked(
        &self,
        writer: &mut WriterState,
        restore: bool,
    ) -> Result<Option<(u64, RestoredImage)>, StoreError> {
        let dir = self.config.directory();
        fs::create_dir_all(dir).map_err(|e| StoreError::io(&e, dir))?;

        let path = self.config.file_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&e, &path))?;
        let file_len = file.metadata().map_err(|e| StoreError::io(&e, &path))?.len();

        let mut restored = None;
        let scan = match map_file(&file, file_len, &path)? {
            Some(mmap) => {
                let scan = frame::scan(&mmap);
                if restore {
                    restored = decode_latest(&mmap, &scan);
                }
                scan
            }
            None => FrameScan::default(),
        };

        match &scan.defect {
            Some(FrameDefect::UnsupportedVersion { offset, version }) => {
                error!(path = %path.display(), offset, version, "store file has an unsupported frame version");
                return Err(StoreError::UnsupportedVersion { version: *version });
            }
            Some(FrameDefect::Torn { offset, message }) => {
                let defect = StoreError::CorruptFrame {
                    offset: *offset,
                    message: message.clone(),
                };
                warn!(
                    path = %path.display(),
                    valid_len = scan.valid_len,
                    discarded = file_len - scan.valid_len as u64,
                    %defect,
                    "discarding torn trailing frame"
                );
                file.set_len(scan.valid_len as u64)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| StoreError::io(&e, &path))?;
            }
            None => {}
        }

        if let Some(last) = scan.last() {
            self.frame_sequence.fetch_max(last.sequence, Ordering::AcqRel);
        }
        drop(file);

        let handle = SnapshotWriter::spawn(&self.config, scan.valid_len as u64, Arc::clone(&self.sync))?;
        *writer = WriterState::Open(handle);
        info!(
            path = %path.display(),
            frames = scan.frames.len(),
            bytes = scan.valid_len,
            "store file opened"
        );
        Ok(restored)
    }

    /// Loads the newest valid frame into memory, opening the file first if
    /// needed. Any orders already in memory are replaced.
    ///
    /// Returns `false` if the file holds no restorable frame.
    ///
    /// # Errors
    ///
    /// As [`open_file`](Self::open_file); or the I/O error of a snapshot
    /// still in flight when the store was already open.
    pub fn recover(&self) -> Result<bool, StoreError> {
        let opened = {
            let mut writer = self.writer();
            match &*writer {
                WriterState::Closed => return Err(StoreError::Closed),
                WriterState::Idle => Some(self.open_locked(&mut writer, true)?),
                WriterState::Open(_) => None,
            }
        };
        let restored = match opened {
            Some(restored) => restored,
            None => self.reload()?,
        };

        let Some((sequence, image)) = restored else {
            info!(path = %self.config.file_path().display(), "no snapshot to recover");
            return Ok(false);
        };
        self.apply(sequence, image);
        Ok(true)
    }

    // Re-reads the file of an already open store.
    fn reload(&self) -> Result<Option<(u64, RestoredImage)>, StoreError> {
        self.sync.wait()?;
        let path = self.config.file_path();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| StoreError::io(&e, &path))?;
        let file_len = file.metadata().map_err(|e| StoreError::io(&e, &path))?.len();
        Ok(map_file(&file, file_len, &path)?.and_then(|mmap| {
            let scan = frame::scan(&mmap);
            decode_latest(&mmap, &scan)
        }))
    }

    fn apply(&self, sequence: u64, image: RestoredImage) {
        let _guard = self.lock();
        self.by_id.clear();
        self.by_serial.clear();
        for order in image.by_id {
            self.by_id
                .insert(order.broker_order_id().to_string(), order);
        }
        for (serial, order) in image.by_serial {
            self.by_serial.insert(serial, order);
        }
        self.remote_sequence
            .store(image.remote_sequence, Ordering::Release);
        self.local_sequence
            .store(image.local_sequence, Ordering::Release);
        self.frame_sequence.fetch_max(sequence, Ordering::AcqRel);
        self.dirty.store(false, Ordering::Release);
        info!(
            frame_sequence = sequence,
            orders = self.by_id.len(),
            remote_sequence = image.remote_sequence,
            local_sequence = image.local_sequence,
            "store recovered"
        );
    }

    /// Stops the writer after queued snapshots are written. Later
    /// persistence calls return [`StoreError::Closed`].
    pub fn close(&self) {
        let mut writer = self.writer();
        if let WriterState::Open(handle) = &mut *writer {
            handle.shutdown();
            info!(path = %self.config.file_path().display(), "store closed");
        }
        *writer = WriterState::Closed;
        self.sync.close();
    }

    // ─── Snapshots ──────────────────────────────────────────────────────────

    /// Schedules a snapshot unless one is in flight, the last one is younger
    /// than `snapshot_interval`, or nothing changed since.
    ///
    /// Returns whether a snapshot was scheduled.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotOpen`] before [`open_file`](Self::open_file),
    /// [`StoreError::Closed`] after [`close`](Self::close), or an encoding
    /// error.
    pub fn try_snapshot(&self) -> Result<bool, StoreError> {
        let writer = self.writer();
        let handle = open_writer(&writer)?;

        if self.sync.in_flight() {
            trace!("snapshot skipped: one in flight");
            return Ok(false);
        }
        let elapsed = current_time_millis().saturating_sub(self.last_snapshot_at.load(Ordering::Acquire));
        if u128::from(elapsed) < self.config.snapshot_interval.as_millis() {
            trace!(elapsed, "snapshot skipped: not due");
            return Ok(false);
        }
        if !self.has_changes() {
            trace!("snapshot skipped: no changes");
            return Ok(false);
        }
        self.schedule(handle).map(|_| true)
    }

    /// Schedules a snapshot unconditionally and returns its generation.
    ///
    /// # Errors
    ///
    /// As [`try_snapshot`](Self::try_snapshot).
    pub fn force_snapshot(&self) -> Result<u64, StoreError> {
        let writer = self.writer();
        let handle = open_writer(&writer)?;
        self.schedule(handle)
    }

    /// Blocks until every snapshot scheduled so far is on disk.
    ///
    /// # Errors
    ///
    /// The I/O error of the awaited snapshot, or [`StoreError::Closed`] if
    /// the store closed first.
    pub fn wait_for_snapshot(&self) -> Result<(), StoreError> {
        self.sync.wait()
    }

    /// Returns `true` while a scheduled snapshot has not been written.
    #[must_use]
    pub fn is_snapshot_in_flight(&self) -> bool {
        self.sync.in_flight()
    }

    fn has_changes(&self) -> bool {
        if self.dirty.load(Ordering::Acquire) {
            return true;
        }
        // Records can also change in place through their `OrderRef`.
        let since = self.last_snapshot_at.load(Ordering::Acquire);
        self.by_id.iter().any(|e| e.value().modified_at() >= since)
    }

    fn schedule(&self, handle: &SnapshotWriter) -> Result<u64, StoreError> {
        let _guard = self.lock();
        let image = StoreImage::capture(
            &self.by_id,
            &self.by_serial,
            self.remote_sequence(),
            self.local_sequence(),
        );
        let payload = image.to_json()?;
        let sequence = self.frame_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let bytes = frame::encode(sequence, &payload)?;

        let generation = self.sync.begin()?;
        self.dirty.store(false, Ordering::Release);
        self.last_snapshot_at.store(image.taken_at, Ordering::Release);
        if let Err(err) = handle.submit(generation, bytes) {
            self.sync.complete(generation, Err(err.clone()));
            return Err(err);
        }
        debug!(
            generation,
            frame_sequence = sequence,
            orders = image.orders.len(),
            bytes = payload.len(),
            "snapshot scheduled"
        );
        Ok(generation)
    }

    fn after_mutation(&self) {
        if !self.config.auto_snapshot {
            return;
        }
        match self.try_snapshot() {
            Ok(_) | Err(StoreError::NotOpen) => {}
            Err(err) => warn!(%err, "automatic snapshot failed"),
        }
    }
}

fn open_writer(state: &WriterState) -> Result<&SnapshotWriter, StoreError> {
    match state {
        WriterState::Open(handle) => Ok(handle),
        WriterState::Idle => Err(StoreError::NotOpen),
        WriterState::Closed => Err(StoreError::Closed),
    }
}

fn map_file(file: &fs::File, len: u64, path: &Path) -> Result<Option<Mmap>, StoreError> {
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: Read-only mapping. The writer only appends past the mapped
    // length or renames a new file into place, so the mapped bytes are
    // never modified while the map is alive.
    let mmap = unsafe { Mmap::map(file) }.map_err(|e| StoreError::io(&e, path))?;
    Ok(Some(mmap))
}

/// Restores the newest frame whose payload decodes, falling back to older
/// frames.
fn decode_latest(data: &[u8], scan: &FrameScan) -> Option<(u64, RestoredImage)> {
    for frame in scan.frames.iter().rev() {
        let restored = StoreImage::from_json(&data[frame.payload.clone()], frame.sequence)
            .and_then(|image| image.restore(frame.sequence));
        match restored {
            Ok(image) => return Some((frame.sequence, image)),
            Err(err) => warn!(
                offset = frame.offset,
                frame_sequence = frame.sequence,
                %err,
                "skipping unreadable snapshot frame"
            ),
        }
    }
    None
}

impl fmt::Debug for DurableOrderStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableOrderStore")
            .field("path", &self.config.file_path())
            .field("orders", &self.count())
            .field("remote_sequence", &self.remote_sequence())
            .field("local_sequence", &self.local_sequence())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for DurableOrderStore {
    fn drop(&mut self) {
        self.close();
    }
}
