//! Store images and the background snapshot writer.
//!
//! A snapshot is a [`StoreImage`] of the whole order table serialized to
//! JSON and wrapped in a frame (see [`frame`](super::frame)). Images are
//! captured on the caller's thread under the store's mutation lock; the
//! file I/O runs on a dedicated writer thread fed through a crossbeam
//! channel.

use super::config::StoreConfig;
use super::error::StoreError;
use super::order::{OrderRecord, OrderRef, OrderState, Side};
use crate::utils::current_time_millis;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Version of the image schema inside a frame payload.
pub(crate) const STORE_IMAGE_FORMAT_VERSION: u32 = 1;

/// Serialized form of one [`OrderRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct OrderImage {
    pub broker_order_id: String,
    pub logical_serial: i64,
    pub symbol: String,
    pub side: Side,
    pub price: u64,
    pub size: u64,
    pub filled_size: u64,
    pub state: OrderState,
    pub created_at: u64,
    pub modified_at: u64,
    /// Broker id of the superseding order.
    pub replace: Option<String>,
    /// Whether the record is reachable by id, or only through a replace link.
    pub indexed: bool,
}

impl OrderImage {
    fn capture(order: &OrderRecord, indexed: bool) -> Self {
        Self {
            broker_order_id: order.broker_order_id().to_string(),
            logical_serial: order.logical_serial(),
            symbol: order.symbol().to_string(),
            side: order.side(),
            price: order.price(),
            size: order.size(),
            filled_size: order.filled_size(),
            state: order.state(),
            created_at: order.created_at(),
            modified_at: order.modified_at(),
            replace: order.replace().map(|r| r.broker_order_id().to_string()),
            indexed,
        }
    }

    fn to_record(&self) -> OrderRef {
        OrderRecord::new(
            self.broker_order_id.clone(),
            self.logical_serial,
            self.symbol.clone(),
            self.side,
            self.price,
            self.size,
        )
        .with_state(self.state)
        .with_filled_size(self.filled_size)
        .with_timestamps(self.created_at, self.modified_at)
        .into_ref()
    }
}

/// Which order the serial index points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SerialEntry {
    pub logical_serial: i64,
    pub broker_order_id: String,
}

/// Full image of a store: every order plus the sequence counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoreImage {
    pub version: u32,
    pub taken_at: u64,
    pub remote_sequence: u64,
    pub local_sequence: u64,
    pub orders: Vec<OrderImage>,
    pub serials: Vec<SerialEntry>,
}

/// Indices rebuilt from a [`StoreImage`].
pub(crate) struct RestoredImage {
    pub by_id: Vec<OrderRef>,
    pub by_serial: Vec<(i64, OrderRef)>,
    pub remote_sequence: u64,
    pub local_sequence: u64,
}

impl StoreImage {
    /// Captures both indices. Records that are only reachable through a
    /// replace link are included so that chains survive a restart.
    pub fn capture(
        by_id: &DashMap<String, OrderRef>,
        by_serial: &DashMap<i64, OrderRef>,
        remote_sequence: u64,
        local_sequence: u64,
    ) -> Self {
        let mut seen: HashSet<String> = HashSet::with_capacity(by_id.len());
        let mut orders = Vec::with_capacity(by_id.len());
        let mut chained: Vec<OrderRef> = Vec::new();

        for entry in by_id.iter() {
            let order = entry.value();
            seen.insert(order.broker_order_id().to_string());
            orders.push(OrderImage::capture(order, true));
            chained.extend(order.replace());
        }
        for entry in by_serial.iter() {
            chained.push(Arc::clone(entry.value()));
        }
        while let Some(order) = chained.pop() {
            if seen.insert(order.broker_order_id().to_string()) {
                orders.push(OrderImage::capture(&order, false));
                chained.extend(order.replace());
            }
        }
        orders.sort_by(|a, b| {
            (a.logical_serial, &a.broker_order_id).cmp(&(b.logical_serial, &b.broker_order_id))
        });

        let mut serials: Vec<SerialEntry> = by_serial
            .iter()
            .map(|entry| SerialEntry {
                logical_serial: *entry.key(),
                broker_order_id: entry.value().broker_order_id().to_string(),
            })
            .collect();
        serials.sort_by_key(|s| s.logical_serial);

        Self {
            version: STORE_IMAGE_FORMAT_VERSION,
            taken_at: current_time_millis(),
            remote_sequence,
            local_sequence,
            orders,
            serials,
        }
    }

    /// Serializes the image to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|error| StoreError::SerializationError {
            message: error.to_string(),
        })
    }

    /// Deserializes an image from a frame payload.
    pub fn from_json(data: &[u8], frame_sequence: u64) -> Result<Self, StoreError> {
        serde_json::from_slice(data).map_err(|error| StoreError::DeserializationError {
            frame_sequence,
            message: error.to_string(),
        })
    }

    /// Rebuilds records and replace links. Each broker id yields exactly one
    /// record, so every link into it resolves to the same `Arc`.
    pub fn restore(self, frame_sequence: u64) -> Result<RestoredImage, StoreError> {
        if self.version != STORE_IMAGE_FORMAT_VERSION {
            return Err(StoreError::DeserializationError {
                frame_sequence,
                message: format!(
                    "unsupported image version: {} (expected {})",
                    self.version, STORE_IMAGE_FORMAT_VERSION
                ),
            });
        }

        let records: HashMap<String, OrderRef> = self
            .orders
            .iter()
            .map(|image| (image.broker_order_id.clone(), image.to_record()))
            .collect();
        let resolve = |id: &str| {
            records
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::DeserializationError {
                    frame_sequence,
                    message: format!("image references unknown order {id}"),
                })
        };

        let mut by_id = Vec::with_capacity(self.orders.len());
        for image in &self.orders {
            let record = resolve(&image.broker_order_id)?;
            if let Some(next) = &image.replace {
                record.set_replace(&resolve(next)?)?;
            }
            if image.indexed {
                by_id.push(record);
            }
        }

        let by_serial = self
            .serials
            .iter()
            .map(|s| resolve(&s.broker_order_id).map(|order| (s.logical_serial, order)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RestoredImage {
            by_id,
            by_serial,
            remote_sequence: self.remote_sequence,
            local_sequence: self.local_sequence,
        })
    }
}

#[derive(Debug, Default)]
struct Progress {
    scheduled: u64,
    completed: u64,
    last_failure: Option<(u64, StoreError)>,
    closed: bool,
}

/// Completion tracking shared between the store and its writer thread.
#[derive(Debug, Default)]
pub(crate) struct SnapshotSync {
    progress: Mutex<Progress>,
    done: Condvar,
}

impl SnapshotSync {
    fn lock(&self) -> Result<MutexGuard<'_, Progress>, StoreError> {
        self.progress.lock().map_err(|_| StoreError::MutexPoisoned)
    }

    /// Reserves the next snapshot generation.
    pub fn begin(&self) -> Result<u64, StoreError> {
        let mut progress = self.lock()?;
        if progress.closed {
            return Err(StoreError::Closed);
        }
        progress.scheduled += 1;
        Ok(progress.scheduled)
    }

    /// Returns `true` while a scheduled snapshot has not been written.
    pub fn in_flight(&self) -> bool {
        self.lock()
            .map(|p| p.completed < p.scheduled)
            .unwrap_or(false)
    }

    /// Records the outcome of `generation` and wakes waiters.
    pub fn complete(&self, generation: u64, result: Result<(), StoreError>) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.completed = progress.completed.max(generation);
            if let Err(err) = result {
                progress.last_failure = Some((generation, err));
            }
        }
        self.done.notify_all();
    }

    /// Blocks until every snapshot scheduled before the call is written.
    ///
    /// Returns the failure of the awaited snapshot, or of a later one that
    /// completed before the waiter woke up.
    pub fn wait(&self) -> Result<(), StoreError> {
        let mut progress = self.lock()?;
        let target = progress.scheduled;
        while progress.completed < target {
            if progress.closed {
                return Err(StoreError::Closed);
            }
            progress = self
                .done
                .wait(progress)
                .map_err(|_| StoreError::MutexPoisoned)?;
        }
        match &progress.last_failure {
            Some((generation, err)) if *generation >= target && target > 0 => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Marks the store closed and wakes waiters.
    pub fn close(&self) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.closed = true;
        }
        self.done.notify_all();
    }
}

enum WriteJob {
    Frame { generation: u64, bytes: Vec<u8> },
    Shutdown,
}

/// Appends frames to the store file, rolling it over when it grows past
/// the configured size.
struct FrameSink {
    path: PathBuf,
    rollover_path: PathBuf,
    /// Bytes of whole frames known to be on disk.
    size: u64,
    rollover_size: u64,
    /// Set when a failed append could not be cut back to `size`.
    needs_rollover: bool,
}

impl FrameSink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let frame_len = bytes.len() as u64;
        if self.needs_rollover
            || (self.size > 0 && self.size.saturating_add(frame_len) > self.rollover_size)
        {
            return self.roll(bytes);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&e, &self.path))?;
        let on_disk = file
            .metadata()
            .map_err(|e| StoreError::io(&e, &self.path))?
            .len();
        if on_disk != self.size {
            warn!(
                path = %self.path.display(),
                expected = self.size,
                on_disk,
                "store file length differs from written frames"
            );
            drop(file);
            return self.roll(bytes);
        }

        if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_data()) {
            // Cut off whatever part of the frame landed so later appends
            // stay reachable.
            if let Err(truncate) = file.set_len(self.size) {
                warn!(
                    path = %self.path.display(),
                    error = %truncate,
                    "could not trim failed append, next frame rolls over"
                );
                self.needs_rollover = true;
            }
            return Err(StoreError::io(&e, &self.path));
        }
        self.size = self.size.saturating_add(frame_len);
        Ok(())
    }

    fn roll(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let frame_len = bytes.len() as u64;
        self.rollover(bytes)?;
        info!(
            path = %self.path.display(),
            previous_size = self.size,
            new_size = frame_len,
            "store file rolled over to a fresh base frame"
        );
        self.size = frame_len;
        self.needs_rollover = false;
        Ok(())
    }

    /// Writes `bytes` as the only frame of a temp file and renames it over
    /// the live file.
    fn rollover(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = &self.rollover_path;
        let mut file = File::create(tmp).map_err(|e| StoreError::io(&e, tmp))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| StoreError::io(&e, tmp))?;
        drop(file);
        fs::rename(tmp, &self.path).map_err(|e| StoreError::io(&e, &self.path))
    }
}

/// Handle to the background writer thread.
pub(crate) struct SnapshotWriter {
    jobs: Sender<WriteJob>,
    thread: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    /// Starts the writer for a store file that currently holds `file_len`
    /// valid bytes.
    pub fn spawn(
        config: &StoreConfig,
        file_len: u64,
        sync: Arc<SnapshotSync>,
    ) -> Result<Self, StoreError> {
        let (jobs, rx) = channel::unbounded();
        let sink = FrameSink {
            path: config.file_path(),
            rollover_path: config.rollover_path(),
            size: file_len,
            rollover_size: config.snapshot_rollover_size,
            needs_rollover: false,
        };
        let thread = thread::Builder::new()
            .name(format!("{}-snapshot", config.name))
            .spawn(move || run(sink, rx, sync))
            .map_err(StoreError::from)?;
        Ok(Self {
            jobs,
            thread: Some(thread),
        })
    }

    /// Queues a frame for writing.
    pub fn submit(&self, generation: u64, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.jobs
            .send(WriteJob::Frame { generation, bytes })
            .map_err(|_| StoreError::Closed)
    }

    /// Lets queued frames drain, then stops the thread.
    pub fn shutdown(&mut self) {
        let _ = self.jobs.send(WriteJob::Shutdown);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            error!("snapshot writer thread panicked");
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut sink: FrameSink, jobs: Receiver<WriteJob>, sync: Arc<SnapshotSync>) {
    debug!(path = %sink.path.display(), "snapshot writer started");
    for job in jobs {
        match job {
            WriteJob::Frame { generation, bytes } => {
                let result = sink.write(&bytes);
                match &result {
                    Ok(()) => trace!(generation, bytes = bytes.len(), "snapshot written"),
                    Err(err) => error!(generation, %err, "snapshot write failed"),
                }
                sync.complete(generation, result);
            }
            WriteJob::Shutdown => break,
        }
    }
    debug!(path = %sink.path.display(), "snapshot writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, serial: i64) -> OrderRef {
        OrderRecord::new(id, serial, "ES", Side::Buy, 4_500, 2).into_ref()
    }

    #[test]
    fn test_capture_includes_chained_records() {
        let by_id = DashMap::new();
        let by_serial = DashMap::new();
        let old = order("A", 1);
        let new = order("B", 1);
        assert!(old.set_replace(&new).is_ok());
        by_id.insert("A".to_string(), Arc::clone(&old));
        by_serial.insert(1, Arc::clone(&new));

        let image = StoreImage::capture(&by_id, &by_serial, 3, 4);
        assert_eq!(image.orders.len(), 2);
        let b = image.orders.iter().find(|o| o.broker_order_id == "B");
        assert_eq!(b.map(|o| o.indexed), Some(false));
        assert_eq!(image.serials.len(), 1);
        assert_eq!(image.remote_sequence, 3);
    }

    #[test]
    fn test_restore_preserves_identity() {
        let by_id = DashMap::new();
        let by_serial = DashMap::new();
        let old = order("A", 1);
        let new = order("B", 1);
        assert!(old.set_replace(&new).is_ok());
        by_id.insert("A".to_string(), old);
        by_id.insert("B".to_string(), Arc::clone(&new));
        by_serial.insert(1, new);

        let json = StoreImage::capture(&by_id, &by_serial, 0, 0)
            .to_json()
            .unwrap_or_else(|e| panic!("{e}"));
        let restored = StoreImage::from_json(&json, 1)
            .and_then(|image| image.restore(1))
            .unwrap_or_else(|e| panic!("{e}"));

        let a = restored.by_id.iter().find(|o| o.broker_order_id() == "A");
        let b = restored.by_id.iter().find(|o| o.broker_order_id() == "B");
        let (Some(a), Some(b)) = (a, b) else {
            panic!("orders missing after restore");
        };
        assert!(a.replace().is_some_and(|r| Arc::ptr_eq(&r, b)));
        assert!(Arc::ptr_eq(&restored.by_serial[0].1, b));
    }

    #[test]
    fn test_restore_rejects_dangling_reference() {
        let image = StoreImage {
            version: STORE_IMAGE_FORMAT_VERSION,
            taken_at: 0,
            remote_sequence: 0,
            local_sequence: 0,
            orders: Vec::new(),
            serials: vec![SerialEntry {
                logical_serial: 1,
                broker_order_id: "missing".to_string(),
            }],
        };
        assert!(matches!(
            image.restore(9),
            Err(StoreError::DeserializationError { frame_sequence: 9, .. })
        ));
    }

    #[test]
    fn test_wait_returns_immediately_when_idle() {
        let sync = SnapshotSync::default();
        assert_eq!(sync.wait(), Ok(()));
        assert!(!sync.in_flight());
    }

    #[test]
    fn test_wait_surfaces_failure() {
        let sync = Arc::new(SnapshotSync::default());
        let generation = sync.begin().unwrap_or_else(|e| panic!("{e}"));
        assert!(sync.in_flight());

        let worker = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            worker.complete(generation, Err(StoreError::NotOpen));
        });
        assert_eq!(sync.wait(), Err(StoreError::NotOpen));
        assert!(handle.join().is_ok());

        sync.close();
        assert_eq!(sync.begin(), Err(StoreError::Closed));
    }
}
